//! Quorum collectors over groups of completions.
//!
//! These combinators take a group of in-flight completions and settle an output completion
//! once a quorum rule is satisfied: all inputs, any input, a simple majority of inputs, or
//! independent majorities of a joint membership. Results which arrive after the decision are
//! discarded, which is the best-effort cancellation the engine relies on. The collector
//! callbacks never run under the engine lock; they are posted on the supplied executor.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::completion::Completion;
use crate::completion::Resolver;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::executor::Executor;
use crate::quorum;
use crate::NodeId;

struct Gather<T: Send + 'static> {
    results: Vec<Option<RaftResult<T>>>,
    settled: usize,
    resolver: Option<Resolver<Vec<RaftResult<T>>>>,
}

impl<T: Send + 'static> Gather<T> {
    fn decide(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            let results = self
                .results
                .iter_mut()
                .map(|slot| slot.take().unwrap_or(Err(RaftError::Cancelled)))
                .collect::<Vec<_>>();
            let _ = resolver.fulfil(results);
        }
    }
}

/// Collect until `needed` of the inputs have settled, with any mix of successes and failures.
///
/// Outstanding inputs are abandoned once the decision is made; their eventual results are
/// discarded and reported as `Cancelled` in the output vector. On timeout the output fails
/// with `Timeout`.
fn gather<T: Send + 'static>(
    inputs: Vec<Completion<T>>,
    needed: usize,
    timeout: Option<Duration>,
    executor: &Executor,
) -> Completion<Vec<RaftResult<T>>> {
    let (tx, rx) = Completion::pair_on(executor);
    let total = inputs.len();
    if total == 0 || needed == 0 {
        let _ = tx.fulfil(Vec::new());
        return rx;
    }

    let state = Arc::new(Mutex::new(Gather {
        results: (0..total).map(|_| None).collect(),
        settled: 0,
        resolver: Some(tx),
    }));

    if let Some(timeout) = timeout {
        let timer_state = state.clone();
        let _ = executor.timer(timeout, move || {
            let mut gather = timer_state.lock().unwrap();
            if let Some(resolver) = gather.resolver.take() {
                let _ = resolver.fail(RaftError::Timeout);
            }
        });
    }

    for (idx, input) in inputs.into_iter().enumerate() {
        let state = state.clone();
        input.on_settle(Box::new(move |res| {
            let mut gather = state.lock().unwrap();
            if gather.resolver.is_none() {
                return;
            }
            gather.results[idx] = Some(res);
            gather.settled += 1;
            if gather.settled >= needed {
                gather.decide();
            }
        }));
    }

    rx
}

/// Collect the results of every input completion.
pub fn all<T: Send + 'static>(
    inputs: Vec<Completion<T>>,
    timeout: Option<Duration>,
    executor: &Executor,
) -> Completion<Vec<RaftResult<T>>> {
    let needed = inputs.len();
    gather(inputs, needed, timeout, executor)
}

/// Collect until a majority of the inputs have settled, with any mix of successes and failures.
pub fn majority<T: Send + 'static>(
    inputs: Vec<Completion<T>>,
    timeout: Option<Duration>,
    executor: &Executor,
) -> Completion<Vec<RaftResult<T>>> {
    let needed = quorum::majority_of(inputs.len());
    gather(inputs, needed, timeout, executor)
}

/// Settle with the result of whichever input settles first.
pub fn any<T: Send + 'static>(
    inputs: Vec<Completion<T>>,
    timeout: Option<Duration>,
    executor: &Executor,
) -> Completion<T> {
    gather(inputs, 1, timeout, executor).then_try(|res| match res {
        Ok(results) => results.into_iter().find(|r| !matches!(r, Err(RaftError::Cancelled))).unwrap_or(Err(RaftError::Cancelled)),
        Err(err) => Err(err),
    })
}

struct JointGather<T: Send + 'static> {
    ids: Vec<NodeId>,
    results: Vec<Option<RaftResult<T>>>,
    affirmed: BTreeSet<NodeId>,
    settled: usize,
    current: BTreeSet<NodeId>,
    next: Option<BTreeSet<NodeId>>,
    resolver: Option<Resolver<Vec<(NodeId, RaftResult<T>)>>>,
}

impl<T: Send + 'static> JointGather<T> {
    fn quorum_reached(&self) -> bool {
        set_majority_reached(&self.current, &self.affirmed)
            && self.next.as_ref().map(|n| set_majority_reached(n, &self.affirmed)).unwrap_or(true)
    }

    fn decide(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            let results = self
                .ids
                .iter()
                .zip(self.results.iter_mut())
                .map(|(id, slot)| (*id, slot.take().unwrap_or(Err(RaftError::Cancelled))))
                .collect::<Vec<_>>();
            let _ = resolver.fulfil(results);
        }
    }
}

fn set_majority_reached(group: &BTreeSet<NodeId>, affirmed: &BTreeSet<NodeId>) -> bool {
    group.intersection(affirmed).count() >= quorum::majority_of(group.len())
}

/// Collect per-node completions until affirmative results form independent majorities of both
/// membership groups.
///
/// Only successful results count toward the quorums; `seed` names nodes counted as affirmed
/// up front (typically the local node). The output settles as soon as both majorities are
/// reached, or once every input has settled without reaching them, letting the caller inspect
/// the shortfall. On timeout the output fails with `Timeout`.
pub fn joint_majority<T: Send + 'static>(
    current: &BTreeSet<NodeId>,
    next: Option<&BTreeSet<NodeId>>,
    inputs: Vec<(NodeId, Completion<T>)>,
    seed: &[NodeId],
    timeout: Option<Duration>,
    executor: &Executor,
) -> Completion<Vec<(NodeId, RaftResult<T>)>> {
    let (tx, rx) = Completion::pair_on(executor);
    let current = current.clone();
    let next = next.cloned();

    let affirmed: BTreeSet<NodeId> = seed.iter().copied().collect();
    let satisfied = |affirmed: &BTreeSet<NodeId>| {
        set_majority_reached(&current, affirmed)
            && next.as_ref().map(|n| set_majority_reached(n, affirmed)).unwrap_or(true)
    };

    if inputs.is_empty() || satisfied(&affirmed) {
        let _ = tx.fulfil(inputs.into_iter().map(|(id, c)| {
            c.cancel();
            (id, Err(RaftError::Cancelled))
        }).collect());
        return rx;
    }

    let total = inputs.len();
    let state = Arc::new(Mutex::new(JointGather {
        ids: inputs.iter().map(|(id, _)| *id).collect(),
        results: (0..total).map(|_| None).collect(),
        affirmed,
        settled: 0,
        current,
        next,
        resolver: Some(tx),
    }));

    if let Some(timeout) = timeout {
        let timer_state = state.clone();
        let _ = executor.timer(timeout, move || {
            let mut gather = timer_state.lock().unwrap();
            if let Some(resolver) = gather.resolver.take() {
                let _ = resolver.fail(RaftError::Timeout);
            }
        });
    }

    for (idx, (id, input)) in inputs.into_iter().enumerate() {
        let state = state.clone();
        input.on_settle(Box::new(move |res| {
            let mut gather = state.lock().unwrap();
            if gather.resolver.is_none() {
                return;
            }
            if res.is_ok() {
                gather.affirmed.insert(id);
            }
            gather.results[idx] = Some(res);
            gather.settled += 1;

            if gather.quorum_reached() || gather.settled == total {
                gather.decide();
            }
        }));
    }

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;

    fn pairs(n: usize) -> (Vec<Resolver<u64>>, Vec<Completion<u64>>) {
        (0..n).map(|_| Completion::pair()).unzip()
    }

    #[test]
    fn test_collect_all_waits_for_every_input() {
        let (txs, rxs) = pairs(3);
        let out = all(rxs, None, &Executor::inline());
        txs[0].fulfil(0).unwrap();
        txs[1].fulfil(1).unwrap();
        assert!(!out.is_ready());
        txs[2].fulfil(2).unwrap();
        let results = out.get().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_collect_majority_settles_on_quorum() {
        let (txs, rxs) = pairs(5);
        let out = majority(rxs, None, &Executor::inline());
        txs[0].fulfil(0).unwrap();
        txs[1].fail(RaftError::Disconnected).unwrap();
        assert!(!out.is_ready());
        txs[2].fulfil(2).unwrap();
        let results = out.get().unwrap();
        // A mix of successes and failures counts toward settlement.
        let settled = results.iter().filter(|r| !matches!(r, Err(RaftError::Cancelled))).count();
        assert_eq!(settled, 3);
        // Late results are discarded without error.
        assert!(txs[3].fulfil(3).is_ok());
    }

    #[test]
    fn test_collect_majority_success_count_law() {
        let (txs, rxs) = pairs(5);
        let out = majority(rxs, None, &Executor::inline());
        for tx in txs.iter().take(3) {
            tx.fulfil(1).unwrap();
        }
        let results = out.get().unwrap();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert!(successes >= quorum::majority_of(5));
    }

    #[test]
    fn test_collect_any_settles_with_first() {
        let (txs, rxs) = pairs(3);
        let out = any(rxs, None, &Executor::inline());
        txs[1].fulfil(42).unwrap();
        assert_eq!(out.get().unwrap(), 42);
    }

    #[test]
    fn test_collect_timeout_fails_with_timeout() {
        let (_txs, rxs) = pairs(3);
        let out = all(rxs, Some(Duration::from_millis(10)), &Executor::inline());
        assert_eq!(out.get().unwrap_err(), RaftError::Timeout);
    }

    #[test]
    fn test_collect_empty_input_settles_immediately() {
        let out = majority::<u64>(Vec::new(), None, &Executor::inline());
        assert!(out.get().unwrap().is_empty());
    }

    #[test]
    fn test_joint_majority_requires_both_groups() {
        let current = btreeset![1u64, 2, 3];
        let next = btreeset![3u64, 4, 5];
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..5).map(|_| Completion::<u64>::pair()).unzip();
        let inputs = vec![1u64, 2, 3, 4, 5].into_iter().zip(rxs).collect::<Vec<_>>();
        let out = joint_majority(&current, Some(&next), inputs, &[], None, &Executor::inline());

        // Majority of the old group alone does not decide.
        txs[0].fulfil(0).unwrap();
        txs[1].fulfil(0).unwrap();
        assert!(!out.is_ready());

        // A majority of the new group as well settles the collector.
        txs[2].fulfil(0).unwrap();
        txs[3].fulfil(0).unwrap();
        let results = out.get().unwrap();
        let affirmed: BTreeSet<NodeId> = results.iter().filter(|(_, r)| r.is_ok()).map(|(id, _)| *id).collect();
        assert!(affirmed.is_superset(&btreeset![1, 2, 3, 4]));
    }

    #[test]
    fn test_joint_majority_settles_when_all_inputs_fail() {
        let current = btreeset![1u64, 2, 3];
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..2).map(|_| Completion::<u64>::pair()).unzip();
        let inputs = vec![2u64, 3].into_iter().zip(rxs).collect::<Vec<_>>();
        let out = joint_majority(&current, None, inputs, &[1], None, &Executor::inline());
        txs[0].fail(RaftError::Disconnected).unwrap();
        txs[1].fail(RaftError::Disconnected).unwrap();
        let results = out.get().unwrap();
        assert!(results.iter().all(|(_, r)| r.is_err()));
    }

    #[test]
    fn test_joint_majority_seed_satisfies_single_node_cluster() {
        let current = btreeset![1u64];
        let out = joint_majority::<u64>(&current, None, Vec::new(), &[1], None, &Executor::inline());
        assert!(out.get().unwrap().is_empty());
    }
}
