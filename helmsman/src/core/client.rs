use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::time::Duration;

use crate::collect;
use crate::completion::Resolver;
use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::state_machine::StateMachine;
use crate::storage::Persistence;
use crate::LogId;
use crate::NodeId;
use crate::RaftTransport;

/// A client or internal request which has been appended to the log, along with its response
/// channel. One of these is held per in-flight request, keyed implicitly by its log index,
/// until the entry commits.
pub(super) struct ClientRequestEntry {
    /// The Arc'd entry of the request.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx,
}

impl ClientRequestEntry {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx>>(entry: Entry, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }
}

/// An enum type wrapping either a client response channel or an internal Raft response channel.
#[derive(derive_more::From)]
pub(super) enum ClientOrInternalResponseTx {
    Client(Resolver<Vec<u8>>),
    Internal(Option<Resolver<u64>>),
}

impl ClientOrInternalResponseTx {
    /// Fail the underlying response channel, if any.
    pub(super) fn reject(self, err: RaftError) {
        match self {
            ClientOrInternalResponseTx::Client(tx) => {
                let _ = tx.fail(err);
            }
            ClientOrInternalResponseTx::Internal(Some(tx)) => {
                let _ = tx.fail(err);
            }
            ClientOrInternalResponseTx::Internal(None) => {}
        }
    }
}

impl<'a, N: RaftTransport, P: Persistence, M: StateMachine> LeaderState<'a, N, P, M> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        // If the cluster has just formed, and the current index is 0, then commit the current
        // config, else a blank payload.
        let last_log_id = self.core.log.last_log_id();

        let payload: EntryPayload = if last_log_id.index == 0 {
            EntryPayload::ConfigChange(self.core.membership.clone())
        } else {
            // Complete a partial member-change:
            //
            // Raft appends two consecutive membership change logs: the joint config and the
            // final config, to impl a membership change.
            //
            // It is possible only the first one, the joint config log, was written to storage
            // or replicated. Thus if a new leader sees only the joint config, it appends the
            // final config log so the change-membership operation can finish.
            let final_payload = match self.core.log.entry(last_log_id.index).map(|entry| &entry.payload) {
                Some(EntryPayload::ConfigChange(membership)) if membership.is_in_joint_consensus() => {
                    Some(EntryPayload::ConfigChange(membership.to_final_config()))
                }
                _ => None,
            };
            final_payload.unwrap_or(EntryPayload::Blank)
        };

        // Commit the initial payload to the cluster.
        let entry = self.append_payload_to_log(payload).await?;
        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Handle client read requests with the read-index technique.
    ///
    /// From the spec (§8): a leader must check whether it has been deposed before processing a
    /// read-only request, as its information may be stale if a more recent leader has been
    /// elected. A heartbeat round is exchanged with a majority of the cluster (joint-aware)
    /// before the state machine is consulted.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_read_request(&mut self, tx: Resolver<Vec<u8>>) {
        let read_index = self.core.commit_index;

        // Spawn heartbeats to all replication targets and gather confirmations through the
        // joint-majority collector; our own self-check is the seed.
        let rpc_timeout = Duration::from_millis(self.core.config.heartbeat_interval);
        let collect_timeout = Duration::from_millis(self.core.config.election_timeout_min);
        let current_term = self.core.current_term;

        let mut inputs = Vec::new();
        for (id, node) in self.nodes.iter() {
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_index: node.matched.index,
                prev_log_term: node.matched.term,
                entries: vec![],
                leader_commit: self.core.commit_index,
            };
            let confirmation = self.core.network.append_entries(*id, rpc, rpc_timeout).then_try(
                move |res| -> RaftResult<()> {
                    match res {
                        Ok(resp) if resp.term == current_term => Ok(()),
                        Ok(resp) => Err(RaftError::LeadershipLost { term: resp.term }),
                        Err(err) => Err(err),
                    }
                },
            );
            inputs.push((*id, confirmation));
        }

        let collector = collect::joint_majority(
            &self.core.membership.members,
            self.core.membership.members_after_consensus.as_ref(),
            inputs,
            &[self.core.id],
            Some(collect_timeout),
            &self.core.executor,
        );

        let results = match collector.await {
            Ok(results) => results,
            Err(err) => {
                tracing::debug!(error=%err, "read-index heartbeat round failed");
                let _ = tx.fail(RaftError::Timeout);
                return;
            }
        };

        // A response carrying a newer term deposes this leader and fails the read.
        let max_seen_term = results
            .iter()
            .filter_map(|(_, res)| match res {
                Err(RaftError::LeadershipLost { term }) => Some(*term),
                _ => None,
            })
            .max()
            .unwrap_or(self.core.current_term);
        if max_seen_term > self.core.current_term {
            self.core.update_current_term(max_seen_term, None);
            if self.core.save_hard_state().await.is_err() {
                let _ = tx.fail(RaftError::ShuttingDown);
                return;
            }
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            let _ = tx.fail(RaftError::LeadershipLost { term: max_seen_term });
            return;
        }

        let mut confirmed: BTreeSet<NodeId> = results.iter().filter(|(_, res)| res.is_ok()).map(|(id, _)| *id).collect();
        confirmed.insert(self.core.id);
        if !self.core.membership.majority_satisfied(&confirmed) {
            tracing::debug!("too many read-index heartbeats failed, could not confirm leadership");
            let _ = tx.fail(RaftError::Timeout);
            return;
        }

        // Leadership confirmed at `read_index`; make sure the applied prefix covers it before
        // capturing the state machine.
        if self.core.last_applied.index < read_index {
            if let Err(err) = self.core.apply_outstanding_upto(read_index).await {
                let _ = tx.fail(err);
                return;
            }
            self.leader_report_metrics();
        }

        match self.core.state_machine.get_state().await {
            Ok(state) => {
                let _ = tx.fulfil(state);
            }
            Err(err) => {
                tracing::error!(error=%err, "error capturing state machine for read");
                let _ = tx.fail(RaftError::BadCommand {
                    message: err.to_string(),
                });
            }
        }
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, command, tx))]
    pub(super) async fn handle_client_write_request(&mut self, command: Vec<u8>, tx: Resolver<Vec<u8>>) {
        let entry = match self.append_payload_to_log(EntryPayload::Normal(command)).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.fail(err);
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Entry> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.log.last_log_id().index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .log
            .append(vec![entry.clone()])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        self.leader_report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry) {
        // Replicate the request if there are other cluster members. The client response will be
        // returned elsewhere after the entry has been committed to the cluster.
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() {
            // There are no other voting nodes for replication, so the payload is now committed.
            self.core.commit_index = entry_arc.log_id.index;
            self.leader_report_metrics();
            self.client_request_post_commit(req).await;
            return;
        }

        self.awaiting_committed.push(req);
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                crate::replication::RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry) {
        let entry = &req.entry;

        // Ensure the applied prefix is current before touching this entry, then apply it and
        // answer the request.
        if let Err(err) = self.core.apply_outstanding_upto(entry.log_id.index.saturating_sub(1)).await {
            req.tx.reject(err);
            return;
        }

        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => match &entry.payload {
                EntryPayload::Normal(_) => {
                    let _ = tx.resolve(self.core.apply_entry_to_state_machine(entry).await);
                }
                _ => {
                    // This should never be hit: client responses are only registered for
                    // normal entries. Log loudly rather than silently drop the channel.
                    tracing::error!("critical error: a client response channel was registered for a non-client entry");
                    let _ = tx.fail(RaftError::BadCommand {
                        message: "internal entry carried a client response channel".into(),
                    });
                }
            },
            ClientOrInternalResponseTx::Internal(tx) => {
                self.handle_special_log(entry);
                match self.core.apply_entry_to_state_machine(entry).await {
                    Ok(_) => {
                        if let Some(tx) = tx {
                            let _ = tx.fulfil(entry.log_id.index);
                        }
                    }
                    Err(err) => {
                        if let Some(tx) = tx {
                            let _ = tx.fail(err);
                        }
                    }
                }
            }
        }

        self.leader_report_metrics();

        // Trigger log compaction if needed.
        self.core.trigger_log_compaction_if_needed(false).await;
    }

    /// React to the commitment of a protocol-internal entry.
    pub(super) fn handle_special_log(&mut self, entry: &Arc<Entry>) {
        match &entry.payload {
            EntryPayload::ConfigChange(membership) => {
                if membership.is_in_joint_consensus() {
                    self.handle_joint_consensus_committed();
                } else {
                    self.handle_uniform_consensus_committed(entry.log_id.index);
                }
            }
            EntryPayload::Blank => {}
            EntryPayload::Normal(_) => {}
        }
    }
}
