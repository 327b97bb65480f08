use std::collections::BTreeSet;

use crate::completion::Resolver;
use crate::core::client::ClientRequestEntry;
use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::MembershipConfig;
use crate::raft::EntryPayload;
use crate::replication::RaftEvent;
use crate::state_machine::StateMachine;
use crate::storage::Persistence;
use crate::NodeId;
use crate::RaftTransport;

impl<'a, N: RaftTransport, P: Persistence, M: StateMachine> LeaderState<'a, N, P, M> {
    /// Propose a new membership config, driving the cluster through joint consensus (§6).
    ///
    /// Two consecutive config entries are appended: the joint config, whose quorum rules take
    /// effect upon append, and the final config, which replaces them once committed. Nodes
    /// removed by the final config keep replicating until it commits.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, members: BTreeSet<NodeId>, tx: Resolver<u64>) {
        // Ensure cluster will have at least one node.
        if members.is_empty() {
            let _ = tx.fail(RaftError::BadCommand {
                message: "a cluster must have at least one node".into(),
            });
            return;
        }

        // Only allow config updates when currently in a uniform consensus state.
        match &self.consensus_state {
            ConsensusState::Uniform => (),
            ConsensusState::Joint { .. } => {
                let _ = tx.fail(RaftError::BadCommand {
                    message: "a configuration change is already in progress".into(),
                });
                return;
            }
        }

        if !members.contains(&self.core.id) {
            self.is_stepping_down = true;
        }
        self.consensus_state = ConsensusState::Joint { is_committed: false };
        self.core.membership.members_after_consensus = Some(members.clone());

        let joint_config = self.core.membership.clone();
        let final_config = MembershipConfig::new_stable(members);

        if let Err(err) = self.append_membership_log(joint_config, None).await {
            tracing::error!(error=%err, "error appending joint membership log");
            return;
        }
        if let Err(err) = self.append_membership_log(final_config, Some(tx)).await {
            tracing::error!(error=%err, "error appending final membership log");
        }
    }

    #[tracing::instrument(level = "trace", skip(self, resp_tx), fields(id=self.core.id))]
    pub(super) async fn append_membership_log(
        &mut self,
        mem: MembershipConfig,
        resp_tx: Option<Resolver<u64>>,
    ) -> RaftResult<()> {
        let entry = match self.append_payload_to_log(EntryPayload::ConfigChange(mem)).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(tx) = resp_tx {
                    let _ = tx.fail(err.clone());
                }
                return Err(err);
            }
        };

        // New members must have replication streams before the joint rules can be satisfied.
        self.update_replication_targets();

        let cr_entry = ClientRequestEntry::from_entry(entry, resp_tx);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Spawn replication streams for any configured node which lacks one.
    ///
    /// Removal of streams for departed nodes happens only once the final config commits, via
    /// `handle_uniform_consensus_committed`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn update_replication_targets(&mut self) {
        let targets: BTreeSet<NodeId> = self
            .core
            .membership
            .all_nodes()
            .into_iter()
            .filter(|id| id != &self.core.id)
            .collect();
        for target in targets {
            if !self.nodes.contains_key(&target) {
                tracing::debug!(target, "spawning replication stream for new cluster member");
                let state = self.spawn_replication_stream(target);
                self.nodes.insert(target, state);
            }
        }
    }

    /// Handle the commitment of the joint consensus cluster configuration.
    ///
    /// The joint quorum rules stay in force; they are replaced only when the final config
    /// commits.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_joint_consensus_committed(&mut self) {
        if let ConsensusState::Joint { is_committed } = &mut self.consensus_state {
            *is_committed = true;
        }
    }

    /// Handle the commitment of a uniform consensus cluster configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_uniform_consensus_committed(&mut self, index: u64) {
        // Cut the cluster config over to the committed final membership.
        if let Some(final_members) = self.core.membership.members_after_consensus.take() {
            self.core.membership.members = final_members;
        }
        self.consensus_state = ConsensusState::Uniform;

        // Step down if needed.
        if self.is_stepping_down {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_state(State::NonVoter);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        // Remove any replication streams which have replicated this config & which are no
        // longer cluster members. All other replication streams which are no longer cluster
        // members, but which have not yet replicated this config, will be marked for removal.
        let membership = &self.core.membership;
        let nodes_to_remove: Vec<_> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !membership.contains(id))
            .filter_map(|(idx, replstate)| {
                if replstate.matched.index >= index {
                    Some(*idx)
                } else {
                    replstate.remove_after_commit = Some(index);
                    None
                }
            })
            .collect();

        for target in nodes_to_remove {
            tracing::debug!(target, "removing target node from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }
        self.leader_report_metrics();
    }
}
