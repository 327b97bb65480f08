use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::state_machine::StateMachine;
use crate::storage::Persistence;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::LogId;
use crate::MessageSummary;
use crate::RaftTransport;
use crate::Update;

impl<N: RaftTransport, P: Persistence, M: StateMachine> RaftCore<N, P, M> {
    /// Invoked by the leader to send chunks of a snapshot to a follower (§7).
    ///
    /// Leaders always send chunks in order. The first chunk opens a scratch buffer; each
    /// subsequent chunk must continue at the cumulative byte offset and carry the same
    /// snapshot metadata, otherwise the partial snapshot is discarded.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        // If not follower, become follower.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower); // State update will emit metrics.
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // Compare current snapshot state with received RPC and handle as needed.
        // - Init a new scratch buffer if there is none, or if a local compaction is running.
        // - Matching metadata continues the stream at the cumulative offset.
        // - Mismatched metadata with offset=0 indicates a new stream; the old scratch is dropped.
        // - Mismatched metadata with offset greater than 0 is out of order and is rejected.
        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Snapshotting { handle }) => {
                handle.abort(); // Abort the current compaction in favor of installation from leader.
                self.begin_installing_snapshot(req).await
            }
            Some(SnapshotState::Streaming {
                offset,
                last_included,
                membership,
                buf,
            }) => {
                if req.last_included_index == last_included.index && req.last_included_term == last_included.term {
                    return self.continue_installing_snapshot(req, offset, last_included, membership, buf).await;
                }

                if req.offset == 0 {
                    return self.begin_installing_snapshot(req).await;
                }

                Err(RaftError::LogInconsistency {
                    message: format!(
                        "snapshot stream mismatch: streaming {}-{} at offset {}, got {}-{} at offset {}",
                        last_included.term,
                        last_included.index,
                        offset,
                        req.last_included_term,
                        req.last_included_index,
                        req.offset
                    ),
                })
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        if req.offset > 0 {
            return Err(RaftError::LogInconsistency {
                message: format!("snapshot stream for {}-{} must start at offset 0, got {}", req.last_included_term, req.last_included_index, req.offset),
            });
        }

        let last_included = LogId {
            term: req.last_included_term,
            index: req.last_included_index,
        };

        // A stale snapshot which our own snapshot already covers carries no new information.
        if last_included.index <= self.log.snapshot_last_log_id().index {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        let buf = req.data;
        if req.done {
            self.finalize_snapshot_installation(last_included, req.membership, buf).await?;
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // Else, retain the scratch buffer for later segments & respond.
        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: buf.len() as u64,
            last_included,
            membership: req.membership,
            buf,
        });
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, req, buf), fields(req=%req.summary()))]
    async fn continue_installing_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        offset: u64,
        last_included: LogId,
        membership: crate::membership::MembershipConfig,
        mut buf: Vec<u8>,
    ) -> RaftResult<InstallSnapshotResponse> {
        // Chunks must arrive at the cumulative offset; anything else discards the scratch.
        if req.offset != offset {
            return Err(RaftError::LogInconsistency {
                message: format!("snapshot chunk at offset {}, expected {}", req.offset, offset),
            });
        }

        buf.extend_from_slice(&req.data);

        if req.done {
            self.finalize_snapshot_installation(last_included, membership, buf).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming {
                offset: buf.len() as u64,
                last_included,
                membership,
                buf,
            });
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    /// Finalize the installation of a new snapshot.
    ///
    /// Any errors which come up from this routine will cause the Raft node to go into shutdown.
    #[tracing::instrument(level = "debug", skip(self, membership, data))]
    async fn finalize_snapshot_installation(
        &mut self,
        last_included: LogId,
        membership: crate::membership::MembershipConfig,
        data: Vec<u8>,
    ) -> RaftResult<()> {
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_log_id: last_included,
                membership: membership.clone(),
            },
            data,
        };
        self.storage.save_snapshot(&snapshot).await.map_err(|err| self.map_fatal_storage_error(err))?;

        // If the log holds the snapshot's boundary entry the suffix past it is retained;
        // otherwise the whole log is discarded in favor of the snapshot.
        let retain_suffix = self.log.term_of(last_included.index) == Some(last_included.term);
        self.log
            .reset_to_snapshot(last_included, retain_suffix)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.state_machine
            .restore(&snapshot.data, last_included)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.update_membership(membership)?;
        self.last_applied = last_included;
        if self.commit_index < last_included.index {
            self.commit_index = last_included.index;
        }
        self.report_metrics(Update::Ignore);
        Ok(())
    }
}
