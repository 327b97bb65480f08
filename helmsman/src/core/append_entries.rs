use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::state_machine::StateMachine;
use crate::storage::Persistence;
use crate::MessageSummary;
use crate::RaftTransport;
use crate::Update;

impl<N: RaftTransport, P: Persistence, M: StateMachine> RaftCore<N, P, M> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    ///
    /// The new entries are durable before the response is produced; an acknowledged entry can
    /// therefore be counted toward commitment by the leader without further coordination.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=req.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: None,
                conflict_index: None,
                conflict_term: None,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        let mut report_metrics = false;

        // Update current term if needed.
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

        // Transition to follower state if needed.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        // Consistency check: the log must hold an entry at `prev_log_index` whose term is
        // `prev_log_term`, else the leader must back up. The conflict hints let it jump a
        // whole term per round trip.
        let last_log_id = self.log.last_log_id();
        if req.prev_log_index > last_log_id.index {
            if report_metrics {
                self.report_metrics(Update::Ignore);
            }
            return Ok(AppendEntriesResponse::conflict(self.current_term, last_log_id.index + 1, None));
        }
        match self.log.term_of(req.prev_log_index) {
            // The prev entry sits inside our snapshot: it is committed and therefore matches.
            None => {}
            Some(term) if term == req.prev_log_term => {}
            Some(term) => {
                let conflict_index = self.log.first_index_of_term(term).unwrap_or(req.prev_log_index);
                if report_metrics {
                    self.report_metrics(Update::Ignore);
                }
                return Ok(AppendEntriesResponse::conflict(self.current_term, conflict_index, Some(term)));
            }
        }

        // Walk the incoming entries: skip what we already hold, truncate a conflicting
        // uncommitted suffix, then append whatever is new.
        let mut last_new = crate::LogId {
            term: req.prev_log_term,
            index: req.prev_log_index,
        };
        let mut to_append: Vec<Entry> = Vec::new();
        for entry in req.entries {
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            if entry.log_id.index < self.log.first_retained_index() {
                // Covered by our snapshot; committed and identical by log matching.
                last_new = entry.log_id;
                continue;
            }
            match self.log.term_of(entry.log_id.index) {
                Some(term) if term == entry.log_id.term => {
                    last_new = entry.log_id;
                }
                Some(_) => {
                    tracing::debug!(
                        index = entry.log_id.index,
                        "removing conflicting uncommitted suffix from log"
                    );
                    self.log
                        .truncate(entry.log_id.index)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        if !to_append.is_empty() {
            // Config-change entries take effect upon append, not commit.
            for entry in to_append.iter() {
                if let EntryPayload::ConfigChange(membership) = &entry.payload {
                    self.update_membership(membership.clone())?;
                }
            }
            last_new = to_append.last().map(|entry| entry.log_id).unwrap_or(last_new);
            self.log.append(to_append).await.map_err(|err| self.map_fatal_storage_error(err))?;
            report_metrics = true;
        }

        // Advance the commit index and drive the apply loop. The clamp to the last matching
        // entry never moves the commit index backwards on a stale heartbeat.
        let new_commit = req.leader_commit.min(last_new.index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.replicate_to_state_machine_if_needed();
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        Ok(AppendEntriesResponse::matched(self.current_term, last_new.index))
    }
}
