use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::state_machine::StateMachine;
use crate::storage::Persistence;
use crate::MessageSummary;
use crate::RaftTransport;

impl<N: RaftTransport, P: Persistence, M: StateMachine> RaftCore<N, P, M> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// A grant is durable before the response leaves this node: the hard state carrying
    /// `voted_for` is flushed first, so a crash-restart can never hand out a second vote for
    /// the same term.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if req.term < self.current_term {
            tracing::debug!({candidate=req.candidate_id, self.current_term, rpc_term=req.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Per spec, if we observe a term greater than our own outside of the election timeout
        // minimum, then we must update term & immediately become follower. We still need to do
        // vote checking after this.
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            if self.target_state.is_leader() || self.target_state.is_candidate() {
                self.set_target_state(State::Follower);
            }
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        // If candidate's log is not at least as up-to-date as this node, then reject.
        let last_log_id = self.log.last_log_id();
        let candidate_is_up_to_date = (req.last_log_term, req.last_log_index) >= (last_log_id.term, last_log_id.index);
        if !candidate_is_up_to_date {
            tracing::debug!(
                {candidate=req.candidate_id},
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date so handle voting conditions: within a term, this node
        // votes for at most one candidate, first-come-first-served.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &req.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(req.candidate_id);
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                tracing::debug!({candidate=req.candidate_id}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}
