//! Cluster membership configuration.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::quorum;
use crate::NodeId;

/// The membership configuration of the cluster.
///
/// A config is either stable (a single member set) or in joint consensus, in which case
/// `members_after_consensus` holds the target member set and every decision requires
/// independent majorities of both sets.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// All members of the Raft cluster.
    pub members: BTreeSet<NodeId>,
    /// All members of the Raft cluster after joint consensus is finalized.
    ///
    /// The presence of a value here indicates that the config is in joint consensus.
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
}

impl MembershipConfig {
    /// Create a new initial config containing only the given node ID.
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            members,
            members_after_consensus: None,
        }
    }

    /// Create a new stable config over the given member set.
    pub fn new_stable(members: BTreeSet<NodeId>) -> Self {
        Self {
            members,
            members_after_consensus: None,
        }
    }

    /// Get an iterator over all nodes in the current config.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.members.clone();
        if let Some(members) = &self.members_after_consensus {
            all.extend(members);
        }
        all
    }

    /// Check if the given NodeId exists in this membership config.
    ///
    /// When in joint consensus, this will check both config groups.
    pub fn contains(&self, x: &NodeId) -> bool {
        self.members.contains(x)
            || if let Some(members) = &self.members_after_consensus {
                members.contains(x)
            } else {
                false
            }
    }

    /// Check to see if the config is currently in joint consensus.
    pub fn is_in_joint_consensus(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// The stable config this one resolves to once joint consensus finishes.
    pub fn to_final_config(&self) -> Self {
        match self.members_after_consensus {
            None => self.clone(),
            Some(ref m) => MembershipConfig {
                members: m.clone(),
                members_after_consensus: None,
            },
        }
    }

    /// Check whether the given set of affirmative nodes forms a quorum under this config.
    ///
    /// For a stable config this is a simple majority; in joint consensus both the current and
    /// the target member sets must independently reach majority.
    pub fn majority_satisfied(&self, votes: &BTreeSet<NodeId>) -> bool {
        let current = self.members.intersection(votes).count() >= quorum::majority_of(self.members.len());
        match &self.members_after_consensus {
            Some(next) => current && next.intersection(votes).count() >= quorum::majority_of(next.len()),
            None => current,
        }
    }
}
