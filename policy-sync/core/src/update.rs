use crate::{Policy, PolicyId, Profile, ProfileId, TierInfo, WorkloadId};
use std::sync::Arc;

/// An event delivered to a workload's subscriber.
///
/// A stream begins with `FullSnapshotBegin`, carries the snapshot, and then exactly one `InSync`
/// before any incremental update.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    FullSnapshotBegin,

    /// A profile became active, or the content of an active profile changed.
    ActiveProfileAdded(ProfileId, Arc<Profile>),
    ActiveProfileRemoved(ProfileId),

    /// A policy became active, or the content of an active policy changed.
    ActivePolicyAdded(PolicyId, Arc<Policy>),
    ActivePolicyRemoved(PolicyId),

    /// Replaces the endpoint's complete tier sequence and profile list.
    EndpointTierInfoChanged {
        endpoint: WorkloadId,
        tiers: Vec<TierInfo>,
        profile_ids: Vec<ProfileId>,
    },

    InSync,

    /// The endpoint was deleted. Always the final update for a subscription.
    EndpointRemoved(WorkloadId),
}

impl Update {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FullSnapshotBegin => "full_snapshot_begin",
            Self::ActiveProfileAdded(..) => "active_profile_added",
            Self::ActiveProfileRemoved(_) => "active_profile_removed",
            Self::ActivePolicyAdded(..) => "active_policy_added",
            Self::ActivePolicyRemoved(_) => "active_policy_removed",
            Self::EndpointTierInfoChanged { .. } => "endpoint_tier_info_changed",
            Self::InSync => "in_sync",
            Self::EndpointRemoved(_) => "endpoint_removed",
        }
    }
}
