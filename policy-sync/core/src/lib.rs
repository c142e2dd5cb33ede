#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoint;
mod mirror;
mod policy;
mod update;

pub use self::{
    endpoint::{EndpointActiveState, InvalidWorkload, TierInfo, WorkloadId},
    mirror::Mirror,
    policy::{Action, EntityRule, Policy, PolicyId, Profile, ProfileId, Rule},
    update::Update,
};
use anyhow::Result;
use futures::prelude::*;
use std::{pin::Pin, sync::Arc};

/// The tier that policies are placed in when they do not name one.
pub const DEFAULT_TIER: &str = "default";

/// Models per-workload subscription to the endpoint index.
#[async_trait::async_trait]
pub trait DiscoverEndpoint {
    /// Atomically captures the workload's current state and begins buffering every subsequent
    /// delta for it. Any previous subscription for the same workload stops receiving updates.
    async fn subscribe(&self, workload: &WorkloadId) -> Result<Subscription>;
}

pub type UpdateStream = Pin<Box<dyn Stream<Item = Update> + Send + Sync + 'static>>;

/// A point-in-time view of one workload, along with the deltas that follow it.
pub struct Subscription {
    pub snapshot: Snapshot,
    pub updates: UpdateStream,
}

/// The state a new subscriber must observe before it is in sync.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// Unset when the workload's endpoint has not (yet) been observed in the datastore.
    pub endpoint: Option<(WorkloadId, EndpointActiveState)>,
    pub profiles: Vec<(ProfileId, Arc<Profile>)>,
    pub policies: Vec<(PolicyId, Arc<Policy>)>,
}

// === impl Snapshot ===

impl Snapshot {
    /// Lists the updates that transform an empty mirror into this snapshot.
    ///
    /// Active profiles and policies precede the endpoint that references them.
    pub fn into_updates(self) -> impl Iterator<Item = Update> {
        let Self {
            endpoint,
            profiles,
            policies,
        } = self;
        let profiles = profiles
            .into_iter()
            .map(|(id, profile)| Update::ActiveProfileAdded(id, profile));
        let policies = policies
            .into_iter()
            .map(|(id, policy)| Update::ActivePolicyAdded(id, policy));
        let endpoint = endpoint.map(|(id, state)| Update::EndpointTierInfoChanged {
            endpoint: id,
            tiers: state.tiers,
            profile_ids: state.profile_ids,
        });
        profiles.chain(policies).chain(endpoint)
    }
}
