use crate::{Policy, PolicyId, Profile, ProfileId, TierInfo, Update, WorkloadId};
use anyhow::{bail, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Reconstructs a subscriber's view of its workload by replaying updates from an empty state.
///
/// Replay fails if the stream violates the ordering a dataplane depends on: an endpoint
/// referencing an inactive policy or profile, removing a policy or profile that is still
/// referenced, or a second `InSync`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mirror {
    in_sync: bool,
    profiles: BTreeMap<ProfileId, Arc<Profile>>,
    policies: BTreeMap<PolicyId, Arc<Policy>>,
    endpoints: BTreeMap<WorkloadId, Endpoint>,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Endpoint {
    tiers: Vec<TierInfo>,
    profile_ids: Vec<ProfileId>,
}

impl Mirror {
    pub fn apply(&mut self, update: Update) -> Result<()> {
        match update {
            Update::FullSnapshotBegin => {
                *self = Self::default();
            }

            Update::InSync => {
                if self.in_sync {
                    bail!("duplicate in-sync marker");
                }
                self.in_sync = true;
            }

            Update::ActiveProfileAdded(id, profile) => {
                self.profiles.insert(id, profile);
            }

            Update::ActiveProfileRemoved(id) => {
                if self.endpoints.values().any(|ep| ep.profile_ids.contains(&id)) {
                    bail!("profile {id} removed while still referenced");
                }
                if self.profiles.remove(&id).is_none() {
                    bail!("profile {id} removed but not active");
                }
            }

            Update::ActivePolicyAdded(id, policy) => {
                self.policies.insert(id, policy);
            }

            Update::ActivePolicyRemoved(id) => {
                if self.endpoints.values().any(|ep| references(ep, &id)) {
                    bail!("policy {id} removed while still referenced");
                }
                if self.policies.remove(&id).is_none() {
                    bail!("policy {id} removed but not active");
                }
            }

            Update::EndpointTierInfoChanged {
                endpoint,
                tiers,
                profile_ids,
            } => {
                let ep = Endpoint { tiers, profile_ids };
                for id in &ep.profile_ids {
                    if !self.profiles.contains_key(id) {
                        bail!("endpoint {endpoint} references inactive profile {id}");
                    }
                }
                for id in policies_of(&ep) {
                    if !self.policies.contains_key(&id) {
                        bail!("endpoint {endpoint} references inactive policy {id}");
                    }
                }
                self.endpoints.insert(endpoint, ep);
            }

            Update::EndpointRemoved(endpoint) => {
                self.endpoints.remove(&endpoint);
            }
        }

        Ok(())
    }

    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn active_profiles(&self) -> BTreeSet<ProfileId> {
        self.profiles.keys().cloned().collect()
    }

    pub fn active_policies(&self) -> BTreeSet<PolicyId> {
        self.policies.keys().cloned().collect()
    }

    pub fn profile(&self, id: &ProfileId) -> Option<&Profile> {
        self.profiles.get(id).map(|p| &**p)
    }

    pub fn policy(&self, id: &PolicyId) -> Option<&Policy> {
        self.policies.get(id).map(|p| &**p)
    }

    /// Returns each known endpoint's tier sequence.
    pub fn endpoint_tiers(&self) -> BTreeMap<WorkloadId, Vec<TierInfo>> {
        self.endpoints
            .iter()
            .map(|(id, ep)| (id.clone(), ep.tiers.clone()))
            .collect()
    }

    /// Returns each known endpoint's profile list.
    pub fn endpoint_profiles(&self) -> BTreeMap<WorkloadId, Vec<ProfileId>> {
        self.endpoints
            .iter()
            .map(|(id, ep)| (id.clone(), ep.profile_ids.clone()))
            .collect()
    }
}

fn policies_of(ep: &Endpoint) -> impl Iterator<Item = PolicyId> + '_ {
    ep.tiers.iter().flat_map(|tier| {
        tier.ingress_policies
            .iter()
            .chain(tier.egress_policies.iter())
            .map(move |name| PolicyId::new(&tier.name, name))
    })
}

fn references(ep: &Endpoint, id: &PolicyId) -> bool {
    ep.tiers.iter().any(|tier| {
        tier.name == id.tier
            && (tier.ingress_policies.contains(&id.name) || tier.egress_policies.contains(&id.name))
    })
}
