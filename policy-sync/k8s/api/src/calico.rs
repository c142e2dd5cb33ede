//! Bindings for the Calico v3 resources stored as Kubernetes custom resources.

pub mod network_policy;
pub mod profile;
pub mod rule;
pub mod tier;
pub mod workload_endpoint;

pub use self::{
    network_policy::{
        GlobalNetworkPolicy, GlobalNetworkPolicySpec, NetworkPolicy, NetworkPolicySpec,
        PolicySpec, PolicyType,
    },
    profile::{Profile, ProfileSpec},
    rule::{Action, EntityRule, Rule},
    tier::{Tier, TierSpec},
    workload_endpoint::{WorkloadEndpoint, WorkloadEndpointSpec},
};

pub const GROUP: &str = "crd.projectcalico.org";
