use super::Rule;
use crate::labels::Selector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A policy that may select workload endpoints in any namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.projectcalico.org",
    version = "v1",
    kind = "GlobalNetworkPolicy"
)]
pub struct GlobalNetworkPolicySpec {
    #[serde(flatten)]
    pub policy: PolicySpec,
}

/// A policy that selects workload endpoints in its own namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.projectcalico.org",
    version = "v1",
    kind = "NetworkPolicy",
    namespaced
)]
pub struct NetworkPolicySpec {
    #[serde(flatten)]
    pub policy: PolicySpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// The tier the policy belongs to. Unset means the default tier.
    pub tier: Option<String>,

    /// Policies with lower orders are evaluated first within their tier.
    pub order: Option<f64>,

    /// Selects endpoints with a structured label selector (`matchLabels` and
    /// `matchExpressions`). Calico's own resources carry selector expressions as strings, so
    /// these resources are not schema-compatible with `crd.projectcalico.org/v1` objects.
    #[serde(default)]
    pub selector: Selector,

    /// The directions the policy applies to. When unset, a policy always applies to ingress
    /// and applies to egress only if it has egress rules.
    pub types: Option<Vec<PolicyType>>,

    #[serde(default)]
    pub ingress: Vec<Rule>,
    #[serde(default)]
    pub egress: Vec<Rule>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PolicyType {
    Ingress,
    Egress,
}

// === impl PolicySpec ===

impl PolicySpec {
    /// Returns whether the policy applies to (ingress, egress) traffic.
    pub fn directions(&self) -> (bool, bool) {
        match self.types.as_deref() {
            Some(types) => (
                types.contains(&PolicyType::Ingress),
                types.contains(&PolicyType::Egress),
            ),
            None => (true, !self.egress.is_empty()),
        }
    }
}
