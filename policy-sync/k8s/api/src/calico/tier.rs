use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An ordered stage of policy evaluation.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "crd.projectcalico.org", version = "v1", kind = "Tier")]
#[serde(rename_all = "camelCase")]
pub struct TierSpec {
    /// Tiers with lower orders are evaluated first. Tiers without an order are evaluated last.
    pub order: Option<f64>,
}
