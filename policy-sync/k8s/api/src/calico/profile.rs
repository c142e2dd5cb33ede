use super::Rule;
use crate::labels;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default rules and labels shared by the workload endpoints that list the profile.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "crd.projectcalico.org", version = "v1", kind = "Profile")]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    pub labels_to_apply: Option<labels::Map>,
    #[serde(default)]
    pub ingress: Vec<Rule>,
    #[serde(default)]
    pub egress: Vec<Rule>,
}
