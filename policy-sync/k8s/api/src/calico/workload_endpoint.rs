use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single network interface of a workload. Its labels are taken from the resource metadata.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.projectcalico.org",
    version = "v1",
    kind = "WorkloadEndpoint",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointSpec {
    pub orchestrator: String,
    pub workload: Option<String>,
    pub pod: Option<String>,
    pub endpoint: String,
    pub node: Option<String>,
    #[serde(rename = "containerID")]
    pub container_id: Option<String>,
    pub interface_name: Option<String>,
    pub mac: Option<String>,
    #[serde(default)]
    pub ip_networks: Vec<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
}

impl WorkloadEndpointSpec {
    /// Kubernetes endpoints name their workload by pod.
    pub fn workload_name(&self) -> Option<&str> {
        self.pod
            .as_deref()
            .or(self.workload.as_deref())
            .filter(|name| !name.is_empty())
    }
}
