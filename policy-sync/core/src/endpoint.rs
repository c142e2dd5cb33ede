use crate::{PolicyId, ProfileId};
use std::{collections::BTreeSet, fmt, str::FromStr};

/// Uniquely names a single workload network endpoint.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadId {
    pub orchestrator: String,
    pub namespace: String,
    pub workload: String,
    pub endpoint: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid workload identifier: {0}")]
pub struct InvalidWorkload(pub String);

/// The policies of a single tier that apply to an endpoint, in evaluation order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TierInfo {
    pub name: String,
    pub ingress_policies: Vec<String>,
    pub egress_policies: Vec<String>,
}

/// The policy and profile state that applies to one endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointActiveState {
    /// Tiers that have at least one policy selecting the endpoint, in evaluation order.
    pub tiers: Vec<TierInfo>,

    /// The endpoint's profiles, de-duplicated, in the order the endpoint lists them.
    pub profile_ids: Vec<ProfileId>,
}

// === impl WorkloadId ===

impl WorkloadId {
    pub fn new(
        orchestrator: impl ToString,
        namespace: impl ToString,
        workload: impl ToString,
        endpoint: impl ToString,
    ) -> Result<Self, InvalidWorkload> {
        let id = Self {
            orchestrator: orchestrator.to_string(),
            namespace: namespace.to_string(),
            workload: workload.to_string(),
            endpoint: endpoint.to_string(),
        };
        let valid = [&id.orchestrator, &id.namespace, &id.workload, &id.endpoint]
            .iter()
            .all(|part| !part.is_empty() && !part.contains('/'));
        if !valid {
            return Err(InvalidWorkload(id.to_string()));
        }
        Ok(id)
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.orchestrator, self.namespace, self.workload, self.endpoint
        )
    }
}

impl FromStr for WorkloadId {
    type Err = InvalidWorkload;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(orch), Some(ns), Some(wl), Some(ep), None) => Self::new(orch, ns, wl, ep),
            _ => Err(InvalidWorkload(s.to_string())),
        }
    }
}

// === impl EndpointActiveState ===

impl EndpointActiveState {
    /// Returns every policy referenced by the endpoint's tiers.
    pub fn policy_ids(&self) -> BTreeSet<PolicyId> {
        self.tiers
            .iter()
            .flat_map(|tier| {
                tier.ingress_policies
                    .iter()
                    .chain(tier.egress_policies.iter())
                    .map(move |name| PolicyId::new(&tier.name, name))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty() && self.profile_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_workload_id() {
        let id = "k8s/fv/fv-pod-0/eth0".parse::<WorkloadId>().expect("must parse");
        assert_eq!(
            id,
            WorkloadId {
                orchestrator: "k8s".to_string(),
                namespace: "fv".to_string(),
                workload: "fv-pod-0".to_string(),
                endpoint: "eth0".to_string(),
            }
        );
        assert_eq!(id.to_string(), "k8s/fv/fv-pod-0/eth0");
    }

    #[test]
    fn reject_malformed_workload_ids() {
        for input in ["", "k8s/fv/pod", "k8s/fv/pod/eth0/extra", "k8s//pod/eth0"] {
            assert!(
                input.parse::<WorkloadId>().is_err(),
                "{input:?} must not parse"
            );
        }
        assert!(WorkloadId::new("k8s", "fv", "a/b", "eth0").is_err());
    }

    #[test]
    fn policy_ids_span_directions() {
        let state = EndpointActiveState {
            tiers: vec![
                TierInfo {
                    name: "security".to_string(),
                    ingress_policies: vec!["a".to_string()],
                    egress_policies: vec!["a".to_string(), "b".to_string()],
                },
                TierInfo {
                    name: "default".to_string(),
                    ingress_policies: vec!["c".to_string()],
                    egress_policies: vec![],
                },
            ],
            profile_ids: vec![],
        };
        assert_eq!(
            state.policy_ids().into_iter().collect::<Vec<_>>(),
            vec![
                PolicyId::new("default", "c"),
                PolicyId::new("security", "a"),
                PolicyId::new("security", "b"),
            ]
        );
    }
}
