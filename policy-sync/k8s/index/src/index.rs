use crate::{
    endpoint::{self, ContentChanges, Endpoint, Resource},
    metrics::IndexMetrics,
};
use ahash::AHashMap as HashMap;
use kubert::index::{
    ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved,
};
use parking_lot::RwLock;
use policy_sync_core::{
    Action, EndpointActiveState, EntityRule, InvalidWorkload, Policy, PolicyId, Profile,
    ProfileId, Rule, Snapshot, TierInfo, Update, WorkloadId, DEFAULT_TIER,
};
use policy_sync_k8s_api::{
    calico,
    labels::{self, Labels, Selector},
    ResourceExt,
};
use std::{cmp::Ordering, num::NonZeroUsize, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Receives the ids of endpoints deleted from the datastore.
pub type Removals = mpsc::UnboundedReceiver<WorkloadId>;

/// Labels that every endpoint carries in addition to its own.
pub const NAMESPACE_LABEL: &str = "projectcalico.org/namespace";
pub const ORCHESTRATOR_LABEL: &str = "projectcalico.org/orchestrator";

#[derive(Clone, Debug)]
pub struct Config {
    /// When set, only endpoints scheduled to this node are indexed.
    pub node_name: Option<String>,

    /// The number of updates buffered for each subscriber.
    pub queue_capacity: NonZeroUsize,
}

/// Holds the policy model and every tracked endpoint's active state.
///
/// Updated by the resource watches and read by subscribers. Every mutation runs to completion
/// under the write lock, so each subscriber observes the index's transitions in order.
#[derive(Debug)]
pub struct Index {
    config: Config,

    /// Tier orders, by tier name.
    tiers: HashMap<String, Option<f64>>,

    /// Policies keyed by name. Namespaced policies are named `namespace/name`.
    policies: HashMap<String, PolicyEntry>,

    profiles: HashMap<String, ProfileEntry>,

    pub(crate) endpoints: HashMap<WorkloadId, Endpoint>,

    /// Maps each workload endpoint resource's `(namespace, name)` to the endpoint it describes.
    pub(crate) resources: HashMap<(String, String), WorkloadId>,

    removals: mpsc::UnboundedSender<WorkloadId>,

    metrics: IndexMetrics,
}

#[derive(Debug)]
struct PolicyEntry {
    id: PolicyId,
    order: Option<f64>,

    /// Unset for global policies.
    namespace: Option<String>,

    selector: Selector,
    ingress: bool,
    egress: bool,
    content: Arc<Policy>,
}

/// An endpoint's next state and the updates that bring its subscriber there.
#[derive(Debug)]
pub(crate) struct Transition {
    pub(crate) id: WorkloadId,
    pub(crate) state: EndpointActiveState,
    pub(crate) updates: Vec<Update>,
}

#[derive(Debug)]
struct ProfileEntry {
    labels: labels::Map,
    content: Arc<Profile>,
}

// === impl Index ===

impl Index {
    pub fn shared(config: Config, metrics: IndexMetrics) -> (SharedIndex, Removals) {
        let (removals, rx) = mpsc::unbounded_channel();
        let index = Self {
            config,
            tiers: HashMap::default(),
            policies: HashMap::default(),
            profiles: HashMap::default(),
            endpoints: HashMap::default(),
            resources: HashMap::default(),
            removals,
            metrics,
        };
        (Arc::new(RwLock::new(index)), rx)
    }

    /// Captures the workload's current state and installs a new queue that receives every
    /// subsequent update for it.
    ///
    /// A previously installed queue is closed. A workload that has not been observed yet is
    /// tracked as pending, with an empty snapshot.
    pub fn subscribe(&mut self, workload: &WorkloadId) -> (Snapshot, mpsc::Receiver<Update>) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.get());

        let ep = self.endpoints.entry(workload.clone()).or_insert_with(|| {
            debug!(%workload, "Tracking pending endpoint");
            Endpoint::pending(&workload.namespace)
        });
        if ep.subscriber.replace(tx).is_some() {
            debug!(%workload, "Replaced subscriber");
        }
        let state = ep.state.clone();

        let snapshot = self.snapshot(workload, state);
        self.update_gauges();
        (snapshot, rx)
    }

    /// Drops the workload's subscriber, if any, and forgets the workload if it was never
    /// observed.
    pub fn release(&mut self, workload: &WorkloadId) {
        if let Some(ep) = self.endpoints.get_mut(workload) {
            ep.subscriber = None;
            if !ep.is_known() {
                debug!(%workload, "Forgetting pending endpoint");
                self.endpoints.remove(workload);
            }
        }
        self.update_gauges();
    }

    /// Drops the workload's subscriber if its receiver has gone away, and forgets the workload
    /// if it was never observed.
    pub fn release_closed(&mut self, workload: &WorkloadId) {
        let closed = self
            .endpoints
            .get(workload)
            .and_then(|ep| ep.subscriber.as_ref())
            .is_some_and(|tx| tx.is_closed());
        if closed {
            debug!(%workload, "Subscriber went away");
            self.release(workload);
        }
    }

    /// Indicates whether the workload has a live subscriber.
    pub fn is_subscribed(&self, workload: &WorkloadId) -> bool {
        self.endpoints
            .get(workload)
            .is_some_and(Endpoint::is_subscribed)
    }

    fn snapshot(&self, id: &WorkloadId, state: Option<EndpointActiveState>) -> Snapshot {
        let Some(state) = state else {
            return Snapshot::default();
        };
        Snapshot {
            profiles: state
                .profile_ids
                .iter()
                .map(|p| (p.clone(), self.profile_content(p)))
                .collect(),
            policies: state
                .policy_ids()
                .into_iter()
                .map(|p| {
                    let content = self.policy_content(&p);
                    (p, content)
                })
                .collect(),
            endpoint: Some((id.clone(), state)),
        }
    }

    /// Referenced profiles are active whether or not they exist; unknown profiles are empty.
    fn profile_content(&self, id: &ProfileId) -> Arc<Profile> {
        self.profiles
            .get(&id.name)
            .map(|p| p.content.clone())
            .unwrap_or_default()
    }

    fn policy_content(&self, id: &PolicyId) -> Arc<Policy> {
        self.policies
            .get(&id.name)
            .filter(|p| p.id == *id)
            .map(|p| p.content.clone())
            .unwrap_or_default()
    }

    fn tier_order(&self, tier: &str) -> Option<f64> {
        self.tiers.get(tier).copied().flatten()
    }

    /// Computes the endpoint's active state from the current policy model.
    fn active_state(&self, ep: &Endpoint) -> Option<EndpointActiveState> {
        let resource = ep.resource.as_ref()?;

        // Profile labels apply in profile order; the endpoint's own labels take precedence.
        let labels = resource.labels.with_defaults(
            resource
                .profile_ids
                .iter()
                .filter_map(|p| self.profiles.get(&p.name))
                .flat_map(|p| p.labels.iter()),
        );

        let mut selected = self
            .policies
            .values()
            .filter(|p| p.namespace.as_ref().map_or(true, |ns| *ns == ep.namespace))
            .filter(|p| p.selector.matches(&labels))
            .collect::<Vec<_>>();
        selected.sort_by(|a, b| {
            cmp_order(self.tier_order(&a.id.tier), self.tier_order(&b.id.tier))
                .then_with(|| a.id.tier.cmp(&b.id.tier))
                .then_with(|| cmp_order(a.order, b.order))
                .then_with(|| a.id.name.cmp(&b.id.name))
        });

        let mut tiers = Vec::<TierInfo>::new();
        for policy in selected {
            if tiers.last().map_or(true, |t| t.name != policy.id.tier) {
                tiers.push(TierInfo {
                    name: policy.id.tier.clone(),
                    ..TierInfo::default()
                });
            }
            if let Some(tier) = tiers.last_mut() {
                if policy.ingress {
                    tier.ingress_policies.push(policy.id.name.clone());
                }
                if policy.egress {
                    tier.egress_policies.push(policy.id.name.clone());
                }
            }
        }

        Some(EndpointActiveState {
            tiers,
            profile_ids: resource.profile_ids.clone(),
        })
    }

    /// Recomputes every known endpoint's state and publishes the changes to its subscriber.
    fn reconcile(&mut self, changes: &ContentChanges) {
        for Transition { id, state, updates } in self.transitions(changes) {
            if let Some(ep) = self.endpoints.get_mut(&id) {
                debug!(workload = %id, updates = updates.len(), "Endpoint changed");
                ep.state = Some(state);
                ep.publish(&id, updates, &self.metrics);
            }
        }

        self.update_gauges();
    }

    /// Lists the endpoints whose state changes, with those that lose an active id first, so that
    /// an id that moves between endpoints is removed from one before it is added to another.
    pub(crate) fn transitions(&self, changes: &ContentChanges) -> Vec<Transition> {
        let mut transitions = self
            .endpoints
            .iter()
            .filter_map(|(id, ep)| {
                let state = self.active_state(ep)?;
                let updates = endpoint::diff(
                    id,
                    ep.state.as_ref(),
                    &state,
                    changes,
                    |p| Update::ActiveProfileAdded(p.clone(), self.profile_content(p)),
                    |p| Update::ActivePolicyAdded(p.clone(), self.policy_content(p)),
                );
                if updates.is_empty() {
                    return None;
                }
                Some(Transition {
                    id: id.clone(),
                    state,
                    updates,
                })
            })
            .collect::<Vec<_>>();
        transitions.sort_by_key(|t| !endpoint::revokes(&t.updates));
        transitions
    }

    fn update_gauges(&self) {
        self.metrics
            .set_endpoints(self.endpoints.values().filter(|ep| ep.is_known()).count());
        self.metrics.set_subscribers(
            self.endpoints
                .values()
                .filter(|ep| ep.is_subscribed())
                .count(),
        );
    }

    fn apply_tier(&mut self, tier: calico::Tier) -> bool {
        let name = tier.name_unchecked();
        let order = tier.spec.order;
        let prior = self.tiers.insert(name, order);
        prior != Some(order)
    }

    pub(crate) fn apply_policy(
        &mut self,
        key: String,
        namespace: Option<String>,
        spec: calico::PolicySpec,
    ) -> ContentChanges {
        let tier = spec
            .tier
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TIER.to_string());
        let (ingress, egress) = spec.directions();
        let content = Arc::new(Policy {
            inbound_rules: spec.ingress.iter().map(mk_rule).collect(),
            outbound_rules: spec.egress.iter().map(mk_rule).collect(),
        });
        let id = PolicyId::new(tier, &key);

        let mut changes = ContentChanges::default();
        if let Some(prior) = self.policies.get(&key) {
            if prior.id == id && prior.content != content {
                changes.policies.insert(id.clone());
            }
        }

        self.policies.insert(
            key,
            PolicyEntry {
                id,
                order: spec.order,
                namespace,
                selector: spec.selector,
                ingress,
                egress,
                content,
            },
        );
        changes
    }

    fn apply_profile(&mut self, profile: calico::Profile) -> ContentChanges {
        let name = profile.name_unchecked();
        let id = ProfileId::new(&name);
        let calico::ProfileSpec {
            labels_to_apply,
            ingress,
            egress,
        } = profile.spec;
        let labels = labels_to_apply.unwrap_or_default();
        let content = Arc::new(Profile {
            labels_to_apply: labels.clone(),
            inbound_rules: ingress.iter().map(mk_rule).collect(),
            outbound_rules: egress.iter().map(mk_rule).collect(),
        });

        let mut changes = ContentChanges::default();
        if self.profile_content(&id) != content {
            changes.profiles.insert(id);
        }
        self.profiles.insert(name, ProfileEntry { labels, content });
        changes
    }

    fn delete_profile(&mut self, name: String) -> ContentChanges {
        let mut changes = ContentChanges::default();
        if let Some(prior) = self.profiles.remove(&name) {
            if *prior.content != Profile::default() {
                changes.profiles.insert(ProfileId::new(name));
            }
        }
        changes
    }

    /// Records the endpoint's resource, returning whether the endpoint changed.
    fn apply_endpoint(&mut self, wep: calico::WorkloadEndpoint) -> bool {
        let Some(namespace) = wep.namespace() else {
            warn!(name = %wep.name_any(), "Ignoring workload endpoint without a namespace");
            return false;
        };
        let name = wep.name_unchecked();

        if let Some(node) = self.config.node_name.as_deref() {
            if wep.spec.node.as_deref() != Some(node) {
                self.delete_endpoint(&namespace, &name);
                return false;
            }
        }

        let id = match workload_id(&namespace, &wep.spec) {
            Ok(id) => id,
            Err(error) => {
                warn!(%namespace, %name, %error, "Ignoring workload endpoint");
                return false;
            }
        };

        let key = (namespace.clone(), name);
        if self.resources.get(&key).is_some_and(|prior| *prior != id) {
            self.delete_endpoint(&key.0, &key.1);
        }

        let mut labels = wep.labels().clone();
        labels.insert(NAMESPACE_LABEL.to_string(), namespace.clone());
        labels.insert(ORCHESTRATOR_LABEL.to_string(), wep.spec.orchestrator.clone());

        let mut profile_ids = Vec::<ProfileId>::new();
        for name in wep.spec.profiles.iter().filter(|p| !p.is_empty()) {
            let p = ProfileId::new(name);
            if !profile_ids.contains(&p) {
                profile_ids.push(p);
            }
        }

        let resource = Resource {
            labels: Labels::from(labels),
            profile_ids,
        };

        self.resources.insert(key, id.clone());
        let ep = self
            .endpoints
            .entry(id.clone())
            .or_insert_with(|| Endpoint::pending(&namespace));
        if ep.resource.as_ref() == Some(&resource) {
            return false;
        }
        if !ep.is_known() {
            info!(workload = %id, "Indexed workload endpoint");
        }
        ep.resource = Some(resource);
        true
    }

    /// Drains the endpoint's subscriber, closes its queue and announces the removal.
    fn delete_endpoint(&mut self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let Some(id) = self.resources.remove(&key) else {
            return;
        };
        let Some(mut ep) = self.endpoints.remove(&id) else {
            return;
        };

        info!(workload = %id, "Workload endpoint deleted");
        let state = ep.state.take().unwrap_or_default();
        ep.publish(&id, endpoint::removal(&id, &state), &self.metrics);
        drop(ep);

        if self.removals.send(id).is_err() {
            debug!("Removal receiver dropped");
        }
        self.update_gauges();
    }
}

impl IndexClusterResource<calico::Tier> for Index {
    fn apply(&mut self, tier: calico::Tier) {
        if self.apply_tier(tier) {
            self.reconcile(&ContentChanges::default());
        }
    }

    fn delete(&mut self, name: String) {
        if self.tiers.remove(&name).is_some() {
            self.reconcile(&ContentChanges::default());
        }
    }

    fn reset(&mut self, tiers: Vec<calico::Tier>, removed: ClusterRemoved) {
        self.metrics.reset("Tier");
        for tier in tiers {
            self.apply_tier(tier);
        }
        for name in removed {
            self.tiers.remove(&name);
        }
        self.reconcile(&ContentChanges::default());
    }
}

impl IndexClusterResource<calico::GlobalNetworkPolicy> for Index {
    fn apply(&mut self, policy: calico::GlobalNetworkPolicy) {
        let name = policy.name_unchecked();
        let changes = self.apply_policy(name, None, policy.spec.policy);
        self.reconcile(&changes);
    }

    fn delete(&mut self, name: String) {
        if self.policies.remove(&name).is_some() {
            self.reconcile(&ContentChanges::default());
        }
    }

    fn reset(&mut self, policies: Vec<calico::GlobalNetworkPolicy>, removed: ClusterRemoved) {
        self.metrics.reset("GlobalNetworkPolicy");
        let mut changes = ContentChanges::default();
        for policy in policies {
            let name = policy.name_unchecked();
            changes.extend(self.apply_policy(name, None, policy.spec.policy));
        }
        for name in removed {
            self.policies.remove(&name);
        }
        self.reconcile(&changes);
    }
}

impl IndexNamespacedResource<calico::NetworkPolicy> for Index {
    fn apply(&mut self, policy: calico::NetworkPolicy) {
        let Some(namespace) = policy.namespace() else {
            return;
        };
        let key = format!("{namespace}/{}", policy.name_unchecked());
        let changes = self.apply_policy(key, Some(namespace), policy.spec.policy);
        self.reconcile(&changes);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.policies.remove(&format!("{namespace}/{name}")).is_some() {
            self.reconcile(&ContentChanges::default());
        }
    }

    fn reset(&mut self, policies: Vec<calico::NetworkPolicy>, removed: NamespacedRemoved) {
        self.metrics.reset("NetworkPolicy");
        let mut changes = ContentChanges::default();
        for policy in policies {
            let Some(namespace) = policy.namespace() else {
                continue;
            };
            let key = format!("{namespace}/{}", policy.name_unchecked());
            changes.extend(self.apply_policy(key, Some(namespace), policy.spec.policy));
        }
        for (namespace, names) in removed {
            for name in names {
                self.policies.remove(&format!("{namespace}/{name}"));
            }
        }
        self.reconcile(&changes);
    }
}

impl IndexClusterResource<calico::Profile> for Index {
    fn apply(&mut self, profile: calico::Profile) {
        let changes = self.apply_profile(profile);
        self.reconcile(&changes);
    }

    fn delete(&mut self, name: String) {
        let changes = self.delete_profile(name);
        self.reconcile(&changes);
    }

    fn reset(&mut self, profiles: Vec<calico::Profile>, removed: ClusterRemoved) {
        self.metrics.reset("Profile");
        let mut changes = ContentChanges::default();
        for profile in profiles {
            changes.extend(self.apply_profile(profile));
        }
        for name in removed {
            changes.extend(self.delete_profile(name));
        }
        self.reconcile(&changes);
    }
}

impl IndexNamespacedResource<calico::WorkloadEndpoint> for Index {
    fn apply(&mut self, wep: calico::WorkloadEndpoint) {
        if self.apply_endpoint(wep) {
            self.reconcile(&ContentChanges::default());
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_endpoint(&namespace, &name);
    }

    fn reset(&mut self, weps: Vec<calico::WorkloadEndpoint>, removed: NamespacedRemoved) {
        self.metrics.reset("WorkloadEndpoint");
        for wep in weps {
            self.apply_endpoint(wep);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete_endpoint(&namespace, &name);
            }
        }
        self.reconcile(&ContentChanges::default());
    }
}

fn workload_id(
    namespace: &str,
    spec: &calico::WorkloadEndpointSpec,
) -> Result<WorkloadId, InvalidWorkload> {
    WorkloadId::new(
        &spec.orchestrator,
        namespace,
        spec.workload_name().unwrap_or_default(),
        &spec.endpoint,
    )
}

/// Orders by `order`, with unordered items last.
fn cmp_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn mk_rule(rule: &calico::Rule) -> Rule {
    Rule {
        action: match rule.action {
            calico::Action::Allow => Action::Allow,
            calico::Action::Deny => Action::Deny,
            calico::Action::Log => Action::Log,
            calico::Action::Pass => Action::Pass,
        },
        protocol: rule.protocol.clone(),
        source: mk_entity(&rule.source),
        destination: mk_entity(&rule.destination),
    }
}

fn mk_entity(entity: &calico::EntityRule) -> EntityRule {
    EntityRule {
        nets: entity.nets.clone(),
        ports: entity.ports.clone(),
    }
}
