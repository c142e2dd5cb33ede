use crate::metrics::IndexMetrics;
use policy_sync_core::{EndpointActiveState, PolicyId, ProfileId, Update, WorkloadId};
use policy_sync_k8s_api::Labels;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Tracks a single workload endpoint and its subscriber.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) namespace: String,

    /// Unset until the endpoint's resource is observed. An endpoint may be subscribed to before
    /// it is known, in which case it is tracked as pending.
    pub(crate) resource: Option<Resource>,

    /// The state last published to the subscriber. Unset until the resource is observed.
    pub(crate) state: Option<EndpointActiveState>,

    pub(crate) subscriber: Option<mpsc::Sender<Update>>,
}

/// The inputs to an endpoint's active state, as read from its resource.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Resource {
    /// The endpoint's own labels, including the orchestrator-assigned labels.
    pub(crate) labels: Labels,

    /// De-duplicated, in the order the endpoint lists them.
    pub(crate) profile_ids: Vec<ProfileId>,
}

/// Identifies policies and profiles whose content changed in the course of a single index
/// update. Endpoints that remain subscribed to them must learn the new content.
#[derive(Debug, Default)]
pub(crate) struct ContentChanges {
    pub(crate) profiles: BTreeSet<ProfileId>,
    pub(crate) policies: BTreeSet<PolicyId>,
}

// === impl ContentChanges ===

impl ContentChanges {
    pub(crate) fn extend(&mut self, other: Self) {
        self.profiles.extend(other.profiles);
        self.policies.extend(other.policies);
    }
}

// === impl Endpoint ===

impl Endpoint {
    pub(crate) fn pending(namespace: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            resource: None,
            state: None,
            subscriber: None,
        }
    }

    pub(crate) fn is_known(&self) -> bool {
        self.resource.is_some()
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.subscriber.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Publishes updates to the subscriber in order.
    ///
    /// A subscriber that cannot keep up is dropped: its queue closes once drained, and it must
    /// subscribe again to receive a fresh snapshot.
    pub(crate) fn publish(
        &mut self,
        id: &WorkloadId,
        updates: impl IntoIterator<Item = Update>,
        metrics: &IndexMetrics,
    ) {
        let Some(tx) = self.subscriber.as_ref() else {
            return;
        };

        for update in updates {
            let kind = update.kind();
            match tx.try_send(update) {
                Ok(()) => metrics.update_sent(kind),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(workload = %id, "Subscriber queue is full; dropping subscriber");
                    metrics.queue_overflowed();
                    self.subscriber = None;
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(workload = %id, "Subscriber went away");
                    self.subscriber = None;
                    return;
                }
            }
        }
    }
}

/// Computes the updates that move a subscriber from `old` to `new`.
///
/// Ids are added before anything references them and removed only after nothing does, so a
/// subscriber never observes a dangling reference nor an id active longer than it is.
pub(crate) fn diff(
    id: &WorkloadId,
    old: Option<&EndpointActiveState>,
    new: &EndpointActiveState,
    changes: &ContentChanges,
    mut profile: impl FnMut(&ProfileId) -> Update,
    mut policy: impl FnMut(&PolicyId) -> Update,
) -> Vec<Update> {
    let announce = old.is_none();
    let empty = EndpointActiveState::default();
    let old = old.unwrap_or(&empty);

    let old_policies = old.policy_ids();
    let new_policies = new.policy_ids();

    let mut updates = Vec::new();

    for p in &new.profile_ids {
        if !old.profile_ids.contains(p) || changes.profiles.contains(p) {
            updates.push(profile(p));
        }
    }

    for p in &new_policies {
        if !old_policies.contains(p) || changes.policies.contains(p) {
            updates.push(policy(p));
        }
    }

    if announce || old.tiers != new.tiers || old.profile_ids != new.profile_ids {
        updates.push(Update::EndpointTierInfoChanged {
            endpoint: id.clone(),
            tiers: new.tiers.clone(),
            profile_ids: new.profile_ids.clone(),
        });
    }

    for p in old_policies.difference(&new_policies) {
        updates.push(Update::ActivePolicyRemoved(p.clone()));
    }

    for p in &old.profile_ids {
        if !new.profile_ids.contains(p) {
            updates.push(Update::ActiveProfileRemoved(p.clone()));
        }
    }

    updates
}

/// Indicates whether the updates deactivate any policy or profile.
pub(crate) fn revokes(updates: &[Update]) -> bool {
    updates.iter().any(|u| {
        matches!(
            u,
            Update::ActivePolicyRemoved(_) | Update::ActiveProfileRemoved(_)
        )
    })
}

/// Lists the updates that drain a subscriber's view of a deleted endpoint.
pub(crate) fn removal(id: &WorkloadId, old: &EndpointActiveState) -> Vec<Update> {
    let mut updates = vec![Update::EndpointTierInfoChanged {
        endpoint: id.clone(),
        tiers: vec![],
        profile_ids: vec![],
    }];
    updates.extend(old.policy_ids().into_iter().map(Update::ActivePolicyRemoved));
    updates.extend(
        old.profile_ids
            .iter()
            .cloned()
            .map(Update::ActiveProfileRemoved),
    );
    updates.push(Update::EndpointRemoved(id.clone()));
    updates
}
