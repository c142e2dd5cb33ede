use crate::{
    admission::{AdmitSubscriber, Admitted},
    metrics::{GrpcServerMetricsFamily, GrpcServerRpcMetrics, ResponseObserver},
    proto::policysync::{
        self as proto,
        policy_sync_server::{PolicySync, PolicySyncServer as Svc},
        to_dataplane::Payload,
    },
};
use futures::prelude::*;
use policy_sync_core::{
    DiscoverEndpoint, Policy, PolicyId, Profile, ProfileId, Rule, Subscription, TierInfo, Update,
    WorkloadId,
};
use std::pin::Pin;
use tracing::{debug, info};

/// Serves the policy sync API on a single workload's socket.
#[derive(Clone, Debug)]
pub struct PolicySyncServer<D, A> {
    workload: WorkloadId,
    discover: D,
    admit: A,
    drain: drain::Watch,
    metrics: GrpcServerRpcMetrics,
}

type BoxSyncStream =
    Pin<Box<dyn Stream<Item = Result<proto::ToDataplane, tonic::Status>> + Send + Sync>>;

// === impl PolicySyncServer ===

impl<D, A> PolicySyncServer<D, A>
where
    D: DiscoverEndpoint + Send + Sync + 'static,
    A: AdmitSubscriber + Send + Sync + 'static,
{
    pub fn new(
        workload: WorkloadId,
        discover: D,
        admit: A,
        drain: drain::Watch,
        metrics: &GrpcServerMetricsFamily,
    ) -> Self {
        Self {
            workload,
            discover,
            admit,
            drain,
            metrics: metrics.server_stream_rpc("policysync.PolicySync", "Sync"),
        }
    }

    pub fn svc(self) -> Svc<Self> {
        Svc::new(self)
    }
}

#[async_trait::async_trait]
impl<D, A> PolicySync for PolicySyncServer<D, A>
where
    D: DiscoverEndpoint + Send + Sync + 'static,
    A: AdmitSubscriber + Send + Sync + 'static,
{
    type SyncStream = BoxSyncStream;

    async fn sync(
        &self,
        _req: tonic::Request<proto::SyncRequest>,
    ) -> Result<tonic::Response<BoxSyncStream>, tonic::Status> {
        let mut metrics = self.metrics.start();

        // Any prior subscriber is gone before the snapshot is taken.
        let admitted = match self.admit.admit(&self.workload).await {
            Ok(admitted) => admitted,
            Err(error) => {
                let status = tonic::Status::unavailable(format!("admission failed: {error}"));
                metrics.end(status.code());
                return Err(status);
            }
        };

        let subscription = match self.discover.subscribe(&self.workload).await {
            Ok(subscription) => subscription,
            Err(error) => {
                let status = tonic::Status::internal(format!("subscription failed: {error}"));
                metrics.end(status.code());
                return Err(status);
            }
        };

        info!(workload = %self.workload, "Subscriber admitted");
        Ok(tonic::Response::new(response_stream(
            self.workload.clone(),
            admitted,
            subscription,
            self.drain.clone(),
            metrics,
        )))
    }
}

/// Streams the snapshot, then the in-sync marker, then every subsequent update.
///
/// The stream fails with ABORTED if the subscriber is evicted and with RESOURCE_EXHAUSTED if
/// its update queue is closed; it ends cleanly after the endpoint is removed or when the server
/// shuts down.
fn response_stream(
    workload: WorkloadId,
    mut admitted: Admitted,
    subscription: Subscription,
    drain: drain::Watch,
    mut metrics: ResponseObserver,
) -> BoxSyncStream {
    let Subscription {
        snapshot,
        mut updates,
    } = subscription;

    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let mut seq = 0;
        let mut next = move |update: &Update| {
            seq += 1;
            to_dataplane(seq, update)
        };

        if admitted.is_evicted() {
            let status = tonic::Status::aborted("subscriber evicted by a newer connection");
            metrics.end(status.code());
            Err::<(), _>(status)?;
        }

        let snapshot = std::iter::once(Update::FullSnapshotBegin)
            .chain(snapshot.into_updates())
            .chain(Some(Update::InSync));
        for update in snapshot {
            metrics.msg_sent();
            yield next(&update);
        }
        debug!(%workload, "Subscriber in sync");

        loop {
            let res = tokio::select! {
                biased;

                // A newer subscriber takes over the workload.
                _ = admitted.evicted() => {
                    Err(tonic::Status::aborted("subscriber evicted by a newer connection"))
                }

                // If the server starts shutting down, close the stream so that it doesn't hold
                // the server open.
                _ = (&mut shutdown) => Ok(None),

                update = updates.next() => update.map(Some).ok_or_else(|| {
                    tonic::Status::resource_exhausted("subscriber fell behind its update queue")
                }),
            };

            let update = match res {
                Ok(Some(update)) => update,
                Ok(None) => return,
                Err(status) => {
                    info!(%workload, code = ?status.code(), "Subscriber stream terminated");
                    metrics.end(status.code());
                    Err(status)?
                }
            };

            let removed = matches!(update, Update::EndpointRemoved(_));
            metrics.msg_sent();
            yield next(&update);
            if removed {
                info!(%workload, "Endpoint removed; closing subscriber stream");
                return;
            }
        }
    })
}

pub(crate) fn to_dataplane(sequence_number: u64, update: &Update) -> proto::ToDataplane {
    let payload = match update {
        Update::FullSnapshotBegin => Payload::SnapshotBegin(proto::SnapshotBegin {}),
        Update::InSync => Payload::InSync(proto::InSync {}),
        Update::ActiveProfileAdded(id, profile) => {
            Payload::ActiveProfileUpdate(proto::ActiveProfileUpdate {
                id: Some(to_profile_id(id)),
                profile: Some(to_profile(profile)),
            })
        }
        Update::ActiveProfileRemoved(id) => {
            Payload::ActiveProfileRemove(proto::ActiveProfileRemove {
                id: Some(to_profile_id(id)),
            })
        }
        Update::ActivePolicyAdded(id, policy) => {
            Payload::ActivePolicyUpdate(proto::ActivePolicyUpdate {
                id: Some(to_policy_id(id)),
                policy: Some(to_policy(policy)),
            })
        }
        Update::ActivePolicyRemoved(id) => Payload::ActivePolicyRemove(proto::ActivePolicyRemove {
            id: Some(to_policy_id(id)),
        }),
        Update::EndpointTierInfoChanged {
            endpoint,
            tiers,
            profile_ids,
        } => Payload::WorkloadEndpointUpdate(proto::WorkloadEndpointUpdate {
            id: Some(to_endpoint_id(endpoint)),
            endpoint: Some(proto::WorkloadEndpoint {
                tiers: tiers.iter().map(to_tier).collect(),
                profile_ids: profile_ids.iter().map(|p| p.name.clone()).collect(),
            }),
        }),
        Update::EndpointRemoved(endpoint) => {
            Payload::WorkloadEndpointRemove(proto::WorkloadEndpointRemove {
                id: Some(to_endpoint_id(endpoint)),
            })
        }
    };

    proto::ToDataplane {
        sequence_number,
        payload: Some(payload),
    }
}

fn to_profile_id(id: &ProfileId) -> proto::ProfileId {
    proto::ProfileId {
        name: id.name.clone(),
    }
}

fn to_policy_id(id: &PolicyId) -> proto::PolicyId {
    proto::PolicyId {
        tier: id.tier.clone(),
        name: id.name.clone(),
    }
}

fn to_endpoint_id(id: &WorkloadId) -> proto::WorkloadEndpointId {
    proto::WorkloadEndpointId {
        orchestrator_id: id.orchestrator.clone(),
        namespace: id.namespace.clone(),
        workload_id: id.workload.clone(),
        endpoint_id: id.endpoint.clone(),
    }
}

fn to_tier(tier: &TierInfo) -> proto::TierInfo {
    proto::TierInfo {
        name: tier.name.clone(),
        ingress_policies: tier.ingress_policies.clone(),
        egress_policies: tier.egress_policies.clone(),
    }
}

fn to_profile(profile: &Profile) -> proto::Profile {
    proto::Profile {
        labels_to_apply: profile
            .labels_to_apply
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        inbound_rules: profile.inbound_rules.iter().map(to_rule).collect(),
        outbound_rules: profile.outbound_rules.iter().map(to_rule).collect(),
    }
}

fn to_policy(policy: &Policy) -> proto::Policy {
    proto::Policy {
        inbound_rules: policy.inbound_rules.iter().map(to_rule).collect(),
        outbound_rules: policy.outbound_rules.iter().map(to_rule).collect(),
    }
}

fn to_rule(rule: &Rule) -> proto::Rule {
    proto::Rule {
        action: rule.action.to_string(),
        protocol: rule.protocol.clone().unwrap_or_default(),
        src_net: rule.source.nets.clone(),
        src_ports: rule.source.ports.iter().copied().map(u32::from).collect(),
        dst_net: rule.destination.nets.clone(),
        dst_ports: rule.destination.ports.iter().copied().map(u32::from).collect(),
    }
}
