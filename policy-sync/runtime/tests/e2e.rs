//! Drives policy sync clients over real unix sockets.

use hyper_util::rt::TokioIo;
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::btreemap;
use policy_sync_runtime::{
    core::WorkloadId,
    grpc::{
        management::ManagementServer,
        metrics::GrpcServerMetricsFamily,
        proto::{
            mgmt::{self, management_server::Management},
            policysync::{
                policy_sync_client::PolicySyncClient, to_dataplane::Payload, SyncRequest,
                ToDataplane,
            },
        },
    },
    index::{self, Index, IndexMetrics, Removals, SharedIndex},
    k8s::{self, calico, labels::Selector},
    Channels, SOCKET_NAME,
};
use std::{iter::FromIterator, num::NonZeroUsize, path::PathBuf};
use tokio::{net::UnixStream, time};
use tonic::{
    transport::{Endpoint, Uri},
    Streaming,
};

struct Harness {
    index: SharedIndex,
    removals: Removals,
    channels: Channels,
    dir: tempfile::TempDir,
    _signal: drain::Signal,
    _tracing: tracing::subscriber::DefaultGuard,
}

#[tokio::test]
async fn serves_snapshot_and_deltas() {
    let mut test = Harness::new();
    test.apply_cluster(mk_profile("kns.fv"));
    test.apply_namespaced(mk_wep("fv", "fv-pod-0", &["kns.fv"]));

    let socket = test.add("fv-pod-0").await;
    let mut stream = sync(&socket).await;
    assert_eq!(
        kinds(&mut stream, 4).await,
        vec![
            "snapshot_begin",
            "active_profile_update",
            "workload_endpoint_update",
            "in_sync",
        ]
    );

    // Policies that select the endpoint are activated before the endpoint refers to them.
    test.apply_cluster(mk_gnp("allow-web", Selector::from_iter(Some(("app", "web")))));
    let msg = next(&mut stream).await;
    assert_eq!(msg.sequence_number, 5);
    match msg.payload {
        Some(Payload::ActivePolicyUpdate(update)) => {
            let id = update.id.expect("policy id must be set");
            assert_eq!((id.tier.as_str(), id.name.as_str()), ("default", "allow-web"));
        }
        payload => panic!("unexpected payload: {payload:?}"),
    }
    match next(&mut stream).await.payload {
        Some(Payload::WorkloadEndpointUpdate(update)) => {
            let ep = update.endpoint.expect("endpoint must be set");
            assert_eq!(ep.profile_ids, vec!["kns.fv".to_string()]);
            assert_eq!(ep.tiers.len(), 1);
            assert_eq!(ep.tiers[0].name, "default");
            assert_eq!(ep.tiers[0].ingress_policies, vec!["allow-web".to_string()]);
        }
        payload => panic!("unexpected payload: {payload:?}"),
    }

    // Deleting the endpoint empties the subscriber's state before ending its stream.
    IndexNamespacedResource::<calico::WorkloadEndpoint>::delete(
        &mut *test.index.write(),
        "fv".to_string(),
        wep_name("fv-pod-0"),
    );
    assert_eq!(
        kinds(&mut stream, 4).await,
        vec![
            "workload_endpoint_update",
            "active_policy_remove",
            "active_profile_remove",
            "workload_endpoint_remove",
        ]
    );
    let end = time::timeout(time::Duration::from_secs(5), stream.message())
        .await
        .expect("stream must end in time")
        .expect("stream must end cleanly");
    assert!(end.is_none(), "stream must end after the endpoint is removed");

    let workload = time::timeout(time::Duration::from_secs(1), test.removals.recv())
        .await
        .expect("removal must be published")
        .expect("removals must be open");
    assert_eq!(workload, wl("fv-pod-0"));
    test.channels.endpoint_deleted(&workload).await;
    assert!(!test.channels.is_served(&workload));
    assert!(!socket.exists(), "socket must be removed");
}

#[tokio::test]
async fn pending_endpoint_is_populated() {
    let test = Harness::new();
    let socket = test.add("fv-pod-0").await;
    let mut stream = sync(&socket).await;
    assert_eq!(
        kinds(&mut stream, 2).await,
        vec!["snapshot_begin", "in_sync"]
    );

    test.apply_namespaced(mk_wep("fv", "fv-pod-0", &["kns.fv"]));
    assert_eq!(
        kinds(&mut stream, 2).await,
        vec!["active_profile_update", "workload_endpoint_update"]
    );
}

#[tokio::test]
async fn second_subscriber_evicts_first() {
    let test = Harness::new();
    test.apply_namespaced(mk_wep("fv", "fv-pod-0", &["kns.fv"]));
    let socket = test.add("fv-pod-0").await;

    let mut first = sync(&socket).await;
    assert_eq!(kinds(&mut first, 4).await.last(), Some(&"in_sync"));

    // The second subscriber is only served once the first has been evicted.
    let mut second = sync(&socket).await;
    let status = time::timeout(time::Duration::from_secs(5), first.message())
        .await
        .expect("first stream must fail in time")
        .expect_err("first stream must fail");
    assert_eq!(status.code(), tonic::Code::Aborted);

    assert_eq!(
        kinds(&mut second, 4).await,
        vec![
            "snapshot_begin",
            "active_profile_update",
            "workload_endpoint_update",
            "in_sync",
        ]
    );

    // Only the second subscriber observes later updates.
    test.apply_cluster(mk_gnp("allow-web", Selector::from_iter(Some(("app", "web")))));
    assert_eq!(
        kinds(&mut second, 2).await,
        vec!["active_policy_update", "workload_endpoint_update"]
    );
}

#[tokio::test]
async fn removed_workload_aborts_subscriber() {
    let test = Harness::new();
    let socket = test.add("fv-pod-0").await;
    let mut stream = sync(&socket).await;
    kinds(&mut stream, 2).await;

    test.channels.remove(&wl("fv-pod-0")).await;
    let status = time::timeout(time::Duration::from_secs(5), stream.message())
        .await
        .expect("stream must fail in time")
        .expect_err("stream must fail");
    assert_eq!(status.code(), tonic::Code::Aborted);
    assert!(!test.channels.is_served(&wl("fv-pod-0")));
    assert!(!socket.exists(), "socket must be removed");
}

/// A peer that reconnects after its endpoint is deleted, but before the channel is torn down,
/// is aborted with the channel.
#[tokio::test]
async fn reconnect_after_endpoint_deletion_is_aborted() {
    let mut test = Harness::new();
    test.apply_namespaced(mk_wep("fv", "fv-pod-0", &[]));
    let socket = test.add("fv-pod-0").await;

    IndexNamespacedResource::<calico::WorkloadEndpoint>::delete(
        &mut *test.index.write(),
        "fv".to_string(),
        wep_name("fv-pod-0"),
    );
    assert_eq!(test.removals.try_recv().ok(), Some(wl("fv-pod-0")));

    let mut stream = sync(&socket).await;
    assert_eq!(
        kinds(&mut stream, 2).await,
        vec!["snapshot_begin", "in_sync"]
    );

    time::timeout(
        time::Duration::from_secs(5),
        test.channels.endpoint_deleted(&wl("fv-pod-0")),
    )
    .await
    .expect("teardown must complete in time");
    let status = time::timeout(time::Duration::from_secs(5), stream.message())
        .await
        .expect("stream must fail in time")
        .expect_err("stream must fail");
    assert_eq!(status.code(), tonic::Code::Aborted);
    assert!(!test.channels.is_served(&wl("fv-pod-0")));
    assert!(!socket.exists(), "socket must be removed");
}

#[tokio::test]
async fn moved_workload_replaces_socket() {
    let test = Harness::new();
    let first = test.add("fv-pod-0").await;

    // Re-adding the same directory is a no-op.
    test.channels
        .add(wl("fv-pod-0"), test.dir.path().join("fv-pod-0"))
        .await
        .expect("channel must be added");
    assert!(first.exists());

    let second_dir = test.dir.path().join("fv-pod-0-moved");
    test.channels
        .add(wl("fv-pod-0"), second_dir.clone())
        .await
        .expect("channel must be added");
    assert!(!first.exists(), "prior socket must be removed");
    let second = second_dir.join(SOCKET_NAME);
    assert!(second.exists());

    let mut stream = sync(&second).await;
    assert_eq!(
        kinds(&mut stream, 2).await,
        vec!["snapshot_begin", "in_sync"]
    );
}

#[tokio::test]
async fn management_creates_channels() {
    let test = Harness::new();
    let server = ManagementServer::new(
        test.channels.clone(),
        test.dir.path(),
        "k8s",
        "eth0",
        &GrpcServerMetricsFamily::default(),
    );

    let rsp = server
        .workload_added(tonic::Request::new(mk_info("fv-pod-0", "fv-pod-0-uid")))
        .await
        .expect("workload must be added")
        .into_inner();
    assert_eq!(rsp.status, "ok");
    let socket = test.dir.path().join("fv-pod-0-uid").join(SOCKET_NAME);
    assert!(socket.exists());
    assert!(test.channels.is_served(&wl("fv-pod-0")));

    let mut stream = sync(&socket).await;
    assert_eq!(
        kinds(&mut stream, 2).await,
        vec!["snapshot_begin", "in_sync"]
    );

    server
        .workload_deleted(tonic::Request::new(mk_info("fv-pod-0", "fv-pod-0-uid")))
        .await
        .expect("workload must be deleted");
    assert!(!test.channels.is_served(&wl("fv-pod-0")));
    assert!(!socket.exists());
}

// === impl Harness ===

impl Harness {
    fn new() -> Self {
        let _tracing = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .finish(),
        );
        let (index, removals) = Index::shared(
            index::Config {
                node_name: None,
                queue_capacity: NonZeroUsize::new(100).unwrap(),
            },
            IndexMetrics::default(),
        );
        let (_signal, drain) = drain::channel();
        let channels = Channels::new(
            index.clone(),
            GrpcServerMetricsFamily::default(),
            time::Duration::from_secs(5),
            drain,
        );
        Self {
            index,
            removals,
            channels,
            dir: tempfile::tempdir().expect("must create a temporary directory"),
            _signal,
            _tracing,
        }
    }

    async fn add(&self, pod: &str) -> PathBuf {
        let dir = self.dir.path().join(pod);
        self.channels
            .add(wl(pod), dir.clone())
            .await
            .expect("channel must be added");
        dir.join(SOCKET_NAME)
    }

    fn apply_cluster<T>(&self, resource: T)
    where
        Index: IndexClusterResource<T>,
    {
        IndexClusterResource::apply(&mut *self.index.write(), resource);
    }

    fn apply_namespaced<T>(&self, resource: T)
    where
        Index: IndexNamespacedResource<T>,
    {
        IndexNamespacedResource::apply(&mut *self.index.write(), resource);
    }
}

// === Utils ===

async fn sync(socket: &std::path::Path) -> Streaming<ToDataplane> {
    let socket = socket.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")
        .expect("endpoint must be valid")
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await.map(TokioIo::new) }
        }))
        .await
        .expect("client must connect");
    time::timeout(
        time::Duration::from_secs(5),
        PolicySyncClient::new(channel).sync(SyncRequest {}),
    )
    .await
    .expect("sync must be admitted in time")
    .expect("sync must succeed")
    .into_inner()
}

async fn next(stream: &mut Streaming<ToDataplane>) -> ToDataplane {
    time::timeout(time::Duration::from_secs(5), stream.message())
        .await
        .expect("stream must yield in time")
        .expect("stream must not fail")
        .expect("stream must not end")
}

async fn kinds(stream: &mut Streaming<ToDataplane>, n: usize) -> Vec<&'static str> {
    let mut kinds = Vec::with_capacity(n);
    for _ in 0..n {
        let payload = next(stream).await.payload.expect("payload must be set");
        kinds.push(match payload {
            Payload::SnapshotBegin(_) => "snapshot_begin",
            Payload::InSync(_) => "in_sync",
            Payload::ActiveProfileUpdate(_) => "active_profile_update",
            Payload::ActiveProfileRemove(_) => "active_profile_remove",
            Payload::ActivePolicyUpdate(_) => "active_policy_update",
            Payload::ActivePolicyRemove(_) => "active_policy_remove",
            Payload::WorkloadEndpointUpdate(_) => "workload_endpoint_update",
            Payload::WorkloadEndpointRemove(_) => "workload_endpoint_remove",
        });
    }
    kinds
}

fn wl(pod: &str) -> WorkloadId {
    WorkloadId::new("k8s", "fv", pod, "eth0").unwrap()
}

fn wep_name(pod: &str) -> String {
    format!("node--0-k8s-{pod}-eth0")
}

fn mk_wep(ns: &str, pod: &str, profiles: &[&str]) -> calico::WorkloadEndpoint {
    calico::WorkloadEndpoint {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(wep_name(pod)),
            labels: Some(btreemap! {
                "app".to_string() => "web".to_string(),
            }),
            ..Default::default()
        },
        spec: calico::WorkloadEndpointSpec {
            orchestrator: "k8s".to_string(),
            pod: Some(pod.to_string()),
            endpoint: "eth0".to_string(),
            node: Some("node-0".to_string()),
            profiles: profiles.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        },
    }
}

fn mk_profile(name: &str) -> calico::Profile {
    calico::Profile {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: calico::ProfileSpec {
            labels_to_apply: Some(btreemap! {
                "projectcalico.org/name".to_string() => "fv".to_string(),
            }),
            ingress: vec![allow()],
            egress: vec![allow()],
        },
    }
}

fn mk_gnp(name: &str, selector: Selector) -> calico::GlobalNetworkPolicy {
    calico::GlobalNetworkPolicy {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: calico::GlobalNetworkPolicySpec {
            policy: calico::PolicySpec {
                tier: None,
                order: None,
                selector,
                types: None,
                ingress: vec![allow()],
                egress: vec![],
            },
        },
    }
}

fn allow() -> calico::Rule {
    calico::Rule {
        action: calico::Action::Allow,
        protocol: None,
        source: Default::default(),
        destination: Default::default(),
    }
}

fn mk_info(workload: &str, path: &str) -> mgmt::WorkloadInfo {
    mgmt::WorkloadInfo {
        attrs: Some(mgmt::WorkloadAttributes {
            uid: path.to_string(),
            workload: workload.to_string(),
            namespace: "fv".to_string(),
            serviceaccount: "default".to_string(),
        }),
        workloadpath: path.to_string(),
    }
}
