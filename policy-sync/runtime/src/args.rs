use crate::{
    channels::Channels,
    grpc::{management::ManagementServer, metrics::GrpcServerMetricsFamily},
    index::{self, IndexMetrics, Removals},
    k8s::calico,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{num::NonZeroUsize, path::PathBuf};
use tokio::{net::UnixListener, time::Duration};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "policy-sync", about = "Serves network policy to each workload on its node")]
pub struct Args {
    #[clap(long, default_value = "policy_sync=info,warn", env = "POLICY_SYNC_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The socket on which workloads are announced.
    #[clap(
        long,
        default_value = "/var/run/calico/policy-mgmt.sock",
        env = "POLICY_SYNC_MANAGEMENT_SOCKET_PATH"
    )]
    management_socket_path: PathBuf,

    /// The directory beneath which each workload's socket directory is created.
    #[clap(
        long,
        default_value = "/var/run/calico",
        env = "POLICY_SYNC_WORKLOAD_SOCKET_PATH_PREFIX"
    )]
    workload_socket_path_prefix: PathBuf,

    #[clap(long, default_value = "k8s")]
    orchestrator: String,

    #[clap(long, default_value = "eth0")]
    endpoint_name: String,

    /// Restricts the index to endpoints scheduled on this node.
    #[clap(long, env = "NODENAME")]
    node_name: Option<String>,

    /// The number of updates buffered for each subscriber before it is disconnected.
    #[clap(long, default_value = "1000")]
    subscriber_queue_capacity: NonZeroUsize,

    #[clap(long, default_value = "5000")]
    eviction_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            management_socket_path,
            workload_socket_path_prefix,
            orchestrator,
            endpoint_name,
            node_name,
            subscriber_queue_capacity,
            eviction_timeout_ms,
        } = self;

        let mut prom = <Registry>::default();
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));
        let grpc_metrics =
            GrpcServerMetricsFamily::register(prom.sub_registry_with_prefix("grpc_server"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Build the index that computes each endpoint's active policy state.
        let (index, removals) = index::Index::shared(
            index::Config {
                node_name,
                queue_capacity: subscriber_queue_capacity,
            },
            index_metrics,
        );

        // Spawn resource watches.

        let tiers = runtime.watch_all::<calico::Tier>(watcher::Config::default());
        tokio::spawn(kubert::index::cluster(index.clone(), tiers).instrument(info_span!("tiers")));

        let profiles = runtime.watch_all::<calico::Profile>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), profiles).instrument(info_span!("profiles")),
        );

        let global_policies =
            runtime.watch_all::<calico::GlobalNetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), global_policies)
                .instrument(info_span!("globalnetworkpolicies")),
        );

        let policies = runtime.watch_all::<calico::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("networkpolicies")),
        );

        let endpoints = runtime.watch_all::<calico::WorkloadEndpoint>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), endpoints)
                .instrument(info_span!("workloadendpoints")),
        );

        let channels = Channels::new(
            index,
            grpc_metrics.clone(),
            Duration::from_millis(eviction_timeout_ms),
            runtime.shutdown_handle(),
        );

        // Tear down the channels of endpoints deleted from the datastore.
        tokio::spawn(
            endpoint_removals(removals, channels.clone(), runtime.shutdown_handle())
                .instrument(info_span!("removals")),
        );

        // Serve the management API through which workloads are announced.
        let management = ManagementServer::new(
            channels,
            workload_socket_path_prefix,
            orchestrator,
            endpoint_name,
            &grpc_metrics,
        );
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = management_grpc(management_socket_path, management, drain).await {
                error!(%error, "Management gRPC server failed");
            }
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn endpoint_removals(mut removals: Removals, channels: Channels, drain: drain::Watch) {
    tokio::pin! {
        let shutdown = drain.signaled();
    }

    loop {
        tokio::select! {
            workload = removals.recv() => match workload {
                Some(workload) => channels.endpoint_deleted(&workload).await,
                None => return,
            },

            _ = (&mut shutdown) => return,
        }
    }
}

#[instrument(skip_all, fields(path = %path.display()))]
async fn management_grpc(
    path: PathBuf,
    server: ManagementServer<Channels>,
    drain: drain::Watch,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match tokio::fs::remove_file(&path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    let listener =
        UnixListener::bind(&path).with_context(|| format!("failed to bind {}", path.display()))?;

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(server.svc())
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), close_rx.map(|_| {}));
    }

    info!("Management gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?;
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}
