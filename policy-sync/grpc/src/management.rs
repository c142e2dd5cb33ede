use crate::{
    metrics::{GrpcServerMetricsFamily, GrpcServerRpcMetrics},
    proto::mgmt::{
        self as proto,
        management_server::{Management, ManagementServer as Svc},
    },
};
use policy_sync_core::WorkloadId;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Creates and tears down per-workload policy channels.
#[async_trait::async_trait]
pub trait ManageWorkloads {
    /// Serves the workload's policy channel in `dir`.
    async fn workload_added(&self, workload: WorkloadId, dir: PathBuf) -> anyhow::Result<()>;

    /// Stops serving the workload's policy channel, if any.
    async fn workload_removed(&self, workload: &WorkloadId) -> anyhow::Result<()>;
}

/// Serves the management API through which workloads are announced.
#[derive(Clone, Debug)]
pub struct ManagementServer<M> {
    manager: M,
    prefix: PathBuf,
    orchestrator: String,
    endpoint: String,
    added: GrpcServerRpcMetrics,
    deleted: GrpcServerRpcMetrics,
}

// === impl ManagementServer ===

impl<M> ManagementServer<M>
where
    M: ManageWorkloads + Send + Sync + 'static,
{
    pub fn new(
        manager: M,
        prefix: impl Into<PathBuf>,
        orchestrator: impl ToString,
        endpoint: impl ToString,
        metrics: &GrpcServerMetricsFamily,
    ) -> Self {
        Self {
            manager,
            prefix: prefix.into(),
            orchestrator: orchestrator.to_string(),
            endpoint: endpoint.to_string(),
            added: metrics.unary_rpc("mgmt.Management", "WorkloadAdded"),
            deleted: metrics.unary_rpc("mgmt.Management", "WorkloadDeleted"),
        }
    }

    pub fn svc(self) -> Svc<Self> {
        Svc::new(self)
    }

    fn workload_id(&self, info: &proto::WorkloadInfo) -> Result<WorkloadId, tonic::Status> {
        let attrs = info
            .attrs
            .as_ref()
            .ok_or_else(|| tonic::Status::invalid_argument("missing workload attributes"))?;
        WorkloadId::new(
            &self.orchestrator,
            &attrs.namespace,
            &attrs.workload,
            &self.endpoint,
        )
        .map_err(|error| tonic::Status::invalid_argument(error.to_string()))
    }

    fn workload_dir(&self, path: &str) -> Result<PathBuf, tonic::Status> {
        let path = Path::new(path);
        let mut normal = false;
        for component in path.components() {
            match component {
                Component::Normal(_) => normal = true,
                Component::CurDir => {}
                _ => {
                    return Err(tonic::Status::invalid_argument(format!(
                        "workload path must be relative and may not traverse parents: {}",
                        path.display()
                    )))
                }
            }
        }
        if !normal {
            return Err(tonic::Status::invalid_argument("missing workload path"));
        }
        Ok(self.prefix.join(path))
    }
}

#[async_trait::async_trait]
impl<M> Management for ManagementServer<M>
where
    M: ManageWorkloads + Send + Sync + 'static,
{
    async fn workload_added(
        &self,
        req: tonic::Request<proto::WorkloadInfo>,
    ) -> Result<tonic::Response<proto::Response>, tonic::Status> {
        let mut metrics = self.added.start();
        let info = req.into_inner();
        let res = async {
            let workload = self.workload_id(&info)?;
            let dir = self.workload_dir(&info.workloadpath)?;
            let uid = info.attrs.as_ref().map(|a| a.uid.as_str()).unwrap_or_default();
            info!(%workload, %uid, dir = %dir.display(), "Workload added");
            self.manager
                .workload_added(workload.clone(), dir)
                .await
                .map_err(|error| {
                    warn!(%workload, %error, "Failed to create workload channel");
                    tonic::Status::internal(format!("failed to create channel: {error}"))
                })
        }
        .await;

        match res {
            Ok(()) => Ok(tonic::Response::new(ok())),
            Err(status) => {
                metrics.end(status.code());
                Err(status)
            }
        }
    }

    async fn workload_deleted(
        &self,
        req: tonic::Request<proto::WorkloadInfo>,
    ) -> Result<tonic::Response<proto::Response>, tonic::Status> {
        let mut metrics = self.deleted.start();
        let info = req.into_inner();
        let res = async {
            let workload = self.workload_id(&info)?;
            info!(%workload, "Workload deleted");
            self.manager
                .workload_removed(&workload)
                .await
                .map_err(|error| {
                    warn!(%workload, %error, "Failed to remove workload channel");
                    tonic::Status::internal(format!("failed to remove channel: {error}"))
                })
        }
        .await;

        match res {
            Ok(()) => Ok(tonic::Response::new(ok())),
            Err(status) => {
                metrics.end(status.code());
                Err(status)
            }
        }
    }
}

fn ok() -> proto::Response {
    proto::Response {
        status: "ok".to_string(),
    }
}
