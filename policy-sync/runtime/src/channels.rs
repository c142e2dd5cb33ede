//! Per-workload policy channels.
//!
//! Each workload announced through the management API is served on its own unix socket. The
//! registry admits at most one subscriber per workload: a new subscriber evicts the prior one
//! and waits for it to release its admission before it takes its snapshot.

use crate::{
    core::WorkloadId,
    grpc::{
        admission::{self, AdmitSubscriber, Admitted, Evictor},
        management::ManageWorkloads,
        metrics::GrpcServerMetricsFamily,
        proto::policysync::policy_sync_server,
        sync::PolicySyncServer,
    },
    index::SharedIndex,
    EndpointDiscover,
};
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{net::UnixListener, sync::oneshot, time};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{debug, info, info_span, warn, Instrument};

/// The name of the socket created in each workload's directory.
pub const SOCKET_NAME: &str = "policysync.sock";

type SyncService =
    policy_sync_server::PolicySyncServer<PolicySyncServer<EndpointDiscover, Channels>>;

/// Registry of the channels served for each workload.
#[derive(Clone, Debug)]
pub struct Channels(Arc<Inner>);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no channel is served for {0}")]
    Unknown(WorkloadId),
}

#[derive(Debug)]
struct Inner {
    channels: Mutex<HashMap<WorkloadId, Channel>>,
    index: SharedIndex,
    metrics: GrpcServerMetricsFamily,
    eviction_timeout: time::Duration,
    drain: drain::Watch,
}

/// A served channel. Dropping it stops the channel's server.
#[derive(Debug)]
struct Channel {
    dir: PathBuf,
    evictor: Option<Evictor>,
    _close: oneshot::Sender<()>,
}

// === impl Channels ===

impl Channels {
    pub fn new(
        index: SharedIndex,
        metrics: GrpcServerMetricsFamily,
        eviction_timeout: time::Duration,
        drain: drain::Watch,
    ) -> Self {
        Self(Arc::new(Inner {
            channels: Mutex::new(HashMap::default()),
            index,
            metrics,
            eviction_timeout,
            drain,
        }))
    }

    /// Serves the workload's channel in `dir`.
    ///
    /// Adding a workload that is already served from the same directory has no effect. If the
    /// workload is served from another directory, that channel is torn down once the new one is
    /// served. If the new channel cannot be served, the prior channel is left in place.
    pub async fn add(&self, workload: WorkloadId, dir: PathBuf) -> Result<(), ChannelError> {
        let served = self
            .0
            .channels
            .lock()
            .get(&workload)
            .is_some_and(|channel| channel.dir == dir);
        if served {
            debug!(%workload, dir = %dir.display(), "Channel already served");
            return Ok(());
        }

        let socket = dir.join(SOCKET_NAME);
        let listener = bind(&dir, &socket)?;
        let (close_tx, close_rx) = oneshot::channel();
        let channel = Channel {
            dir: dir.clone(),
            evictor: None,
            _close: close_tx,
        };

        let svc = PolicySyncServer::new(
            workload.clone(),
            EndpointDiscover::new(self.0.index.clone()),
            self.clone(),
            self.0.drain.clone(),
            &self.0.metrics,
        )
        .svc();
        tokio::spawn(
            serve(socket, listener, svc, close_rx, self.0.drain.clone())
                .instrument(info_span!("channel", %workload)),
        );

        let prior = self.0.channels.lock().insert(workload.clone(), channel);
        match prior {
            // A concurrent add for the same directory raced this one. Its socket was rebound
            // above, so only its subscriber and server are stopped.
            Some(mut raced) if raced.dir == dir => {
                if let Some(evictor) = raced.evictor.take() {
                    self.evict(&workload, evictor).await;
                }
            }
            Some(prior) => {
                info!(
                    %workload,
                    from = %prior.dir.display(),
                    to = %dir.display(),
                    "Moving channel"
                );
                self.close(&workload, prior, true).await;
            }
            None => {}
        }
        info!(%workload, dir = %dir.display(), "Channel added");
        Ok(())
    }

    /// Evicts the workload's subscriber and stops serving its channel.
    pub async fn remove(&self, workload: &WorkloadId) {
        let channel = self.0.channels.lock().remove(workload);
        match channel {
            Some(channel) => {
                self.close(workload, channel, true).await;
                info!(%workload, "Channel removed");
            }
            None => debug!(%workload, "No channel to remove"),
        }
        self.0.index.write().release(workload);
    }

    /// Stops serving the channel of a workload whose endpoint was deleted.
    ///
    /// The subscriber is not evicted, so that it observes the endpoint's removal before its
    /// stream completes. A subscriber that connected after the deletion never observes it, and
    /// is evicted instead.
    pub async fn endpoint_deleted(&self, workload: &WorkloadId) {
        let channel = self.0.channels.lock().remove(workload);
        if let Some(channel) = channel {
            let late = self.0.index.read().is_subscribed(workload);
            self.close(workload, channel, late).await;
            info!(%workload, "Channel closed after endpoint deletion");
        }
        self.0.index.write().release(workload);
    }

    pub fn is_served(&self, workload: &WorkloadId) -> bool {
        self.0.channels.lock().contains_key(workload)
    }

    async fn close(&self, workload: &WorkloadId, mut channel: Channel, evict: bool) {
        if evict {
            if let Some(evictor) = channel.evictor.take() {
                self.evict(workload, evictor).await;
            }
        }
        let socket = channel.dir.join(SOCKET_NAME);
        drop(channel);
        remove_socket(&socket);
    }

    async fn evict(&self, workload: &WorkloadId, evictor: Evictor) {
        debug!(%workload, "Evicting subscriber");
        if time::timeout(self.0.eviction_timeout, evictor.evict())
            .await
            .is_err()
        {
            warn!(
                %workload,
                timeout = ?self.0.eviction_timeout,
                "Evicted subscriber did not complete in time"
            );
        }
    }
}

#[async_trait::async_trait]
impl AdmitSubscriber for Channels {
    async fn admit(&self, workload: &WorkloadId) -> anyhow::Result<Admitted> {
        let (evictor, admitted) = admission::pair();
        let prior = {
            let mut channels = self.0.channels.lock();
            let channel = channels
                .get_mut(workload)
                .ok_or_else(|| ChannelError::Unknown(workload.clone()))?;
            channel.evictor.replace(evictor)
        };
        if let Some(prior) = prior {
            info!(%workload, "Replacing subscriber");
            self.evict(workload, prior).await;
        }
        Ok(admitted)
    }
}

#[async_trait::async_trait]
impl ManageWorkloads for Channels {
    async fn workload_added(&self, workload: WorkloadId, dir: PathBuf) -> anyhow::Result<()> {
        self.add(workload, dir).await?;
        Ok(())
    }

    async fn workload_removed(&self, workload: &WorkloadId) -> anyhow::Result<()> {
        self.remove(workload).await;
        Ok(())
    }
}

fn bind(dir: &Path, socket: &Path) -> Result<UnixListener, ChannelError> {
    std::fs::create_dir_all(dir).map_err(|source| ChannelError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ChannelError::Bind {
                path: socket.to_path_buf(),
                source,
            })
        }
    }
    UnixListener::bind(socket).map_err(|source| ChannelError::Bind {
        path: socket.to_path_buf(),
        source,
    })
}

fn remove_socket(socket: &Path) {
    if let Err(error) = std::fs::remove_file(socket) {
        if error.kind() != io::ErrorKind::NotFound {
            warn!(socket = %socket.display(), %error, "Failed to remove socket");
        }
    }
}

async fn serve(
    socket: PathBuf,
    listener: UnixListener,
    svc: SyncService,
    close: oneshot::Receiver<()>,
    drain: drain::Watch,
) {
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(svc)
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), stop_rx.map(|_| {}));
    }

    debug!(socket = %socket.display(), "Serving policy sync");
    let res = tokio::select! {
        res = (&mut srv) => res,

        // The channel was removed.
        _ = close => {
            let _ = stop_tx.send(());
            srv.await
        }

        handle = drain.signaled() => {
            let _ = stop_tx.send(());
            let res = handle.release_after(srv).await;
            remove_socket(&socket);
            res
        }
    };

    match res {
        Ok(()) => debug!(socket = %socket.display(), "Policy sync server stopped"),
        Err(error) => warn!(socket = %socket.display(), %error, "Policy sync server failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Config, Index, IndexMetrics};
    use std::num::NonZeroUsize;

    fn mk_channels(eviction_timeout: time::Duration) -> (Channels, drain::Signal) {
        let (index, _removals) = Index::shared(
            Config {
                node_name: None,
                queue_capacity: NonZeroUsize::new(10).unwrap(),
            },
            IndexMetrics::default(),
        );
        let (signal, drain) = drain::channel();
        let channels = Channels::new(
            index,
            GrpcServerMetricsFamily::default(),
            eviction_timeout,
            drain,
        );
        (channels, signal)
    }

    fn wl() -> WorkloadId {
        WorkloadId::new("k8s", "fv", "fv-pod-0", "eth0").unwrap()
    }

    #[tokio::test]
    async fn admission_requires_a_channel() {
        let (channels, _signal) = mk_channels(time::Duration::from_secs(1));
        let error = channels
            .admit(&wl())
            .await
            .expect_err("unknown workloads must not be admitted");
        assert!(matches!(
            error.downcast_ref::<ChannelError>(),
            Some(ChannelError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn admission_waits_for_prior_subscriber() {
        let dir = tempfile::tempdir().expect("must create a temporary directory");
        let (channels, _signal) = mk_channels(time::Duration::from_secs(10));
        channels
            .add(wl(), dir.path().to_path_buf())
            .await
            .expect("channel must be added");
        assert!(dir.path().join(SOCKET_NAME).exists());

        let first = channels.admit(&wl()).await.expect("must be admitted");
        assert!(!first.is_evicted());

        let mut second = tokio::spawn({
            let channels = channels.clone();
            async move { channels.admit(&wl()).await }
        });
        assert!(
            time::timeout(time::Duration::from_millis(10), &mut second)
                .await
                .is_err(),
            "the second subscriber must wait for the first to be released"
        );
        assert!(first.is_evicted());

        drop(first);
        let second = time::timeout(time::Duration::from_secs(1), second)
            .await
            .expect("the second subscriber must be admitted")
            .expect("task must not fail")
            .expect("must be admitted");
        assert!(!second.is_evicted());
    }

    #[tokio::test]
    async fn admission_proceeds_after_eviction_timeout() {
        let dir = tempfile::tempdir().expect("must create a temporary directory");
        let (channels, _signal) = mk_channels(time::Duration::from_millis(10));
        channels
            .add(wl(), dir.path().to_path_buf())
            .await
            .expect("channel must be added");

        let _first = channels.admit(&wl()).await.expect("must be admitted");
        let second = time::timeout(time::Duration::from_secs(1), channels.admit(&wl()))
            .await
            .expect("admission must not wait past the eviction timeout")
            .expect("must be admitted");
        assert!(!second.is_evicted());
    }

    #[tokio::test]
    async fn endpoint_deletion_keeps_subscriber() {
        let dir = tempfile::tempdir().expect("must create a temporary directory");
        let (channels, _signal) = mk_channels(time::Duration::from_secs(1));
        channels
            .add(wl(), dir.path().to_path_buf())
            .await
            .expect("channel must be added");
        let admitted = channels.admit(&wl()).await.expect("must be admitted");

        channels.endpoint_deleted(&wl()).await;
        assert!(!channels.is_served(&wl()));
        assert!(!dir.path().join(SOCKET_NAME).exists());
        assert!(
            !admitted.is_evicted(),
            "the subscriber must observe the endpoint's removal"
        );
    }

    #[tokio::test]
    async fn failed_move_keeps_prior_channel() {
        let dir = tempfile::tempdir().expect("must create a temporary directory");
        let (channels, _signal) = mk_channels(time::Duration::from_secs(1));
        let from = dir.path().join("from");
        channels
            .add(wl(), from.clone())
            .await
            .expect("channel must be added");
        let admitted = channels.admit(&wl()).await.expect("must be admitted");

        // A directory cannot be created beneath a regular file.
        let file = dir.path().join("file");
        std::fs::write(&file, b"").expect("must write file");
        let error = channels
            .add(wl(), file.join("to"))
            .await
            .expect_err("the channel must not move");
        assert!(matches!(error, ChannelError::CreateDir { .. }), "{error}");

        assert!(channels.is_served(&wl()));
        assert!(from.join(SOCKET_NAME).exists());
        assert!(!admitted.is_evicted());
    }

    #[tokio::test]
    async fn moved_channel_evicts_subscriber() {
        let dir = tempfile::tempdir().expect("must create a temporary directory");
        let (channels, _signal) = mk_channels(time::Duration::from_millis(10));
        let (from, to) = (dir.path().join("from"), dir.path().join("to"));
        channels
            .add(wl(), from.clone())
            .await
            .expect("channel must be added");
        let admitted = channels.admit(&wl()).await.expect("must be admitted");

        channels
            .add(wl(), to.clone())
            .await
            .expect("channel must move");
        assert!(channels.is_served(&wl()));
        assert!(!from.join(SOCKET_NAME).exists());
        assert!(to.join(SOCKET_NAME).exists());
        assert!(admitted.is_evicted());
    }

    /// A subscriber that connects after its endpoint is deleted, but before its channel is torn
    /// down, is tracked as pending and never observes the removal.
    #[tokio::test]
    async fn endpoint_deletion_evicts_late_subscriber() {
        let dir = tempfile::tempdir().expect("must create a temporary directory");
        let (channels, _signal) = mk_channels(time::Duration::from_secs(10));
        channels
            .add(wl(), dir.path().to_path_buf())
            .await
            .expect("channel must be added");
        let mut admitted = channels.admit(&wl()).await.expect("must be admitted");
        let (_, mut rx) = channels.0.index.write().subscribe(&wl());

        let deleted = tokio::spawn({
            let channels = channels.clone();
            async move { channels.endpoint_deleted(&wl()).await }
        });
        time::timeout(time::Duration::from_secs(1), admitted.evicted())
            .await
            .expect("the subscriber must be evicted");
        drop(admitted);
        time::timeout(time::Duration::from_secs(1), deleted)
            .await
            .expect("teardown must complete once the subscriber is released")
            .expect("task must not fail");

        assert!(!channels.is_served(&wl()));
        assert!(!dir.path().join(SOCKET_NAME).exists());
        assert_eq!(rx.recv().await, None, "the subscriber's queue must be closed");
        assert!(!channels.0.index.read().is_subscribed(&wl()));
    }
}
