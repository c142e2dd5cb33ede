#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use policy_sync_core as core;
pub use policy_sync_grpc as grpc;
pub use policy_sync_k8s_api as k8s;
pub use policy_sync_k8s_index as index;

mod args;
mod channels;

pub use self::{
    args::Args,
    channels::{ChannelError, Channels, SOCKET_NAME},
};
use futures::prelude::*;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio_stream::wrappers::ReceiverStream;

/// Subscribes workloads to the shared endpoint index.
#[derive(Clone, Debug)]
pub struct EndpointDiscover(index::SharedIndex);

// === impl EndpointDiscover ===

impl EndpointDiscover {
    pub fn new(index: index::SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl core::DiscoverEndpoint for EndpointDiscover {
    async fn subscribe(&self, workload: &core::WorkloadId) -> anyhow::Result<core::Subscription> {
        let (snapshot, rx) = self.0.write().subscribe(workload);
        Ok(core::Subscription {
            snapshot,
            updates: Box::pin(Updates {
                workload: workload.clone(),
                index: self.0.clone(),
                rx: ReceiverStream::new(rx),
            }),
        })
    }
}

/// A subscriber's update queue. Dropping it releases the subscriber from the index.
struct Updates {
    workload: core::WorkloadId,
    index: index::SharedIndex,
    rx: ReceiverStream<core::Update>,
}

// === impl Updates ===

impl Stream for Updates {
    type Item = core::Update;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Updates {
    fn drop(&mut self) {
        self.rx.close();
        self.index.write().release_closed(&self.workload);
    }
}
