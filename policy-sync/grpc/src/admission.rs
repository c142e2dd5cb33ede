//! Single-subscriber admission.
//!
//! Each admitted subscriber holds an [`Admitted`] lease for as long as its stream is served. The
//! channel registry holds the matching [`Evictor`]; admitting a new subscriber evicts the prior
//! one and waits for its lease to be released before the new subscriber is served.

use futures::prelude::*;
use policy_sync_core::WorkloadId;
use tokio::sync::{oneshot, watch};

/// Admits subscribers for a workload, evicting any prior subscriber first.
#[async_trait::async_trait]
pub trait AdmitSubscriber {
    /// Completes once the workload has no other admitted subscriber.
    async fn admit(&self, workload: &WorkloadId) -> anyhow::Result<Admitted>;
}

/// Evicts the subscriber holding the matching lease.
#[derive(Debug)]
pub struct Evictor {
    evict: watch::Sender<bool>,
    released: oneshot::Receiver<()>,
}

/// A subscriber's lease. Dropping it releases the subscriber's admission.
#[derive(Debug)]
pub struct Admitted {
    evicted: watch::Receiver<bool>,
    _released: oneshot::Sender<()>,
}

pub fn pair() -> (Evictor, Admitted) {
    let (evict, evicted) = watch::channel(false);
    let (released_tx, released) = oneshot::channel();
    let evictor = Evictor { evict, released };
    let admitted = Admitted {
        evicted,
        _released: released_tx,
    };
    (evictor, admitted)
}

// === impl Evictor ===

impl Evictor {
    /// Signals eviction immediately. The returned future completes once the lease is released.
    pub fn evict(self) -> impl Future<Output = ()> + Send + 'static {
        let Self { evict, released } = self;
        let _ = evict.send(true);
        released.map(|_| ())
    }
}

// === impl Admitted ===

impl Admitted {
    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow()
    }

    /// Completes when the subscriber is evicted. If the evictor is dropped without evicting, the
    /// subscriber is never evicted.
    pub async fn evicted(&mut self) {
        let closed = self.evicted.wait_for(|evicted| *evicted).await.is_err();
        if closed {
            future::pending::<()>().await;
        }
    }
}
