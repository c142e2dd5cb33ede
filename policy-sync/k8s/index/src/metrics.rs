use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    endpoints: Gauge,
    subscribers: Gauge,
    updates: Family<UpdateLabels, Counter>,
    queue_overflows: Counter,
    resets: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpdateLabels {
    kind: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let endpoints = Gauge::default();
        reg.register(
            "endpoints",
            "The number of workload endpoints in the index",
            endpoints.clone(),
        );

        let subscribers = Gauge::default();
        reg.register(
            "subscribers",
            "The number of workload endpoints with a live subscriber",
            subscribers.clone(),
        );

        let updates = Family::default();
        reg.register(
            "updates",
            "Count of updates published to subscribers",
            updates.clone(),
        );

        let queue_overflows = Counter::default();
        reg.register(
            "queue_overflows",
            "Count of subscribers dropped because their update queue was full",
            queue_overflows.clone(),
        );

        let resets = Family::default();
        reg.register(
            "resets",
            "Count of resources re-listed after a watch restart",
            resets.clone(),
        );

        Self {
            endpoints,
            subscribers,
            updates,
            queue_overflows,
            resets,
        }
    }

    pub(crate) fn set_endpoints(&self, n: usize) {
        self.endpoints.set(n as i64);
    }

    pub(crate) fn set_subscribers(&self, n: usize) {
        self.subscribers.set(n as i64);
    }

    pub(crate) fn update_sent(&self, kind: &'static str) {
        self.updates.get_or_create(&UpdateLabels { kind }).inc();
    }

    pub(crate) fn queue_overflowed(&self) {
        self.queue_overflows.inc();
    }

    pub(crate) fn reset(&self, kind: &'static str) {
        self.resets.get_or_create(&KindLabels { kind }).inc();
    }
}
