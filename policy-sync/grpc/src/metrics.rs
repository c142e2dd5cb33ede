use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Standard gRPC server metrics, labeled by service, method and RPC type.
#[derive(Clone, Debug)]
pub struct GrpcServerMetricsFamily {
    started: Family<Labels, Counter>,
    msg_sent: Family<Labels, Counter>,
    handled: Family<CodeLabels, Counter>,
    handling: Family<Labels, Histogram>,
}

/// Metrics for a single RPC method.
#[derive(Clone, Debug)]
pub(crate) struct GrpcServerRpcMetrics {
    started: Counter,
    msg_sent: Counter,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    labels: Labels,
}

/// Observes a single call. A call that is dropped without an explicit status is recorded as OK.
#[derive(Debug)]
pub(crate) struct ResponseObserver {
    msg_sent: Counter,
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    start: time::Instant,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    labels: Labels,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Labels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
    grpc_code: &'static str,
}

// === impl GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::default();
        reg.register(
            "started",
            "Total number of RPCs started on the server",
            started.clone(),
        );

        let msg_sent = Family::default();
        reg.register(
            "msg_sent",
            "Total number of gRPC stream messages sent by the server",
            msg_sent.clone(),
        );

        let handled = Family::default();
        reg.register(
            "handled",
            "Total number of RPCs completed on the server, regardless of success or failure",
            handled.clone(),
        );

        // Sync streams live for as long as their workload, so buckets span hours.
        let handling = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.1, 1.0, 60.0, 3600.0, 86400.0].into_iter())
        });
        reg.register_with_unit(
            "handling",
            "Histogram of the time (seconds) the server spent handling each RPC",
            Unit::Seconds,
            handling.clone(),
        );

        Self {
            started,
            msg_sent,
            handled,
            handling,
        }
    }

    pub(crate) fn unary_rpc(
        &self,
        svc: &'static str,
        method: &'static str,
    ) -> GrpcServerRpcMetrics {
        self.rpc(svc, method, "unary")
    }

    pub(crate) fn server_stream_rpc(
        &self,
        svc: &'static str,
        method: &'static str,
    ) -> GrpcServerRpcMetrics {
        self.rpc(svc, method, "server_stream")
    }

    fn rpc(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
        grpc_type: &'static str,
    ) -> GrpcServerRpcMetrics {
        let labels = Labels {
            grpc_service,
            grpc_method,
            grpc_type,
        };
        GrpcServerRpcMetrics {
            started: self.started.get_or_create(&labels).clone(),
            msg_sent: self.msg_sent.get_or_create(&labels).clone(),
            handling: self.handling.get_or_create(&labels).clone(),
            handled: self.handled.clone(),
            labels,
        }
    }
}

impl Default for GrpcServerMetricsFamily {
    /// Metrics that are not exported.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl GrpcServerRpcMetrics ===

impl GrpcServerRpcMetrics {
    pub(crate) fn start(&self) -> ResponseObserver {
        self.started.inc();
        ResponseObserver {
            msg_sent: self.msg_sent.clone(),
            pending: Some(Pending {
                start: time::Instant::now(),
                handling: self.handling.clone(),
                handled: self.handled.clone(),
                labels: self.labels.clone(),
            }),
        }
    }
}

// === impl ResponseObserver ===

impl ResponseObserver {
    pub(crate) fn msg_sent(&self) {
        self.msg_sent.inc();
    }

    /// Records the call's final status. Subsequent calls have no effect.
    pub(crate) fn end(&mut self, code: tonic::Code) {
        if let Some(pending) = self.pending.take() {
            pending.end(code);
        }
    }
}

impl Drop for ResponseObserver {
    fn drop(&mut self) {
        self.end(tonic::Code::Ok);
    }
}

// === impl Pending ===

impl Pending {
    fn end(self, code: tonic::Code) {
        let Self {
            start,
            handling,
            handled,
            labels,
        } = self;
        handling.observe(start.elapsed().as_secs_f64());
        handled
            .get_or_create(&CodeLabels {
                grpc_service: labels.grpc_service,
                grpc_method: labels.grpc_method,
                grpc_type: labels.grpc_type,
                grpc_code: code_str(code),
            })
            .inc();
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}
