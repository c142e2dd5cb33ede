#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
pub mod management;
pub mod metrics;
pub mod sync;


/// Generated protobuf types and service stubs.
pub mod proto {
    pub mod policysync {
        tonic::include_proto!("policysync");
    }

    pub mod mgmt {
        tonic::include_proto!("mgmt");
    }
}
