#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod calico;
pub mod labels;

pub use self::labels::Labels;
pub use kube::api::{ObjectMeta, Resource, ResourceExt};
