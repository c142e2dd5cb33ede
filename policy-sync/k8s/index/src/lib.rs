//! Policy Sync Interest Filter
//!
//! Watches the Calico policy model and maintains, for every workload endpoint on this node, the
//! set of tiers, policies and profiles that apply to it:
//!
//! - Each `WorkloadEndpoint` carries labels and lists the `Profile`s it uses. A profile may apply
//!   additional labels to the endpoints that use it.
//! - Each `GlobalNetworkPolicy` selects over all endpoints; each `NetworkPolicy` selects over
//!   endpoints in its namespace. Policies are grouped into `Tier`s.
//!
//! ```text
//! [ Tier ] <- [ (Global)NetworkPolicy ] -> [ WorkloadEndpoint ] <- [ Profile ]
//! ```
//!
//! Whenever any of these resources changes, every endpoint's active state is recomputed and the
//! difference from its previous state is published, in dependency order, to the endpoint's
//! subscriber (if any). Subscriptions begin with a snapshot taken under the same lock that
//! installs the subscriber's queue, so no update is lost or duplicated between the two.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoint;
mod index;
pub mod metrics;


pub use self::{
    index::{Config, Index, Removals, SharedIndex, NAMESPACE_LABEL, ORCHESTRATOR_LABEL},
    metrics::IndexMetrics,
};
