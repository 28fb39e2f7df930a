//! NGINX Ingress Controller reconciliation core
//!
//! The controller watches the resources that make up an NGINX configuration and turns changes to
//! them into configuration changes and status problems:
//!
//! - Watch handlers keep a [`Store`] for each kind up to date and enqueue a [`Task`] for every
//!   update that could affect the generated configuration. Updates that only touch status or
//!   bookkeeping metadata are dropped.
//! - A single worker drains the [`Queue`]. Each task triggers a reconciliation pass that validates
//!   every resource, resolves conflicting host and listener claims, and walks the references of
//!   the winners through the caches.
//! - The pass is diffed against the previous pass so that only resources whose derived
//!   configuration changed are emitted.
//!
//! ```text
//! [ watches ] -> [ Store ] -> [ Queue ] -> [ Reconciler ] -> [ Change ] + [ Problem ]
//! ```
//!
//! App Protect resources are validated incrementally as they are observed, and their changes are
//! emitted even before the caches have synced.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod app_protect;
pub mod app_protect_dos;
pub mod changes;
mod config;
pub mod conflict;
pub mod handlers;
pub mod metrics;
mod queue;
pub mod reconciler;
pub mod resolver;
pub mod secrets;
mod store;
pub mod upstreams;
pub mod validation;

#[cfg(test)]
mod tests;

pub use self::{
    config::ControllerConfig,
    handlers::{Handler, SharedHandler, Watched},
    metrics::QueueMetrics,
    queue::{Queue, QueueState},
    reconciler::{Pass, Reconciler, Resolved},
    store::{apply_object, id_of, Store, StoreError, Stores},
};
pub use ingress_controller_core::Task;
