//! Reports the outcome of reconciliation back to the cluster.
//!
//! Problems produced by the reconciler are logged as events and summarized into the `status` of
//! the resources that carry one. Only the leader writes status.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod status;

#[cfg(test)]
mod tests;

pub use self::{
    index::{Controller, ControllerMetrics, Index, Update},
    status::{format_warning_messages, resource_status, status_from_reason},
};
