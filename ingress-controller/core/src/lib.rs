//! Shared vocabulary of the ingress controller.
//!
//! Every resource the controller watches is identified by its kind, namespace, and name. Watch
//! handlers translate cluster events into [`Task`]s keyed by a [`KindedKey`]; the reconciler turns
//! the cached cluster state into [`Change`]s for the configuration renderer and [`Problem`]s for
//! the status writer.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod change;
mod identity;
mod problem;
pub mod reference;

pub use self::{
    change::{Change, Operation, Task},
    identity::{Kind, KindedKey, ResourceId},
    problem::{Problem, Reason},
};

/// The name under which this controller writes status and claims leases.
pub const CONTROLLER_NAME: &str = "nginx-ingress-controller";
