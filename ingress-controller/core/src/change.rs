use crate::KindedKey;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    AddOrUpdate,
    Delete,
}

/// A change in derived configuration, handed to the configuration renderer.
///
/// At most one change is produced per resource per reconciliation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Change<R> {
    pub op: Operation,
    pub resource: R,
}

/// A unit of work on the reconcile queue.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Task {
    /// The resource with this key changed.
    Resource(KindedKey),

    /// Recompute everything from the cached cluster state.
    Resync,
}

// === impl Change ===

impl<R> Change<R> {
    pub fn add_or_update(resource: R) -> Self {
        Self {
            op: Operation::AddOrUpdate,
            resource,
        }
    }

    pub fn delete(resource: R) -> Self {
        Self {
            op: Operation::Delete,
            resource,
        }
    }

    pub fn map<S>(self, f: impl FnOnce(R) -> S) -> Change<S> {
        Change {
            op: self.op,
            resource: f(self.resource),
        }
    }
}
