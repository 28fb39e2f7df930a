//! Reference strings between resources.
//!
//! A reference is either `name`, which refers to a resource in the referencing resource's
//! namespace, or `namespace/name`.

use crate::ResourceId;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0:?} must follow the format <namespace>/<name>")]
pub struct InvalidNamespaceName(pub String);

/// Qualifies a reference with `namespace` unless it already names one.
pub fn qualify(reference: &str, namespace: &str) -> ResourceId {
    match reference.split_once('/') {
        Some((ns, name)) => ResourceId::new(ns, name),
        None => ResourceId::new(namespace, reference),
    }
}

/// Expands a comma-separated list of references, qualifying each element independently.
///
/// Whitespace around elements is ignored. An empty list expands to nothing.
pub fn expand(references: &str, namespace: &str) -> Vec<ResourceId> {
    if references.trim().is_empty() {
        return vec![];
    }
    references
        .split(',')
        .map(|r| qualify(r.trim(), namespace))
        .collect()
}

/// Parses a value that must be exactly `<namespace>/<name>`.
pub fn parse_namespace_name(value: &str) -> Result<ResourceId, InvalidNamespaceName> {
    let mut parts = value.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ns), Some(name), None) => Ok(ResourceId::new(ns, name)),
        _ => Err(InvalidNamespaceName(value.to_string())),
    }
}
