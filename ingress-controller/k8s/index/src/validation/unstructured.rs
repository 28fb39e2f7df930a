//! Required-field checks over schema-less object trees.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum FieldError {
    #[error("Required field {0} not found")]
    NotFound(String),

    #[error("Required field {0} must be a list")]
    NotAList(String),

    #[error("Required field {0} must not be empty")]
    Empty(String),
}

/// Checks that every dotted path in `paths` exists in `tree`.
///
/// Every segment but the last must resolve to a map. The last segment only needs to be present.
pub fn required_fields(tree: &Value, paths: &[&[&str]]) -> Result<(), FieldError> {
    for path in paths {
        lookup(tree, path)?;
    }
    Ok(())
}

/// Checks that every dotted path in `paths` resolves to a list.
pub fn required_slices(tree: &Value, paths: &[&[&str]]) -> Result<(), FieldError> {
    for path in paths {
        if !lookup(tree, path)?.is_array() {
            return Err(FieldError::NotAList(path.join(".")));
        }
    }
    Ok(())
}

/// Walks `path`, reporting the whole path as missing if any segment is absent or any
/// intermediate segment is not a map.
pub(super) fn lookup<'t>(tree: &'t Value, path: &[&str]) -> Result<&'t Value, FieldError> {
    let not_found = || FieldError::NotFound(path.join("."));
    let mut node = tree;
    for segment in path {
        node = node
            .as_object()
            .and_then(|map| map.get(*segment))
            .ok_or_else(not_found)?;
    }
    Ok(node)
}
