//! Structural checks of resources, independent of anything they reference.
//!
//! Malformed input is the expected case here: validators never panic and report every problem
//! they can find in a single error where the format allows it.

mod app_protect;
mod dos;
mod ingress;
mod policy;
mod unstructured;
mod virtual_server;

pub use self::{
    app_protect::{
        validate_ap_dos_log_conf, validate_ap_dos_policy, validate_ap_log_conf,
        validate_ap_policy, validate_ap_user_sig,
    },
    dos::{
        validate_app_protect_dos_access_log_dest, validate_app_protect_dos_log_dest,
        validate_app_protect_dos_monitor, validate_app_protect_dos_name,
        validate_app_protect_log_dest, validate_dos_protected_resource, DosError, MAX_NAME_LENGTH,
    },
    ingress::validate_ingress,
    policy::validate_policy,
    unstructured::{required_fields, required_slices, FieldError},
    virtual_server::{
        validate_global_configuration, validate_transport_server, validate_virtual_server,
        validate_virtual_server_route,
    },
};
use ingress_controller_core::{Kind, ResourceId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

const DNS1123_LABEL_REGEX: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
const DNS1123_SUBDOMAIN_REGEX: &str =
    r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(DNS1123_LABEL_REGEX).expect("should_compile"));
static DNS1123_SUBDOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(DNS1123_SUBDOMAIN_REGEX).expect("should_compile"));

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("{kind} {id} is invalid: {violations}")]
    Fields {
        kind: Kind,
        id: ResourceId,
        violations: Violations,
    },

    #[error("Error validating {kind} {id}: {source}")]
    AppProtect {
        kind: &'static str,
        id: ResourceId,
        source: FieldError,
    },

    #[error("error validating DosProtectedResource {id}: missing value for field: {field}")]
    MissingDosField { id: ResourceId, field: &'static str },

    #[error("error validating DosProtectedResource {id}: invalid field: {field} err={source}")]
    InvalidDosField {
        id: ResourceId,
        field: &'static str,
        source: DosError,
    },
}

// === impl ValidationError ===

impl ValidationError {
    /// The error without the resource's identity, for messages that already name the resource.
    pub fn detail(&self) -> String {
        match self {
            Self::Fields { violations, .. } => violations.to_string(),
            error => error.to_string(),
        }
    }
}

/// A list of field-level violations, formatted the way the Kubernetes API server formats them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Violations(Vec<Violation>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    Required(String),
    Invalid {
        path: String,
        value: String,
        detail: String,
    },
    Duplicate {
        path: String,
        value: String,
    },
    Forbidden {
        path: String,
        detail: String,
    },
}

// === impl Violations ===

impl Violations {
    pub fn required(&mut self, path: impl Into<String>) {
        self.0.push(Violation::Required(path.into()));
    }

    pub fn invalid(
        &mut self,
        path: impl Into<String>,
        value: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.0.push(Violation::Invalid {
            path: path.into(),
            value: value.into(),
            detail: detail.into(),
        });
    }

    pub fn duplicate(&mut self, path: impl Into<String>, value: impl Into<String>) {
        self.0.push(Violation::Duplicate {
            path: path.into(),
            value: value.into(),
        });
    }

    pub fn forbidden(&mut self, path: impl Into<String>, detail: impl Into<String>) {
        self.0.push(Violation::Forbidden {
            path: path.into(),
            detail: detail.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    /// Fails with these violations, attributed to the resource `id` of `kind`, unless there are
    /// none.
    pub fn into_result(self, kind: Kind, id: ResourceId) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Ok(());
        }
        Err(ValidationError::Fields {
            kind,
            id,
            violations: self,
        })
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [v] => v.fmt(f),
            vs => {
                f.write_str("[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    v.fmt(f)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required(path) => write!(f, "{path}: Required value"),
            Self::Invalid {
                path,
                value,
                detail,
            } => write!(f, "{path}: Invalid value: {value:?}: {detail}"),
            Self::Duplicate { path, value } => write!(f, "{path}: Duplicate value: {value:?}"),
            Self::Forbidden { path, detail } => write!(f, "{path}: Forbidden: {detail}"),
        }
    }
}

fn is_dns1123_label(value: &str) -> bool {
    value.len() <= 63 && DNS1123_LABEL.is_match(value)
}

fn is_dns1123_subdomain(value: &str) -> bool {
    value.len() <= 253 && DNS1123_SUBDOMAIN.is_match(value)
}

/// Validates a reference of the form `[namespace/]name`.
fn validate_reference(value: &str, path: &str, violations: &mut Violations) {
    if value.is_empty() {
        violations.required(path);
        return;
    }
    let (ns, name) = match value.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, value),
    };
    if let Some(ns) = ns {
        if !is_dns1123_label(ns) {
            violations.invalid(path, value, "namespace must be a valid DNS-1123 label");
            return;
        }
    }
    if !is_dns1123_subdomain(name) {
        violations.invalid(path, value, "name must be a valid DNS-1123 subdomain");
    }
}
