use super::{
    unstructured::{lookup, required_fields, required_slices, FieldError},
    ValidationError,
};
use crate::store::id_of;
use ingress_controller_k8s_api::DynamicObject;

const AP_POLICY_REQUIRED_FIELDS: &[&[&str]] = &[&["spec", "policy"]];
const AP_LOG_CONF_REQUIRED_FIELDS: &[&[&str]] = &[&["spec", "content"], &["spec", "filter"]];
const AP_USER_SIG_REQUIRED_SLICES: &[&[&str]] = &[&["spec", "signatures"]];
const AP_DOS_POLICY_REQUIRED_FIELDS: &[&[&str]] = &[&["spec"]];
const AP_DOS_LOG_CONF_REQUIRED_FIELDS: &[&[&str]] = &[&["spec", "content"], &["spec", "filter"]];

pub fn validate_ap_policy(obj: &DynamicObject) -> Result<(), ValidationError> {
    required_fields(&obj.data, AP_POLICY_REQUIRED_FIELDS)
        .map_err(|source| invalid("App Protect Policy", obj, source))
}

pub fn validate_ap_log_conf(obj: &DynamicObject) -> Result<(), ValidationError> {
    required_fields(&obj.data, AP_LOG_CONF_REQUIRED_FIELDS)
        .map_err(|source| invalid("App Protect Log Configuration", obj, source))
}

/// User-defined signatures must be a non-empty list.
pub fn validate_ap_user_sig(obj: &DynamicObject) -> Result<(), ValidationError> {
    required_slices(&obj.data, AP_USER_SIG_REQUIRED_SLICES)
        .and_then(|()| {
            let signatures = lookup(&obj.data, AP_USER_SIG_REQUIRED_SLICES[0])?;
            match signatures.as_array() {
                Some(sigs) if !sigs.is_empty() => Ok(()),
                _ => Err(FieldError::Empty("spec.signatures".to_string())),
            }
        })
        .map_err(|source| invalid("App Protect User Signature", obj, source))
}

pub fn validate_ap_dos_policy(obj: &DynamicObject) -> Result<(), ValidationError> {
    required_fields(&obj.data, AP_DOS_POLICY_REQUIRED_FIELDS)
        .map_err(|source| invalid("App Protect Dos Policy", obj, source))
}

pub fn validate_ap_dos_log_conf(obj: &DynamicObject) -> Result<(), ValidationError> {
    required_fields(&obj.data, AP_DOS_LOG_CONF_REQUIRED_FIELDS)
        .map_err(|source| invalid("App Protect Dos Log Configuration", obj, source))
}

fn invalid(kind: &'static str, obj: &DynamicObject, source: FieldError) -> ValidationError {
    ValidationError::AppProtect {
        kind,
        id: id_of(obj),
        source,
    }
}
