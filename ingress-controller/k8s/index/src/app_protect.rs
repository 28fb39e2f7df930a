//! Tracks App Protect (WAF) policies, log configurations and user signatures.
//!
//! These are unstructured resources. Each object is validated when it is added and kept even if
//! it is invalid, so that references to it resolve to "invalid" rather than "not found".

use crate::{
    store::id_of,
    validation::{validate_ap_log_conf, validate_ap_policy, validate_ap_user_sig, ValidationError},
};
use ahash::AHashMap as HashMap;
use ingress_controller_core::{Change, Kind, KindedKey, Problem, Reason, ResourceId};
use ingress_controller_k8s_api::DynamicObject;
use std::sync::Arc;
use thiserror::Error;

/// The reason recorded on objects that fail validation.
pub const FAILED_VALIDATION: &str = "Validation Failed";

/// An object paired with the outcome of its validation.
#[derive(Debug, PartialEq)]
pub struct Validated<T> {
    pub kind: Kind,
    pub object: Arc<T>,
    pub error: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum AppResourceError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: ResourceId },

    #[error("{0}")]
    Invalid(String),

    #[error("Unknown App Protect resource kind {0}")]
    UnknownKind(Kind),
}

pub type Changes = Vec<Change<Validated<DynamicObject>>>;

/// Holds the App Protect resources the controller uses.
pub trait AppProtectConfiguration: Send + Sync {
    fn add_or_update_policy(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>);
    fn add_or_update_log_conf(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>);
    fn add_or_update_user_sig(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>);

    /// Returns a valid object, or why it cannot be used.
    fn get_app_resource(
        &self,
        kind: Kind,
        id: &ResourceId,
    ) -> Result<Arc<DynamicObject>, AppResourceError>;

    fn delete_policy(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>);
    fn delete_log_conf(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>);
    fn delete_user_sig(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>);
}

#[derive(Debug, Default)]
pub struct Configuration {
    policies: HashMap<ResourceId, Validated<DynamicObject>>,
    log_confs: HashMap<ResourceId, Validated<DynamicObject>>,
    user_sigs: HashMap<ResourceId, Validated<DynamicObject>>,
}

/// Accepts every object without validation. Deletes are ignored.
#[derive(Debug, Default)]
pub struct FakeConfiguration {
    policies: HashMap<ResourceId, Arc<DynamicObject>>,
    log_confs: HashMap<ResourceId, Arc<DynamicObject>>,
    user_sigs: HashMap<ResourceId, Arc<DynamicObject>>,
}

pub(crate) fn kind_label(kind: Kind) -> &'static str {
    match kind {
        Kind::ApPolicy => "App Protect Policy",
        Kind::ApLogConf => "App Protect LogConf",
        Kind::ApUserSig => "App Protect UserSig",
        Kind::ApDosPolicy => "App Protect Dos Policy",
        Kind::ApDosLogConf => "App Protect DosLogConf",
        Kind::DosProtectedResource => "App Protect DosProtectedResource",
        other => other.as_str(),
    }
}

/// Stores a validated object and describes the resulting change.
///
/// Invalid objects are stored too, and produce a delete so that any configuration derived from
/// an earlier valid version is removed.
pub(crate) fn add_or_update<T>(
    entries: &mut HashMap<ResourceId, Validated<T>>,
    kind: Kind,
    id: ResourceId,
    object: Arc<T>,
    validate: impl FnOnce(&T) -> Result<(), ValidationError>,
) -> (Vec<Change<Validated<T>>>, Vec<Problem>) {
    match validate(&object) {
        Ok(()) => {
            let entry = Validated {
                kind,
                object,
                error: None,
            };
            entries.insert(id, entry.clone());
            (vec![Change::add_or_update(entry)], vec![])
        }
        Err(error) => {
            tracing::debug!(%id, %error, "Rejecting {}", kind_label(kind));
            let entry = Validated {
                kind,
                object,
                error: Some(FAILED_VALIDATION.to_string()),
            };
            entries.insert(id.clone(), entry.clone());
            (
                vec![Change::delete(entry)],
                vec![Problem::new(
                    KindedKey::new(kind, id),
                    Reason::Rejected,
                    error.to_string(),
                )],
            )
        }
    }
}

pub(crate) fn delete<T>(
    entries: &mut HashMap<ResourceId, Validated<T>>,
    id: &ResourceId,
) -> (Vec<Change<Validated<T>>>, Vec<Problem>) {
    match entries.remove(id) {
        Some(entry) => (vec![Change::delete(entry)], vec![]),
        None => (vec![], vec![]),
    }
}

pub(crate) fn lookup<T>(
    entries: &HashMap<ResourceId, Validated<T>>,
    kind: Kind,
    id: &ResourceId,
) -> Result<Arc<T>, AppResourceError> {
    match entries.get(id) {
        Some(Validated {
            object,
            error: None,
            ..
        }) => Ok(object.clone()),
        Some(Validated {
            error: Some(error), ..
        }) => Err(AppResourceError::Invalid(error.clone())),
        None => Err(AppResourceError::NotFound {
            kind: kind_label(kind),
            id: id.clone(),
        }),
    }
}

// === impl Validated ===

// Cloning shares the object, so `T` itself need not be `Clone`.
impl<T> Clone for Validated<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            object: self.object.clone(),
            error: self.error.clone(),
        }
    }
}

// === impl Configuration ===

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists every valid policy, for reverse lookups.
    pub fn policies(&self) -> impl Iterator<Item = (&ResourceId, &Validated<DynamicObject>)> {
        self.policies.iter()
    }
}

impl AppProtectConfiguration for Configuration {
    fn add_or_update_policy(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        let id = id_of(&*obj);
        add_or_update(
            &mut self.policies,
            Kind::ApPolicy,
            id,
            obj,
            validate_ap_policy,
        )
    }

    fn add_or_update_log_conf(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        let id = id_of(&*obj);
        add_or_update(
            &mut self.log_confs,
            Kind::ApLogConf,
            id,
            obj,
            validate_ap_log_conf,
        )
    }

    fn add_or_update_user_sig(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        let id = id_of(&*obj);
        add_or_update(
            &mut self.user_sigs,
            Kind::ApUserSig,
            id,
            obj,
            validate_ap_user_sig,
        )
    }

    fn get_app_resource(
        &self,
        kind: Kind,
        id: &ResourceId,
    ) -> Result<Arc<DynamicObject>, AppResourceError> {
        match kind {
            Kind::ApPolicy => lookup(&self.policies, kind, id),
            Kind::ApLogConf => lookup(&self.log_confs, kind, id),
            Kind::ApUserSig => lookup(&self.user_sigs, kind, id),
            other => Err(AppResourceError::UnknownKind(other)),
        }
    }

    fn delete_policy(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>) {
        delete(&mut self.policies, id)
    }

    fn delete_log_conf(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>) {
        delete(&mut self.log_confs, id)
    }

    fn delete_user_sig(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>) {
        delete(&mut self.user_sigs, id)
    }
}

// === impl FakeConfiguration ===

impl AppProtectConfiguration for FakeConfiguration {
    fn add_or_update_policy(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        self.policies.insert(id_of(&*obj), obj);
        (vec![], vec![])
    }

    fn add_or_update_log_conf(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        self.log_confs.insert(id_of(&*obj), obj);
        (vec![], vec![])
    }

    fn add_or_update_user_sig(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        self.user_sigs.insert(id_of(&*obj), obj);
        (vec![], vec![])
    }

    fn get_app_resource(
        &self,
        kind: Kind,
        id: &ResourceId,
    ) -> Result<Arc<DynamicObject>, AppResourceError> {
        let entries = match kind {
            Kind::ApPolicy => &self.policies,
            Kind::ApLogConf => &self.log_confs,
            Kind::ApUserSig => &self.user_sigs,
            other => return Err(AppResourceError::UnknownKind(other)),
        };
        entries
            .get(id)
            .cloned()
            .ok_or_else(|| AppResourceError::NotFound {
                kind: kind_label(kind),
                id: id.clone(),
            })
    }

    fn delete_policy(&mut self, _: &ResourceId) -> (Changes, Vec<Problem>) {
        (vec![], vec![])
    }

    fn delete_log_conf(&mut self, _: &ResourceId) -> (Changes, Vec<Problem>) {
        (vec![], vec![])
    }

    fn delete_user_sig(&mut self, _: &ResourceId) -> (Changes, Vec<Problem>) {
        (vec![], vec![])
    }
}
