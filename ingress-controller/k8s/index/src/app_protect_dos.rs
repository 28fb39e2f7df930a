//! Tracks App Protect DoS policies, log configurations and protected resources.

use crate::{
    app_protect::{self, AppResourceError, Validated},
    store::id_of,
    validation::{validate_ap_dos_log_conf, validate_ap_dos_policy, validate_dos_protected_resource},
};
use ahash::AHashMap as HashMap;
use ingress_controller_core::{Change, Kind, Problem, ResourceId};
use ingress_controller_k8s_api::{configuration::DosProtectedResource, DynamicObject};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum DosResource {
    /// A DoS policy or log configuration.
    Unstructured(Validated<DynamicObject>),
    Protected(Validated<DosProtectedResource>),
}

pub type Changes = Vec<Change<DosResource>>;

pub trait AppProtectDosConfiguration: Send + Sync {
    fn add_or_update_policy(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>);
    fn add_or_update_log_conf(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>);
    fn add_or_update_protected_resource(
        &mut self,
        obj: Arc<DosProtectedResource>,
    ) -> (Changes, Vec<Problem>);

    fn get_app_resource(
        &self,
        kind: Kind,
        id: &ResourceId,
    ) -> Result<Arc<DynamicObject>, AppResourceError>;

    /// Resolves a `[namespace/]name` reference to a valid protected resource.
    fn get_protected_resource(
        &self,
        id: &ResourceId,
    ) -> Result<Arc<DosProtectedResource>, AppResourceError>;

    fn delete_policy(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>);
    fn delete_log_conf(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>);
    fn delete_protected_resource(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>);
}

#[derive(Debug, Default)]
pub struct DosConfiguration {
    policies: HashMap<ResourceId, Validated<DynamicObject>>,
    log_confs: HashMap<ResourceId, Validated<DynamicObject>>,
    protected: HashMap<ResourceId, Validated<DosProtectedResource>>,
}

#[derive(Debug, Default)]
pub struct FakeDosConfiguration {
    policies: HashMap<ResourceId, Arc<DynamicObject>>,
    log_confs: HashMap<ResourceId, Arc<DynamicObject>>,
    protected: HashMap<ResourceId, Arc<DosProtectedResource>>,
}

fn unstructured(
    (changes, problems): (Vec<Change<Validated<DynamicObject>>>, Vec<Problem>),
) -> (Changes, Vec<Problem>) {
    let changes = changes
        .into_iter()
        .map(|Change { op, resource }| Change {
            op,
            resource: DosResource::Unstructured(resource),
        })
        .collect();
    (changes, problems)
}

fn protected(
    (changes, problems): (Vec<Change<Validated<DosProtectedResource>>>, Vec<Problem>),
) -> (Changes, Vec<Problem>) {
    let changes = changes
        .into_iter()
        .map(|Change { op, resource }| Change {
            op,
            resource: DosResource::Protected(resource),
        })
        .collect();
    (changes, problems)
}

// === impl DosConfiguration ===

impl DosConfiguration {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppProtectDosConfiguration for DosConfiguration {
    fn add_or_update_policy(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        let id = id_of(&*obj);
        unstructured(app_protect::add_or_update(
            &mut self.policies,
            Kind::ApDosPolicy,
            id,
            obj,
            validate_ap_dos_policy,
        ))
    }

    fn add_or_update_log_conf(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        let id = id_of(&*obj);
        unstructured(app_protect::add_or_update(
            &mut self.log_confs,
            Kind::ApDosLogConf,
            id,
            obj,
            validate_ap_dos_log_conf,
        ))
    }

    fn add_or_update_protected_resource(
        &mut self,
        obj: Arc<DosProtectedResource>,
    ) -> (Changes, Vec<Problem>) {
        let id = id_of(&*obj);
        protected(app_protect::add_or_update(
            &mut self.protected,
            Kind::DosProtectedResource,
            id,
            obj,
            validate_dos_protected_resource,
        ))
    }

    fn get_app_resource(
        &self,
        kind: Kind,
        id: &ResourceId,
    ) -> Result<Arc<DynamicObject>, AppResourceError> {
        match kind {
            Kind::ApDosPolicy => app_protect::lookup(&self.policies, kind, id),
            Kind::ApDosLogConf => app_protect::lookup(&self.log_confs, kind, id),
            other => Err(AppResourceError::UnknownKind(other)),
        }
    }

    fn get_protected_resource(
        &self,
        id: &ResourceId,
    ) -> Result<Arc<DosProtectedResource>, AppResourceError> {
        app_protect::lookup(&self.protected, Kind::DosProtectedResource, id)
    }

    fn delete_policy(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>) {
        unstructured(app_protect::delete(&mut self.policies, id))
    }

    fn delete_log_conf(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>) {
        unstructured(app_protect::delete(&mut self.log_confs, id))
    }

    fn delete_protected_resource(&mut self, id: &ResourceId) -> (Changes, Vec<Problem>) {
        protected(app_protect::delete(&mut self.protected, id))
    }
}

// === impl FakeDosConfiguration ===

impl AppProtectDosConfiguration for FakeDosConfiguration {
    fn add_or_update_policy(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        self.policies.insert(id_of(&*obj), obj);
        (vec![], vec![])
    }

    fn add_or_update_log_conf(&mut self, obj: Arc<DynamicObject>) -> (Changes, Vec<Problem>) {
        self.log_confs.insert(id_of(&*obj), obj);
        (vec![], vec![])
    }

    fn add_or_update_protected_resource(
        &mut self,
        obj: Arc<DosProtectedResource>,
    ) -> (Changes, Vec<Problem>) {
        self.protected.insert(id_of(&*obj), obj);
        (vec![], vec![])
    }

    fn get_app_resource(
        &self,
        kind: Kind,
        id: &ResourceId,
    ) -> Result<Arc<DynamicObject>, AppResourceError> {
        let entries = match kind {
            Kind::ApDosPolicy => &self.policies,
            Kind::ApDosLogConf => &self.log_confs,
            other => return Err(AppResourceError::UnknownKind(other)),
        };
        entries
            .get(id)
            .cloned()
            .ok_or_else(|| AppResourceError::NotFound {
                kind: app_protect::kind_label(kind),
                id: id.clone(),
            })
    }

    fn get_protected_resource(
        &self,
        id: &ResourceId,
    ) -> Result<Arc<DosProtectedResource>, AppResourceError> {
        self.protected
            .get(id)
            .cloned()
            .ok_or_else(|| AppResourceError::NotFound {
                kind: app_protect::kind_label(Kind::DosProtectedResource),
                id: id.clone(),
            })
    }

    fn delete_policy(&mut self, _: &ResourceId) -> (Changes, Vec<Problem>) {
        (vec![], vec![])
    }

    fn delete_log_conf(&mut self, _: &ResourceId) -> (Changes, Vec<Problem>) {
        (vec![], vec![])
    }

    fn delete_protected_resource(&mut self, _: &ResourceId) -> (Changes, Vec<Problem>) {
        (vec![], vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::{Operation, Reason};
    use ingress_controller_k8s_api::{configuration::DosProtectedResourceSpec, ObjectMeta};

    fn protected_resource(name: &str, spec: DosProtectedResourceSpec) -> Arc<DosProtectedResource> {
        Arc::new(DosProtectedResource {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
        })
    }

    #[test]
    fn protected_resources() {
        let mut config = DosConfiguration::new();
        let id = ResourceId::new("default", "dos-protected");

        let (changes, problems) = config.add_or_update_protected_resource(protected_resource(
            "dos-protected",
            DosProtectedResourceSpec {
                enable: true,
                name: "webapp".to_string(),
                ap_dos_monitor: "webapp.example.com".to_string(),
                ..Default::default()
            },
        ));
        assert!(problems.is_empty());
        assert!(matches!(
            changes.as_slice(),
            [Change {
                op: Operation::AddOrUpdate,
                resource: DosResource::Protected(_),
            }]
        ));
        assert!(config.get_protected_resource(&id).is_ok());

        let (changes, problems) = config.add_or_update_protected_resource(protected_resource(
            "dos-protected",
            DosProtectedResourceSpec {
                enable: true,
                ..Default::default()
            },
        ));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, Operation::Delete);
        assert_eq!(problems[0].reason, Reason::Rejected);
        assert_eq!(
            problems[0].message,
            "error validating DosProtectedResource default/dos-protected: missing value for \
             field: name"
        );
        assert_eq!(
            config.get_protected_resource(&id),
            Err(AppResourceError::Invalid(
                app_protect::FAILED_VALIDATION.to_string()
            ))
        );
    }

    #[test]
    fn missing_dos_policy() {
        let config = DosConfiguration::new();
        let err = config
            .get_app_resource(Kind::ApDosPolicy, &ResourceId::new("default", "dos-policy"))
            .expect_err("policy must not exist");
        assert_eq!(
            err.to_string(),
            "App Protect Dos Policy default/dos-policy not found"
        );
    }
}
