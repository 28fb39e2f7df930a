//! Decides whether an update is worth reconciling.
//!
//! Watches deliver many updates that do not affect the generated configuration: status writes,
//! resource version churn, and (for services) fields the proxy never reads.

use ingress_controller_k8s_api::{DynamicObject, Ingress, Service, ServicePort};
use serde_json::Value;
use std::{fmt, sync::Arc};

/// A cached object paired with the parts of it that configuration is derived from.
///
/// Two snapshots are equal when their objects differ only in status or bookkeeping metadata, so
/// that our own status writes never look like configuration changes.
#[derive(Clone)]
pub struct Snapshot<T> {
    pub object: Arc<T>,
    revision: Arc<Value>,
}

/// Ignores load balancer status and resource version churn.
pub fn has_ingress_changes(old: &Ingress, cur: &Ingress) -> bool {
    let mut old = old.clone();
    old.status = cur.status.clone();
    old.metadata.resource_version = cur.metadata.resource_version.clone();
    old != *cur
}

/// Compares only port names and numbers, and the external name of `ExternalName` services.
///
/// Kubernetes does not update endpoints when a service port number changes, so these changes must
/// be observed on the service itself.
pub fn has_service_changes(old: &Service, cur: &Service) -> bool {
    has_service_port_changes(service_ports(old), service_ports(cur))
        || has_service_external_name_changes(old, cur)
}

fn service_ports(svc: &Service) -> Vec<ServicePort> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default()
}

fn has_service_port_changes(mut old: Vec<ServicePort>, mut cur: Vec<ServicePort>) -> bool {
    if old.len() != cur.len() {
        return true;
    }

    let by_name_then_port = |a: &ServicePort, b: &ServicePort| {
        a.name.cmp(&b.name).then_with(|| a.port.cmp(&b.port))
    };
    old.sort_by(by_name_then_port);
    cur.sort_by(by_name_then_port);

    old.iter()
        .zip(cur.iter())
        .any(|(o, c)| o.port != c.port || o.name != c.name)
}

fn has_service_external_name_changes(old: &Service, cur: &Service) -> bool {
    let Some(spec) = cur.spec.as_ref() else {
        return false;
    };
    if spec.type_.as_deref() != Some("ExternalName") {
        return false;
    }
    let old_name = old.spec.as_ref().and_then(|s| s.external_name.as_deref());
    old_name != spec.external_name.as_deref()
}

/// Compares the `spec` of two unstructured objects.
///
/// An object whose spec is not a map is always considered changed so that validation reports it.
pub fn are_specs_different(old: &DynamicObject, cur: &DynamicObject) -> bool {
    let Some(spec) = cur.data.get("spec").filter(|spec| spec.is_object()) else {
        tracing::debug!(name = ?cur.metadata.name, "Spec has an unexpected format");
        return true;
    };
    old.data.get("spec") != Some(spec)
}

// === impl Snapshot ===

impl<T: serde::Serialize> Snapshot<T> {
    pub fn new(object: Arc<T>) -> Self {
        let revision = Arc::new(revision(&*object));
        Self { object, revision }
    }
}

impl<T> PartialEq for Snapshot<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.object, &other.object) || self.revision == other.revision
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.object.fmt(f)
    }
}

fn revision<T: serde::Serialize>(obj: &T) -> Value {
    let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("status");
        if let Some(Value::Object(meta)) = map.get_mut("metadata") {
            for field in ["resourceVersion", "managedFields", "generation"] {
                meta.remove(field);
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_k8s_api::{
        api::networking::v1::{IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus},
        ObjectMeta, ServiceSpec,
    };
    use serde_json::json;

    fn service(ports: &[(&str, i32)], type_: &str, external_name: Option<&str>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                external_name: external_name.map(Into::into),
                ports: Some(
                    ports
                        .iter()
                        .map(|(name, port)| ServicePort {
                            name: Some(name.to_string()),
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_port_order_is_ignored() {
        let old = service(&[("http", 80), ("https", 443)], "ClusterIP", None);
        let cur = service(&[("https", 443), ("http", 80)], "ClusterIP", None);
        assert!(!has_service_changes(&old, &cur));

        let cur = service(&[("http", 8080), ("https", 443)], "ClusterIP", None);
        assert!(has_service_changes(&old, &cur));

        let cur = service(&[("http", 80)], "ClusterIP", None);
        assert!(has_service_changes(&old, &cur));
    }

    #[test]
    fn external_name_only_matters_for_external_name_services() {
        let old = service(&[], "ClusterIP", Some("a.example.com"));
        let cur = service(&[], "ClusterIP", Some("b.example.com"));
        assert!(!has_service_changes(&old, &cur));

        let old = service(&[], "ExternalName", Some("a.example.com"));
        let cur = service(&[], "ExternalName", Some("b.example.com"));
        assert!(has_service_changes(&old, &cur));
    }

    #[test]
    fn ingress_status_is_ignored() {
        let old = Ingress {
            metadata: ObjectMeta {
                name: Some("cafe".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut cur = old.clone();
        cur.metadata.resource_version = Some("2".to_string());
        cur.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress {
                    ip: Some("10.0.0.1".to_string()),
                    ..Default::default()
                }]),
            }),
        });
        assert!(!has_ingress_changes(&old, &cur));

        cur.metadata.labels = Some(maplit::btreemap! { "app".to_string() => "cafe".to_string() });
        assert!(has_ingress_changes(&old, &cur));
    }

    #[test]
    fn unstructured_specs() {
        let obj = |spec: Value| -> DynamicObject {
            serde_json::from_value(json!({
                "apiVersion": "appprotect.f5.com/v1beta1",
                "kind": "APPolicy",
                "metadata": { "name": "waf", "namespace": "default" },
                "spec": spec,
            }))
            .expect("object must deserialize")
        };
        let a = obj(json!({ "policy": { "name": "a" } }));
        let b = obj(json!({ "policy": { "name": "b" } }));
        assert!(!are_specs_different(&a, &a.clone()));
        assert!(are_specs_different(&a, &b));
        assert!(are_specs_different(&a, &obj(json!("not-a-map"))));
    }

    #[test]
    fn snapshots_ignore_status_and_versions() {
        let mut vs = json!({
            "apiVersion": "k8s.nginx.org/v1",
            "kind": "VirtualServer",
            "metadata": { "name": "cafe", "namespace": "default", "resourceVersion": "1" },
            "spec": { "host": "cafe.example.com" },
        });
        let a: DynamicObject = serde_json::from_value(vs.clone()).expect("valid object");
        vs["metadata"]["resourceVersion"] = json!("2");
        vs["status"] = json!({ "state": "Valid" });
        let b: DynamicObject = serde_json::from_value(vs.clone()).expect("valid object");
        assert_eq!(Snapshot::new(Arc::new(a.clone())), Snapshot::new(Arc::new(b)));

        vs["spec"]["host"] = json!("tea.example.com");
        let c: DynamicObject = serde_json::from_value(vs).expect("valid object");
        assert_ne!(Snapshot::new(Arc::new(a)), Snapshot::new(Arc::new(c)));
    }
}
