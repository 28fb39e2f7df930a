//! Watch handlers.
//!
//! Handlers only write the caches and enqueue work. Every decision about what the cluster state
//! means is left to the reconciler.

use crate::{
    changes::{are_specs_different, has_ingress_changes, has_service_changes},
    config::ControllerConfig,
    queue::Queue,
    secrets::{is_supported_secret_type, secret_type},
    store::{id_of, Store},
};
use ahash::AHashSet as HashSet;
use ingress_controller_core::{Kind, KindedKey, ResourceId, Task};
use ingress_controller_k8s_api::{
    configuration::{
        DosProtectedResource, GlobalConfiguration, Policy, TransportServer, VirtualServer,
        VirtualServerRoute,
    },
    ConfigMap, DynamicObject, Endpoints, Event, Ingress, Pod, ResourceExt, Secret, Service, Watch,
};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;

/// Feeds one cache from a watch and enqueues the objects that need reconciling.
#[derive(Debug)]
pub struct Handler<T> {
    store: Arc<Store<T>>,
    queue: Queue,
    config: Arc<ControllerConfig>,
}

pub type SharedHandler<T> = Arc<RwLock<Handler<T>>>;

/// Per-type filters applied by a [`Handler`].
pub trait Watched: ResourceExt + Sized {
    /// Objects that are not relevant are cached but never reconciled.
    fn is_relevant(&self, _kind: Kind, _id: &ResourceId, _config: &ControllerConfig) -> bool {
        true
    }

    /// Decides whether deleting this object, in its last known state, needs reconciling.
    fn is_relevant_tombstone(
        &self,
        kind: Kind,
        id: &ResourceId,
        config: &ControllerConfig,
    ) -> bool {
        self.is_relevant(kind, id, config)
    }

    /// Decides whether an update from `old` affects configuration.
    fn has_changes(&self, old: &Self, id: &ResourceId, config: &ControllerConfig) -> bool;
}

// === impl Handler ===

impl<T: Watched> Handler<T> {
    pub fn new(store: Arc<Store<T>>, queue: Queue, config: Arc<ControllerConfig>) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn shared(self) -> SharedHandler<T> {
        Arc::new(RwLock::new(self))
    }

    fn enqueue(&self, id: ResourceId) {
        let key = KindedKey::new(self.store.kind(), id);
        tracing::debug!(%key, "Enqueuing");
        self.queue.enqueue(Task::Resource(key));
    }
}

impl<T: Watched> IndexNamespacedResource<T> for Handler<T> {
    fn apply(&mut self, obj: T) {
        let id = id_of(&obj);
        let kind = self.store.kind();
        let (prior, obj) = self.store.apply(id.clone(), obj);

        let relevant = obj.is_relevant(kind, &id, &self.config)
            || prior
                .as_ref()
                .is_some_and(|prior| prior.is_relevant(kind, &id, &self.config));
        if !relevant {
            return;
        }

        let changed = match prior {
            Some(prior) => obj.has_changes(&prior, &id, &self.config),
            None => true,
        };
        if changed {
            self.enqueue(id);
        } else {
            tracing::trace!(%kind, %id, "Ignoring unchanged update");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        let Some(tombstone) = self.store.delete(&id) else {
            return;
        };
        if tombstone.is_relevant_tombstone(self.store.kind(), &id, &self.config) {
            self.enqueue(id);
        }
    }

    fn reset(&mut self, resources: Vec<T>, removed: NamespacedRemoved) {
        for resource in resources {
            self.apply(resource);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete(namespace.clone(), name);
            }
        }
        if !self.store.is_synced() {
            tracing::debug!(kind = %self.store.kind(), objects = self.store.len(), "Synced");
        }
        self.store.mark_synced();
    }
}

/// Drives a handler from a watch.
///
/// Used for unstructured kinds, which the runtime cannot watch on its own. Objects that are
/// missing when the watch relists are deleted with their last known state.
pub async fn run<T>(handler: SharedHandler<T>, mut watch: Watch<T>)
where
    T: Watched,
{
    let mut relist: Option<Vec<T>> = None;
    while let Some(event) = watch.recv().await {
        match event {
            Event::Apply(obj) => handler.write().apply(obj),
            Event::Delete(obj) => {
                let ResourceId { namespace, name } = id_of(&obj);
                handler.write().delete(namespace, name);
            }
            Event::Init => relist = Some(Vec::new()),
            Event::InitApply(obj) => relist.get_or_insert_with(Vec::new).push(obj),
            Event::InitDone => {
                let objs = relist.take().unwrap_or_default();
                let listed = objs.iter().map(id_of).collect::<HashSet<_>>();

                let mut handler = handler.write();
                let mut removed = NamespacedRemoved::default();
                for id in handler.store.keys() {
                    if !listed.contains(&id) {
                        removed.entry(id.namespace).or_default().insert(id.name);
                    }
                }
                handler.reset(objs, removed);
            }
        }
    }
    tracing::debug!("Watch ended");
}

// === impl Watched ===

impl Watched for Ingress {
    fn has_changes(&self, old: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
        has_ingress_changes(old, self)
    }
}

impl Watched for Service {
    /// The service exposing the controller is reported in IngressLink and Ingress status, so
    /// any update to it is reconciled.
    fn has_changes(&self, old: &Self, id: &ResourceId, config: &ControllerConfig) -> bool {
        config.is_external_service(id) || has_service_changes(old, self)
    }
}

impl Watched for Endpoints {
    fn has_changes(&self, old: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
        old.subsets != self.subsets
    }
}

/// Pods are only read when resolving endpoints.
impl Watched for Pod {
    fn is_relevant(&self, _: Kind, _: &ResourceId, _: &ControllerConfig) -> bool {
        false
    }

    fn has_changes(&self, _: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
        false
    }
}

impl Watched for Secret {
    fn is_relevant(&self, _: Kind, _: &ResourceId, _: &ControllerConfig) -> bool {
        is_supported_secret_type(secret_type(self))
    }

    /// References to a secret of any type are reported as invalid until it is deleted, when
    /// they become missing.
    fn is_relevant_tombstone(&self, _: Kind, _: &ResourceId, _: &ControllerConfig) -> bool {
        true
    }

    fn has_changes(&self, old: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
        old.type_ != self.type_ || old.data != self.data || old.string_data != self.string_data
    }
}

impl Watched for ConfigMap {
    fn is_relevant(&self, _: Kind, id: &ResourceId, config: &ControllerConfig) -> bool {
        config.config_map.as_ref() == Some(id)
    }

    fn has_changes(&self, old: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
        old.data != self.data || old.binary_data != self.binary_data
    }
}

impl Watched for GlobalConfiguration {
    fn is_relevant(&self, _: Kind, id: &ResourceId, config: &ControllerConfig) -> bool {
        config.global_configuration.as_ref() == Some(id)
    }

    fn has_changes(&self, old: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
        old.spec != self.spec
    }
}

macro_rules! compare_specs {
    ($($ty:ty),+) => {
        $(
            impl Watched for $ty {
                fn has_changes(&self, old: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
                    old.spec != self.spec
                }
            }
        )+
    };
}

compare_specs!(
    VirtualServer,
    VirtualServerRoute,
    TransportServer,
    Policy,
    DosProtectedResource
);

/// Unstructured App Protect resources and IngressLinks.
impl Watched for DynamicObject {
    fn is_relevant(&self, kind: Kind, id: &ResourceId, config: &ControllerConfig) -> bool {
        kind != Kind::IngressLink || config.is_ingress_link(id)
    }

    fn has_changes(&self, old: &Self, _: &ResourceId, _: &ControllerConfig) -> bool {
        are_specs_different(old, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_k8s_api::{resilient, ByteString, ObjectMeta};
    use maplit::btreemap;
    use serde_json::json;
    use std::task::Poll;

    fn handler<T: Watched>(kind: Kind, config: ControllerConfig) -> (Handler<T>, Queue) {
        let queue = Queue::default();
        let store = Arc::new(Store::new(kind));
        (Handler::new(store, queue.clone(), Arc::new(config)), queue)
    }

    fn meta(ns: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn drain(queue: &Queue) -> Vec<String> {
        let mut tasks = Vec::new();
        while !queue.is_empty() {
            let task = match tokio_test::task::spawn(queue.next()).poll() {
                Poll::Ready(Some(task)) => task,
                _ => panic!("task must be queued"),
            };
            queue.done(&task);
            match task {
                Task::Resource(key) => tasks.push(key.to_string()),
                Task::Resync => tasks.push("resync".to_string()),
            }
        }
        tasks
    }

    fn secret(name: &str, type_: &str, value: &str) -> Secret {
        Secret {
            metadata: meta("default", name),
            type_: Some(type_.to_string()),
            data: Some(btreemap! {
                "ca.crt".to_string() => ByteString(value.as_bytes().to_vec()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ignores_status_updates() {
        let (mut handler, queue) = handler::<Ingress>(Kind::Ingress, Default::default());
        let ingress = Ingress {
            metadata: meta("default", "cafe"),
            ..Default::default()
        };
        handler.apply(ingress.clone());
        assert_eq!(drain(&queue), vec!["Ingress/default/cafe"]);

        let mut updated = ingress.clone();
        updated.metadata.resource_version = Some("2".to_string());
        handler.apply(updated.clone());
        assert!(drain(&queue).is_empty());

        updated.metadata.annotations = Some(btreemap! {
            "nginx.org/rewrites".to_string() => "serviceName=tea rewrite=/".to_string(),
        });
        handler.apply(updated);
        assert_eq!(drain(&queue), vec!["Ingress/default/cafe"]);
    }

    #[test]
    fn pods_are_cached_but_never_enqueued() {
        let (mut handler, queue) = handler::<Pod>(Kind::Pod, Default::default());
        handler.apply(Pod {
            metadata: meta("default", "coffee-7c86d7d67c-kv8f5"),
            ..Default::default()
        });
        assert_eq!(handler.store.len(), 1);
        handler.delete("default".to_string(), "coffee-7c86d7d67c-kv8f5".to_string());
        assert!(handler.store.is_empty());
        assert!(drain(&queue).is_empty());
    }

    #[test]
    fn filters_secrets_by_type() {
        let (mut handler, queue) = handler::<Secret>(Kind::Secret, Default::default());
        handler.apply(secret("opaque", "Opaque", "a"));
        handler.apply(secret("ca", "nginx.org/ca", "a"));
        assert_eq!(drain(&queue), vec!["Secret/default/ca"]);

        handler.apply(secret("ca", "nginx.org/ca", "a"));
        assert!(drain(&queue).is_empty(), "unchanged secrets are ignored");

        // A secret that changes to an unsupported type must still be reconciled so that
        // references to it are revisited.
        handler.apply(secret("ca", "Opaque", "a"));
        assert_eq!(drain(&queue), vec!["Secret/default/ca"]);

        // Deletes are reconciled whatever the type, so that references to the secret become
        // missing rather than invalid.
        handler.delete("default".to_string(), "opaque".to_string());
        handler.delete("default".to_string(), "missing".to_string());
        assert_eq!(drain(&queue), vec!["Secret/default/opaque"]);
    }

    #[test]
    fn only_the_configured_config_map_is_enqueued() {
        let config = ControllerConfig {
            config_map: Some(ResourceId::new("nginx-ingress", "nginx-config")),
            ..Default::default()
        };
        let (mut handler, queue) = handler::<ConfigMap>(Kind::ConfigMap, config);
        handler.apply(ConfigMap {
            metadata: meta("nginx-ingress", "other"),
            ..Default::default()
        });
        handler.apply(ConfigMap {
            metadata: meta("nginx-ingress", "nginx-config"),
            data: Some(btreemap! { "worker-processes".to_string() => "1".to_string() }),
            ..Default::default()
        });
        assert_eq!(drain(&queue), vec!["ConfigMap/nginx-ingress/nginx-config"]);
    }

    #[test]
    fn external_service_is_always_enqueued() {
        let config = ControllerConfig {
            external_service: Some("nginx-ingress".to_string()),
            ..Default::default()
        };
        let (mut handler, queue) = handler::<Service>(Kind::Service, config);
        let external = Service {
            metadata: meta("nginx-ingress", "nginx-ingress"),
            ..Default::default()
        };
        let other = Service {
            metadata: meta("default", "coffee"),
            ..Default::default()
        };
        handler.apply(external.clone());
        handler.apply(other.clone());
        assert_eq!(drain(&queue).len(), 2);

        handler.apply(external);
        handler.apply(other);
        assert_eq!(drain(&queue), vec!["Service/nginx-ingress/nginx-ingress"]);
    }

    #[test]
    fn reset_deletes_and_marks_synced() {
        let (mut handler, queue) =
            handler::<VirtualServer>(Kind::VirtualServer, Default::default());
        let vs = |name: &str| VirtualServer {
            metadata: meta("default", name),
            spec: Default::default(),
            status: None,
        };
        handler.apply(vs("a"));
        handler.apply(vs("b"));
        drain(&queue);
        assert!(!handler.store.is_synced());

        let mut removed = NamespacedRemoved::default();
        removed
            .entry("default".to_string())
            .or_default()
            .insert("b".to_string());
        handler.reset(vec![vs("a")], removed);

        assert!(handler.store.is_synced());
        assert_eq!(drain(&queue), vec!["VirtualServer/default/b"]);
    }

    fn ap_policy(name: &str, spec: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "appprotect.f5.com/v1beta1",
            "kind": "APPolicy",
            "metadata": { "name": name, "namespace": "default" },
            "spec": spec,
        }))
        .expect("object must deserialize")
    }

    #[tokio::test]
    async fn relist_tombstones_missing_objects() {
        let (handler, queue) = handler::<DynamicObject>(Kind::ApPolicy, Default::default());
        let store = handler.store.clone();
        let handler = handler.shared();

        let events = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(ap_policy("a", json!({ "policy": {} })))),
            Ok(Event::InitApply(ap_policy("b", json!({ "policy": {} })))),
            Ok(Event::InitDone),
            Ok(Event::Apply(ap_policy("a", json!({ "policy": { "name": "a" } })))),
            Ok(Event::Init),
            Ok(Event::InitApply(ap_policy("a", json!({ "policy": { "name": "a" } })))),
            Ok(Event::InitDone),
        ];
        run(handler, resilient(futures::stream::iter(events))).await;

        assert!(store.is_synced());
        assert!(store.get(&ResourceId::new("default", "a")).is_some());
        assert!(store.get(&ResourceId::new("default", "b")).is_none());
        assert_eq!(
            drain(&queue),
            vec!["APPolicy/default/a", "APPolicy/default/b"]
        );
    }

    #[test]
    fn only_the_configured_ingress_link_is_enqueued() {
        let config = ControllerConfig {
            ingress_link: Some("big-ip".to_string()),
            ..Default::default()
        };
        let (mut handler, queue) = handler::<DynamicObject>(Kind::IngressLink, config);
        let link = |ns: &str, name: &str| -> DynamicObject {
            serde_json::from_value(json!({
                "apiVersion": "cis.f5.com/v1",
                "kind": "IngressLink",
                "metadata": { "name": name, "namespace": ns },
                "spec": { "virtualServerAddress": "10.0.0.1" },
            }))
            .expect("object must deserialize")
        };
        handler.apply(link("nginx-ingress", "big-ip"));
        handler.apply(link("nginx-ingress", "other"));
        handler.apply(link("default", "big-ip"));
        assert_eq!(drain(&queue), vec!["IngressLink/nginx-ingress/big-ip"]);
    }
}
