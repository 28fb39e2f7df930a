//! Per-kind caches mirroring cluster state.
//!
//! Watches write into a [`Store`] while the reconciler reads from it. Reads never reach the
//! cluster; until a store has observed its initial list, a missing object is not evidence that it
//! was deleted.

use ahash::AHashMap as HashMap;
use ingress_controller_core::{Kind, ResourceId};
use ingress_controller_k8s_api::{
    configuration::*, ConfigMap, DynamicObject, Endpoints, Ingress, Labels, Pod,
    ResourceExt, Secret, Selector, Service,
};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StoreError {
    #[error("{0:?} is not a valid key: expected <namespace>/<name>")]
    InvalidKey(String),
}

/// A reader-writer-safe cache of one kind of resource, keyed by namespace and name.
#[derive(Debug)]
pub struct Store<T> {
    kind: Kind,
    objects: RwLock<HashMap<ResourceId, Arc<T>>>,
    synced: watch::Sender<bool>,
}

/// Stores for every kind the controller watches. Kinds that are disabled by configuration are
/// simply never populated.
#[derive(Clone, Debug)]
pub struct Stores {
    pub ingresses: Arc<Store<Ingress>>,
    pub virtual_servers: Arc<Store<VirtualServer>>,
    pub virtual_server_routes: Arc<Store<VirtualServerRoute>>,
    pub transport_servers: Arc<Store<TransportServer>>,
    pub policies: Arc<Store<Policy>>,
    pub global_configurations: Arc<Store<GlobalConfiguration>>,
    pub ingress_links: Arc<Store<DynamicObject>>,
    pub secrets: Arc<Store<Secret>>,
    pub services: Arc<Store<Service>>,
    pub endpoints: Arc<Store<Endpoints>>,
    pub pods: Arc<Store<Pod>>,
    pub config_maps: Arc<Store<ConfigMap>>,
    pub ap_policies: Arc<Store<DynamicObject>>,
    pub ap_log_confs: Arc<Store<DynamicObject>>,
    pub ap_user_sigs: Arc<Store<DynamicObject>>,
    pub ap_dos_policies: Arc<Store<DynamicObject>>,
    pub ap_dos_log_confs: Arc<Store<DynamicObject>>,
    pub dos_protected_resources: Arc<Store<DosProtectedResource>>,
}

/// Identifies an object by its metadata. Objects without a namespace are keyed under the empty
/// namespace.
pub fn id_of<T: ResourceExt>(obj: &T) -> ResourceId {
    ResourceId::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

// === impl Store ===

impl<T> Store<T> {
    pub fn new(kind: Kind) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            objects: RwLock::new(HashMap::default()),
            synced,
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn get(&self, id: &ResourceId) -> Option<Arc<T>> {
        self.objects.read().get(id).cloned()
    }

    /// Looks up an object by a `<namespace>/<name>` key.
    ///
    /// A malformed key is an error, distinct from the object not existing.
    pub fn get_by_key(&self, key: &str) -> Result<Option<Arc<T>>, StoreError> {
        match key.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(self.get(&ResourceId::new(ns, name)))
            }
            _ => Err(StoreError::InvalidKey(key.to_string())),
        }
    }

    /// Lists all objects ordered by namespace and name.
    pub fn list(&self) -> Vec<(ResourceId, Arc<T>)> {
        let mut objects = self
            .objects
            .read()
            .iter()
            .map(|(id, obj)| (id.clone(), obj.clone()))
            .collect::<Vec<_>>();
        objects.sort_by(|(a, _), (b, _)| a.cmp(b));
        objects
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Stores `obj`, returning the object it replaced.
    pub fn apply(&self, id: ResourceId, obj: T) -> (Option<Arc<T>>, Arc<T>) {
        let obj = Arc::new(obj);
        let prior = self.objects.write().insert(id, obj.clone());
        (prior, obj)
    }

    /// Removes an object, returning its last known state.
    pub fn delete(&self, id: &ResourceId) -> Option<Arc<T>> {
        self.objects.write().remove(id)
    }

    /// Lists the keys currently held, for diffing against a relist.
    pub fn keys(&self) -> Vec<ResourceId> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the store has observed its initial list.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender is owned by the store, so the channel cannot close while we hold `self`.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

impl<T: ResourceExt> Store<T> {
    /// Lists objects in `namespace` whose labels match `selector`, ordered by name.
    pub fn list_by_namespace(&self, namespace: &str, selector: &Selector) -> Vec<Arc<T>> {
        let mut objects = self
            .objects
            .read()
            .iter()
            .filter(|(id, _)| id.namespace == namespace)
            .filter(|(_, obj)| selector.matches(&Labels::from(obj.labels().clone())))
            .map(|(id, obj)| (id.clone(), obj.clone()))
            .collect::<Vec<_>>();
        objects.sort_by(|(a, _), (b, _)| a.cmp(b));
        objects.into_iter().map(|(_, obj)| obj).collect()
    }
}

// === impl Stores ===

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    pub fn new() -> Self {
        Self {
            ingresses: Arc::new(Store::new(Kind::Ingress)),
            virtual_servers: Arc::new(Store::new(Kind::VirtualServer)),
            virtual_server_routes: Arc::new(Store::new(Kind::VirtualServerRoute)),
            transport_servers: Arc::new(Store::new(Kind::TransportServer)),
            policies: Arc::new(Store::new(Kind::Policy)),
            global_configurations: Arc::new(Store::new(Kind::GlobalConfiguration)),
            ingress_links: Arc::new(Store::new(Kind::IngressLink)),
            secrets: Arc::new(Store::new(Kind::Secret)),
            services: Arc::new(Store::new(Kind::Service)),
            endpoints: Arc::new(Store::new(Kind::Endpoints)),
            pods: Arc::new(Store::new(Kind::Pod)),
            config_maps: Arc::new(Store::new(Kind::ConfigMap)),
            ap_policies: Arc::new(Store::new(Kind::ApPolicy)),
            ap_log_confs: Arc::new(Store::new(Kind::ApLogConf)),
            ap_user_sigs: Arc::new(Store::new(Kind::ApUserSig)),
            ap_dos_policies: Arc::new(Store::new(Kind::ApDosPolicy)),
            ap_dos_log_confs: Arc::new(Store::new(Kind::ApDosLogConf)),
            dos_protected_resources: Arc::new(Store::new(Kind::DosProtectedResource)),
        }
    }

    /// Returns the unstructured store for an App Protect kind.
    pub fn unstructured(&self, kind: Kind) -> Option<&Arc<Store<DynamicObject>>> {
        match kind {
            Kind::ApPolicy => Some(&self.ap_policies),
            Kind::ApLogConf => Some(&self.ap_log_confs),
            Kind::ApUserSig => Some(&self.ap_user_sigs),
            Kind::ApDosPolicy => Some(&self.ap_dos_policies),
            Kind::ApDosLogConf => Some(&self.ap_dos_log_confs),
            Kind::IngressLink => Some(&self.ingress_links),
            _ => None,
        }
    }

    /// Reports the size of each store, for metrics.
    pub fn sizes(&self) -> Vec<(Kind, usize)> {
        vec![
            (Kind::Ingress, self.ingresses.len()),
            (Kind::VirtualServer, self.virtual_servers.len()),
            (Kind::VirtualServerRoute, self.virtual_server_routes.len()),
            (Kind::TransportServer, self.transport_servers.len()),
            (Kind::Policy, self.policies.len()),
            (Kind::GlobalConfiguration, self.global_configurations.len()),
            (Kind::IngressLink, self.ingress_links.len()),
            (Kind::Secret, self.secrets.len()),
            (Kind::Service, self.services.len()),
            (Kind::Endpoints, self.endpoints.len()),
            (Kind::Pod, self.pods.len()),
            (Kind::ConfigMap, self.config_maps.len()),
            (Kind::ApPolicy, self.ap_policies.len()),
            (Kind::ApLogConf, self.ap_log_confs.len()),
            (Kind::ApUserSig, self.ap_user_sigs.len()),
            (Kind::ApDosPolicy, self.ap_dos_policies.len()),
            (Kind::ApDosLogConf, self.ap_dos_log_confs.len()),
            (
                Kind::DosProtectedResource,
                self.dos_protected_resources.len(),
            ),
        ]
    }
}

/// Convenience for tests and handlers that key objects by their metadata.
pub fn apply_object<T: ResourceExt>(store: &Store<T>, obj: T) -> (Option<Arc<T>>, Arc<T>) {
    store.apply(id_of(&obj), obj)
}
