use crate::status::resource_status;
use ahash::AHashMap as HashMap;
use ingress_controller_core::{Kind, KindedKey, Problem, Reason, CONTROLLER_NAME};
use ingress_controller_k8s_api::{
    self as k8s,
    configuration::{Policy, ResourceStatus, TransportServer, VirtualServer, VirtualServerRoute},
    NamespaceResourceScope,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt, time::Duration};
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        watch,
    },
    time,
};

/// Writes status patches while this instance holds the lease.
pub struct Controller {
    client: k8s::Client,
    leader: watch::Receiver<bool>,
    updates: UnboundedReceiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
}

/// Turns problems into events and status updates.
///
/// The last status sent for each resource is remembered so that unchanged statuses are not
/// written again.
pub struct Index {
    leader: watch::Receiver<bool>,
    updates: UnboundedSender<Update>,
    statuses: HashMap<KindedKey, ResourceStatus>,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub key: KindedKey,
    pub patch: k8s::Patch<serde_json::Value>,
}

/// Kinds whose status is written by this controller.
fn has_status(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::VirtualServer | Kind::VirtualServerRoute | Kind::TransportServer | Kind::Policy
    )
}

pub(crate) fn make_patch(
    key: &KindedKey,
    status: &ResourceStatus,
) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": key.kind.api_version(),
        "kind": key.kind.as_str(),
        "status": status,
    });
    k8s::Patch::Merge(value)
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            patch_timeout.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
        }
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: k8s::Client,
        leader: watch::Receiver<bool>,
        updates: UnboundedReceiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            leader,
            updates,
            patch_timeout,
            metrics,
        }
    }

    pub async fn process_updates(mut self) {
        let params = k8s::PatchParams::apply(CONTROLLER_NAME);
        while let Some(Update { key, patch }) = self.updates.recv().await {
            // Updates are produced by the leader, but leadership may have been lost since.
            let leading = *self.leader.borrow();
            if !leading {
                tracing::debug!(%key, "Not the leader; dropping status update");
                continue;
            }

            match key.kind {
                Kind::VirtualServer => self.patch::<VirtualServer>(&key, &params, &patch).await,
                Kind::VirtualServerRoute => {
                    self.patch::<VirtualServerRoute>(&key, &params, &patch).await
                }
                Kind::TransportServer => {
                    self.patch::<TransportServer>(&key, &params, &patch).await
                }
                Kind::Policy => self.patch::<Policy>(&key, &params, &patch).await,
                kind => tracing::warn!(%kind, %key, "Status is not supported"),
            }
        }
        tracing::debug!("Status updates closed");
    }

    async fn patch<K>(
        &self,
        key: &KindedKey,
        params: &k8s::PatchParams,
        patch: &k8s::Patch<serde_json::Value>,
    ) where
        K: k8s::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
        K: Clone + DeserializeOwned + fmt::Debug,
    {
        let api = k8s::Api::<K>::namespaced(self.client.clone(), key.namespace());
        match time::timeout(self.patch_timeout, api.patch_status(key.name(), params, patch)).await
        {
            Ok(Ok(_)) => {
                tracing::debug!(%key, "Patched status");
                self.metrics.patch_succeeded.inc();
            }
            Ok(Err(error)) => {
                tracing::error!(
                    namespace = %key.namespace(),
                    name = %key.name(),
                    kind = %key.kind,
                    %error,
                    "Failed to patch status",
                );
                self.metrics.patch_failed.inc();
            }
            Err(_) => {
                tracing::error!(
                    namespace = %key.namespace(),
                    name = %key.name(),
                    kind = %key.kind,
                    timeout = ?self.patch_timeout,
                    "Timed out patching status",
                );
                self.metrics.patch_timeout.inc();
            }
        }
    }
}

// === impl Index ===

impl Index {
    pub fn new(leader: watch::Receiver<bool>, updates: UnboundedSender<Update>) -> Self {
        Self {
            leader,
            updates,
            statuses: HashMap::default(),
        }
    }

    /// Logs each problem as an event and sends a status update for every resource whose status
    /// changed.
    pub fn report<'p>(&mut self, problems: impl IntoIterator<Item = &'p Problem>) {
        let mut by_object = BTreeMap::<&KindedKey, Vec<&Problem>>::new();
        for problem in problems {
            event(problem);
            by_object.entry(&problem.object).or_default().push(problem);
        }

        // Followers forget what was written so that everything is written again once they lead.
        let leading = *self.leader.borrow();
        if !leading {
            self.statuses.clear();
            return;
        }

        for (key, problems) in by_object {
            if !has_status(key.kind) {
                continue;
            }
            let Some(status) = resource_status(problems) else {
                continue;
            };
            if self.statuses.get(key) == Some(&status) {
                tracing::trace!(%key, "Status unchanged");
                continue;
            }

            let patch = make_patch(key, &status);
            if let Err(error) = self.updates.send(Update {
                key: key.clone(),
                patch,
            }) {
                tracing::error!(%key, %error, "Failed to send status update");
                continue;
            }
            self.statuses.insert(key.clone(), status);
        }
    }

    /// Forgets the status of a deleted resource.
    pub fn remove(&mut self, key: &KindedKey) {
        self.statuses.remove(key);
    }
}

fn event(problem: &Problem) {
    let Problem {
        object,
        reason,
        message,
    } = problem;
    let (kind, namespace, name) = (object.kind, object.namespace(), object.name());
    match reason {
        Reason::AddedOrUpdated | Reason::Updated => {
            tracing::info!(%kind, %namespace, %name, %reason, "{message}")
        }
        _ => tracing::warn!(%kind, %namespace, %name, %reason, "{message}"),
    }
}
