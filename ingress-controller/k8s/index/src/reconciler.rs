//! The reconciliation pass.
//!
//! Each pass recomputes the full configuration plan from the caches and diffs it against the
//! plan applied by the previous pass, so that exactly one change is produced for each resource
//! whose derived configuration changed. App Protect resources are the exception: they are
//! tracked incrementally by their configurations, and the changes those report are passed
//! through as they are.

use crate::{
    app_protect::{AppProtectConfiguration, Validated},
    app_protect_dos::{AppProtectDosConfiguration, DosResource},
    changes::Snapshot,
    config::ControllerConfig,
    conflict::{self, Candidate, Claim, Role},
    queue::Queue,
    resolver::{
        find_policies_for_secret, waf_policies_for_app_protect_log_conf,
        waf_policies_for_app_protect_policy, Resolution, ResolvedIngress, ResolvedMergeable,
        ResolvedTransportServer, ResolvedVirtualServer, Resolver,
    },
    secrets::SecretStore,
    store::{id_of, Stores},
    validation::{
        validate_global_configuration, validate_ingress, validate_policy,
        validate_transport_server, validate_virtual_server, validate_virtual_server_route,
        ValidationError,
    },
};
use ingress_controller_core::{Change, Kind, KindedKey, Problem, Reason, ResourceId, Task};
use ingress_controller_k8s_api::{
    configuration::{GlobalConfiguration, TransportServer, VirtualServer},
    ConfigMap, DynamicObject, Ingress, ResourceExt, INGRESS_CLASS_ANNOTATION,
    MERGEABLE_INGRESS_TYPE_ANNOTATION,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::{mpsc, watch};

/// Configuration derived from a top-level resource, handed to the configuration renderer.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolved {
    Ingress(ResolvedIngress),
    Mergeable(ResolvedMergeable),
    VirtualServer(ResolvedVirtualServer),
    TransportServer(ResolvedTransportServer),
    GlobalConfiguration(Snapshot<GlobalConfiguration>),
    ConfigMap(Snapshot<ConfigMap>),
    IngressLink(Snapshot<DynamicObject>),
    AppProtect(Validated<DynamicObject>),
    AppProtectDos(DosResource),
}

/// The output of processing one task.
#[derive(Debug, Default)]
pub struct Pass {
    pub changes: Vec<Change<Resolved>>,
    pub problems: Vec<Problem>,

    /// Objects that reported problems in the previous pass and report none now, usually because
    /// they were deleted.
    pub cleared: Vec<KindedKey>,
}

pub struct Reconciler {
    config: Arc<ControllerConfig>,
    stores: Stores,
    secrets: Box<dyn SecretStore>,
    app_protect: Box<dyn AppProtectConfiguration>,
    app_protect_dos: Box<dyn AppProtectDosConfiguration>,

    /// The plan produced by the last pass.
    applied: BTreeMap<KindedKey, Resolved>,

    /// The problems of each object as of the last pass.
    reported: BTreeMap<KindedKey, Vec<Problem>>,

    /// Set by the first resync. Until then the caches may be incomplete, so no plan is computed.
    synced: bool,
}

#[derive(Default)]
struct Plan {
    resources: BTreeMap<KindedKey, Resolved>,
    problems: Vec<Problem>,
}

/// The class of an Ingress. The annotation takes precedence over `spec.ingressClassName`.
pub fn ingress_class(ingress: &Ingress) -> Option<&str> {
    ingress
        .annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .map(String::as_str)
        .or_else(|| ingress.spec.as_ref()?.ingress_class_name.as_deref())
}

fn ingress_role(ingress: &Ingress) -> Role {
    match ingress
        .annotations()
        .get(MERGEABLE_INGRESS_TYPE_ANNOTATION)
        .map(String::as_str)
    {
        Some("master") => Role::Master,
        Some("minion") => Role::Minion,
        _ => Role::Standalone,
    }
}

fn rejected(key: &KindedKey, error: &ValidationError) -> Problem {
    Problem::new(
        key.clone(),
        Reason::Rejected,
        format!(
            "{} {} was rejected with error: {}",
            key.kind,
            key.id,
            error.detail()
        ),
    )
}

fn added_or_updated(key: &KindedKey) -> Problem {
    Problem::new(
        key.clone(),
        Reason::AddedOrUpdated,
        format!("Configuration for {} {} was added or updated", key.kind, key.id),
    )
}

fn candidate<T: ResourceExt>(
    kind: Kind,
    id: ResourceId,
    obj: &T,
    class: Option<&str>,
) -> Candidate {
    let meta = obj.meta();
    Candidate {
        generation: meta.generation,
        created: meta.creation_timestamp.clone(),
        class: class.map(Into::into),
        ..Candidate::new(KindedKey::new(kind, id))
    }
}

// === impl Resolved ===

impl Resolved {
    /// The key of the resource this configuration is derived from.
    pub fn key(&self) -> KindedKey {
        match self {
            Self::Ingress(ing) => KindedKey::new(Kind::Ingress, id_of(&*ing.ingress.object)),
            Self::Mergeable(m) => KindedKey::new(Kind::Ingress, id_of(&*m.master.ingress.object)),
            Self::VirtualServer(vs) => {
                KindedKey::new(Kind::VirtualServer, id_of(&*vs.virtual_server.object))
            }
            Self::TransportServer(ts) => {
                KindedKey::new(Kind::TransportServer, id_of(&*ts.transport_server.object))
            }
            Self::GlobalConfiguration(gc) => {
                KindedKey::new(Kind::GlobalConfiguration, id_of(&*gc.object))
            }
            Self::ConfigMap(cm) => KindedKey::new(Kind::ConfigMap, id_of(&*cm.object)),
            Self::IngressLink(link) => KindedKey::new(Kind::IngressLink, id_of(&*link.object)),
            Self::AppProtect(v) => KindedKey::new(v.kind, id_of(&*v.object)),
            Self::AppProtectDos(DosResource::Unstructured(v)) => {
                KindedKey::new(v.kind, id_of(&*v.object))
            }
            Self::AppProtectDos(DosResource::Protected(v)) => {
                KindedKey::new(v.kind, id_of(&*v.object))
            }
        }
    }

    /// Indicates whether this configuration was derived using the resource identified by `key`.
    pub fn references(&self, key: &KindedKey) -> bool {
        match self {
            Self::Ingress(ing) => ing.dependencies.references(key),
            Self::Mergeable(m) => {
                m.master.dependencies.references(key)
                    || m.minions.iter().any(|minion| {
                        minion.dependencies.references(key)
                            || (key.kind == Kind::Ingress
                                && id_of(&*minion.ingress.object) == key.id)
                    })
            }
            Self::VirtualServer(vs) => {
                vs.dependencies.references(key)
                    || (key.kind == Kind::VirtualServerRoute
                        && vs.routes.iter().any(|r| id_of(&*r.object) == key.id))
            }
            Self::TransportServer(ts) => ts.dependencies.references(key),
            _ => false,
        }
    }
}

// === impl Pass ===

impl Pass {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.problems.is_empty() && self.cleared.is_empty()
    }
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        config: Arc<ControllerConfig>,
        stores: Stores,
        secrets: Box<dyn SecretStore>,
        app_protect: Box<dyn AppProtectConfiguration>,
        app_protect_dos: Box<dyn AppProtectDosConfiguration>,
    ) -> Self {
        Self {
            config,
            stores,
            secrets,
            app_protect,
            app_protect_dos,
            applied: BTreeMap::new(),
            reported: BTreeMap::new(),
            synced: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// The plan applied by the last pass.
    pub fn applied(&self) -> impl Iterator<Item = &Resolved> {
        self.applied.values()
    }

    /// Drains the queue while `leader` is set, sending the outcome of every pass that produced
    /// changes or problems.
    ///
    /// Leadership is only checked between tasks: a task that has been taken is fully processed.
    pub async fn run(
        mut self,
        queue: Queue,
        mut leader: watch::Receiver<bool>,
        passes: mpsc::Sender<Pass>,
    ) {
        loop {
            let closed = leader.wait_for(|leading| *leading).await.is_err();
            if closed {
                tracing::debug!("Leadership channel closed");
                return;
            }

            let task = tokio::select! {
                task = queue.next() => task,
                res = leader.changed() => {
                    if res.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let Some(task) = task else {
                tracing::debug!("Queue shut down");
                return;
            };

            let pass = self.process(&task);
            queue.done(&task);
            tracing::debug!(
                ?task,
                changes = pass.changes.len(),
                problems = pass.problems.len(),
                "Processed"
            );
            if !pass.is_empty() && passes.send(pass).await.is_err() {
                tracing::debug!("Pass receiver dropped");
                return;
            }
        }
    }

    /// Processes one task. Never fails: problems with individual resources are reported in the
    /// returned pass.
    pub fn process(&mut self, task: &Task) -> Pass {
        let mut pass = Pass::default();
        let key = match task {
            Task::Resync => {
                if !self.synced {
                    tracing::info!("Caches synced");
                }
                self.synced = true;
                self.secrets.pre_sync();
                None
            }
            Task::Resource(key) => {
                self.observe(key, &mut pass);
                Some(key)
            }
        };

        if !self.synced {
            tracing::debug!(?task, "Waiting for caches to sync");
            return pass;
        }

        let Plan {
            resources,
            problems,
        } = self.plan();
        self.apply(resources, &mut pass.changes);
        self.report(key, problems, &mut pass);
        pass
    }

    /// Updates the incrementally tracked state for a changed resource.
    fn observe(&mut self, key: &KindedKey, pass: &mut Pass) {
        let id = &key.id;
        match key.kind {
            Kind::Secret => match self.stores.secrets.get(id) {
                Some(secret) => self.secrets.add_or_update_secret(secret),
                None => self.secrets.delete_secret(id),
            },

            Kind::ApPolicy | Kind::ApLogConf | Kind::ApUserSig => {
                let Some(store) = self.stores.unstructured(key.kind) else {
                    return;
                };
                let ap = &mut self.app_protect;
                let (changes, problems) = match (store.get(id), key.kind) {
                    (Some(obj), Kind::ApPolicy) => ap.add_or_update_policy(obj),
                    (Some(obj), Kind::ApLogConf) => ap.add_or_update_log_conf(obj),
                    (Some(obj), _) => ap.add_or_update_user_sig(obj),
                    (None, Kind::ApPolicy) => ap.delete_policy(id),
                    (None, Kind::ApLogConf) => ap.delete_log_conf(id),
                    (None, _) => ap.delete_user_sig(id),
                };
                pass.changes
                    .extend(changes.into_iter().map(|c| c.map(Resolved::AppProtect)));
                pass.problems.extend(problems);
            }

            Kind::ApDosPolicy | Kind::ApDosLogConf => {
                let Some(store) = self.stores.unstructured(key.kind) else {
                    return;
                };
                let dos = &mut self.app_protect_dos;
                let (changes, problems) = match (store.get(id), key.kind) {
                    (Some(obj), Kind::ApDosPolicy) => dos.add_or_update_policy(obj),
                    (Some(obj), _) => dos.add_or_update_log_conf(obj),
                    (None, Kind::ApDosPolicy) => dos.delete_policy(id),
                    (None, _) => dos.delete_log_conf(id),
                };
                pass.changes
                    .extend(changes.into_iter().map(|c| c.map(Resolved::AppProtectDos)));
                pass.problems.extend(problems);
            }

            Kind::DosProtectedResource => {
                let dos = &mut self.app_protect_dos;
                let (changes, problems) = match self.stores.dos_protected_resources.get(id) {
                    Some(obj) => dos.add_or_update_protected_resource(obj),
                    None => dos.delete_protected_resource(id),
                };
                pass.changes
                    .extend(changes.into_iter().map(|c| c.map(Resolved::AppProtectDos)));
                pass.problems.extend(problems);
            }

            _ => {}
        }
    }

    /// Computes the configuration of every resource from the caches.
    fn plan(&mut self) -> Plan {
        let config: &ControllerConfig = &self.config;
        let stores = &self.stores;
        let mut plan = Plan::default();
        let mut candidates = Vec::new();

        let mut ingresses = BTreeMap::<ResourceId, Arc<Ingress>>::new();
        for (id, ingress) in stores.ingresses.list() {
            let class = ingress_class(&ingress);
            if !config.accepts_class(class) {
                continue;
            }
            let key = KindedKey::new(Kind::Ingress, id.clone());
            if let Err(error) = validate_ingress(&ingress) {
                plan.problems.push(rejected(&key, &error));
                continue;
            }

            let role = ingress_role(&ingress);
            let rules = ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.rules.as_deref())
                .unwrap_or_default();
            let mut c = candidate(Kind::Ingress, id.clone(), &*ingress, class);
            c.role = role;
            c.claims = rules
                .iter()
                .filter_map(|rule| rule.host.clone())
                .map(Claim::Host)
                .collect();
            if role == Role::Minion {
                c.paths = rules
                    .iter()
                    .filter_map(|rule| rule.http.as_ref())
                    .flat_map(|http| http.paths.iter())
                    .map(|path| path.path.clone().unwrap_or_else(|| "/".to_string()))
                    .collect();
            }
            candidates.push(c);
            ingresses.insert(id, ingress);
        }

        let mut virtual_servers = BTreeMap::<ResourceId, Arc<VirtualServer>>::new();
        let mut transport_servers = BTreeMap::<ResourceId, Arc<TransportServer>>::new();
        if config.enable_custom_resources {
            for (id, vs) in stores.virtual_servers.list() {
                let class = vs.spec.ingress_class_name.as_deref();
                if !config.accepts_class(class) {
                    continue;
                }
                let key = KindedKey::new(Kind::VirtualServer, id.clone());
                if let Err(error) = validate_virtual_server(&vs) {
                    plan.problems.push(rejected(&key, &error));
                    continue;
                }
                let mut c = candidate(Kind::VirtualServer, id.clone(), &*vs, class);
                c.claims = vec![Claim::Host(vs.spec.host.clone())];
                candidates.push(c);
                virtual_servers.insert(id, vs);
            }

            for (id, ts) in stores.transport_servers.list() {
                let class = ts.spec.ingress_class_name.as_deref();
                if !config.accepts_class(class) {
                    continue;
                }
                let key = KindedKey::new(Kind::TransportServer, id.clone());
                if let Err(error) = validate_transport_server(&ts) {
                    plan.problems.push(rejected(&key, &error));
                    continue;
                }
                let mut c = candidate(Kind::TransportServer, id.clone(), &*ts, class);
                c.claims = match ts.spec.host.as_ref() {
                    Some(host) if ts.spec.is_tls_passthrough() => vec![Claim::Host(host.clone())],
                    _ => vec![Claim::Listener(ts.spec.listener.name.clone())],
                };
                candidates.push(c);
                transport_servers.insert(id, ts);
            }
        }

        let conflicts = conflict::resolve(config, candidates);
        plan.problems.extend(conflicts.problems);

        let mut resolver = Resolver::new(
            config,
            stores,
            &mut *self.secrets,
            &*self.app_protect,
            &*self.app_protect_dos,
        );
        let mut linked_routes = BTreeSet::new();
        let mut positive = Vec::new();
        for winner in conflicts.winners {
            let key = winner.key;
            let Resolution { resolved, problems } = match key.kind {
                Kind::Ingress => {
                    let Some(ingress) = ingresses.get(&key.id).cloned() else {
                        continue;
                    };
                    if winner.role == Role::Master {
                        let minions = conflicts
                            .minions
                            .get(&key)
                            .into_iter()
                            .flatten()
                            .filter_map(|m| ingresses.get(&m.key.id).cloned())
                            .collect::<Vec<_>>();
                        let resolution = resolver.resolve_mergeable(ingress, minions);
                        if let Some(mergeable) = resolution.resolved.as_ref() {
                            positive.extend(mergeable.minions.iter().map(|m| {
                                KindedKey::new(Kind::Ingress, id_of(&*m.ingress.object))
                            }));
                        }
                        Resolution {
                            resolved: resolution.resolved.map(Resolved::Mergeable),
                            problems: resolution.problems,
                        }
                    } else {
                        let resolution = resolver.resolve_ingress(ingress);
                        Resolution {
                            resolved: resolution.resolved.map(Resolved::Ingress),
                            problems: resolution.problems,
                        }
                    }
                }

                Kind::VirtualServer => {
                    let Some(vs) = virtual_servers.get(&key.id).cloned() else {
                        continue;
                    };
                    let resolution = resolver.resolve_virtual_server(vs);
                    if let Some(resolved) = resolution.resolved.as_ref() {
                        linked_routes.extend(resolved.routes.iter().map(|r| id_of(&*r.object)));
                    }
                    Resolution {
                        resolved: resolution.resolved.map(Resolved::VirtualServer),
                        problems: resolution.problems,
                    }
                }

                Kind::TransportServer => {
                    let Some(ts) = transport_servers.get(&key.id).cloned() else {
                        continue;
                    };
                    let resolution = resolver.resolve_transport_server(ts);
                    Resolution {
                        resolved: resolution.resolved.map(Resolved::TransportServer),
                        problems: resolution.problems,
                    }
                }

                kind => {
                    tracing::warn!(%kind, %key, "Unexpected candidate");
                    continue;
                }
            };
            plan.problems.extend(problems);
            if let Some(resolved) = resolved {
                positive.push(key.clone());
                plan.resources.insert(key, resolved);
            }
        }

        if config.enable_custom_resources {
            for (id, vsr) in stores.virtual_server_routes.list() {
                if !config.accepts_class(vsr.spec.ingress_class_name.as_deref()) {
                    continue;
                }
                let key = KindedKey::new(Kind::VirtualServerRoute, id.clone());
                if let Err(error) = validate_virtual_server_route(&vsr) {
                    plan.problems.push(rejected(&key, &error));
                } else if linked_routes.contains(&id) {
                    positive.push(key);
                } else if !plan
                    .problems
                    .iter()
                    .any(|p| p.object == key && p.reason == Reason::Ignored)
                {
                    plan.problems.push(Problem::new(
                        key,
                        Reason::NoVirtualServersFound,
                        "VirtualServer is invalid or doesn't exist",
                    ));
                }
            }

            for (id, policy) in stores.policies.list() {
                if !config.accepts_class(policy.spec.ingress_class_name.as_deref()) {
                    continue;
                }
                let key = KindedKey::new(Kind::Policy, id);
                match validate_policy(&policy) {
                    Ok(()) => positive.push(key),
                    Err(error) => plan.problems.push(rejected(&key, &error)),
                }
            }

            if let Some(gc) = resolver.global_configuration() {
                let key = KindedKey::new(Kind::GlobalConfiguration, id_of(&*gc));
                positive.push(key.clone());
                plan.resources
                    .insert(key, Resolved::GlobalConfiguration(Snapshot::new(gc)));
            } else if let Some(id) = config.global_configuration.as_ref() {
                if let Some(gc) = stores.global_configurations.get(id) {
                    if let Err(error) = validate_global_configuration(&gc) {
                        let key = KindedKey::new(Kind::GlobalConfiguration, id.clone());
                        plan.problems.push(rejected(&key, &error));
                    }
                }
            }
        }

        if let Some(id) = config.config_map.as_ref() {
            if let Some(cm) = stores.config_maps.get(id) {
                let key = KindedKey::new(Kind::ConfigMap, id.clone());
                positive.push(key.clone());
                plan.resources
                    .insert(key, Resolved::ConfigMap(Snapshot::new(cm)));
            }
        }

        if let Some(name) = config.ingress_link.as_ref() {
            let id = ResourceId::new(&config.controller_namespace, name);
            if let Some(link) = stores.ingress_links.get(&id) {
                plan.resources.insert(
                    KindedKey::new(Kind::IngressLink, id),
                    Resolved::IngressLink(Snapshot::new(link)),
                );
            }
        }

        // Resources with nothing to report are reported as applied.
        for key in positive {
            if !plan.problems.iter().any(|p| p.object == key) {
                plan.problems.push(added_or_updated(&key));
            }
        }
        plan
    }

    /// Replaces the applied plan, emitting a change for every resource whose configuration
    /// differs from the previous plan.
    fn apply(&mut self, plan: BTreeMap<KindedKey, Resolved>, changes: &mut Vec<Change<Resolved>>) {
        let prior = std::mem::replace(&mut self.applied, plan);
        for (key, resolved) in prior.iter() {
            if !self.applied.contains_key(key) {
                tracing::debug!(%key, "Removing configuration");
                changes.push(Change::delete(resolved.clone()));
            }
        }
        for (key, resolved) in self.applied.iter() {
            if prior.get(key) != Some(resolved) {
                tracing::debug!(%key, "Updating configuration");
                changes.push(Change::add_or_update(resolved.clone()));
            }
        }
    }

    /// Emits the problems of objects whose problems changed, of the object the task is about,
    /// and of the objects whose configuration depends on it. A resync emits everything.
    fn report(&mut self, task: Option<&KindedKey>, problems: Vec<Problem>, pass: &mut Pass) {
        let mut current = BTreeMap::<KindedKey, Vec<Problem>>::new();
        for problem in problems {
            let entry = current.entry(problem.object.clone()).or_default();
            if !entry.contains(&problem) {
                entry.push(problem);
            }
        }

        let affected = task.map(|key| self.affected_by(key)).unwrap_or_default();
        for (object, problems) in current.iter() {
            let emit = task.is_none()
                || affected.contains(object)
                || self.reported.get(object) != Some(problems);
            if emit {
                pass.problems.extend(problems.iter().cloned());
            }
        }
        pass.cleared.extend(
            self.reported
                .keys()
                .filter(|object| !current.contains_key(*object))
                .cloned(),
        );
        self.reported = current;
    }

    /// Finds the objects that depend on `key`, including `key` itself.
    fn affected_by(&self, key: &KindedKey) -> BTreeSet<KindedKey> {
        let mut dependencies = vec![key.clone()];
        let policies = match key.kind {
            Kind::Secret | Kind::ApPolicy | Kind::ApLogConf => self.stores.policies.list(),
            _ => Vec::new(),
        };
        let referencing = match key.kind {
            Kind::Secret => find_policies_for_secret(&policies, &key.id),
            Kind::ApPolicy => waf_policies_for_app_protect_policy(&policies, &key.id),
            Kind::ApLogConf => waf_policies_for_app_protect_log_conf(&policies, &key.id),
            _ => Vec::new(),
        };
        dependencies.extend(
            referencing
                .into_iter()
                .map(|id| KindedKey::new(Kind::Policy, id)),
        );

        let mut affected = dependencies.iter().cloned().collect::<BTreeSet<_>>();
        for (owner, resolved) in self.applied.iter() {
            if dependencies.iter().any(|dep| resolved.references(dep)) {
                affected.insert(owner.clone());
            }
        }
        affected
    }
}
