//! Resolves the references of top-level resources against the caches.
//!
//! Resolution never fails as a whole. Each reference that cannot be used is reported as a
//! [`ResolveError`] against the referencing resource, and the rest of the resource is still
//! resolved so that it can be partially applied.

use crate::{
    app_protect::{AppProtectConfiguration, AppResourceError},
    app_protect_dos::AppProtectDosConfiguration,
    changes::Snapshot,
    config::ControllerConfig,
    secrets::{
        SecretError, SecretReference, SecretStore, SECRET_TYPE_CA, SECRET_TYPE_JWK,
        SECRET_TYPE_OIDC, SECRET_TYPE_TLS,
    },
    store::{id_of, StoreError, Stores},
    upstreams::{BackendPort, ResolvedEndpoints, UpstreamError, Upstreams},
    validation::{
        validate_global_configuration, validate_policy, validate_virtual_server_route,
        ValidationError,
    },
};
use ingress_controller_core::{reference, Kind, KindedKey, Problem, Reason, ResourceId};
use ingress_controller_k8s_api::{
    configuration::{
        transport_server::TLS_PASSTHROUGH_LISTENER, DosProtectedResource, GlobalConfiguration,
        Listener, Policy, PolicyReference, TransportServer, Upstream, VirtualServer,
        VirtualServerRoute, Waf,
    },
    DynamicObject, Ingress, IngressBackend, ResourceExt, APP_PROTECT_DOS_RESOURCE_ANNOTATION,
    APP_PROTECT_POLICY_ANNOTATION, APP_PROTECT_SECURITY_LOG_ANNOTATION,
    APP_PROTECT_SECURITY_LOG_ENABLE_ANNOTATION,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{source}")]
    InvalidPolicy {
        id: ResourceId,
        source: ValidationError,
    },

    #[error("Policy {0} doesn't exist")]
    PolicyNotFound(ResourceId),

    #[error("Failed to get policy {key}: {source}")]
    PolicyLookup { key: String, source: StoreError },

    #[error("{owner} references Secret {id} which does not exist")]
    MissingSecret { owner: String, id: ResourceId },

    #[error("{owner} references Secret {id} of a wrong type '{actual}', must be '{expected}'")]
    SecretType {
        owner: String,
        id: ResourceId,
        actual: String,
        expected: &'static str,
    },

    #[error("{owner} references an invalid Secret {id}: {source}")]
    InvalidSecret {
        owner: String,
        id: ResourceId,
        source: SecretError,
    },

    #[error("{owner} requires App Protect, which is not enabled")]
    AppProtectDisabled { owner: String },

    #[error("{owner} references an unusable App Protect resource: {source}")]
    AppResource {
        owner: String,
        source: AppResourceError,
    },

    #[error("{owner} enables a security log without an apLogConf")]
    MissingLogConf { owner: String },

    #[error("VirtualServerRoute {0} doesn't exist or is invalid")]
    RouteNotFound(ResourceId),

    #[error("VirtualServerRoute {id} is ignored: host {host:?} does not match {expected:?}")]
    RouteHost {
        id: ResourceId,
        host: String,
        expected: String,
    },

    #[error(
        "VirtualServerRoute {id} is ignored: subroute path {path:?} must start with {prefix:?}"
    )]
    RoutePath {
        id: ResourceId,
        path: String,
        prefix: String,
    },

    #[error("Upstream {upstream}: {source}")]
    Upstream {
        upstream: String,
        source: UpstreamError,
    },

    #[error("Listener {0} doesn't exist")]
    ListenerNotFound(String),

    #[error("{owner} references a DosProtectedResource that cannot be used: {source}")]
    Dos {
        owner: String,
        source: AppResourceError,
    },
}

/// Everything a resource depends on, as it was observed when the resource was resolved.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dependencies {
    pub secrets: BTreeMap<ResourceId, SecretReference>,
    pub policies: BTreeMap<ResourceId, Snapshot<Policy>>,

    /// Policies that are referenced but cannot be applied. Traffic they would apply to must be
    /// denied rather than passed unprotected.
    pub invalid_policies: BTreeSet<ResourceId>,

    pub app_protect: BTreeMap<KindedKey, Snapshot<DynamicObject>>,
    pub dos: BTreeMap<ResourceId, Snapshot<DosProtectedResource>>,

    /// Endpoints keyed by `<namespace>/<service>:<port>`.
    pub endpoints: BTreeMap<String, ResolvedEndpoints>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedVirtualServer {
    pub virtual_server: Snapshot<VirtualServer>,
    pub routes: Vec<Snapshot<VirtualServerRoute>>,
    pub dependencies: Dependencies,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTransportServer {
    pub transport_server: Snapshot<TransportServer>,
    /// Unset for TLS passthrough servers, which use the built-in listener.
    pub listener: Option<Listener>,
    pub dependencies: Dependencies,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedIngress {
    pub ingress: Snapshot<Ingress>,
    pub dependencies: Dependencies,
}

/// A master Ingress and the minions that contribute paths to its host.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedMergeable {
    pub master: ResolvedIngress,
    pub minions: Vec<ResolvedIngress>,
}

/// A resolved resource together with everything reported while resolving it.
#[derive(Debug)]
pub struct Resolution<T> {
    pub resolved: Option<T>,
    pub problems: Vec<Problem>,
}

/// Walks references through the caches.
pub struct Resolver<'a> {
    config: &'a ControllerConfig,
    stores: &'a Stores,
    secrets: &'a mut dyn SecretStore,
    app_protect: &'a dyn AppProtectConfiguration,
    app_protect_dos: &'a dyn AppProtectDosConfiguration,
}

// === impl ResolveError ===

impl ResolveError {
    /// The reason reported against the referencing resource.
    pub fn reason(&self) -> Reason {
        match self {
            Self::MissingSecret { .. } => Reason::MissingSecret,
            Self::ListenerNotFound(_) => Reason::Rejected,
            Self::RouteNotFound(_)
            | Self::RouteHost { .. }
            | Self::RoutePath { .. }
            | Self::Upstream { .. }
            | Self::Dos { .. } => Reason::AddedOrUpdatedWithWarning,
            _ => Reason::AddedOrUpdatedWithError,
        }
    }

    fn into_problem(self, object: &KindedKey) -> Problem {
        Problem::new(object.clone(), self.reason(), self.to_string())
    }
}

// === impl Dependencies ===

impl Dependencies {
    /// Indicates whether the resource identified by `key` was used to resolve these
    /// dependencies.
    pub fn references(&self, key: &KindedKey) -> bool {
        match key.kind {
            Kind::Secret => self.secrets.contains_key(&key.id),
            Kind::Policy => {
                self.policies.contains_key(&key.id) || self.invalid_policies.contains(&key.id)
            }
            Kind::ApPolicy | Kind::ApLogConf | Kind::ApUserSig | Kind::ApDosPolicy
            | Kind::ApDosLogConf => self.app_protect.contains_key(key),
            Kind::DosProtectedResource => self.dos.contains_key(&key.id),
            Kind::Service | Kind::Endpoints => {
                let prefix = format!("{}:", key.id);
                self.endpoints.keys().any(|k| k.starts_with(&prefix))
            }
            _ => false,
        }
    }
}

// === impl Resolution ===

impl<T> Resolution<T> {
    fn new(resolved: Option<T>, problems: Vec<Problem>) -> Self {
        Self { resolved, problems }
    }
}

// === impl Resolver ===

impl<'a> Resolver<'a> {
    pub fn new(
        config: &'a ControllerConfig,
        stores: &'a Stores,
        secrets: &'a mut dyn SecretStore,
        app_protect: &'a dyn AppProtectConfiguration,
        app_protect_dos: &'a dyn AppProtectDosConfiguration,
    ) -> Self {
        Self {
            config,
            stores,
            secrets,
            app_protect,
            app_protect_dos,
        }
    }

    /// Looks up the policies referenced from a resource in `namespace`.
    ///
    /// Returns the valid policies, keeping only the first reference to each, and an error for
    /// every reference that cannot be used.
    pub fn get_policies(
        &self,
        references: &[PolicyReference],
        namespace: &str,
    ) -> (Vec<(ResourceId, Arc<Policy>)>, Vec<ResolveError>) {
        let mut policies = Vec::new();
        let mut errors = Vec::new();

        for r in references {
            let ns = r.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(namespace);
            let key = format!("{}/{}", ns, r.name);
            match self.stores.policies.get_by_key(&key) {
                Err(source) => errors.push(ResolveError::PolicyLookup { key, source }),
                Ok(None) => errors.push(ResolveError::PolicyNotFound(ResourceId::new(ns, &r.name))),
                Ok(Some(policy)) => {
                    let id = id_of(&*policy);
                    if !self
                        .config
                        .accepts_class(policy.spec.ingress_class_name.as_deref())
                    {
                        errors.push(ResolveError::PolicyNotFound(id));
                    } else if let Err(source) = validate_policy(&policy) {
                        errors.push(ResolveError::InvalidPolicy { id, source });
                    } else {
                        policies.push((id, policy));
                    }
                }
            }
        }

        (create_policy_map(policies).into_iter().collect(), errors)
    }

    /// Resolves the secrets and App Protect resources a policy references.
    ///
    /// Every rule is attempted, in a fixed order, and all errors are returned. The policy is
    /// recorded as usable in `deps` only if no errors occurred.
    pub fn resolve_policy(
        &mut self,
        id: &ResourceId,
        policy: &Arc<Policy>,
        deps: &mut Dependencies,
    ) -> Vec<ResolveError> {
        let spec = &policy.spec;
        let ns = id.namespace.as_str();
        let mut errors = Vec::new();

        // Access control and rate limit rules reference nothing.

        if let Some(secret) = spec.jwt.as_ref().and_then(|jwt| jwt.secret.as_deref()) {
            let owner = format!("JWT policy {id}");
            let secret = ResourceId::new(ns, secret);
            if let Err(e) = self.check_secret(&owner, secret, SECRET_TYPE_JWK, deps) {
                errors.push(e);
            }
        }

        if let Some(mtls) = spec.ingress_mtls.as_ref() {
            if !mtls.client_cert_secret.is_empty() {
                let owner = format!("IngressMTLS policy {id}");
                let secret = ResourceId::new(ns, &mtls.client_cert_secret);
                if let Err(e) = self.check_secret(&owner, secret, SECRET_TYPE_CA, deps) {
                    errors.push(e);
                }
            }
        }

        if let Some(mtls) = spec.egress_mtls.as_ref() {
            let owner = format!("EgressMTLS policy {id}");
            if let Some(secret) = mtls.tls_secret.as_deref() {
                let secret = ResourceId::new(ns, secret);
                if let Err(e) = self.check_secret(&owner, secret, SECRET_TYPE_TLS, deps) {
                    errors.push(e);
                }
            }
            if let Some(secret) = mtls.trusted_cert_secret.as_deref() {
                let secret = ResourceId::new(ns, secret);
                if let Err(e) = self.check_secret(&owner, secret, SECRET_TYPE_CA, deps) {
                    errors.push(e);
                }
            }
        }

        if let Some(oidc) = spec.oidc.as_ref() {
            if !oidc.client_secret.is_empty() {
                let owner = format!("OIDC policy {id}");
                let secret = ResourceId::new(ns, &oidc.client_secret);
                if let Err(e) = self.check_secret(&owner, secret, SECRET_TYPE_OIDC, deps) {
                    errors.push(e);
                }
            }
        }

        if let Some(waf) = spec.waf.as_ref() {
            let owner = format!("WAF policy {id}");
            if !self.config.enable_app_protect {
                errors.push(ResolveError::AppProtectDisabled { owner });
            } else {
                if let Some(ap_policy) = waf.ap_policy.as_deref() {
                    let ap_id = reference::qualify(ap_policy, ns);
                    if let Err(e) = self.check_app_resource(&owner, Kind::ApPolicy, ap_id, deps) {
                        errors.push(e);
                    }
                }

                if let Some(log) = waf.security_log.as_ref() {
                    match log.ap_log_conf.as_deref() {
                        Some(conf) => {
                            let conf_id = reference::qualify(conf, ns);
                            let res =
                                self.check_app_resource(&owner, Kind::ApLogConf, conf_id, deps);
                            if let Err(e) = res {
                                if log.enable {
                                    errors.push(e);
                                }
                            }
                        }
                        None if log.enable => errors.push(ResolveError::MissingLogConf { owner }),
                        None => {}
                    }
                }
            }
        }

        if errors.is_empty() {
            deps.policies
                .insert(id.clone(), Snapshot::new(policy.clone()));
        } else {
            deps.invalid_policies.insert(id.clone());
        }
        errors
    }

    /// Resolves policies referenced from `owner`, reporting errors against it.
    fn resolve_policies(
        &mut self,
        owner: &KindedKey,
        references: &[PolicyReference],
        namespace: &str,
        deps: &mut Dependencies,
        problems: &mut Vec<Problem>,
    ) {
        let (policies, errors) = self.get_policies(references, namespace);
        for error in errors {
            if let ResolveError::PolicyNotFound(id) | ResolveError::InvalidPolicy { id, .. } =
                &error
            {
                deps.invalid_policies.insert(id.clone());
            }
            problems.push(error.into_problem(owner));
        }
        for (id, policy) in policies {
            if deps.policies.contains_key(&id) || deps.invalid_policies.contains(&id) {
                continue;
            }
            for error in self.resolve_policy(&id, &policy, deps) {
                problems.push(error.into_problem(owner));
            }
        }
    }

    pub fn resolve_virtual_server(
        &mut self,
        vs: Arc<VirtualServer>,
    ) -> Resolution<ResolvedVirtualServer> {
        let id = id_of(&*vs);
        let owner = KindedKey::new(Kind::VirtualServer, id.clone());
        let ns = id.namespace.as_str();
        let spec = &vs.spec;
        let mut deps = Dependencies::default();
        let mut problems = Vec::new();

        if let Some(secret) = spec.tls.as_ref().and_then(|tls| tls.secret.as_deref()) {
            let owner_name = format!("VirtualServer {id}");
            let secret = ResourceId::new(ns, secret);
            if let Err(e) = self.check_secret(&owner_name, secret, SECRET_TYPE_TLS, &mut deps) {
                problems.push(e.into_problem(&owner));
            }
        }

        self.resolve_policies(&owner, &spec.policies, ns, &mut deps, &mut problems);
        for route in &spec.routes {
            self.resolve_policies(&owner, &route.policies, ns, &mut deps, &mut problems);
        }

        let mut routes = Vec::new();
        for route in &spec.routes {
            let Some(name) = route.route.as_deref() else {
                continue;
            };
            let vsr_id = reference::qualify(name, ns);
            let vsr_key = KindedKey::new(Kind::VirtualServerRoute, vsr_id.clone());
            let Some(vsr) = self.stores.virtual_server_routes.get(&vsr_id).filter(|vsr| {
                self.config
                    .accepts_class(vsr.spec.ingress_class_name.as_deref())
                    && validate_virtual_server_route(vsr).is_ok()
            }) else {
                problems.push(ResolveError::RouteNotFound(vsr_id).into_problem(&owner));
                continue;
            };

            let ignored = if vsr.spec.host != spec.host {
                Some(ResolveError::RouteHost {
                    id: vsr_id.clone(),
                    host: vsr.spec.host.clone(),
                    expected: spec.host.clone(),
                })
            } else {
                vsr.spec
                    .subroutes
                    .iter()
                    .find(|sub| !sub.path.starts_with(&route.path))
                    .map(|sub| ResolveError::RoutePath {
                        id: vsr_id.clone(),
                        path: sub.path.clone(),
                        prefix: route.path.clone(),
                    })
            };
            if let Some(error) = ignored {
                problems.push(Problem::new(
                    vsr_key,
                    Reason::Ignored,
                    format!("VirtualServer {id} ignores VirtualServerRoute"),
                ));
                problems.push(error.into_problem(&owner));
                continue;
            }

            let vsr_ns = vsr_id.namespace.clone();
            for sub in &vsr.spec.subroutes {
                self.resolve_policies(&owner, &sub.policies, &vsr_ns, &mut deps, &mut problems);
            }
            for upstream in &vsr.spec.upstreams {
                self.resolve_upstream(&owner, &vsr_ns, upstream, &mut deps, &mut problems);
            }
            for dos in vsr.spec.subroutes.iter().filter_map(|s| s.dos.as_deref()) {
                let dos = reference::qualify(dos, &vsr_ns);
                self.resolve_dos(&owner, dos, &mut deps, &mut problems);
            }
            routes.push(Snapshot::new(vsr));
        }

        for upstream in &spec.upstreams {
            self.resolve_upstream(&owner, ns, upstream, &mut deps, &mut problems);
        }

        let dos = spec
            .dos
            .iter()
            .chain(spec.routes.iter().filter_map(|r| r.dos.as_ref()));
        for dos in dos {
            self.resolve_dos(&owner, reference::qualify(dos, ns), &mut deps, &mut problems);
        }

        Resolution::new(
            Some(ResolvedVirtualServer {
                virtual_server: Snapshot::new(vs),
                routes,
                dependencies: deps,
            }),
            problems,
        )
    }

    /// Resolves a TransportServer. A server whose listener does not exist is not resolved.
    pub fn resolve_transport_server(
        &mut self,
        ts: Arc<TransportServer>,
    ) -> Resolution<ResolvedTransportServer> {
        let id = id_of(&*ts);
        let owner = KindedKey::new(Kind::TransportServer, id.clone());
        let ns = id.namespace.as_str();
        let spec = &ts.spec;
        let mut deps = Dependencies::default();
        let mut problems = Vec::new();

        let listener = if spec.is_tls_passthrough() {
            None
        } else {
            match self.listener(&spec.listener.name, &spec.listener.protocol) {
                Some(listener) => Some(listener),
                None => {
                    let error = ResolveError::ListenerNotFound(spec.listener.name.clone());
                    return Resolution::new(None, vec![error.into_problem(&owner)]);
                }
            }
        };

        self.resolve_policies(&owner, &spec.policies, ns, &mut deps, &mut problems);

        let upstreams = Upstreams::new(self.stores, self.config);
        for upstream in &spec.upstreams {
            let port = BackendPort::from(upstream.port);
            let key = endpoints_key(ns, &upstream.service, &port);
            match upstreams.endpoints(ns, &upstream.service, &port) {
                Ok(endpoints) => {
                    deps.endpoints.insert(key, endpoints);
                }
                Err(error) => {
                    tracing::debug!(%id, upstream = %upstream.name, %error, "No endpoints");
                    deps.endpoints.insert(key, ResolvedEndpoints::default());
                }
            }
        }

        Resolution::new(
            Some(ResolvedTransportServer {
                transport_server: Snapshot::new(ts),
                listener,
                dependencies: deps,
            }),
            problems,
        )
    }

    /// Resolves a standalone Ingress, or a master or minion of a mergeable host.
    pub fn resolve_ingress(&mut self, ingress: Arc<Ingress>) -> Resolution<ResolvedIngress> {
        let id = id_of(&*ingress);
        let owner = KindedKey::new(Kind::Ingress, id.clone());
        let ns = id.namespace.as_str();
        let mut deps = Dependencies::default();
        let mut problems = Vec::new();

        let spec = ingress.spec.as_ref();
        let secrets = spec
            .and_then(|s| s.tls.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|tls| tls.secret_name.as_deref());
        for secret in secrets {
            let owner_name = format!("Ingress {id}");
            let secret = ResourceId::new(ns, secret);
            if let Err(e) = self.check_secret(&owner_name, secret, SECRET_TYPE_TLS, &mut deps) {
                problems.push(e.into_problem(&owner));
            }
        }

        let backends = spec
            .and_then(|s| s.default_backend.as_ref())
            .into_iter()
            .chain(
                spec.and_then(|s| s.rules.as_ref())
                    .into_iter()
                    .flatten()
                    .filter_map(|rule| rule.http.as_ref())
                    .flat_map(|http| http.paths.iter().map(|path| &path.backend)),
            );
        let upstreams = Upstreams::new(self.stores, self.config);
        for backend in backends {
            let Some((service, port)) = backend_service(backend) else {
                continue;
            };
            let key = endpoints_key(ns, service, &port);
            if deps.endpoints.contains_key(&key) {
                continue;
            }
            match upstreams.endpoints(ns, service, &port) {
                Ok(endpoints) => {
                    deps.endpoints.insert(key, endpoints);
                }
                Err(error @ UpstreamError::ExternalNameUnsupported) => {
                    let error = ResolveError::Upstream {
                        upstream: service.to_string(),
                        source: error,
                    };
                    problems.push(error.into_problem(&owner));
                }
                Err(error) => {
                    tracing::debug!(%id, %service, %error, "No endpoints");
                    deps.endpoints.insert(key, ResolvedEndpoints::default());
                }
            }
        }

        let annotations = ingress.annotations();
        if self.config.enable_app_protect {
            let owner_name = format!("Ingress {id}");
            if let Some(policy) = annotations.get(APP_PROTECT_POLICY_ANNOTATION) {
                let policy = reference::qualify(policy, ns);
                let res = self.check_app_resource(&owner_name, Kind::ApPolicy, policy, &mut deps);
                if let Err(e) = res {
                    problems.push(Problem::new(
                        owner.clone(),
                        Reason::AddedOrUpdatedWithWarning,
                        e.to_string(),
                    ));
                }
            }

            let log_enabled = annotations
                .get(APP_PROTECT_SECURITY_LOG_ENABLE_ANNOTATION)
                .map(|v| v == "true")
                .unwrap_or(false);
            if log_enabled {
                let confs = annotations
                    .get(APP_PROTECT_SECURITY_LOG_ANNOTATION)
                    .map(|list| reference::expand(list, ns))
                    .unwrap_or_default();
                for conf in confs {
                    let res =
                        self.check_app_resource(&owner_name, Kind::ApLogConf, conf, &mut deps);
                    if let Err(e) = res {
                        problems.push(Problem::new(
                            owner.clone(),
                            Reason::AddedOrUpdatedWithWarning,
                            e.to_string(),
                        ));
                    }
                }
            }
        }

        if let Some(dos) = annotations.get(APP_PROTECT_DOS_RESOURCE_ANNOTATION) {
            self.resolve_dos(&owner, reference::qualify(dos, ns), &mut deps, &mut problems);
        }

        Resolution::new(
            Some(ResolvedIngress {
                ingress: Snapshot::new(ingress),
                dependencies: deps,
            }),
            problems,
        )
    }

    /// Resolves a master Ingress and its minions. Problems of each minion are reported against
    /// that minion.
    pub fn resolve_mergeable(
        &mut self,
        master: Arc<Ingress>,
        minions: impl IntoIterator<Item = Arc<Ingress>>,
    ) -> Resolution<ResolvedMergeable> {
        let Resolution {
            resolved,
            mut problems,
        } = self.resolve_ingress(master);
        let Some(master) = resolved else {
            return Resolution::new(None, problems);
        };

        let mut resolved_minions = Vec::new();
        for minion in minions {
            let resolution = self.resolve_ingress(minion);
            problems.extend(resolution.problems);
            resolved_minions.extend(resolution.resolved);
        }

        Resolution::new(
            Some(ResolvedMergeable {
                master,
                minions: resolved_minions,
            }),
            problems,
        )
    }

    /// Returns the honored GlobalConfiguration if it exists and is valid.
    pub fn global_configuration(&self) -> Option<Arc<GlobalConfiguration>> {
        let id = self.config.global_configuration.as_ref()?;
        let gc = self.stores.global_configurations.get(id)?;
        validate_global_configuration(&gc).ok()?;
        Some(gc)
    }

    fn listener(&self, name: &str, protocol: &str) -> Option<Listener> {
        if name == TLS_PASSTHROUGH_LISTENER {
            return None;
        }
        self.global_configuration()?
            .spec
            .listeners
            .iter()
            .find(|l| l.name == name && l.protocol == protocol)
            .cloned()
    }

    fn check_secret(
        &mut self,
        owner: &str,
        id: ResourceId,
        expected: &'static str,
        deps: &mut Dependencies,
    ) -> Result<(), ResolveError> {
        let Some(secret) = self.secrets.get_secret(&id) else {
            return Err(ResolveError::MissingSecret {
                owner: owner.to_string(),
                id,
            });
        };
        if secret.secret_type() != expected {
            return Err(ResolveError::SecretType {
                owner: owner.to_string(),
                actual: secret.secret_type().to_string(),
                id,
                expected,
            });
        }
        if let Some(source) = secret.error.clone() {
            return Err(ResolveError::InvalidSecret {
                owner: owner.to_string(),
                id,
                source,
            });
        }
        deps.secrets.insert(id, secret);
        Ok(())
    }

    fn check_app_resource(
        &self,
        owner: &str,
        kind: Kind,
        id: ResourceId,
        deps: &mut Dependencies,
    ) -> Result<(), ResolveError> {
        let obj = self
            .app_protect
            .get_app_resource(kind, &id)
            .map_err(|source| ResolveError::AppResource {
                owner: owner.to_string(),
                source,
            })?;
        deps.app_protect
            .insert(KindedKey::new(kind, id), Snapshot::new(obj));
        Ok(())
    }

    fn resolve_upstream(
        &self,
        owner: &KindedKey,
        ns: &str,
        upstream: &Upstream,
        deps: &mut Dependencies,
        problems: &mut Vec<Problem>,
    ) {
        let upstreams = Upstreams::new(self.stores, self.config);
        let port = BackendPort::from(upstream.port);
        let key = endpoints_key(ns, &upstream.service, &port);
        let resolved = if upstream.use_cluster_ip {
            upstreams.cluster_ip_endpoint(ns, &upstream.service, upstream.port)
        } else if !upstream.subselector.is_empty() {
            upstreams.endpoints_with_subselector(
                ns,
                &upstream.service,
                upstream.port,
                &upstream.subselector,
            )
        } else {
            upstreams.endpoints(ns, &upstream.service, &port)
        };

        match resolved {
            Ok(endpoints) => {
                deps.endpoints.insert(key, endpoints);
            }
            Err(source @ UpstreamError::ExternalNameUnsupported) => {
                let error = ResolveError::Upstream {
                    upstream: upstream.name.clone(),
                    source,
                };
                problems.push(error.into_problem(owner));
            }
            Err(error) => {
                tracing::debug!(%owner, upstream = %upstream.name, %error, "No endpoints");
                deps.endpoints.insert(key, ResolvedEndpoints::default());
            }
        }
    }

    fn resolve_dos(
        &self,
        owner: &KindedKey,
        id: ResourceId,
        deps: &mut Dependencies,
        problems: &mut Vec<Problem>,
    ) {
        if !self.config.enable_app_protect_dos || deps.dos.contains_key(&id) {
            return;
        }
        let owner_name = format!("{} {}", owner.kind, owner.id);
        let resource = match self.app_protect_dos.get_protected_resource(&id) {
            Ok(resource) => resource,
            Err(source) => {
                let error = ResolveError::Dos {
                    owner: owner_name,
                    source,
                };
                problems.push(error.into_problem(owner));
                return;
            }
        };

        let ns = id.namespace.clone();
        let spec = &resource.spec;
        let mut references = Vec::new();
        if !spec.ap_dos_policy.is_empty() {
            references.push((Kind::ApDosPolicy, reference::qualify(&spec.ap_dos_policy, &ns)));
        }
        if let Some(log) = spec.dos_security_log.as_ref().filter(|log| log.enable) {
            references.push((Kind::ApDosLogConf, reference::qualify(&log.ap_dos_log_conf, &ns)));
        }
        for (kind, ref_id) in references {
            match self.app_protect_dos.get_app_resource(kind, &ref_id) {
                Ok(obj) => {
                    deps.app_protect
                        .insert(KindedKey::new(kind, ref_id), Snapshot::new(obj));
                }
                Err(source) => {
                    let error = ResolveError::Dos {
                        owner: owner_name.clone(),
                        source,
                    };
                    problems.push(error.into_problem(owner));
                    return;
                }
            }
        }

        deps.dos.insert(id, Snapshot::new(resource));
    }
}

fn endpoints_key(ns: &str, service: &str, port: &BackendPort) -> String {
    format!("{ns}/{service}:{port}")
}

fn backend_service(backend: &IngressBackend) -> Option<(&str, BackendPort)> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref()?;
    let port = match (port.number, port.name.as_ref()) {
        (Some(n), _) => BackendPort::Number(n),
        (None, Some(name)) => BackendPort::Name(name.clone()),
        (None, None) => return None,
    };
    Some((service.name.as_str(), port))
}

/// Keys policies by namespace and name, keeping the first occurrence of each.
pub fn create_policy_map(
    policies: impl IntoIterator<Item = (ResourceId, Arc<Policy>)>,
) -> BTreeMap<ResourceId, Arc<Policy>> {
    let mut map = BTreeMap::new();
    for (id, policy) in policies {
        map.entry(id).or_insert(policy);
    }
    map
}

/// Finds the policies in the secret's namespace that reference it.
pub fn find_policies_for_secret(
    policies: &[(ResourceId, Arc<Policy>)],
    secret: &ResourceId,
) -> Vec<ResourceId> {
    policies
        .iter()
        .filter(|(id, _)| id.namespace == secret.namespace)
        .filter(|(_, policy)| {
            let spec = &policy.spec;
            let name = secret.name.as_str();
            spec.jwt.as_ref().and_then(|j| j.secret.as_deref()) == Some(name)
                || spec.ingress_mtls.as_ref().map(|m| m.client_cert_secret.as_str()) == Some(name)
                || spec.egress_mtls.as_ref().is_some_and(|m| {
                    m.tls_secret.as_deref() == Some(name)
                        || m.trusted_cert_secret.as_deref() == Some(name)
                })
                || spec.oidc.as_ref().map(|o| o.client_secret.as_str()) == Some(name)
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// Finds the WAF policies whose `apPolicy` references the App Protect policy `ap_policy`.
pub fn waf_policies_for_app_protect_policy(
    policies: &[(ResourceId, Arc<Policy>)],
    ap_policy: &ResourceId,
) -> Vec<ResourceId> {
    waf_policies_referencing(policies, ap_policy, |waf| waf.ap_policy.as_deref())
}

/// Finds the WAF policies whose security log references the App Protect log configuration
/// `log_conf`.
pub fn waf_policies_for_app_protect_log_conf(
    policies: &[(ResourceId, Arc<Policy>)],
    log_conf: &ResourceId,
) -> Vec<ResourceId> {
    waf_policies_referencing(policies, log_conf, |waf| {
        waf.security_log
            .as_ref()
            .and_then(|log| log.ap_log_conf.as_deref())
    })
}

fn waf_policies_referencing(
    policies: &[(ResourceId, Arc<Policy>)],
    target: &ResourceId,
    reference_of: impl Fn(&Waf) -> Option<&str>,
) -> Vec<ResourceId> {
    policies
        .iter()
        .filter(|(id, policy)| {
            policy
                .spec
                .waf
                .as_ref()
                .and_then(&reference_of)
                .is_some_and(|r| reference::qualify(r, &id.namespace) == *target)
        })
        .map(|(id, _)| id.clone())
        .collect()
}
