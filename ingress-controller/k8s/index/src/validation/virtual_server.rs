use super::{
    is_dns1123_label, is_dns1123_subdomain, validate_reference, ValidationError, Violations,
};
use crate::store::id_of;
use ahash::AHashSet as HashSet;
use ingress_controller_core::Kind;
use ingress_controller_k8s_api::configuration::{
    transport_server::TLS_PASSTHROUGH_LISTENER, GlobalConfiguration, PolicyReference, Route,
    TransportServer, Upstream, VirtualServer, VirtualServerRoute,
};

pub fn validate_virtual_server(vs: &VirtualServer) -> Result<(), ValidationError> {
    let spec = &vs.spec;
    let mut violations = Violations::default();

    validate_host(&spec.host, "spec.host", &mut violations);
    if let Some(secret) = spec.tls.as_ref().and_then(|tls| tls.secret.as_deref()) {
        if !is_dns1123_subdomain(secret) {
            violations.invalid("spec.tls.secret", secret, "must be a valid DNS-1123 subdomain");
        }
    }
    validate_policy_references(&spec.policies, "spec.policies", &mut violations);
    if let Some(dos) = spec.dos.as_deref() {
        validate_reference(dos, "spec.dos", &mut violations);
    }
    let upstreams = validate_upstreams(&spec.upstreams, "spec.upstreams", &mut violations);
    validate_routes(&spec.routes, &upstreams, "spec.routes", true, &mut violations);

    violations.into_result(Kind::VirtualServer, id_of(vs))
}

pub fn validate_virtual_server_route(vsr: &VirtualServerRoute) -> Result<(), ValidationError> {
    let spec = &vsr.spec;
    let mut violations = Violations::default();

    validate_host(&spec.host, "spec.host", &mut violations);
    let upstreams = validate_upstreams(&spec.upstreams, "spec.upstreams", &mut violations);
    validate_routes(
        &spec.subroutes,
        &upstreams,
        "spec.subroutes",
        false,
        &mut violations,
    );

    violations.into_result(Kind::VirtualServerRoute, id_of(vsr))
}

pub fn validate_transport_server(ts: &TransportServer) -> Result<(), ValidationError> {
    let spec = &ts.spec;
    let mut violations = Violations::default();

    if spec.listener.name.is_empty() {
        violations.required("spec.listener.name");
    }
    match spec.listener.protocol.as_str() {
        "" => violations.required("spec.listener.protocol"),
        "TCP" | "UDP" => {
            if spec.listener.name == TLS_PASSTHROUGH_LISTENER {
                violations.forbidden(
                    "spec.listener.name",
                    "tls-passthrough listener can only be used with the TLS_PASSTHROUGH protocol",
                );
            }
            if spec.host.is_some() {
                violations.forbidden("spec.host", "host is only supported for TLS_PASSTHROUGH");
            }
        }
        "TLS_PASSTHROUGH" => {
            if spec.listener.name != TLS_PASSTHROUGH_LISTENER {
                violations.invalid(
                    "spec.listener.name",
                    &spec.listener.name,
                    "must be tls-passthrough for the TLS_PASSTHROUGH protocol",
                );
            }
            match spec.host.as_deref() {
                Some(host) => validate_host(host, "spec.host", &mut violations),
                None => violations.required("spec.host"),
            }
        }
        other => violations.invalid(
            "spec.listener.protocol",
            other,
            "must be one of: 'TCP', 'UDP', 'TLS_PASSTHROUGH'",
        ),
    }

    let mut names = HashSet::default();
    for (i, upstream) in spec.upstreams.iter().enumerate() {
        let path = format!("spec.upstreams[{i}]");
        validate_upstream_name(&upstream.name, &format!("{path}.name"), &mut violations);
        if !names.insert(upstream.name.as_str()) {
            violations.duplicate(format!("{path}.name"), &upstream.name);
        }
        validate_service_name(&upstream.service, &format!("{path}.service"), &mut violations);
        if upstream.port == 0 {
            violations.invalid(
                format!("{path}.port"),
                "0",
                "must be between 1 and 65535, inclusive",
            );
        }
    }

    match spec.action.as_ref() {
        None => violations.required("spec.action"),
        Some(action) if !names.contains(action.pass.as_str()) => violations.invalid(
            "spec.action.pass",
            &action.pass,
            "must be the name of an upstream",
        ),
        Some(_) => {}
    }
    validate_policy_references(&spec.policies, "spec.policies", &mut violations);

    violations.into_result(Kind::TransportServer, id_of(ts))
}

pub fn validate_global_configuration(gc: &GlobalConfiguration) -> Result<(), ValidationError> {
    let mut violations = Violations::default();
    let mut names = HashSet::default();
    let mut ports = HashSet::default();

    for (i, listener) in gc.spec.listeners.iter().enumerate() {
        let path = format!("spec.listeners[{i}]");
        if listener.name == TLS_PASSTHROUGH_LISTENER {
            violations.forbidden(
                format!("{path}.name"),
                "tls-passthrough is a reserved listener name",
            );
        } else if !is_dns1123_label(&listener.name) {
            violations.invalid(
                format!("{path}.name"),
                &listener.name,
                "must be a valid DNS-1123 label",
            );
        }
        if !names.insert(listener.name.as_str()) {
            violations.duplicate(format!("{path}.name"), &listener.name);
        }
        if !(1..=65535).contains(&listener.port) {
            violations.invalid(
                format!("{path}.port"),
                listener.port.to_string(),
                "must be between 1 and 65535, inclusive",
            );
        }
        if !matches!(listener.protocol.as_str(), "TCP" | "UDP") {
            violations.invalid(
                format!("{path}.protocol"),
                &listener.protocol,
                "must be one of: 'TCP', 'UDP'",
            );
        }
        if !ports.insert((listener.port, listener.protocol.as_str())) {
            violations.duplicate(format!("{path}.port"), listener.port.to_string());
        }
    }

    violations.into_result(Kind::GlobalConfiguration, id_of(gc))
}

fn validate_host(host: &str, path: &str, violations: &mut Violations) {
    if host.is_empty() {
        violations.required(path);
    } else if !is_dns1123_subdomain(host) {
        violations.invalid(path, host, "must be a valid DNS-1123 subdomain");
    }
}

fn validate_policy_references(
    policies: &[PolicyReference],
    path: &str,
    violations: &mut Violations,
) {
    let mut seen = HashSet::default();
    for (i, policy) in policies.iter().enumerate() {
        let path = format!("{path}[{i}]");
        if policy.name.is_empty() {
            violations.required(format!("{path}.name"));
        } else if !is_dns1123_subdomain(&policy.name) {
            violations.invalid(
                format!("{path}.name"),
                &policy.name,
                "must be a valid DNS-1123 subdomain",
            );
        }
        if let Some(ns) = policy.namespace.as_deref() {
            if !is_dns1123_label(ns) {
                violations.invalid(
                    format!("{path}.namespace"),
                    ns,
                    "must be a valid DNS-1123 label",
                );
            }
        }
        if !seen.insert((policy.namespace.as_deref(), policy.name.as_str())) {
            violations.duplicate(path, &policy.name);
        }
    }
}

/// Validates upstreams, returning the set of valid names routes may pass to.
fn validate_upstreams<'u>(
    upstreams: &'u [Upstream],
    path: &str,
    violations: &mut Violations,
) -> HashSet<&'u str> {
    let mut names = HashSet::default();
    for (i, upstream) in upstreams.iter().enumerate() {
        let path = format!("{path}[{i}]");
        validate_upstream_name(&upstream.name, &format!("{path}.name"), violations);
        if !names.insert(upstream.name.as_str()) {
            violations.duplicate(format!("{path}.name"), &upstream.name);
        }
        validate_service_name(&upstream.service, &format!("{path}.service"), violations);
        if upstream.port == 0 {
            violations.invalid(
                format!("{path}.port"),
                "0",
                "must be between 1 and 65535, inclusive",
            );
        }
    }
    names
}

fn validate_routes(
    routes: &[Route],
    upstreams: &HashSet<&str>,
    path: &str,
    allow_delegation: bool,
    violations: &mut Violations,
) {
    let mut paths = HashSet::default();
    for (i, route) in routes.iter().enumerate() {
        let path = format!("{path}[{i}]");
        if route.path.is_empty() {
            violations.required(format!("{path}.path"));
        } else if !is_route_path(&route.path) {
            violations.invalid(
                format!("{path}.path"),
                &route.path,
                "must start with '/', '~' or '=' followed by a path",
            );
        }
        if !paths.insert(route.path.as_str()) {
            violations.duplicate(format!("{path}.path"), &route.path);
        }

        let kinds = [
            route.action.is_some(),
            !route.splits.is_empty(),
            route.route.is_some(),
        ];
        match kinds.iter().filter(|set| **set).count() {
            1 => {}
            _ if allow_delegation => {
                violations.invalid(
                    &path,
                    "",
                    "must specify exactly one of: `action`, `splits` or `route`",
                );
                continue;
            }
            _ => {
                violations.invalid(&path, "", "must specify exactly one of: `action` or `splits`");
                continue;
            }
        }

        if let Some(reference) = route.route.as_deref() {
            if !allow_delegation {
                violations.forbidden(format!("{path}.route"), "subroutes cannot delegate");
            } else {
                validate_reference(reference, &format!("{path}.route"), violations);
            }
        }

        if !route.splits.is_empty() {
            let total: u32 = route.splits.iter().map(|s| s.weight).sum();
            if route.splits.len() < 2 {
                violations.invalid(
                    format!("{path}.splits"),
                    "",
                    "must include at least 2 splits",
                );
            } else if total != 100 {
                violations.invalid(
                    format!("{path}.splits"),
                    "",
                    "the sum of the weights of all splits must be equal to 100",
                );
            }
        }

        for name in route.upstream_names() {
            if !upstreams.contains(name) {
                violations.invalid(
                    format!("{path}.action.pass"),
                    name,
                    "must be the name of an upstream",
                );
            }
        }

        validate_policy_references(&route.policies, &format!("{path}.policies"), violations);
    }
}

/// Prefix paths start with `/`, regexes with `~` and exact matches with `=`, as in `=/coffee`.
fn is_route_path(path: &str) -> bool {
    match path.strip_prefix('=') {
        Some(exact) => exact.starts_with('/'),
        None => path.starts_with('/') || path.starts_with('~'),
    }
}

fn validate_upstream_name(name: &str, path: &str, violations: &mut Violations) {
    if name.is_empty() {
        violations.required(path);
    } else if !is_dns1123_label(name) {
        violations.invalid(path, name, "must be a valid DNS-1123 label");
    }
}

fn validate_service_name(name: &str, path: &str, violations: &mut Violations) {
    if name.is_empty() {
        violations.required(path);
    } else if !is_dns1123_label(name) {
        violations.invalid(path, name, "must be a valid DNS-1123 label");
    }
}
