use super::{
    dos::validate_app_protect_log_dest, is_dns1123_subdomain, validate_reference,
    ValidationError, Violations,
};
use ingress_controller_k8s_api::configuration::{
    AccessControl, EgressMtls, IngressMtls, Jwt, Oidc, Policy, RateLimit, Waf,
};
use crate::store::id_of;
use ingress_controller_core::Kind;
use std::net::IpAddr;

const POLICY_TYPES: &str = "`accessControl`, `rateLimit`, `ingressMTLS`, `egressMTLS`, `jwt`, \
                            `oidc`, `waf`";

/// Validates a Policy. Exactly one rule type must be set; it is checked before anything else.
pub fn validate_policy(policy: &Policy) -> Result<(), ValidationError> {
    let spec = &policy.spec;
    let mut violations = Violations::default();

    if spec.rule_types().len() != 1 {
        violations.invalid(
            "spec",
            "",
            format!("must specify exactly one of: {POLICY_TYPES}"),
        );
        return violations.into_result(Kind::Policy, id_of(policy));
    }

    if let Some(ac) = spec.access_control.as_ref() {
        validate_access_control(ac, &mut violations);
    }
    if let Some(rl) = spec.rate_limit.as_ref() {
        validate_rate_limit(rl, &mut violations);
    }
    if let Some(jwt) = spec.jwt.as_ref() {
        validate_jwt(jwt, &mut violations);
    }
    if let Some(mtls) = spec.ingress_mtls.as_ref() {
        validate_ingress_mtls(mtls, &mut violations);
    }
    if let Some(mtls) = spec.egress_mtls.as_ref() {
        validate_egress_mtls(mtls, &mut violations);
    }
    if let Some(oidc) = spec.oidc.as_ref() {
        validate_oidc(oidc, &mut violations);
    }
    if let Some(waf) = spec.waf.as_ref() {
        validate_waf(waf, &mut violations);
    }

    violations.into_result(Kind::Policy, id_of(policy))
}

fn validate_access_control(ac: &AccessControl, violations: &mut Violations) {
    let path = "spec.accessControl";
    let (field, addrs) = match (ac.allow.is_empty(), ac.deny.is_empty()) {
        (false, true) => ("allow", &ac.allow),
        (true, false) => ("deny", &ac.deny),
        _ => {
            violations.invalid(path, "", "must specify exactly one of: `allow` or `deny`");
            return;
        }
    };
    for (i, addr) in addrs.iter().enumerate() {
        if !is_ip_or_cidr(addr) {
            violations.invalid(
                format!("{path}.{field}[{i}]"),
                addr,
                "must be a CIDR or IP",
            );
        }
    }
}

fn validate_rate_limit(rl: &RateLimit, violations: &mut Violations) {
    let path = "spec.rateLimit";
    if rl.rate.is_empty() {
        violations.required(format!("{path}.rate"));
    } else if !is_rate(&rl.rate) {
        violations.invalid(
            format!("{path}.rate"),
            &rl.rate,
            "must consist of numeric characters followed by a valid rate suffix. 'r/s|r/m'",
        );
    }
    if rl.key.is_empty() {
        violations.required(format!("{path}.key"));
    }
    if rl.zone_size.is_empty() {
        violations.required(format!("{path}.zoneSize"));
    }
    if rl.burst.is_some_and(|b| b < 0) {
        violations.invalid(
            format!("{path}.burst"),
            rl.burst.unwrap_or_default().to_string(),
            "must be non-negative",
        );
    }
}

fn validate_jwt(jwt: &Jwt, violations: &mut Violations) {
    let path = "spec.jwt";
    if jwt.realm.is_empty() {
        violations.required(format!("{path}.realm"));
    }
    match (jwt.secret.as_deref(), jwt.jwks_uri.as_deref()) {
        (Some(secret), None) => validate_secret_name(secret, &format!("{path}.secret"), violations),
        (None, Some(_)) => {}
        (None, None) => violations.required(format!("{path}.secret")),
        (Some(_), Some(_)) => violations.forbidden(
            format!("{path}.secret"),
            "secret and jwksURI cannot both be specified",
        ),
    }
}

fn validate_ingress_mtls(mtls: &IngressMtls, violations: &mut Violations) {
    let path = "spec.ingressMTLS";
    validate_secret_name(
        &mtls.client_cert_secret,
        &format!("{path}.clientCertSecret"),
        violations,
    );
    if let Some(verify) = mtls.verify_client.as_deref() {
        if !matches!(verify, "on" | "off" | "optional" | "optional_no_ca") {
            violations.invalid(
                format!("{path}.verifyClient"),
                verify,
                "must be one of: 'on', 'off', 'optional', 'optional_no_ca'",
            );
        }
    }
    if mtls.verify_depth.is_some_and(|d| d < 0) {
        violations.invalid(
            format!("{path}.verifyDepth"),
            mtls.verify_depth.unwrap_or_default().to_string(),
            "must be non-negative",
        );
    }
}

fn validate_egress_mtls(mtls: &EgressMtls, violations: &mut Violations) {
    let path = "spec.egressMTLS";
    if let Some(secret) = mtls.tls_secret.as_deref() {
        validate_secret_name(secret, &format!("{path}.tlsSecret"), violations);
    }
    match mtls.trusted_cert_secret.as_deref() {
        Some(secret) => {
            validate_secret_name(secret, &format!("{path}.trustedCertSecret"), violations)
        }
        None if mtls.verify_server => violations.required(format!("{path}.trustedCertSecret")),
        None => {}
    }
}

fn validate_oidc(oidc: &Oidc, violations: &mut Violations) {
    let path = "spec.oidc";
    for (field, value) in [
        ("authEndpoint", &oidc.auth_endpoint),
        ("tokenEndpoint", &oidc.token_endpoint),
        ("jwksURI", &oidc.jwks_uri),
        ("clientID", &oidc.client_id),
    ] {
        if value.is_empty() {
            violations.required(format!("{path}.{field}"));
        }
    }
    validate_secret_name(
        &oidc.client_secret,
        &format!("{path}.clientSecret"),
        violations,
    );
    if !oidc.scope.is_empty() && !oidc.scope.split('+').any(|s| s == "openid") {
        violations.invalid(
            format!("{path}.scope"),
            &oidc.scope,
            "scope must include 'openid'",
        );
    }
}

fn validate_waf(waf: &Waf, violations: &mut Violations) {
    let path = "spec.waf";
    if let Some(reference) = waf.ap_policy.as_deref() {
        validate_reference(reference, &format!("{path}.apPolicy"), violations);
    }
    if let Some(log) = waf.security_log.as_ref() {
        if let Some(reference) = log.ap_log_conf.as_deref() {
            validate_reference(
                reference,
                &format!("{path}.securityLog.apLogConf"),
                violations,
            );
        }
        if let Some(dest) = log.log_dest.as_deref() {
            if let Err(error) = validate_app_protect_log_dest(dest) {
                violations.invalid(format!("{path}.securityLog.logDest"), dest, error.to_string());
            }
        }
    }
}

fn validate_secret_name(name: &str, path: &str, violations: &mut Violations) {
    if name.is_empty() {
        violations.required(path);
    } else if !is_dns1123_subdomain(name) {
        violations.invalid(path, name, "must be a valid DNS-1123 subdomain");
    }
}

fn is_ip_or_cidr(value: &str) -> bool {
    match value.split_once('/') {
        Some((addr, prefix)) => {
            let Ok(addr) = addr.parse::<IpAddr>() else {
                return false;
            };
            let max = if addr.is_ipv4() { 32 } else { 128 };
            prefix.parse::<u8>().is_ok_and(|p| p <= max)
        }
        None => value.parse::<IpAddr>().is_ok(),
    }
}

fn is_rate(rate: &str) -> bool {
    rate.strip_suffix("r/s")
        .or_else(|| rate.strip_suffix("r/m"))
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}
