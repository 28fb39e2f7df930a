use super::ResourceStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reusable rule attached to VirtualServers, VirtualServerRoutes or TransportServers.
///
/// Exactly one of the rule fields must be set.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "Policy",
    derive = "PartialEq",
    status = "ResourceStatus",
    shortname = "pol",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub ingress_class_name: Option<String>,
    pub access_control: Option<AccessControl>,
    pub rate_limit: Option<RateLimit>,
    pub jwt: Option<Jwt>,
    #[serde(rename = "ingressMTLS")]
    pub ingress_mtls: Option<IngressMtls>,
    #[serde(rename = "egressMTLS")]
    pub egress_mtls: Option<EgressMtls>,
    pub oidc: Option<Oidc>,
    pub waf: Option<Waf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessControl {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    #[serde(default)]
    pub rate: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub zone_size: String,
    pub burst: Option<i32>,
    pub dry_run: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Jwt {
    #[serde(default)]
    pub realm: String,
    /// Names a `nginx.org/jwk` secret in the policy's namespace.
    pub secret: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "jwksURI")]
    pub jwks_uri: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressMtls {
    /// Names a `nginx.org/ca` secret in the policy's namespace.
    #[serde(default)]
    pub client_cert_secret: String,
    pub verify_client: Option<String>,
    pub verify_depth: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressMtls {
    /// Names a `kubernetes.io/tls` secret in the policy's namespace.
    pub tls_secret: Option<String>,
    /// Names a `nginx.org/ca` secret in the policy's namespace.
    pub trusted_cert_secret: Option<String>,
    #[serde(default)]
    pub verify_server: bool,
    pub verify_depth: Option<i32>,
    pub server_name: Option<bool>,
    pub ssl_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Oidc {
    #[serde(default)]
    pub auth_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default, rename = "jwksURI")]
    pub jwks_uri: String,
    #[serde(default, rename = "clientID")]
    pub client_id: String,
    /// Names a `nginx.org/oidc` secret in the policy's namespace.
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scope: String,
    pub redirect_uri: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Waf {
    #[serde(default)]
    pub enable: bool,
    /// References an APPolicy as `[namespace/]name`.
    pub ap_policy: Option<String>,
    pub security_log: Option<SecurityLog>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityLog {
    #[serde(default)]
    pub enable: bool,
    /// References an APLogConf as `[namespace/]name`.
    pub ap_log_conf: Option<String>,
    pub log_dest: Option<String>,
}

// === impl PolicySpec ===

impl PolicySpec {
    /// Lists the names of the rule fields that are set, in declaration order.
    pub fn rule_types(&self) -> Vec<&'static str> {
        let mut types = Vec::new();
        if self.access_control.is_some() {
            types.push("accessControl");
        }
        if self.rate_limit.is_some() {
            types.push("rateLimit");
        }
        if self.ingress_mtls.is_some() {
            types.push("ingressMTLS");
        }
        if self.egress_mtls.is_some() {
            types.push("egressMTLS");
        }
        if self.jwt.is_some() {
            types.push("jwt");
        }
        if self.oidc.is_some() {
            types.push("oidc");
        }
        if self.waf.is_some() {
            types.push("waf");
        }
        types
    }
}
