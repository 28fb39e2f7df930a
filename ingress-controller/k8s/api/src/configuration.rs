//! Custom resources in the `k8s.nginx.org` and `appprotectdos.f5.com` groups.

pub mod dos;
pub mod policy;
pub mod transport_server;
pub mod virtual_server;

pub use self::{
    dos::{DosProtectedResource, DosProtectedResourceSpec, DosSecurityLog},
    policy::{
        AccessControl, EgressMtls, IngressMtls, Jwt, Oidc, Policy, PolicySpec, RateLimit,
        SecurityLog, Waf,
    },
    transport_server::{
        GlobalConfiguration, GlobalConfigurationSpec, Listener, TransportServer,
        TransportServerAction, TransportServerListener, TransportServerSpec,
        TransportServerUpstream,
    },
    virtual_server::{
        Action, PolicyReference, Route, Split, Tls, Upstream, VirtualServer, VirtualServerRoute,
        VirtualServerRouteSpec, VirtualServerSpec,
    },
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The status written back to VirtualServer, VirtualServerRoute, TransportServer and Policy
/// resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// The state reported for a resource that was applied without problems.
pub const STATE_VALID: &str = "Valid";
/// The state reported for a resource that was applied with warnings.
pub const STATE_WARNING: &str = "Warning";
/// The state reported for a resource that could not be applied.
pub const STATE_INVALID: &str = "Invalid";
