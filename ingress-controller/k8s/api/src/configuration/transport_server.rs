use super::{virtual_server::PolicyReference, ResourceStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The built-in listener that passes TLS connections through on the HTTPS port.
pub const TLS_PASSTHROUGH_LISTENER: &str = "tls-passthrough";

/// Configures TCP, UDP or TLS passthrough load balancing.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1alpha1",
    kind = "TransportServer",
    derive = "PartialEq",
    status = "ResourceStatus",
    shortname = "ts",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerSpec {
    pub ingress_class_name: Option<String>,
    pub listener: TransportServerListener,
    /// Only set for TLS passthrough servers.
    pub host: Option<String>,
    #[serde(default)]
    pub upstreams: Vec<TransportServerUpstream>,
    pub action: Option<TransportServerAction>,
    #[serde(default)]
    pub policies: Vec<PolicyReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerListener {
    pub name: String,
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerUpstream {
    pub name: String,
    pub service: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerAction {
    pub pass: String,
}

/// Declares the listeners TransportServers may bind to.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1alpha1",
    kind = "GlobalConfiguration",
    derive = "PartialEq",
    shortname = "gc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfigurationSpec {
    #[serde(default)]
    pub listeners: Vec<Listener>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

// === impl TransportServerSpec ===

impl TransportServerSpec {
    pub fn is_tls_passthrough(&self) -> bool {
        self.listener.name == TLS_PASSTHROUGH_LISTENER
            && self.listener.protocol == "TLS_PASSTHROUGH"
    }
}
