use super::ResourceStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configures load balancing for a single host.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "VirtualServer",
    derive = "PartialEq",
    status = "ResourceStatus",
    shortname = "vs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerSpec {
    pub ingress_class_name: Option<String>,
    #[serde(default)]
    pub host: String,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub policies: Vec<PolicyReference>,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// References a DosProtectedResource as `[namespace/]name`.
    pub dos: Option<String>,
}

/// Extends a VirtualServer with routes for a path prefix, possibly from another namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "VirtualServerRoute",
    derive = "PartialEq",
    status = "ResourceStatus",
    shortname = "vsr",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerRouteSpec {
    pub ingress_class_name: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub subroutes: Vec<Route>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    pub secret: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReference {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub name: String,
    pub service: String,
    pub port: u16,
    #[serde(default)]
    pub subselector: BTreeMap<String, String>,
    #[serde(default, rename = "use-cluster-ip")]
    pub use_cluster_ip: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub path: String,
    #[serde(default)]
    pub policies: Vec<PolicyReference>,
    /// Delegates the path to a VirtualServerRoute, `[namespace/]name`.
    pub route: Option<String>,
    pub action: Option<Action>,
    #[serde(default)]
    pub splits: Vec<Split>,
    pub dos: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// The name of an upstream to pass requests to.
    pub pass: Option<String>,
    pub redirect: Option<serde_json::Value>,
    #[serde(rename = "return")]
    pub return_: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub weight: u32,
    pub action: Option<Action>,
}

// === impl Route ===

impl Route {
    /// Names the upstreams this route passes traffic to, directly or through splits.
    pub fn upstream_names(&self) -> impl Iterator<Item = &str> {
        self.action
            .iter()
            .chain(self.splits.iter().filter_map(|s| s.action.as_ref()))
            .filter_map(|a| a.pass.as_deref())
    }
}
