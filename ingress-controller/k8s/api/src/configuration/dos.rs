use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Enables App Protect DoS mitigation for the resources that reference it.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "appprotectdos.f5.com",
    version = "v1beta1",
    kind = "DosProtectedResource",
    derive = "PartialEq",
    shortname = "pr",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DosProtectedResourceSpec {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub name: String,
    /// References an APDosPolicy as `[namespace/]name`.
    #[serde(default)]
    pub ap_dos_policy: String,
    pub dos_security_log: Option<DosSecurityLog>,
    #[serde(default)]
    pub ap_dos_monitor: String,
    #[serde(default)]
    pub dos_access_log_dest: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DosSecurityLog {
    #[serde(default)]
    pub enable: bool,
    /// References an APDosLogConf as `[namespace/]name`.
    #[serde(default)]
    pub ap_dos_log_conf: String,
    #[serde(default)]
    pub dos_log_dest: String,
}
