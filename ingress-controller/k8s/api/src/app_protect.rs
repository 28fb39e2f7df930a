//! Group/version/kind descriptors for resources that are watched as unstructured objects.
//!
//! App Protect resources carry schemas owned by the App Protect product, so the controller only
//! checks the fields it depends on and otherwise treats them as opaque trees.

use kube::core::{ApiResource, GroupVersionKind};

pub const APP_PROTECT_GROUP: &str = "appprotect.f5.com";
pub const APP_PROTECT_DOS_GROUP: &str = "appprotectdos.f5.com";
pub const INGRESS_LINK_GROUP: &str = "cis.f5.com";

fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
}

pub fn ap_policy() -> ApiResource {
    resource(APP_PROTECT_GROUP, "v1beta1", "APPolicy", "appolicies")
}

pub fn ap_log_conf() -> ApiResource {
    resource(APP_PROTECT_GROUP, "v1beta1", "APLogConf", "aplogconfs")
}

pub fn ap_user_sig() -> ApiResource {
    resource(APP_PROTECT_GROUP, "v1beta1", "APUserSig", "apusersigs")
}

pub fn ap_dos_policy() -> ApiResource {
    resource(APP_PROTECT_DOS_GROUP, "v1beta1", "APDosPolicy", "apdospolicies")
}

pub fn ap_dos_log_conf() -> ApiResource {
    resource(APP_PROTECT_DOS_GROUP, "v1beta1", "APDosLogConf", "apdoslogconfs")
}

pub fn ingress_link() -> ApiResource {
    resource(INGRESS_LINK_GROUP, "v1", "IngressLink", "ingresslinks")
}
