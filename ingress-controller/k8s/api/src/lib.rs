#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod app_protect;
pub mod configuration;
pub mod labels;
mod watch;

pub use self::{
    labels::{Labels, Selector},
    watch::{resilient, Event, Watch},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            ConfigMap, Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset,
            Endpoints, ObjectReference, Pod, PodSpec, PodStatus, Secret, Service, ServicePort,
            ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{OwnerReference, Time},
        util::intstr::IntOrString,
    },
    ByteString, NamespaceResourceScope,
};
pub use kube::{
    api::{Api, DynamicObject, ObjectMeta, Patch, PatchParams, ResourceExt},
    core::{ApiResource, GroupVersionKind},
    runtime::watcher,
    Client, Error, Resource,
};

/// Annotation selecting the ingress class of an `Ingress`. Takes precedence over
/// `spec.ingressClassName`.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Annotation marking an `Ingress` as a `master` or `minion` of a mergeable host.
pub const MERGEABLE_INGRESS_TYPE_ANNOTATION: &str = "nginx.org/mergeable-ingress-type";

/// Annotation referencing the App Protect policy applied to an `Ingress`.
pub const APP_PROTECT_POLICY_ANNOTATION: &str = "appprotect.f5.com/app-protect-policy";

/// Annotation enabling App Protect security logging for an `Ingress`.
pub const APP_PROTECT_SECURITY_LOG_ENABLE_ANNOTATION: &str =
    "appprotect.f5.com/app-protect-security-log-enable";

/// Annotation listing the App Protect log configurations of an `Ingress`, comma separated.
pub const APP_PROTECT_SECURITY_LOG_ANNOTATION: &str = "appprotect.f5.com/app-protect-security-log";

/// Annotation referencing the DosProtectedResource applied to an `Ingress`.
pub const APP_PROTECT_DOS_RESOURCE_ANNOTATION: &str =
    "appprotectdos.f5.com/app-protect-dos-resource";
