//! Resolves the endpoints behind an upstream or ingress backend.
//!
//! Lookups are served from the caches. A service port's target port may be numeric, named (in
//! which case it is looked up on the service's pods), or unset (in which case it equals the
//! service port).

use crate::{config::ControllerConfig, store::Stores};
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::{
    api::core::v1::Probe, ContainerPort, Endpoints, IntOrString, Pod, ResourceExt, Selector,
    Service, ServicePort,
};
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;

/// A service port, as an ingress backend or upstream refers to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendPort {
    Number(i32),
    Name(String),
}

/// A single address traffic may be sent to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub pod: Option<String>,
    pub owner: Option<PodOwner>,
}

/// The workload that runs a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodOwner {
    pub kind: &'static str,
    pub name: String,
}

/// The endpoints of an upstream. External endpoints name an `ExternalName` service's DNS name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    pub endpoints: Vec<Endpoint>,
    pub external: bool,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum UpstreamError {
    #[error("service {0} doesn't exist")]
    ServiceNotFound(ResourceId),

    #[error("No port {port} in service {service}")]
    NoPort { port: BackendPort, service: String },

    #[error("No pods of service {0}")]
    NoPods(String),

    #[error("no suitable port {port} in pod {pod}")]
    NoNamedPort { port: String, pod: String },

    #[error("No endpoints for target port {port} in service {service}")]
    NoEndpoints { port: i32, service: String },

    #[error("Type ExternalName Services feature is only available in NGINX Plus")]
    ExternalNameUnsupported,

    #[error("service {0} has no cluster IP")]
    NoClusterIp(String),
}

/// Endpoint lookups over the cached services, endpoints and pods.
#[derive(Clone, Copy)]
pub struct Upstreams<'a> {
    stores: &'a Stores,
    config: &'a ControllerConfig,
}

// === impl BackendPort ===

impl From<u16> for BackendPort {
    fn from(port: u16) -> Self {
        Self::Number(port.into())
    }
}

impl fmt::Display for BackendPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => n.fmt(f),
            Self::Name(name) => name.fmt(f),
        }
    }
}

// === impl Upstreams ===

impl<'a> Upstreams<'a> {
    pub fn new(stores: &'a Stores, config: &'a ControllerConfig) -> Self {
        Self { stores, config }
    }

    pub fn service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, UpstreamError> {
        let id = ResourceId::new(namespace, name);
        self.stores
            .services
            .get(&id)
            .ok_or(UpstreamError::ServiceNotFound(id))
    }

    /// Resolves the endpoints for `port` of the service `name`.
    pub fn endpoints(
        &self,
        namespace: &str,
        name: &str,
        port: &BackendPort,
    ) -> Result<ResolvedEndpoints, UpstreamError> {
        let svc = self.service(namespace, name)?;
        let spec = svc.spec.as_ref();

        if spec.and_then(|s| s.type_.as_deref()) == Some("ExternalName") {
            if !self.config.is_nginx_plus {
                return Err(UpstreamError::ExternalNameUnsupported);
            }
            let host = spec
                .and_then(|s| s.external_name.as_deref())
                .unwrap_or_default();
            let port = match port {
                BackendPort::Number(n) => *n,
                BackendPort::Name(_) => 0,
            };
            return Ok(ResolvedEndpoints {
                endpoints: vec![Endpoint {
                    address: format!("{host}:{port}"),
                    pod: None,
                    owner: None,
                }],
                external: true,
            });
        }

        let svc_port = service_port(&svc, port).ok_or_else(|| UpstreamError::NoPort {
            port: port.clone(),
            service: svc.name_any(),
        })?;
        let target_port = self.target_port(&svc_port, &svc)?;
        let endpoints = self
            .stores
            .endpoints
            .get(&ResourceId::new(namespace, name))
            .ok_or_else(|| UpstreamError::NoEndpoints {
                port: target_port,
                service: svc.name_any(),
            })?;

        let endpoints = self
            .endpoints_for_target_port(&endpoints, target_port)
            .ok_or_else(|| UpstreamError::NoEndpoints {
                port: target_port,
                service: svc.name_any(),
            })?;
        Ok(ResolvedEndpoints {
            endpoints,
            external: false,
        })
    }

    /// Resolves endpoints restricted to the service's pods that also match `subselector`.
    pub fn endpoints_with_subselector(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
        subselector: &BTreeMap<String, String>,
    ) -> Result<ResolvedEndpoints, UpstreamError> {
        let svc = self.service(namespace, name)?;
        let port = BackendPort::from(port);
        let svc_port = service_port(&svc, &port).ok_or_else(|| UpstreamError::NoPort {
            port,
            service: svc.name_any(),
        })?;
        let target_port = self.target_port(&svc_port, &svc)?;

        let selector = service_selector(&svc).merge(subselector);
        let pods = self.stores.pods.list_by_namespace(namespace, &selector);
        let endpoints = self
            .stores
            .endpoints
            .get(&ResourceId::new(namespace, name))
            .map(|eps| endpoints_for_pods(&eps, target_port, &pods))
            .unwrap_or_default();
        Ok(ResolvedEndpoints {
            endpoints,
            external: false,
        })
    }

    /// Resolves a single endpoint at the service's cluster IP.
    pub fn cluster_ip_endpoint(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
    ) -> Result<ResolvedEndpoints, UpstreamError> {
        let svc = self.service(namespace, name)?;
        let ip = svc
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.as_deref())
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .ok_or_else(|| UpstreamError::NoClusterIp(svc.name_any()))?;
        Ok(ResolvedEndpoints {
            endpoints: vec![Endpoint {
                address: format!("{ip}:{port}"),
                pod: None,
                owner: None,
            }],
            external: false,
        })
    }

    /// Finds an HTTP readiness probe on the first pod of the service that serves `port`.
    pub fn health_check(&self, namespace: &str, name: &str, port: &BackendPort) -> Option<Probe> {
        let svc = self.service(namespace, name).ok()?;
        let svc_port = service_port(&svc, port)?;
        let pods = self
            .stores
            .pods
            .list_by_namespace(namespace, &service_selector(&svc));
        let pod = pods.first()?;
        pod.spec
            .as_ref()?
            .containers
            .iter()
            .filter(|c| {
                c.ports
                    .iter()
                    .flatten()
                    .any(|p| container_serves_port(p, &svc_port))
            })
            .filter_map(|c| c.readiness_probe.as_ref())
            .find(|probe| probe.http_get.is_some() && probe.period_seconds.unwrap_or(0) > 0)
            .cloned()
    }

    fn target_port(&self, svc_port: &ServicePort, svc: &Service) -> Result<i32, UpstreamError> {
        let name = match svc_port.target_port.as_ref() {
            None => return Ok(svc_port.port),
            Some(IntOrString::Int(0)) => return Ok(svc_port.port),
            Some(IntOrString::Int(port)) => return Ok(*port),
            Some(IntOrString::String(name)) => name,
        };

        let namespace = svc.namespace().unwrap_or_default();
        let pods = self
            .stores
            .pods
            .list_by_namespace(&namespace, &service_selector(svc));
        let pod = pods
            .first()
            .ok_or_else(|| UpstreamError::NoPods(svc.name_any()))?;
        named_container_port(pod, name, protocol(svc_port.protocol.as_deref())).ok_or_else(|| {
            UpstreamError::NoNamedPort {
                port: name.clone(),
                pod: pod.name_any(),
            }
        })
    }

    fn endpoints_for_target_port(
        &self,
        endpoints: &Endpoints,
        target_port: i32,
    ) -> Option<Vec<Endpoint>> {
        let subset = endpoints.subsets.iter().flatten().find(|subset| {
            subset
                .ports
                .iter()
                .flatten()
                .any(|port| port.port == target_port)
        })?;

        let endpoints = subset
            .addresses
            .iter()
            .flatten()
            .map(|address| {
                let pod = address.target_ref.as_ref().and_then(|r| {
                    let id = ResourceId::new(r.namespace.clone()?, r.name.clone()?);
                    Some(id)
                });
                let owner = pod
                    .as_ref()
                    .and_then(|id| self.stores.pods.get(id))
                    .and_then(|pod| pod_owner(&pod));
                Endpoint {
                    address: format!("{}:{}", address.ip, target_port),
                    pod: pod.map(|id| id.name),
                    owner,
                }
            })
            .collect();
        Some(endpoints)
    }
}

fn service_port(svc: &Service, port: &BackendPort) -> Option<ServicePort> {
    svc.spec
        .as_ref()?
        .ports
        .iter()
        .flatten()
        .find(|p| match port {
            BackendPort::Number(n) => p.port == *n,
            BackendPort::Name(name) => p.name.as_deref() == Some(name),
        })
        .cloned()
}

fn service_selector(svc: &Service) -> Selector {
    Selector::from_optional(svc.spec.as_ref().and_then(|s| s.selector.as_ref()))
}

fn protocol(protocol: Option<&str>) -> &str {
    protocol.unwrap_or("TCP")
}

fn named_container_port(pod: &Pod, name: &str, proto: &str) -> Option<i32> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(name) && protocol(p.protocol.as_deref()) == proto)
        .map(|p| p.container_port)
}

fn container_serves_port(port: &ContainerPort, svc_port: &ServicePort) -> bool {
    match svc_port.target_port.as_ref() {
        None => svc_port.port > 0 && svc_port.port == port.container_port,
        Some(IntOrString::Int(target)) => *target > 0 && *target == port.container_port,
        Some(IntOrString::String(name)) => {
            port.name.as_deref() == Some(name)
                && protocol(port.protocol.as_deref()) == protocol(svc_port.protocol.as_deref())
        }
    }
}

/// Selects the ready endpoints that belong to `pods`.
fn endpoints_for_pods(endpoints: &Endpoints, target_port: i32, pods: &[Arc<Pod>]) -> Vec<Endpoint> {
    let mut selected = Vec::new();
    for pod in pods {
        let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()) else {
            continue;
        };
        for subset in endpoints.subsets.iter().flatten() {
            if !subset.ports.iter().flatten().any(|p| p.port == target_port) {
                continue;
            }
            for address in subset.addresses.iter().flatten() {
                if address.ip == ip {
                    selected.push(Endpoint {
                        address: format!("{ip}:{target_port}"),
                        pod: address.target_ref.as_ref().and_then(|r| r.name.clone()),
                        owner: pod_owner(pod),
                    });
                }
            }
        }
    }
    selected
}

/// Identifies the workload controlling a pod.
///
/// Pods created by a ReplicaSet are attributed to its Deployment, whose name is the ReplicaSet's
/// name without the pod template hash.
pub fn pod_owner(pod: &Pod) -> Option<PodOwner> {
    let hash = pod
        .labels()
        .get("pod-template-hash")
        .cloned()
        .unwrap_or_default();
    let mut owner = None;
    for reference in pod.owner_references() {
        let mut kind = "deployment";
        let mut name = reference.name.clone();
        if reference.controller == Some(true) {
            match reference.kind.as_str() {
                "StatefulSet" => kind = "statefulset",
                "DaemonSet" => kind = "daemonset",
                "ReplicaSet" => {
                    if let Some(stripped) = name
                        .strip_suffix(hash.as_str())
                        .and_then(|n| n.strip_suffix('-'))
                    {
                        name = stripped.to_string();
                    }
                }
                _ => {}
            }
        }
        owner = Some(PodOwner { kind, name });
    }
    owner
}
