use std::{cmp::Ordering, fmt};

/// Identifies a namespaced resource within a single kind.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// The kinds of cluster resources the controller caches.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Kind {
    Ingress,
    VirtualServer,
    VirtualServerRoute,
    TransportServer,
    Policy,
    GlobalConfiguration,
    IngressLink,
    Secret,
    Service,
    Endpoints,
    Pod,
    ConfigMap,
    ApPolicy,
    ApLogConf,
    ApUserSig,
    ApDosPolicy,
    ApDosLogConf,
    DosProtectedResource,
}

/// A resource identity qualified by its kind.
///
/// Resources of different kinds may share a namespace and name, so everything that is keyed
/// across kinds (the work queue, the set of applied configuration, reported problems) uses this
/// type.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct KindedKey {
    pub kind: Kind,
    pub id: ResourceId,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Kind ===

impl Kind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "Ingress",
            Self::VirtualServer => "VirtualServer",
            Self::VirtualServerRoute => "VirtualServerRoute",
            Self::TransportServer => "TransportServer",
            Self::Policy => "Policy",
            Self::GlobalConfiguration => "GlobalConfiguration",
            Self::IngressLink => "IngressLink",
            Self::Secret => "Secret",
            Self::Service => "Service",
            Self::Endpoints => "Endpoints",
            Self::Pod => "Pod",
            Self::ConfigMap => "ConfigMap",
            Self::ApPolicy => "APPolicy",
            Self::ApLogConf => "APLogConf",
            Self::ApUserSig => "APUserSig",
            Self::ApDosPolicy => "APDosPolicy",
            Self::ApDosLogConf => "APDosLogConf",
            Self::DosProtectedResource => "DosProtectedResource",
        }
    }

    pub const fn api_version(&self) -> &'static str {
        match self {
            Self::Ingress => "networking.k8s.io/v1",
            Self::VirtualServer | Self::VirtualServerRoute | Self::Policy => "k8s.nginx.org/v1",
            Self::TransportServer | Self::GlobalConfiguration => "k8s.nginx.org/v1alpha1",
            Self::IngressLink => "cis.f5.com/v1",
            Self::Secret | Self::Service | Self::Endpoints | Self::Pod | Self::ConfigMap => "v1",
            Self::ApPolicy | Self::ApLogConf | Self::ApUserSig => "appprotect.f5.com/v1beta1",
            Self::ApDosPolicy | Self::ApDosLogConf | Self::DosProtectedResource => {
                "appprotectdos.f5.com/v1beta1"
            }
        }
    }

    /// Orders kinds that compete for the same host when their creation timestamps are equal.
    /// Lower values win.
    pub const fn host_precedence(&self) -> u8 {
        match self {
            Self::VirtualServer => 0,
            Self::TransportServer => 1,
            Self::Ingress => 2,
            _ => u8::MAX,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialOrd for Kind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Kind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

// === impl KindedKey ===

impl KindedKey {
    pub fn new(kind: Kind, id: ResourceId) -> Self {
        Self { kind, id }
    }

    pub fn namespace(&self) -> &str {
        &self.id.namespace
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }
}

impl fmt::Display for KindedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl PartialOrd for KindedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keys sort by kind, then namespace, then name.
impl Ord for KindedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_keys() {
        let id = ResourceId::new("ns-1", "cafe");
        assert_eq!(id.to_string(), "ns-1/cafe");
        assert_eq!(
            KindedKey::new(Kind::VirtualServer, id).to_string(),
            "VirtualServer/ns-1/cafe"
        );
    }

    #[test]
    fn orders_by_kind_namespace_name() {
        let mut keys = vec![
            KindedKey::new(Kind::VirtualServer, ResourceId::new("b", "a")),
            KindedKey::new(Kind::VirtualServer, ResourceId::new("a", "z")),
            KindedKey::new(Kind::Ingress, ResourceId::new("z", "z")),
            KindedKey::new(Kind::VirtualServer, ResourceId::new("a", "b")),
        ];
        keys.sort();
        let keys = keys.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                "Ingress/z/z",
                "VirtualServer/a/b",
                "VirtualServer/a/z",
                "VirtualServer/b/a",
            ]
        );
    }
}
