//! Secrets referenced by configuration, validated by type and memoized per key.

use crate::store::Store;
use ahash::AHashMap as HashMap;
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::Secret;
use std::sync::Arc;
use thiserror::Error;

pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
pub const SECRET_TYPE_CA: &str = "nginx.org/ca";
pub const SECRET_TYPE_JWK: &str = "nginx.org/jwk";
pub const SECRET_TYPE_OIDC: &str = "nginx.org/oidc";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret type {0:?} is not supported")]
    UnsupportedType(String),

    #[error("secret doesn't have {0}")]
    MissingData(&'static str),
}

/// A secret that exists in the cluster, paired with where it is installed and whether it is
/// usable.
///
/// Absence of a reference means the secret does not exist; a reference with an error means it
/// exists but cannot be used.
#[derive(Clone, Debug, PartialEq)]
pub struct SecretReference {
    pub secret: Arc<Secret>,
    pub path: Option<String>,
    pub error: Option<SecretError>,
}

/// Provides secret references to the resolver.
pub trait SecretStore: Send + Sync {
    fn add_or_update_secret(&mut self, secret: Arc<Secret>);
    fn delete_secret(&mut self, id: &ResourceId);

    /// Returns `None` when the secret does not exist.
    fn get_secret(&mut self, id: &ResourceId) -> Option<SecretReference>;

    /// Called before a full resync.
    fn pre_sync(&mut self) {}
}

/// A [`SecretStore`] backed by the secrets cache.
#[derive(Debug)]
pub struct LocalSecretStore {
    secrets: Arc<Store<Secret>>,
    secrets_dir: String,
    references: HashMap<ResourceId, SecretReference>,
}

/// A [`SecretStore`] that serves fixed references.
#[derive(Debug, Default)]
pub struct FakeSecretStore {
    references: HashMap<ResourceId, SecretReference>,
}

pub fn is_supported_secret_type(type_: &str) -> bool {
    matches!(
        type_,
        SECRET_TYPE_TLS | SECRET_TYPE_CA | SECRET_TYPE_JWK | SECRET_TYPE_OIDC
    )
}

pub fn secret_type(secret: &Secret) -> &str {
    secret.type_.as_deref().unwrap_or("Opaque")
}

/// Checks that a secret carries the data its type requires.
pub fn validate_secret(secret: &Secret) -> Result<(), SecretError> {
    let required: &[&'static str] = match secret_type(secret) {
        SECRET_TYPE_TLS => &["tls.crt", "tls.key"],
        SECRET_TYPE_CA => &["ca.crt"],
        SECRET_TYPE_JWK => &["jwk"],
        SECRET_TYPE_OIDC => &["client-secret"],
        other => return Err(SecretError::UnsupportedType(other.to_string())),
    };

    for &key in required {
        let present = secret
            .data
            .as_ref()
            .is_some_and(|data| data.contains_key(key))
            || secret
                .string_data
                .as_ref()
                .is_some_and(|data| data.contains_key(key));
        if !present {
            return Err(SecretError::MissingData(key));
        }
    }
    Ok(())
}

// === impl SecretReference ===

impl SecretReference {
    pub fn secret_type(&self) -> &str {
        secret_type(&self.secret)
    }
}

// === impl LocalSecretStore ===

impl LocalSecretStore {
    pub fn new(secrets: Arc<Store<Secret>>, secrets_dir: impl Into<String>) -> Self {
        Self {
            secrets,
            secrets_dir: secrets_dir.into(),
            references: HashMap::default(),
        }
    }

    fn reference(&self, id: &ResourceId, secret: Arc<Secret>) -> SecretReference {
        match validate_secret(&secret) {
            Ok(()) => {
                // OIDC client secrets are rendered inline rather than installed as files.
                let path = (secret_type(&secret) != SECRET_TYPE_OIDC).then(|| {
                    format!("{}/{}-{}", self.secrets_dir, id.namespace, id.name)
                });
                SecretReference {
                    secret,
                    path,
                    error: None,
                }
            }
            Err(error) => SecretReference {
                secret,
                path: None,
                error: Some(error),
            },
        }
    }
}

impl SecretStore for LocalSecretStore {
    /// Rebuilds every reference from the cache. Secrets of unsupported types are kept with an
    /// error so that references to them are reported as invalid rather than missing.
    fn pre_sync(&mut self) {
        self.references.clear();
        for (id, secret) in self.secrets.list() {
            let reference = self.reference(&id, secret);
            self.references.insert(id, reference);
        }
        tracing::debug!(secrets = self.references.len(), "Synced secrets");
    }

    fn add_or_update_secret(&mut self, secret: Arc<Secret>) {
        let id = crate::store::id_of(&*secret);
        let reference = self.reference(&id, secret);
        self.references.insert(id, reference);
    }

    fn delete_secret(&mut self, id: &ResourceId) {
        self.references.remove(id);
    }

    /// Memoized references are only served while they describe the cached secret, so a secret
    /// that was replaced or deleted without notice is never reported in its old state.
    fn get_secret(&mut self, id: &ResourceId) -> Option<SecretReference> {
        let Some(secret) = self.secrets.get(id) else {
            self.references.remove(id);
            return None;
        };
        if let Some(reference) = self.references.get(id) {
            if Arc::ptr_eq(&reference.secret, &secret) {
                return Some(reference.clone());
            }
        }

        let reference = self.reference(id, secret);
        self.references.insert(id.clone(), reference.clone());
        Some(reference)
    }
}

// === impl FakeSecretStore ===

impl FakeSecretStore {
    pub fn new(references: impl IntoIterator<Item = (ResourceId, SecretReference)>) -> Self {
        Self {
            references: references.into_iter().collect(),
        }
    }
}

impl SecretStore for FakeSecretStore {
    fn add_or_update_secret(&mut self, _: Arc<Secret>) {}

    fn delete_secret(&mut self, _: &ResourceId) {}

    fn get_secret(&mut self, id: &ResourceId) -> Option<SecretReference> {
        self.references.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::apply_object;
    use ingress_controller_core::Kind;
    use ingress_controller_k8s_api::{ByteString, ObjectMeta};
    use maplit::btreemap;

    fn secret(name: &str, type_: &str, keys: &[&str]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(b"data".to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn validates_by_type() {
        assert_eq!(
            validate_secret(&secret("tls", SECRET_TYPE_TLS, &["tls.crt", "tls.key"])),
            Ok(())
        );
        assert_eq!(
            validate_secret(&secret("tls", SECRET_TYPE_TLS, &["tls.crt"])),
            Err(SecretError::MissingData("tls.key"))
        );
        assert_eq!(
            validate_secret(&secret("ca", SECRET_TYPE_CA, &["ca.crt"])),
            Ok(())
        );
        assert_eq!(
            validate_secret(&secret("jwk", SECRET_TYPE_JWK, &[])),
            Err(SecretError::MissingData("jwk"))
        );
        assert_eq!(
            validate_secret(&secret("opaque", "Opaque", &["x"])),
            Err(SecretError::UnsupportedType("Opaque".to_string()))
        );
    }

    #[test]
    fn local_store_distinguishes_missing_from_invalid() {
        let secrets = Arc::new(Store::new(Kind::Secret));
        apply_object(&secrets, secret("cafe", SECRET_TYPE_TLS, &["tls.crt", "tls.key"]));
        apply_object(&secrets, secret("broken", SECRET_TYPE_TLS, &["tls.crt"]));
        apply_object(&secrets, secret("oidc", SECRET_TYPE_OIDC, &["client-secret"]));

        let mut store = LocalSecretStore::new(secrets.clone(), "/etc/nginx/secrets");
        store.pre_sync();

        let cafe = store
            .get_secret(&ResourceId::new("default", "cafe"))
            .expect("secret must exist");
        assert_eq!(cafe.error, None);
        assert_eq!(cafe.path.as_deref(), Some("/etc/nginx/secrets/default-cafe"));

        let broken = store
            .get_secret(&ResourceId::new("default", "broken"))
            .expect("secret must exist");
        assert_eq!(broken.error, Some(SecretError::MissingData("tls.key")));
        assert_eq!(broken.path, None);

        let oidc = store
            .get_secret(&ResourceId::new("default", "oidc"))
            .expect("secret must exist");
        assert_eq!(oidc.path, None);

        assert_eq!(store.get_secret(&ResourceId::new("default", "missing")), None);

        // Updates replace the memoized reference.
        let (_, fixed) =
            apply_object(&secrets, secret("broken", SECRET_TYPE_TLS, &["tls.crt", "tls.key"]));
        store.add_or_update_secret(fixed);
        let fixed = store
            .get_secret(&ResourceId::new("default", "broken"))
            .expect("secret must exist");
        assert_eq!(fixed.error, None);

        secrets.delete(&ResourceId::new("default", "cafe"));
        store.delete_secret(&ResourceId::new("default", "cafe"));
        assert_eq!(store.get_secret(&ResourceId::new("default", "cafe")), None);
    }

    #[test]
    fn local_store_follows_the_cache() {
        let secrets = Arc::new(Store::new(Kind::Secret));
        apply_object(&secrets, secret("cafe", "Opaque", &["x"]));

        let mut store = LocalSecretStore::new(secrets.clone(), "/etc/nginx/secrets");
        store.pre_sync();
        let id = ResourceId::new("default", "cafe");
        assert_eq!(
            store.get_secret(&id).and_then(|r| r.error),
            Some(SecretError::UnsupportedType("Opaque".to_string()))
        );

        // Replaced without an update being delivered to the store.
        apply_object(&secrets, secret("cafe", SECRET_TYPE_TLS, &["tls.crt", "tls.key"]));
        let replaced = store.get_secret(&id).expect("secret must exist");
        assert_eq!(replaced.secret_type(), SECRET_TYPE_TLS);
        assert_eq!(replaced.error, None);

        // Deleted without a delete being delivered to the store.
        secrets.delete(&id);
        assert_eq!(store.get_secret(&id), None);
    }

    #[test]
    fn fake_store_serves_fixed_references() {
        let id = ResourceId::new("default", "jwk");
        let reference = SecretReference {
            secret: Arc::new(secret("jwk", SECRET_TYPE_JWK, &["jwk"])),
            path: Some("/etc/nginx/secrets/default-jwk".to_string()),
            error: None,
        };
        let mut store = FakeSecretStore::new(btreemap! { id.clone() => reference.clone() });
        store.delete_secret(&id);
        assert_eq!(store.get_secret(&id), Some(reference));
    }
}
