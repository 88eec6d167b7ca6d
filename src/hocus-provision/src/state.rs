//! Provisioning state and the local material directory.
//!
//! The local directory mirrors the store's object names one-to-one, so a
//! materialized state can always be pushed back remotely without renaming.
//! The provisioner is the sole writer of these paths.

use crate::error::ProvisionError;
use crate::store;
use hocus_pki::{Identity, IdentityRole};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// The full identity set for one deployment.
///
/// Exactly one CA, one server identity, and one client identity per known
/// device. Grows monotonically; removal is an out-of-band operation.
#[derive(Debug, Clone)]
pub struct ProvisioningState {
    pub ca: Identity,
    pub server: Identity,
    pub clients: BTreeMap<String, Identity>,
}

impl ProvisioningState {
    pub fn has_client(&self, device: &str) -> bool {
        self.clients.contains_key(device)
    }

    /// Whether the server certificate names the given public address.
    pub fn server_covers(&self, addr: IpAddr) -> bool {
        self.server.covers_address(addr)
    }
}

/// Local on-disk mirror of the store's namespace.
#[derive(Debug, Clone)]
pub struct MaterialDir {
    root: PathBuf,
}

impl MaterialDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, object: &str) -> PathBuf {
        self.root.join(object)
    }

    pub fn exists(&self, object: &str) -> bool {
        self.path(object).is_file()
    }

    pub fn read(&self, object: &str) -> Result<Vec<u8>, ProvisionError> {
        let path = self.path(object);
        std::fs::read(&path).map_err(|e| ProvisionError::io(path, e))
    }

    pub fn read_string(&self, object: &str) -> Result<String, ProvisionError> {
        let path = self.path(object);
        std::fs::read_to_string(&path).map_err(|e| ProvisionError::io(path, e))
    }

    /// Write an object, creating parents. Objects under `private/` get
    /// owner-only permissions.
    pub fn write(&self, object: &str, data: &[u8]) -> Result<(), ProvisionError> {
        let path = self.path(object);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProvisionError::io(parent, e))?;
        }
        std::fs::write(&path, data).map_err(|e| ProvisionError::io(&path, e))?;
        #[cfg(unix)]
        if object.starts_with("private/") {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ProvisionError::io(&path, e))?;
        }
        Ok(())
    }

    /// Persist an identity's cert and key under the given object names.
    pub fn write_identity(
        &self,
        identity: &Identity,
        cert_object: &str,
        key_object: &str,
    ) -> Result<(), ProvisionError> {
        self.write(cert_object, identity.cert_pem.as_bytes())?;
        self.write(key_object, identity.key_pem.as_bytes())
    }

    /// Load an identity from a cert/key object pair, if both are present.
    pub fn load_identity(
        &self,
        role: IdentityRole,
        cert_object: &str,
        key_object: &str,
    ) -> Result<Option<Identity>, ProvisionError> {
        if !(self.exists(cert_object) && self.exists(key_object)) {
            return Ok(None);
        }
        let cert_pem = self.read_string(cert_object)?;
        let key_pem = self.read_string(key_object)?;
        match Identity::from_pem_parts(role, cert_pem, key_pem) {
            Ok(identity) => Ok(Some(identity)),
            // unparseable local material is treated as absent, the caller
            // falls through to restore or bootstrap
            Err(e) => {
                tracing::warn!(object = cert_object, error = %e, "ignoring unreadable local identity");
                Ok(None)
            }
        }
    }

    /// Whether a server identity is fully materialized locally.
    pub fn has_server_identity(&self) -> bool {
        self.exists(store::SERVER_CERT) && self.exists(store::SERVER_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_creates_parents_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let dir = MaterialDir::new(tmp.path());
        dir.write(store::CA_CERT, b"cert").unwrap();
        assert!(dir.exists(store::CA_CERT));
        assert_eq!(dir.read(store::CA_CERT).unwrap(), b"cert");
    }

    #[test]
    #[cfg(unix)]
    fn private_objects_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let dir = MaterialDir::new(tmp.path());
        dir.write(store::SERVER_KEY, b"key").unwrap();
        let mode = std::fs::metadata(dir.path(store::SERVER_KEY))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn server_identity_requires_both_halves() {
        let tmp = TempDir::new().unwrap();
        let dir = MaterialDir::new(tmp.path());
        assert!(!dir.has_server_identity());
        dir.write(store::SERVER_CERT, b"cert").unwrap();
        assert!(!dir.has_server_identity());
        dir.write(store::SERVER_KEY, b"key").unwrap();
        assert!(dir.has_server_identity());
    }

    #[test]
    fn load_identity_missing_returns_none() {
        let tmp = TempDir::new().unwrap();
        let dir = MaterialDir::new(tmp.path());
        let loaded = dir
            .load_identity(IdentityRole::Server, store::SERVER_CERT, store::SERVER_KEY)
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_identity_garbage_treated_as_absent() {
        let tmp = TempDir::new().unwrap();
        let dir = MaterialDir::new(tmp.path());
        dir.write(store::SERVER_CERT, b"not a cert").unwrap();
        dir.write(store::SERVER_KEY, b"not a key").unwrap();
        let loaded = dir
            .load_identity(IdentityRole::Server, store::SERVER_CERT, store::SERVER_KEY)
            .unwrap();
        assert!(loaded.is_none());
    }
}
