//! Identity and known_hosts loading
//!
//! Each distinct file is read once; hosts naming the same path share the
//! decoded key or the parsed known_hosts store.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::PrivateKey;

use crate::config::expand_tilde;
use crate::ssh::KnownHostsStore;

#[derive(Default)]
pub struct CredentialCache {
    identities: HashMap<PathBuf, Arc<PrivateKey>>,
    known_hosts: HashMap<PathBuf, Arc<KnownHostsStore>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a private key, returning a human-readable reason on failure
    pub fn identity(
        &mut self,
        path: &str,
        passphrase: Option<&str>,
    ) -> Result<Arc<PrivateKey>, String> {
        let path = expand_tilde(path);
        if let Some(key) = self.identities.get(&path) {
            return Ok(key.clone());
        }

        check_readable(&path)?;
        let key = russh::keys::load_secret_key(&path, passphrase).map_err(|e| {
            match passphrase {
                Some(_) => format!("cannot be decoded: {}", e),
                None => format!("cannot be decoded (encrypted keys need a passphrase): {}", e),
            }
        })?;

        let key = Arc::new(key);
        self.identities.insert(path, key.clone());
        Ok(key)
    }

    /// Parse a known_hosts file, returning a human-readable reason on failure
    pub fn known_hosts(&mut self, path: &str) -> Result<Arc<KnownHostsStore>, String> {
        let path = expand_tilde(path);
        if let Some(store) = self.known_hosts.get(&path) {
            return Ok(store.clone());
        }

        check_readable(&path)?;
        let store = Arc::new(KnownHostsStore::load(&path).map_err(|e| e.to_string())?);
        self.known_hosts.insert(path, store.clone());
        Ok(store)
    }
}

fn check_readable(path: &Path) -> Result<(), String> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => "file not found".to_string(),
        ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => e.to_string(),
    })?;
    if metadata.is_dir() {
        return Err("file is a directory".to_string());
    }
    std::fs::File::open(path).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn testdata(name: &str) -> String {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_identity_is_shared() {
        let mut cache = CredentialCache::new();
        let first = cache.identity(&testdata("id_ed25519"), None).unwrap();
        let second = cache.identity(&testdata("id_ed25519"), None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_protected_identity_needs_passphrase() {
        let mut cache = CredentialCache::new();
        assert!(cache
            .identity(&testdata("id_ed25519_protected"), Some("secret"))
            .is_ok());

        let mut cache = CredentialCache::new();
        let err = cache
            .identity(&testdata("id_ed25519_protected"), None)
            .unwrap_err();
        assert!(err.contains("passphrase"));
    }

    #[test]
    fn test_unreadable_files() {
        let dir = tempdir().unwrap();
        let mut cache = CredentialCache::new();

        let missing = dir.path().join("missing").to_string_lossy().into_owned();
        assert_eq!(cache.identity(&missing, None).unwrap_err(), "file not found");

        let as_dir = dir.path().to_string_lossy().into_owned();
        assert_eq!(cache.known_hosts(&as_dir).unwrap_err(), "file is a directory");

        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, "not a key").unwrap();
        assert!(cache
            .identity(&garbage.to_string_lossy(), None)
            .unwrap_err()
            .starts_with("cannot be decoded"));
    }

    #[test]
    fn test_known_hosts_loaded_once() {
        let mut cache = CredentialCache::new();
        let first = cache.known_hosts(&testdata("known_hosts")).unwrap();
        let second = cache.known_hosts(&testdata("known_hosts")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
