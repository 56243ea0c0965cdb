//! Known hosts verification for SSH host keys
//!
//! Each host may name its own known_hosts file. Files are read once at
//! validation time and shared between hosts that name the same path.
//! Hashed hostnames (`|1|salt|hash`, written with `HashKnownHosts yes`)
//! are matched by HMAC-SHA1 of the lookup key.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

type HmacSha1 = Hmac<Sha1>;

/// Hashed hostname entry: HMAC-SHA1(salt, lookup key) == hash
#[derive(Clone, Debug)]
struct HashedEntry {
    salt: Vec<u8>,
    hash: Vec<u8>,
    key: HostKeyEntry,
}

impl HashedEntry {
    /// Parse `|1|base64salt|base64hash`
    fn parse(field: &str, key: HostKeyEntry) -> Option<Self> {
        let mut parts = field.strip_prefix("|1|")?.split('|');
        let salt = BASE64.decode(parts.next()?).ok()?;
        let hash = BASE64.decode(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { salt, hash, key })
    }

    fn matches(&self, lookup_key: &str) -> bool {
        let Ok(mut mac) = HmacSha1::new_from_slice(&self.salt) else {
            return false;
        };
        mac.update(lookup_key.as_bytes());
        mac.verify_slice(&self.hash).is_ok()
    }
}

/// Parsed known_hosts file
#[derive(Debug)]
pub struct KnownHostsStore {
    /// host lookup key -> keys (supports multiple key types per host)
    hosts: HashMap<String, Vec<HostKeyEntry>>,
    hashed: Vec<HashedEntry>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Read a known_hosts file
    pub fn load(path: &Path) -> Result<Self, SshError> {
        let file = fs::File::open(path).map_err(SshError::IoError)?;
        let reader = BufReader::new(file);
        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();
        let mut hashed = Vec::new();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line.map_err(SshError::IoError)?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    match HashedEntry::parse(hostname, entry.clone()) {
                        Some(hashed_entry) => {
                            hashed.push(hashed_entry);
                            entry_count += 1;
                        }
                        None => warn!("Skipping malformed hashed host in {}", path.display()),
                    }
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts, {} hashed) from {}",
            entry_count,
            hosts.len(),
            hashed.len(),
            path.display()
        );
        Ok(Self {
            hosts,
            hashed,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Normalize a known_hosts hostname field into a lookup key
    fn normalize_hostname(host: &str) -> String {
        // [host]:22 is the same entry as host
        if let Some(rest) = host.strip_prefix('[') {
            if let Some((name, port)) = rest.split_once("]:") {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::make_key(name, port);
                }
            }
            return rest.trim_end_matches(']').to_lowercase();
        }
        host.to_lowercase()
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.public_key_bytes());
        format!("SHA256:{}", BASE64.encode(hasher.finalize()).trim_end_matches('='))
    }

    /// Compute fingerprint from stored base64 key
    fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                format!("SHA256:{}", BASE64.encode(hasher.finalize()).trim_end_matches('='))
            }
            Err(_) => "unknown".to_string(),
        }
    }

    /// Verify a host's public key
    ///
    /// A host may be listed with several keys of the same type; any one of
    /// them matching is enough.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().to_string();
        let fingerprint = Self::fingerprint(key);

        let plain = self.hosts.get(&lookup_key).into_iter().flatten();
        let hashed = self
            .hashed
            .iter()
            .filter(|h| h.matches(&lookup_key))
            .map(|h| &h.key);
        let same_type: Vec<&HostKeyEntry> = plain
            .chain(hashed)
            .filter(|e| e.key_type == actual_key_type)
            .collect();

        if same_type.iter().any(|e| e.key_data == actual_key_b64) {
            debug!("Host key verified for {} (type: {})", lookup_key, actual_key_type);
            return HostKeyVerification::Verified;
        }

        let Some(expected) = same_type.first() else {
            debug!("No {} key stored for {}", actual_key_type, lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        let expected_fingerprint = Self::compute_fingerprint_from_b64(&expected.key_data);
        warn!(
            "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
            lookup_key, actual_key_type, expected_fingerprint, fingerprint
        );
        HostKeyVerification::Changed {
            expected_fingerprint,
            actual_fingerprint: fingerprint,
        }
    }
}
