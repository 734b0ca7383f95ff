//! Stable device identity: persisted id string plus the 16-byte beacon digest.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Derives and persists one stable identifier for this device.
///
/// The first call to [`get_identity`](Self::get_identity) prefers a UUID
/// derived from a host-provided seed (so reinstalls on the same machine keep
/// the same id), falls back to a random UUID, and writes the result next to
/// the stores. Every later call returns the persisted value unchanged.
pub struct IdentityProvider {
    path: PathBuf,
    seed: Option<String>,
    cached: Mutex<Option<String>>,
}

impl IdentityProvider {
    pub fn new(path: impl Into<PathBuf>, seed: Option<String>) -> Self {
        Self {
            path: path.into(),
            seed,
            cached: Mutex::new(None),
        }
    }

    /// Idempotent: computes and persists the id once, then always returns
    /// the stored value.
    pub fn get_identity(&self) -> String {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }
        let id = match fs::read_to_string(&self.path) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => {
                let id = generate_identity(self.seed.as_deref());
                if let Some(parent) = self.path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::write(&self.path, &id) {
                    tracing::warn!("failed to persist device id: {e}");
                }
                id
            }
        };
        *cached = Some(id.clone());
        id
    }

    /// 16-byte digest of the identity string, sized to fit a beacon's
    /// vendor-data slot.
    pub fn identity_digest(&self) -> [u8; 16] {
        digest_of(&self.get_identity())
    }
}

fn generate_identity(seed: Option<&str>) -> String {
    match seed {
        Some(seed) if !seed.is_empty() => {
            let digest = Sha256::digest(seed.as_bytes());
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&digest[..16]);
            Uuid::from_bytes(bytes).to_string()
        }
        _ => Uuid::new_v4().to_string(),
    }
}

/// Pure digest of an identity string: first 16 bytes of its SHA-256.
pub fn digest_of(identity: &str) -> [u8; 16] {
    let digest = Sha256::digest(identity.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Uppercase hex rendering of a digest, as shown in the peer registry.
pub fn digest_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02X}")).collect()
}
