//! Trust-on-first-use store for peripheral identity keys.
//!
//! A JSON file mapping device address to the hex-encoded Ed25519 public key
//! pinned on the first successful handshake. Subsequent handshakes must
//! present the same key; a different key aborts with `IdentityMismatch`.
//! Key rotation is an out-of-band operation (edit or delete the entry).
//!
//! On Unix the file is created with owner-only permissions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BlerpcError, Result};

/// File-backed TOFU store. Cheap to construct; each check reloads the file
/// so concurrent centrals sharing a store see each other's pins.
#[derive(Debug, Clone)]
pub struct KnownKeys {
    path: PathBuf,
}

impl KnownKeys {
    /// Use (and create on first pin) the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify `key` against the pinned key for `address`, pinning it if the
    /// address is unknown.
    pub fn check_or_store(&self, address: &str, key: &[u8; 32]) -> Result<()> {
        let mut entries = self.load()?;
        let hex = hex_encode(key);

        match entries.get(address) {
            Some(pinned) if pinned.eq_ignore_ascii_case(&hex) => Ok(()),
            Some(_) => {
                tracing::warn!(address, "peripheral identity key changed; rejecting");
                Err(BlerpcError::IdentityMismatch)
            }
            None => {
                tracing::info!(address, "pinning peripheral identity key");
                entries.insert(address.to_string(), hex);
                self.save(&entries)
            }
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(entries)?;
        write_private(&self.path, &json)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}
