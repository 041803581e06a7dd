//! Device identity: a stable per-device id sourced from the host OS,
//! plus a single persisted opaque device token.
//!
//! The token file follows the same read/parse/write-via-temp-then-
//! rename pattern this workspace's session-state files use: set once,
//! reread on process start, atomically replaced on write.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Stable device id plus a single opaque, set-once device token.
pub trait DeviceIdentity: Send + Sync {
    /// Stable identifier for this device. Opaque; only presence and
    /// stability matter to the core.
    fn device_id(&self) -> &str;

    /// The currently persisted token, if one has been set.
    fn token(&self) -> Option<String>;

    /// Persist a new token, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the token file cannot be written.
    fn set_token(&self, token: String) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenRecord {
    token: String,
}

/// Filesystem-backed [`DeviceIdentity`]: device id from `/etc/machine-id`
/// (falling back to `/var/lib/dbus/machine-id`), token from a JSON file.
pub struct FilesystemDeviceIdentity {
    device_id: String,
    token_path: PathBuf,
    token: Mutex<Option<String>>,
}

impl FilesystemDeviceIdentity {
    /// Read the host's machine id and any previously persisted token.
    ///
    /// # Errors
    ///
    /// Returns an error if no machine id file is readable, or if the
    /// token file exists but cannot be read or parsed.
    pub fn load(token_path: PathBuf) -> Result<Self> {
        let device_id = read_machine_id()?;
        let token = read_token(&token_path)?;
        Ok(Self {
            device_id,
            token_path,
            token: Mutex::new(token),
        })
    }
}

fn read_machine_id() -> Result<String> {
    for candidate in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = std::fs::read_to_string(candidate) {
            let id = contents.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
    }
    bail!("no machine id found at /etc/machine-id or /var/lib/dbus/machine-id")
}

fn read_token(path: &std::path::Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read device token: {}", path.display()))?;
    let record: TokenRecord = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse device token: {}", path.display()))?;
    Ok(Some(record.token))
}

impl DeviceIdentity for FilesystemDeviceIdentity {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn set_token(&self, token: String) -> Result<()> {
        if let Some(parent) = self.token_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create device state dir: {}", parent.display()))?;
        }

        let record = TokenRecord { token: token.clone() };
        let contents = serde_json::to_string_pretty(&record).context("failed to serialize device token")?;

        let tmp_path = self.token_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("failed to write temp device token: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.token_path)
            .with_context(|| format!("failed to rename device token into place: {}", self.token_path.display()))?;

        *self.token.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rc-agent-device-test-{name}-{:?}.json", std::thread::current().id()))
    }

    #[test]
    fn fresh_token_path_starts_with_no_token() {
        let path = scratch_path("fresh");
        let _ = std::fs::remove_file(&path);
        let identity = FilesystemDeviceIdentity::load(path.clone()).expect("machine id should be readable in test env");
        assert_eq!(identity.token(), None);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn set_token_persists_and_rereads() {
        let path = scratch_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let identity = FilesystemDeviceIdentity::load(path.clone()).unwrap();
        identity.set_token("abc123".to_string()).expect("token write should succeed");
        assert_eq!(identity.token(), Some("abc123".to_string()));

        let reloaded = FilesystemDeviceIdentity::load(path.clone()).unwrap();
        assert_eq!(reloaded.token(), Some("abc123".to_string()));

        std::fs::remove_file(&path).ok();
    }
}
