// walink Engine — Config Store
//
// The single durable, shared-mutable resource of the process: users,
// passkeys, admin identity, and feature flags, persisted as one JSON
// document. Every mutation goes through `update()`, which holds the lock
// across read-modify-persist so two concurrent mutations of the same entry
// can never lose a write against the whole-file overwrite underneath.

use crate::atoms::error::{BridgeError, BridgeResult};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ── Records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub time: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub active: bool,
    /// Linked WhatsApp numbers, in link order.
    pub numbers: Vec<String>,
    /// Append-only activity trail (gated by `log_user_activity`).
    pub activity_log: Vec<ActivityEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasskeyEntry {
    /// The Telegram identity this key was issued for.
    pub user_id: String,
    /// RFC-3339 issuance time; expiry is checked lazily against
    /// `passkey_ttl_secs`.
    pub issued_at: String,
}

// ── Config Struct ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub bot_token: String,
    /// Telegram user id of the operator. Admin commands compare exactly
    /// against this.
    pub admin_id: String,
    pub users: BTreeMap<String, UserRecord>,
    /// Outstanding one-time passkeys: key digits → pending identity.
    pub passkeys: BTreeMap<String, PasskeyEntry>,
    pub notify_admin_on_access_attempt: bool,
    pub passkey_length: usize,
    /// Seconds an unconsumed passkey stays redeemable. 0 disables expiry.
    pub passkey_ttl_secs: u64,
    pub whatsapp_sessions_path: PathBuf,
    pub deleted_messages_path: PathBuf,
    pub deleted_messages_limit: usize,
    pub log_deleted_messages: bool,
    pub log_user_activity: bool,
    /// When set, every outgoing WhatsApp message on a linked number is
    /// deleted immediately after send and logged for review.
    pub auto_delete: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        BotConfig {
            bot_token: String::new(),
            admin_id: String::new(),
            users: BTreeMap::new(),
            passkeys: BTreeMap::new(),
            notify_admin_on_access_attempt: true,
            passkey_length: 6,
            passkey_ttl_secs: 900,
            whatsapp_sessions_path: PathBuf::from("./sessions"),
            deleted_messages_path: PathBuf::from("./deleted_messages"),
            deleted_messages_limit: 1000,
            log_deleted_messages: true,
            log_user_activity: true,
            auto_delete: false,
        }
    }
}

// ── Store ──────────────────────────────────────────────────────────────

/// Owns the config document. Constructed once at startup and handed to every
/// component as `Arc<ConfigStore>` — no ambient globals.
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<BotConfig>,
}

impl ConfigStore {
    /// Load the config from `path`, creating it with defaults on first run.
    /// Also ensures the sessions / deleted-messages directories exist.
    /// A parse failure here is fatal: a half-read config must not silently
    /// reset user and passkey state.
    pub fn load(path: impl Into<PathBuf>) -> BridgeResult<Self> {
        let path = path.into();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<BotConfig>(&raw)
                .map_err(|e| BridgeError::Config(format!("parse {}: {}", path.display(), e)))?
        } else {
            let config = BotConfig::default();
            write_json(&path, &config)?;
            info!("[config] Created default config at {}", path.display());
            config
        };

        std::fs::create_dir_all(&config.whatsapp_sessions_path)?;
        std::fs::create_dir_all(&config.deleted_messages_path)?;

        Ok(ConfigStore { path, inner: Mutex::new(config) })
    }

    /// Read access under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&BotConfig) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Mutate-then-persist as one critical section. The closure runs on a
    /// staged copy that replaces the in-memory config only after the write
    /// succeeded, so a persist failure never leaves memory and disk
    /// disagreeing and callers never act on state that was not durably
    /// recorded.
    pub fn update<R>(&self, f: impl FnOnce(&mut BotConfig) -> R) -> BridgeResult<R> {
        let mut config = self.inner.lock();
        let mut staged = config.clone();
        let result = f(&mut staged);
        write_json(&self.path, &staged)
            .map_err(|e| BridgeError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        *config = staged;
        Ok(result)
    }
}

/// Whole-file overwrite via temp + rename, so a crash mid-write never leaves
/// a truncated config behind.
fn write_json<T: Serialize>(path: &Path, value: &T) -> BridgeResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("walink-test-{}", uuid::Uuid::new_v4()))
            .join("config.json")
    }

    #[test]
    fn load_creates_default_file() {
        let path = temp_config_path();
        let store = ConfigStore::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.with(|c| c.passkey_length), 6);
        assert!(store.with(|c| c.users.is_empty()));
    }

    #[test]
    fn update_persists_and_reloads() {
        let path = temp_config_path();
        {
            let store = ConfigStore::load(&path).unwrap();
            store
                .update(|c| {
                    c.admin_id = "100".into();
                    c.users.insert("200".into(), UserRecord { active: true, ..Default::default() });
                })
                .unwrap();
        }
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.with(|c| c.admin_id.clone()), "100");
        assert!(store.with(|c| c.users["200"].active));
    }

    #[test]
    fn update_returns_closure_result() {
        let store = ConfigStore::load(temp_config_path()).unwrap();
        let had_user = store.update(|c| c.users.contains_key("nobody")).unwrap();
        assert!(!had_user);
    }

    #[test]
    fn failed_persist_leaves_memory_unchanged() {
        let path = temp_config_path();
        let store = ConfigStore::load(&path).unwrap();
        // Occupy the temp slot with a directory so the next write fails.
        std::fs::create_dir_all(path.with_extension("json.tmp")).unwrap();

        let err = store.update(|c| c.admin_id = "100".into()).unwrap_err();
        assert!(matches!(err, BridgeError::Persistence(_)));
        assert_eq!(store.with(|c| c.admin_id.clone()), "");

        // A later successful update must not smuggle the failed change in.
        std::fs::remove_dir(path.with_extension("json.tmp")).unwrap();
        store.update(|c| c.passkey_length = 8).unwrap();
        assert_eq!(store.with(|c| c.admin_id.clone()), "");
        assert_eq!(store.with(|c| c.passkey_length), 8);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"admin_id":"1","check_interval":0.1}"#).unwrap();
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.with(|c| c.admin_id.clone()), "1");
        assert_eq!(store.with(|c| c.deleted_messages_limit), 1000);
    }
}
