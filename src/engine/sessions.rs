// walink Engine — Session Registry
//
// Owns the {telegram user → {number → live connection handle}} map. Starting
// a session delegates the protocol work to the `WhatsAppClient` seam and
// hands the event receiver back to the caller (the event bridge pumps it —
// one subscription per session, installed once at creation). Stopping always
// deregisters, whether or not the remote logout succeeded.
//
// Lightweight per-number metadata ({linked_to, status, messages_deleted})
// lives in one JSON file per number and may outlive the in-memory handle
// across restarts; a dead handle is never resurrected, restart re-pairs.

use crate::atoms::error::{BridgeError, BridgeResult};
use crate::engine::config::ConfigStore;
use crate::engine::whatsapp::{ConnectionHandle, LinkMethod, SessionEvent, WhatsAppClient};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Per-number metadata ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub linked_to: String,
    pub number: String,
    pub status: String,
    pub messages_deleted: u64,
}

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_CLOSED: &str = "closed";

// ── Start outcome ──────────────────────────────────────────────────────

pub enum StartOutcome {
    /// A live connection already existed; duplicate start is a no-op.
    AlreadyActive,
    /// Fresh connection. The receiver must be pumped by exactly one task.
    Started { handle: Arc<dyn ConnectionHandle>, events: mpsc::Receiver<SessionEvent> },
}

// ── Registry ───────────────────────────────────────────────────────────

pub struct SessionRegistry {
    store: Arc<ConfigStore>,
    client: Arc<dyn WhatsAppClient>,
    active: Mutex<HashMap<String, HashMap<String, Arc<dyn ConnectionHandle>>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<ConfigStore>, client: Arc<dyn WhatsAppClient>) -> Self {
        SessionRegistry { store, client, active: Mutex::new(HashMap::new()) }
    }

    /// Start a session for (user, number). Idempotent on live pairs.
    pub async fn start(
        &self,
        user_id: &str,
        number: &str,
        method: LinkMethod,
    ) -> BridgeResult<StartOutcome> {
        if self.is_active(user_id, number) {
            info!("[sessions] Session already running: {} ({})", number, user_id);
            return Ok(StartOutcome::AlreadyActive);
        }

        let connection = self.client.connect(number, method).await?;

        {
            let mut active = self.active.lock();
            let numbers = active.entry(user_id.to_string()).or_default();
            if numbers.contains_key(number) {
                // Lost a start race while pairing was in flight — keep the
                // first connection, drop this one.
                let handle = connection.handle.clone();
                tokio::spawn(async move {
                    let _ = handle.logout().await;
                });
                return Ok(StartOutcome::AlreadyActive);
            }
            numbers.insert(number.to_string(), connection.handle.clone());
        }

        // Persist the link and the per-number metadata.
        self.store.update(|c| {
            if let Some(user) = c.users.get_mut(user_id) {
                if !user.numbers.iter().any(|n| n == number) {
                    user.numbers.push(number.to_string());
                }
            }
        })?;
        let meta = self.load_meta(number)?.unwrap_or(SessionMeta {
            linked_to: user_id.to_string(),
            number: number.to_string(),
            status: STATUS_ACTIVE.into(),
            messages_deleted: 0,
        });
        // `linked_to` follows the current owner; a number re-linked by a
        // different user must not keep the previous one in its metadata.
        self.save_meta(&SessionMeta {
            linked_to: user_id.to_string(),
            status: STATUS_ACTIVE.into(),
            ..meta
        })?;

        info!("[sessions] Session started: {} ({}, {})", number, user_id, method.as_str());
        Ok(StartOutcome::Started { handle: connection.handle, events: connection.events })
    }

    /// Stop a session. No-op (`false`) when no live connection exists.
    /// Logout failures are logged, never surfaced — the handle is
    /// deregistered regardless.
    pub async fn stop(&self, user_id: &str, number: &str) -> BridgeResult<bool> {
        let handle = {
            let mut active = self.active.lock();
            match active.get_mut(user_id) {
                Some(numbers) => numbers.remove(number),
                None => None,
            }
        };
        let handle = match handle {
            Some(h) => h,
            None => return Ok(false),
        };

        if let Err(e) = handle.logout().await {
            warn!("[sessions] Logout error for {}: {}", number, e);
        }

        self.store.update(|c| {
            if let Some(user) = c.users.get_mut(user_id) {
                user.numbers.retain(|n| n != number);
            }
        })?;
        self.mark_status(number, STATUS_CLOSED)?;

        info!("[sessions] Session stopped: {} ({})", number, user_id);
        Ok(true)
    }

    /// Bookkeeping removal on connection loss. The number stays in the
    /// user's persisted list so a restart re-initiates pairing.
    pub fn deregister(&self, user_id: &str, number: &str) -> bool {
        let removed = {
            let mut active = self.active.lock();
            active.get_mut(user_id).map(|n| n.remove(number).is_some()).unwrap_or(false)
        };
        if removed {
            if let Err(e) = self.mark_status(number, STATUS_CLOSED) {
                warn!("[sessions] Metadata write failed for {}: {}", number, e);
            }
        }
        removed
    }

    pub fn is_active(&self, user_id: &str, number: &str) -> bool {
        self.active.lock().get(user_id).map(|n| n.contains_key(number)).unwrap_or(false)
    }

    /// Snapshot of live (user, numbers) pairs — one user's, or the whole
    /// registry when `user_id` is None.
    pub fn list(&self, user_id: Option<&str>) -> Vec<(String, Vec<String>)> {
        let active = self.active.lock();
        let mut out: Vec<(String, Vec<String>)> = active
            .iter()
            .filter(|(uid, _)| user_id.map(|u| u == uid.as_str()).unwrap_or(true))
            .map(|(uid, numbers)| {
                let mut nums: Vec<String> = numbers.keys().cloned().collect();
                nums.sort();
                (uid.clone(), nums)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    // ── Metadata files ─────────────────────────────────────────────────

    fn meta_path(&self, number: &str) -> PathBuf {
        self.store.with(|c| c.whatsapp_sessions_path.join(format!("{}.json", number)))
    }

    pub fn load_meta(&self, number: &str) -> BridgeResult<Option<SessionMeta>> {
        let path = self.meta_path(number);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save_meta(&self, meta: &SessionMeta) -> BridgeResult<()> {
        let path = self.meta_path(&meta.number);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(meta)?;
        std::fs::write(&path, json)
            .map_err(|e| BridgeError::Persistence(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    fn mark_status(&self, number: &str, status: &str) -> BridgeResult<()> {
        if let Some(meta) = self.load_meta(number)? {
            self.save_meta(&SessionMeta { status: status.into(), ..meta })?;
        }
        Ok(())
    }

    /// Bump the auto-delete counter in the number's metadata file.
    pub fn bump_deleted_count(&self, number: &str) {
        let result = (|| -> BridgeResult<()> {
            if let Some(meta) = self.load_meta(number)? {
                self.save_meta(&SessionMeta { messages_deleted: meta.messages_deleted + 1, ..meta })?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!("[sessions] Counter update failed for {}: {}", number, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::UserRecord;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHandle;

    #[async_trait]
    impl ConnectionHandle for FakeHandle {
        async fn delete_message(&self, _to: &str, _id: &str) -> BridgeResult<()> {
            Ok(())
        }
        async fn logout(&self) -> BridgeResult<()> {
            Ok(())
        }
    }

    struct FakeClient {
        connects: AtomicUsize,
        fail_numbers: Vec<String>,
    }

    impl FakeClient {
        fn new() -> Self {
            FakeClient { connects: AtomicUsize::new(0), fail_numbers: vec![] }
        }
    }

    #[async_trait]
    impl WhatsAppClient for FakeClient {
        async fn connect(
            &self,
            number: &str,
            _method: LinkMethod,
        ) -> BridgeResult<crate::engine::whatsapp::Connection> {
            if self.fail_numbers.iter().any(|n| n == number) {
                return Err(BridgeError::connection(number, "pairing refused"));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (_tx, rx) = mpsc::channel(8);
            Ok(crate::engine::whatsapp::Connection { handle: Arc::new(FakeHandle), events: rx })
        }
    }

    fn setup(client: FakeClient) -> (Arc<ConfigStore>, Arc<FakeClient>, SessionRegistry) {
        let dir = std::env::temp_dir().join(format!("walink-sessions-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(ConfigStore::load(dir.join("config.json")).unwrap());
        store
            .update(|c| {
                c.whatsapp_sessions_path = dir.join("sessions");
                c.users.insert("200".into(), UserRecord { active: true, ..Default::default() });
            })
            .unwrap();
        let client = Arc::new(client);
        let registry = SessionRegistry::new(store.clone(), client.clone());
        (store, client, registry)
    }

    #[tokio::test]
    async fn double_start_yields_one_connection() {
        let (_store, client, registry) = setup(FakeClient::new());
        let first = registry.start("200", "5551234", LinkMethod::Qr).await.unwrap();
        assert!(matches!(first, StartOutcome::Started { .. }));
        let second = registry.start("200", "5551234", LinkMethod::Qr).await.unwrap();
        assert!(matches!(second, StartOutcome::AlreadyActive));
        assert_eq!(client.connects.load(Ordering::SeqCst), 1);
        assert_eq!(registry.list(Some("200")), vec![("200".into(), vec!["5551234".into()])]);
    }

    #[tokio::test]
    async fn start_persists_number_and_metadata() {
        let (store, _client, registry) = setup(FakeClient::new());
        registry.start("200", "5551234", LinkMethod::Phone).await.unwrap();

        assert_eq!(store.with(|c| c.users["200"].numbers.clone()), vec!["5551234"]);
        let meta = registry.load_meta("5551234").unwrap().unwrap();
        assert_eq!(meta.linked_to, "200");
        assert_eq!(meta.status, STATUS_ACTIVE);
        assert_eq!(meta.messages_deleted, 0);
    }

    #[tokio::test]
    async fn relink_by_another_user_updates_metadata_owner() {
        let (store, _client, registry) = setup(FakeClient::new());
        store
            .update(|c| {
                c.users.insert("300".into(), UserRecord { active: true, ..Default::default() });
            })
            .unwrap();

        registry.start("200", "5551234", LinkMethod::Qr).await.unwrap();
        registry.stop("200", "5551234").await.unwrap();
        registry.start("300", "5551234", LinkMethod::Qr).await.unwrap();

        let meta = registry.load_meta("5551234").unwrap().unwrap();
        assert_eq!(meta.linked_to, "300");
        assert_eq!(meta.status, STATUS_ACTIVE);
    }

    #[tokio::test]
    async fn stop_is_noop_without_live_connection() {
        let (_store, _client, registry) = setup(FakeClient::new());
        assert!(!registry.stop("200", "5551234").await.unwrap());
    }

    #[tokio::test]
    async fn stop_deregisters_and_unlists_number() {
        let (store, _client, registry) = setup(FakeClient::new());
        registry.start("200", "5551234", LinkMethod::Qr).await.unwrap();
        assert!(registry.stop("200", "5551234").await.unwrap());

        assert!(!registry.is_active("200", "5551234"));
        assert!(store.with(|c| c.users["200"].numbers.is_empty()));
        let meta = registry.load_meta("5551234").unwrap().unwrap();
        assert_eq!(meta.status, STATUS_CLOSED);
    }

    #[tokio::test]
    async fn deregister_keeps_number_for_restore() {
        let (store, _client, registry) = setup(FakeClient::new());
        registry.start("200", "5551234", LinkMethod::Qr).await.unwrap();
        assert!(registry.deregister("200", "5551234"));
        assert!(!registry.deregister("200", "5551234"));

        assert!(!registry.is_active("200", "5551234"));
        // Number survives for restart-time re-pairing.
        assert_eq!(store.with(|c| c.users["200"].numbers.clone()), vec!["5551234"]);
    }

    #[tokio::test]
    async fn connect_failure_registers_nothing() {
        let (store, _client, registry) = setup(FakeClient {
            connects: AtomicUsize::new(0),
            fail_numbers: vec!["5550000".into()],
        });
        let result = registry.start("200", "5550000", LinkMethod::Qr).await;
        assert!(matches!(result, Err(BridgeError::Connection { .. })));
        assert!(!registry.is_active("200", "5550000"));
        assert!(store.with(|c| c.users["200"].numbers.is_empty()));
    }

    #[tokio::test]
    async fn bump_deleted_count_increments_metadata() {
        let (_store, _client, registry) = setup(FakeClient::new());
        registry.start("200", "5551234", LinkMethod::Qr).await.unwrap();
        registry.bump_deleted_count("5551234");
        registry.bump_deleted_count("5551234");
        assert_eq!(registry.load_meta("5551234").unwrap().unwrap().messages_deleted, 2);
    }
}
