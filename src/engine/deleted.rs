// walink Engine — Deleted Message Log
//
// Append-only per-number log of auto-deleted outgoing WhatsApp messages,
// kept as one JSON file per number under `deleted_messages_path` and capped
// at `deleted_messages_limit` (oldest records dropped first). Records stay
// in the log until the owner reviews them from Telegram; both review
// outcomes remove the record — the message is already gone on WhatsApp, the
// choice only decides whether the text survives here.

use crate::atoms::error::{BridgeError, BridgeResult};
use crate::engine::config::ConfigStore;
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// ── Record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedMessage {
    pub id: String,
    pub time: String,
    /// Recipient JID / number the message was addressed to.
    pub to: String,
    /// Message text, or `None` for media and other non-text payloads.
    pub body: Option<String>,
}

impl DeletedMessage {
    /// Human-readable body for Telegram presentation.
    pub fn display_body(&self) -> &str {
        self.body.as_deref().unwrap_or("[Media/Unknown]")
    }
}

// ── Log ────────────────────────────────────────────────────────────────

pub struct DeletionLog {
    store: Arc<ConfigStore>,
}

impl DeletionLog {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        DeletionLog { store }
    }

    fn file_for(&self, number: &str) -> PathBuf {
        self.store.with(|c| c.deleted_messages_path.join(format!("{}.json", number)))
    }

    /// Append a timestamped record, trimming to the configured cap.
    /// Returns `Ok(None)` without touching disk when deletion logging is
    /// disabled.
    pub fn record(
        &self,
        number: &str,
        to: &str,
        body: Option<String>,
    ) -> BridgeResult<Option<DeletedMessage>> {
        let (enabled, limit) =
            self.store.with(|c| (c.log_deleted_messages, c.deleted_messages_limit));
        if !enabled {
            return Ok(None);
        }

        let record = DeletedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            time: Utc::now().to_rfc3339(),
            to: to.to_string(),
            body,
        };

        let mut messages = self.read(number)?;
        messages.push(record.clone());
        if messages.len() > limit {
            // FIFO bound: keep the newest `limit` records.
            messages.drain(..messages.len() - limit);
        }
        self.write(number, &messages)?;
        info!("[deleted] Recorded auto-deleted message on {} (log len {})", number, messages.len());
        Ok(Some(record))
    }

    /// Ordered not-yet-reviewed records for one number.
    pub fn pending(&self, number: &str) -> BridgeResult<Vec<DeletedMessage>> {
        self.read(number)
    }

    /// Remove one record by id. Idempotent: `false` when the id is already
    /// gone. Serves both the *keep* and *purge* review actions.
    pub fn resolve(&self, number: &str, id: &str) -> BridgeResult<bool> {
        let mut messages = self.read(number)?;
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Ok(false);
        }
        self.write(number, &messages)?;
        Ok(true)
    }

    /// Drop the entire log for a number.
    pub fn clear(&self, number: &str) -> BridgeResult<()> {
        let path = self.file_for(number);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn read(&self, number: &str) -> BridgeResult<Vec<DeletedMessage>> {
        let path = self.file_for(number);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write(&self, number: &str, messages: &[DeletedMessage]) -> BridgeResult<()> {
        let path = self.file_for(number);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(messages)?;
        std::fs::write(&path, json)
            .map_err(|e| BridgeError::Persistence(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}
