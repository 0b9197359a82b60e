// walink Engine — Access Control
//
// The admission state machine that turns an unknown Telegram identity into
// an active user, plus the authorization gates every mutating operation
// passes through.
//
// Flow: unknown user asks for access → a one-time numeric passkey is issued
// and shown to the admin only → the admin hands the key to the person out of
// band → the user redeems it and becomes active. Keys expire after a TTL
// (the original design never expired them).

use crate::atoms::error::{BridgeError, BridgeResult};
use crate::engine::config::{ActivityEntry, ConfigStore, PasskeyEntry, UserRecord};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;
use std::sync::Arc;

pub struct AccessController {
    store: Arc<ConfigStore>,
}

impl AccessController {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        AccessController { store }
    }

    // ── Admission ──────────────────────────────────────────────────────

    /// Issue a passkey for an unknown identity. Returns `None` (no-op) when
    /// the user already exists. The key is returned to the caller so the
    /// bridge can forward it to the admin — never to the requester.
    pub fn request_access(&self, user_id: &str) -> BridgeResult<Option<String>> {
        let ttl = self.store.with(|c| c.passkey_ttl_secs);
        self.store.update(|c| {
            if c.users.contains_key(user_id) {
                return None;
            }
            prune_expired(&mut c.passkeys, ttl);

            // Key space must not collide with an outstanding key.
            let mut rng = rand::thread_rng();
            let key = loop {
                let candidate: String =
                    (0..c.passkey_length).map(|_| rng.gen_range(0..10).to_string()).collect();
                if !c.passkeys.contains_key(&candidate) {
                    break candidate;
                }
            };
            c.passkeys.insert(
                key.clone(),
                PasskeyEntry { user_id: user_id.to_string(), issued_at: Utc::now().to_rfc3339() },
            );
            info!("[access] Passkey issued for pending user {}", user_id);
            Some(key)
        })
    }

    /// Redeem a passkey. Succeeds only when the key exists, has not expired,
    /// and was issued for the calling identity. Any entry that is found is
    /// consumed, success or not; a key that does not exist leaves state
    /// untouched. Every failure is the same generic error.
    pub fn redeem_passkey(&self, user_id: &str, supplied_key: &str) -> BridgeResult<()> {
        let ttl = self.store.with(|c| c.passkey_ttl_secs);
        let granted = self.store.update(|c| {
            let entry = match c.passkeys.remove(supplied_key) {
                Some(entry) => entry,
                None => return false,
            };
            if is_expired(&entry, ttl) {
                warn!("[access] Expired passkey presented by {}", user_id);
                return false;
            }
            if entry.user_id != user_id {
                warn!("[access] Passkey owner mismatch for {}", user_id);
                return false;
            }
            c.users.insert(user_id.to_string(), UserRecord { active: true, ..Default::default() });
            true
        })?;

        if granted {
            info!("[access] User {} activated", user_id);
            Ok(())
        } else {
            Err(BridgeError::InvalidPasskey)
        }
    }

    // ── Gates ──────────────────────────────────────────────────────────

    /// Whether `user_id` is a known, active user. Every mutating session or
    /// deletion-log path checks this first.
    pub fn authorize(&self, user_id: &str) -> bool {
        self.store.with(|c| c.users.get(user_id).map(|u| u.active).unwrap_or(false))
    }

    /// Exact match against the configured admin identity. Admin commands
    /// gate on this alone, independent of `authorize`.
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.store.with(|c| !c.admin_id.is_empty() && c.admin_id == user_id)
    }

    // ── Admin user management ──────────────────────────────────────────

    /// Create an active user directly (admin approval stands in for the
    /// passkey handshake). Returns `false` if the user already exists.
    pub fn add_user(&self, user_id: &str) -> BridgeResult<bool> {
        self.store.update(|c| {
            if c.users.contains_key(user_id) {
                return false;
            }
            c.users.insert(user_id.to_string(), UserRecord { active: true, ..Default::default() });
            info!("[access] User {} added by admin", user_id);
            true
        })
    }

    /// Remove a user entirely. Returns the removed record so the caller can
    /// tear down any live sessions on its numbers.
    pub fn remove_user(&self, user_id: &str) -> BridgeResult<Option<UserRecord>> {
        self.store.update(|c| {
            let removed = c.users.remove(user_id);
            if removed.is_some() {
                info!("[access] User {} removed", user_id);
            }
            removed
        })
    }

    pub fn view_user(&self, user_id: &str) -> Option<UserRecord> {
        self.store.with(|c| c.users.get(user_id).cloned())
    }

    pub fn list_users(&self) -> Vec<(String, UserRecord)> {
        self.store.with(|c| c.users.iter().map(|(id, u)| (id.clone(), u.clone())).collect())
    }

    // ── Activity trail ─────────────────────────────────────────────────

    /// Append a timestamped line to the user's activity log. Skipped when
    /// activity logging is disabled or the user is unknown.
    pub fn log_activity(&self, user_id: &str, message: &str) {
        let enabled = self.store.with(|c| c.log_user_activity);
        if !enabled {
            return;
        }
        let result = self.store.update(|c| {
            if let Some(user) = c.users.get_mut(user_id) {
                user.activity_log
                    .push(ActivityEntry { time: Utc::now().to_rfc3339(), message: message.to_string() });
            }
        });
        if let Err(e) = result {
            warn!("[access] Activity log write failed for {}: {}", user_id, e);
        }
    }
}

// ── Expiry helpers ─────────────────────────────────────────────────────

fn is_expired(entry: &PasskeyEntry, ttl_secs: u64) -> bool {
    if ttl_secs == 0 {
        return false;
    }
    match DateTime::parse_from_rfc3339(&entry.issued_at) {
        Ok(issued) => (Utc::now() - issued.with_timezone(&Utc)).num_seconds() as u64 > ttl_secs,
        // Unparseable timestamp — treat as expired rather than immortal.
        Err(_) => true,
    }
}

fn prune_expired(passkeys: &mut std::collections::BTreeMap<String, PasskeyEntry>, ttl_secs: u64) {
    if ttl_secs == 0 {
        return;
    }
    passkeys.retain(|_, entry| !is_expired(entry, ttl_secs));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::BotConfig;
    use std::path::PathBuf;

    fn test_store() -> Arc<ConfigStore> {
        let path: PathBuf = std::env::temp_dir()
            .join(format!("walink-access-{}", uuid::Uuid::new_v4()))
            .join("config.json");
        let store = Arc::new(ConfigStore::load(path).unwrap());
        store.update(|c| c.admin_id = "100".into()).unwrap();
        store
    }

    fn controller(store: &Arc<ConfigStore>) -> AccessController {
        AccessController::new(store.clone())
    }

    #[test]
    fn request_access_issues_fixed_length_numeric_key() {
        let store = test_store();
        let access = controller(&store);
        let key = access.request_access("200").unwrap().expect("key issued");
        assert_eq!(key.len(), 6);
        assert!(key.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(store.with(|c| c.passkeys[&key].user_id.clone()), "200");
    }

    #[test]
    fn request_access_is_noop_for_known_user() {
        let store = test_store();
        let access = controller(&store);
        access.add_user("200").unwrap();
        assert!(access.request_access("200").unwrap().is_none());
        assert!(store.with(|c| c.passkeys.is_empty()));
    }

    #[test]
    fn redeem_creates_active_user_and_consumes_key() {
        let store = test_store();
        let access = controller(&store);
        let key = access.request_access("200").unwrap().unwrap();
        access.redeem_passkey("200", &key).unwrap();

        assert!(access.authorize("200"));
        let user = access.view_user("200").unwrap();
        assert!(user.active);
        assert!(user.numbers.is_empty());
        assert!(store.with(|c| c.passkeys.is_empty()));
    }

    #[test]
    fn redeem_with_wrong_owner_consumes_key_and_fails_generically() {
        let store = test_store();
        let access = controller(&store);
        let key = access.request_access("200").unwrap().unwrap();

        let err = access.redeem_passkey("999", &key).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPasskey));
        // Key is consumed, so the rightful owner can no longer redeem either.
        assert!(store.with(|c| c.passkeys.is_empty()));
        let err = access.redeem_passkey("200", &key).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPasskey));
        assert!(!access.authorize("200"));
    }

    #[test]
    fn redeem_unknown_key_leaves_state_unchanged() {
        let store = test_store();
        let access = controller(&store);
        let key = access.request_access("200").unwrap().unwrap();

        let err = access.redeem_passkey("200", "000000").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPasskey));
        assert!(store.with(|c| c.passkeys.contains_key(&key)));
    }

    #[test]
    fn expired_passkey_is_rejected() {
        let store = test_store();
        let access = controller(&store);
        let key = access.request_access("200").unwrap().unwrap();
        store
            .update(|c| {
                c.passkeys.get_mut(&key).unwrap().issued_at =
                    (Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339();
            })
            .unwrap();

        let err = access.redeem_passkey("200", &key).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPasskey));
        assert!(!access.authorize("200"));
    }

    #[test]
    fn issuing_prunes_expired_keys() {
        let store = test_store();
        let access = controller(&store);
        let stale = access.request_access("300").unwrap().unwrap();
        store
            .update(|c| {
                c.passkeys.get_mut(&stale).unwrap().issued_at =
                    (Utc::now() - chrono::Duration::seconds(3600)).to_rfc3339();
            })
            .unwrap();

        access.request_access("400").unwrap().unwrap();
        assert!(store.with(|c| !c.passkeys.contains_key(&stale)));
    }

    #[test]
    fn authorize_requires_active_flag() {
        let store = test_store();
        let access = controller(&store);
        store
            .update(|c| {
                c.users.insert("500".into(), UserRecord { active: false, ..Default::default() });
            })
            .unwrap();
        assert!(!access.authorize("500"));
        assert!(!access.authorize("nobody"));
    }

    #[test]
    fn is_admin_exact_match_only() {
        let store = test_store();
        let access = controller(&store);
        assert!(access.is_admin("100"));
        assert!(!access.is_admin("1000"));
        assert!(!access.is_admin(""));
    }

    #[test]
    fn empty_admin_id_matches_nobody() {
        let store = test_store();
        store.update(|c| c.admin_id = String::new()).unwrap();
        let access = controller(&store);
        assert!(!access.is_admin(""));
    }

    #[test]
    fn add_and_remove_user() {
        let store = test_store();
        let access = controller(&store);
        assert!(access.add_user("200").unwrap());
        assert!(!access.add_user("200").unwrap());
        assert!(access.authorize("200"));

        let removed = access.remove_user("200").unwrap();
        assert!(removed.is_some());
        assert!(!access.authorize("200"));
        assert!(access.remove_user("200").unwrap().is_none());
    }

    #[test]
    fn activity_log_respects_toggle() {
        let store = test_store();
        let access = controller(&store);
        access.add_user("200").unwrap();

        access.log_activity("200", "linked 5551234");
        assert_eq!(access.view_user("200").unwrap().activity_log.len(), 1);

        store.update(|c| c.log_user_activity = false).unwrap();
        access.log_activity("200", "unlinked 5551234");
        assert_eq!(access.view_user("200").unwrap().activity_log.len(), 1);

        let config_default = BotConfig::default();
        assert!(config_default.log_user_activity);
    }
}
