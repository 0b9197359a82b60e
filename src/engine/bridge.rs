// walink Engine — Event Bridge
//
// The translation layer between the two messaging networks. Telegram
// commands and callbacks come in, pass the authorization gate, and dispatch
// to the access controller, session registry, or deletion log; WhatsApp
// connection and message events come back and are routed to the owning
// Telegram chat. The two protocol adapters never talk to each other
// directly — everything crosses this typed contract.
//
// One task per inbound update, one pump task per live session, so a handler
// awaiting network I/O never stalls dispatch. Within a session, events are
// handled in delivery order; across sessions no ordering is promised.

use crate::atoms::error::{BridgeError, BridgeResult};
use crate::engine::access::AccessController;
use crate::engine::config::ConfigStore;
use crate::engine::deleted::DeletionLog;
use crate::engine::http::reconnect_delay;
use crate::engine::sessions::{SessionRegistry, StartOutcome};
use crate::engine::telegram::{Callback, Command, InlineButton, TelegramApi, TgUpdate};
use crate::engine::whatsapp::{
    ConnectionHandle, LinkMethod, SessionEvent, SessionState, WhatsAppClient,
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct EventBridge {
    store: Arc<ConfigStore>,
    access: AccessController,
    registry: SessionRegistry,
    deleted: DeletionLog,
    telegram: Arc<dyn TelegramApi>,
}

impl EventBridge {
    pub fn new(
        store: Arc<ConfigStore>,
        client: Arc<dyn WhatsAppClient>,
        telegram: Arc<dyn TelegramApi>,
    ) -> Arc<Self> {
        Arc::new(EventBridge {
            access: AccessController::new(store.clone()),
            registry: SessionRegistry::new(store.clone(), client),
            deleted: DeletionLog::new(store.clone()),
            store,
            telegram,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // ── Polling loop ───────────────────────────────────────────────────

    /// Long-poll Telegram until the stop flag is set. Transport failures
    /// reconnect with capped exponential backoff; each update is handled in
    /// its own task.
    pub async fn run(self: &Arc<Self>, stop: Arc<AtomicBool>) -> BridgeResult<()> {
        let mut offset: i64 = 0;
        let mut reconnect_attempt: u32 = 0;

        loop {
            if stop.load(Ordering::Relaxed) {
                info!("[bridge] Stop signal received, exiting poll loop");
                break;
            }

            match self.telegram.get_updates(offset, 30).await {
                Ok(updates) => {
                    reconnect_attempt = 0;
                    for update in updates {
                        offset = update.update_id + 1;
                        let bridge = self.clone();
                        tokio::spawn(async move {
                            bridge.handle_update(update).await;
                        });
                    }
                }
                Err(e) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("[bridge] Poll error: {} — reconnecting", e);
                    let delay = reconnect_delay(reconnect_attempt).await;
                    warn!(
                        "[bridge] Reconnecting in {}ms (attempt {})",
                        delay.as_millis(),
                        reconnect_attempt + 1
                    );
                    reconnect_attempt += 1;
                }
            }
        }

        Ok(())
    }

    // ── Update dispatch ────────────────────────────────────────────────

    pub async fn handle_update(self: &Arc<Self>, update: TgUpdate) {
        if let Some(msg) = update.message {
            let user = match &msg.from {
                Some(u) if !u.is_bot => u,
                _ => return,
            };
            let text = match &msg.text {
                Some(t) if !t.is_empty() => t.clone(),
                _ => return,
            };
            let user_id = user.id.to_string();
            let chat_id = msg.chat.id.to_string();
            if let Some(cmd) = Command::parse(&text) {
                debug!("[bridge] Command from {}: {:?}", user_id, cmd);
                self.handle_command(&user_id, &chat_id, cmd).await;
            }
        } else if let Some(query) = update.callback_query {
            let user_id = query.from.id.to_string();
            let chat_id = query
                .message
                .as_ref()
                .map(|m| m.chat.id.to_string())
                .unwrap_or_else(|| user_id.clone());
            if let Some(cb) = query.data.as_deref().and_then(Callback::parse) {
                debug!("[bridge] Callback from {}: {:?}", user_id, cb);
                self.handle_callback(&user_id, &chat_id, cb).await;
            }
            let _ = self.telegram.answer_callback(&query.id).await;
        }
    }

    async fn handle_command(self: &Arc<Self>, user_id: &str, chat_id: &str, cmd: Command) {
        match cmd {
            Command::Start => self.cmd_start(user_id, chat_id).await,
            Command::RequestPasskey => self.cmd_request_passkey(user_id, chat_id).await,
            Command::Verify(key) => self.cmd_verify(user_id, chat_id, &key).await,
            Command::Link(number) => self.cmd_link(user_id, chat_id, &number).await,
            Command::DeletedMessages => self.cmd_deleted_messages(user_id, chat_id).await,
            Command::AddUser(id) => self.admin_add_user(user_id, chat_id, &id).await,
            Command::RemoveUser(id) => self.admin_remove_user(user_id, chat_id, &id).await,
            Command::ViewUser(id) => self.admin_view_user(user_id, chat_id, &id).await,
            Command::ListUsers => self.admin_list_users(user_id, chat_id).await,
        }
    }

    async fn handle_callback(self: &Arc<Self>, user_id: &str, chat_id: &str, cb: Callback) {
        if !self.access.authorize(user_id) {
            self.notify(chat_id, "You are not authorized.").await;
            return;
        }
        match cb {
            Callback::LinkQr(number) => {
                self.notify(chat_id, &format!("🔗 Linking *{}* via QR Code...", number)).await;
                self.link_and_report(user_id, chat_id, &number, LinkMethod::Qr).await;
            }
            Callback::LinkPhone(number) => {
                self.notify(chat_id, &format!("🔗 Linking *{}* via Phone Number...", number)).await;
                self.link_and_report(user_id, chat_id, &number, LinkMethod::Phone).await;
            }
            Callback::Unlink(number) => {
                self.notify(chat_id, &format!("❌ Unlinking WhatsApp number *{}*...", number)).await;
                match self.registry.stop(user_id, &number).await {
                    Ok(true) => {
                        self.access.log_activity(user_id, &format!("unlinked {}", number));
                        self.notify(chat_id, &format!("⚠️ WhatsApp session unlinked for {}", number))
                            .await;
                    }
                    Ok(false) => {
                        self.notify(chat_id, &format!("No active session for {}.", number)).await;
                    }
                    Err(e) => self.report_failure(chat_id, e).await,
                }
            }
            Callback::Keep(id) => {
                if self.resolve_review(user_id, &id).await {
                    self.notify(chat_id, "✅ Message kept — removed from review list.").await;
                }
            }
            Callback::Delete(id) => {
                if self.resolve_review(user_id, &id).await {
                    self.notify(chat_id, "🗑 Message purged permanently.").await;
                }
            }
        }
    }

    // ── User commands ──────────────────────────────────────────────────

    async fn cmd_start(&self, user_id: &str, chat_id: &str) {
        let known = self.store.with(|c| c.users.contains_key(user_id));
        if !known {
            self.notify(chat_id, "You are not registered. Request access from the admin.").await;
            let (notify_admin, admin_id) =
                self.store.with(|c| (c.notify_admin_on_access_attempt, c.admin_id.clone()));
            if notify_admin && !admin_id.is_empty() {
                self.notify(&admin_id, &format!("User {} attempted access.", user_id)).await;
            }
            return;
        }
        self.notify(
            chat_id,
            "Welcome! You can link/unlink WhatsApp numbers and review deleted messages.",
        )
        .await;
    }

    async fn cmd_request_passkey(&self, user_id: &str, chat_id: &str) {
        match self.access.request_access(user_id) {
            Ok(Some(key)) => {
                let admin_id = self.store.with(|c| c.admin_id.clone());
                if !admin_id.is_empty() {
                    self.notify(
                        &admin_id,
                        &format!("User {} requested access. Passkey: {}", user_id, key),
                    )
                    .await;
                }
                // The requester never sees the key.
                self.notify(chat_id, "Request sent to admin. Await passkey.").await;
            }
            Ok(None) => {
                self.notify(chat_id, "You already have access.").await;
            }
            Err(e) => self.report_failure(chat_id, e).await,
        }
    }

    async fn cmd_verify(&self, user_id: &str, chat_id: &str, key: &str) {
        match self.access.redeem_passkey(user_id, key) {
            Ok(()) => {
                self.access.log_activity(user_id, "access granted");
                self.notify(chat_id, "✅ Access granted!").await;
            }
            Err(BridgeError::InvalidPasskey) => {
                self.notify(chat_id, "❌ Invalid or expired passkey!").await;
            }
            Err(e) => self.report_failure(chat_id, e).await,
        }
    }

    async fn cmd_link(&self, user_id: &str, chat_id: &str, number: &str) {
        if !self.access.authorize(user_id) {
            self.notify(chat_id, "You are not authorized.").await;
            return;
        }
        let keyboard = vec![vec![
            InlineButton::new("📷 QR Code", format!("link_qr_{}", number)),
            InlineButton::new("📱 Phone Number", format!("link_num_{}", number)),
            InlineButton::new("❌ Unlink", format!("unlink_{}", number)),
        ]];
        let text = format!("Choose how to link WhatsApp number *{}*:", number);
        if let Err(e) = self.telegram.send_message_with_keyboard(chat_id, &text, keyboard).await {
            warn!("[bridge] Keyboard send failed for {}: {}", chat_id, e);
        }
    }

    async fn cmd_deleted_messages(&self, user_id: &str, chat_id: &str) {
        if !self.access.authorize(user_id) {
            self.notify(chat_id, "You are not authorized.").await;
            return;
        }
        let numbers = self.store.with(|c| {
            c.users.get(user_id).map(|u| u.numbers.clone()).unwrap_or_default()
        });

        let mut shown = 0usize;
        for number in &numbers {
            let pending = match self.deleted.pending(number) {
                Ok(p) => p,
                Err(e) => {
                    warn!("[bridge] Deleted-message read failed for {}: {}", number, e);
                    continue;
                }
            };
            for record in pending {
                shown += 1;
                let text = format!(
                    "Message {} to {}:\n{}",
                    shown,
                    record.to,
                    record.display_body()
                );
                let keyboard = vec![
                    vec![InlineButton::new("✅ Keep", format!("keep_{}", record.id))],
                    vec![InlineButton::new("🗑 Delete permanently", format!("delete_{}", record.id))],
                ];
                if let Err(e) =
                    self.telegram.send_message_with_keyboard(chat_id, &text, keyboard).await
                {
                    warn!("[bridge] Review send failed for {}: {}", chat_id, e);
                }
            }
        }
        if shown == 0 {
            self.notify(chat_id, "No deleted messages.").await;
        }
    }

    /// Remove a reviewed record from whichever of the user's numbers holds
    /// it. Idempotent: `false` (and no reply) when the id is already gone.
    async fn resolve_review(&self, user_id: &str, record_id: &str) -> bool {
        let numbers = self.store.with(|c| {
            c.users.get(user_id).map(|u| u.numbers.clone()).unwrap_or_default()
        });
        for number in &numbers {
            match self.deleted.resolve(number, record_id) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("[bridge] Review resolve failed for {}: {}", number, e),
            }
        }
        false
    }

    // ── Admin commands ─────────────────────────────────────────────────

    async fn admin_add_user(&self, caller: &str, chat_id: &str, target: &str) {
        if !self.access.is_admin(caller) {
            return;
        }
        match self.access.add_user(target) {
            Ok(true) => {
                self.notify(chat_id, &format!("User {} added successfully.", target)).await
            }
            Ok(false) => self.notify(chat_id, &format!("User {} already exists.", target)).await,
            Err(e) => self.report_failure(chat_id, e).await,
        }
    }

    async fn admin_remove_user(&self, caller: &str, chat_id: &str, target: &str) {
        if !self.access.is_admin(caller) {
            return;
        }
        match self.access.remove_user(target) {
            Ok(Some(record)) => {
                // Tear down whatever the removed user still had live.
                for number in &record.numbers {
                    if let Err(e) = self.registry.stop(target, number).await {
                        warn!("[bridge] Teardown failed for {} ({}): {}", number, target, e);
                    }
                }
                self.notify(chat_id, &format!("User {} removed successfully.", target)).await;
            }
            Ok(None) => self.notify(chat_id, "User not found.").await,
            Err(e) => self.report_failure(chat_id, e).await,
        }
    }

    async fn admin_view_user(&self, caller: &str, chat_id: &str, target: &str) {
        if !self.access.is_admin(caller) {
            return;
        }
        match self.access.view_user(target) {
            Some(record) => {
                let text = serde_json::to_string_pretty(&record)
                    .unwrap_or_else(|_| "<unserializable>".into());
                self.notify(chat_id, &text).await;
            }
            None => self.notify(chat_id, "User not found.").await,
        }
    }

    async fn admin_list_users(&self, caller: &str, chat_id: &str) {
        if !self.access.is_admin(caller) {
            return;
        }
        let users = self.access.list_users();
        if users.is_empty() {
            self.notify(chat_id, "No users found.").await;
            return;
        }
        let lines: Vec<String> = users
            .iter()
            .map(|(id, record)| {
                format!("{}: {}", id, serde_json::to_string(record).unwrap_or_default())
            })
            .collect();
        self.notify(chat_id, &lines.join("\n")).await;
    }

    // ── Session lifecycle ──────────────────────────────────────────────

    /// Start (or re-use) a session and, for a fresh connection, install the
    /// event pump — exactly once per connection instance.
    pub async fn link(
        self: &Arc<Self>,
        user_id: &str,
        number: &str,
        method: LinkMethod,
    ) -> BridgeResult<()> {
        match self.registry.start(user_id, number, method).await? {
            StartOutcome::AlreadyActive => Ok(()),
            StartOutcome::Started { handle, events } => {
                self.access.log_activity(user_id, &format!("linked {}", number));
                self.spawn_pump(user_id, number, method, handle, events);
                Ok(())
            }
        }
    }

    async fn link_and_report(
        self: &Arc<Self>,
        user_id: &str,
        chat_id: &str,
        number: &str,
        method: LinkMethod,
    ) {
        if let Err(e) = self.link(user_id, number, method).await {
            error!("[bridge] Link failed for {} ({}): {}", number, user_id, e);
            self.notify(chat_id, &format!("❌ Could not link {}: {}", number, e)).await;
        }
    }

    /// Re-establish every persisted (user, number) pair after a restart.
    /// One failed number never aborts the rest.
    pub async fn restore_sessions(self: &Arc<Self>) {
        let pairs: Vec<(String, Vec<String>)> = self
            .store
            .with(|c| c.users.iter().map(|(id, u)| (id.clone(), u.numbers.clone())).collect());

        for (user_id, numbers) in pairs {
            for number in numbers {
                if let Err(e) = self.link(&user_id, &number, LinkMethod::Qr).await {
                    error!("[bridge] Restore failed for {} ({}): {}", number, user_id, e);
                }
            }
        }
        info!("[bridge] Session restore complete");
    }

    fn spawn_pump(
        self: &Arc<Self>,
        user_id: &str,
        number: &str,
        method: LinkMethod,
        handle: Arc<dyn ConnectionHandle>,
        events: mpsc::Receiver<SessionEvent>,
    ) {
        let bridge = self.clone();
        let user_id = user_id.to_string();
        let number = number.to_string();
        tokio::spawn(async move {
            bridge.pump_session(&user_id, &number, method, handle, events).await;
        });
    }

    /// Drive one session's state machine until the connection closes.
    /// Events arrive in delivery order; `Closed` is terminal.
    async fn pump_session(
        self: Arc<Self>,
        user_id: &str,
        number: &str,
        method: LinkMethod,
        handle: Arc<dyn ConnectionHandle>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) {
        let mut state = SessionState::Connecting;

        while let Some(event) = events.recv().await {
            state = state.apply(&event);
            match event {
                SessionEvent::QrCode(png) => {
                    if method == LinkMethod::Qr {
                        let caption = format!("Scan this QR to link WhatsApp ({})", number);
                        if let Err(e) = self.telegram.send_photo(user_id, png, &caption).await {
                            error!("[bridge] QR delivery failed for {}: {}", number, e);
                        }
                    }
                }
                SessionEvent::PairingCode(code) => {
                    if method == LinkMethod::Phone {
                        self.notify(
                            user_id,
                            &format!("Your pairing code for WhatsApp ({}): *{}*", number, code),
                        )
                        .await;
                    }
                }
                SessionEvent::Connected => {
                    info!("[bridge] Connected: {}", number);
                    self.notify(user_id, &format!("✅ WhatsApp connected successfully: {}", number))
                        .await;
                }
                SessionEvent::Closed(reason) => {
                    info!("[bridge] Connection closed for {}: {}", number, reason);
                    self.registry.deregister(user_id, number);
                    self.notify(user_id, &format!("❌ WhatsApp session closed for {}", number))
                        .await;
                    break;
                }
                SessionEvent::OutgoingMessage { id, to, body } => {
                    self.handle_outgoing(user_id, number, &handle, &id, &to, body).await;
                }
            }
        }

        // Channel dropped without an explicit close still means the
        // connection is gone.
        if state != SessionState::Closed {
            self.registry.deregister(user_id, number);
        }
    }

    /// Auto-delete decision for one outgoing message. Failures are logged
    /// and never change session state.
    async fn handle_outgoing(
        &self,
        user_id: &str,
        number: &str,
        handle: &Arc<dyn ConnectionHandle>,
        message_id: &str,
        to: &str,
        body: Option<String>,
    ) {
        let auto_delete = self.store.with(|c| c.auto_delete);
        if !auto_delete {
            return;
        }

        if let Err(e) = handle.delete_message(to, message_id).await {
            error!("[bridge] Failed to delete outgoing message ({}): {}", number, e);
            return;
        }

        match self.deleted.record(number, to, body) {
            Ok(Some(_)) => self.registry.bump_deleted_count(number),
            Ok(None) => {} // deletion logging disabled
            Err(e) => {
                let admin_id = self.store.with(|c| c.admin_id.clone());
                if !admin_id.is_empty() {
                    self.notify(&admin_id, &format!("⚠️ Persistence failure: {}", e)).await;
                }
            }
        }

        info!("[bridge] Auto-deleted outgoing message from {} to {}", number, to);
        self.notify(user_id, &format!("🗑 Outgoing message to {} auto-deleted.", to)).await;
    }

    // ── Helpers ────────────────────────────────────────────────────────

    async fn notify(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.telegram.send_message(chat_id, text).await {
            warn!("[bridge] Failed to notify chat {}: {}", chat_id, e);
        }
    }

    /// Persistence failures go to the admin chat as well as the caller;
    /// everything else is reported where it happened.
    async fn report_failure(&self, chat_id: &str, err: BridgeError) {
        error!("[bridge] {}", err);
        if matches!(err, BridgeError::Persistence(_)) {
            let admin_id = self.store.with(|c| c.admin_id.clone());
            if !admin_id.is_empty() && admin_id != chat_id {
                self.notify(&admin_id, &format!("⚠️ Persistence failure: {}", err)).await;
            }
        }
        self.notify(chat_id, &format!("⚠️ Error: {}", err)).await;
    }
}
