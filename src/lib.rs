// walink — Telegram-controlled WhatsApp bridge.
//
// A small operator bot: approved Telegram users link one or more WhatsApp
// numbers, the bridge auto-deletes their outgoing WhatsApp messages (when
// enabled) and lets them review the deletions from Telegram. Admission is
// gated by one-time numeric passkeys issued to the admin.
//
// The WhatsApp wire protocol lives behind the `WhatsAppClient` seam (an
// Evolution-API-style sidecar in production); the Telegram transport is the
// Bot API over long-polling.

pub mod atoms;
pub mod engine;
