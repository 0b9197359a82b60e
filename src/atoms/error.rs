// ── walink Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the bridge, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, network, auth, session…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • `InvalidPasskey` deliberately carries no detail: wrong key, consumed key,
//     expired key, and someone else's key all render identically so the
//     rejection cannot be used to enumerate keys or identities.
//   • No variant carries secret material (bot token, passkeys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// An unknown or inactive user attempted a gated action.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Passkey redemption failed. Always the same message, by construction.
    #[error("Invalid or expired passkey")]
    InvalidPasskey,

    /// WhatsApp pairing or transport failure for one number.
    #[error("Connection error ({number}): {message}")]
    Connection { number: String, message: String },

    /// Durable state could not be written. Surfaced to the admin, never
    /// silently dropped.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration is invalid or missing. Fatal only at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Telegram Bot API rejected a call.
    #[error("Telegram error: {0}")]
    Telegram(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Create a connection error for one number.
    pub fn connection(number: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection { number: number.into(), message: message.into() }
    }
}

// ── Migration bridge: String → BridgeError ─────────────────────────────────
// Allows `?` and `.into()` on plain string errors at adapter boundaries.

impl From<String> for BridgeError {
    fn from(s: String) -> Self {
        BridgeError::Other(s)
    }
}

impl From<&str> for BridgeError {
    fn from(s: &str) -> Self {
        BridgeError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All bridge operations should return this type.
pub type BridgeResult<T> = Result<T, BridgeError>;
