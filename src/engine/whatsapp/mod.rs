// walink Engine — WhatsApp Client Seam
//
// The bridge never speaks the WhatsApp wire protocol itself. It talks to an
// external WhatsApp-Web client (an Evolution-API-style sidecar in
// production, a mock in tests) through the traits below: one logical
// connection per linked number, lifecycle and message events delivered over
// a per-connection mpsc channel installed once at creation time.

mod evolution;

pub use evolution::{EvolutionClient, EvolutionSettings};

use crate::atoms::error::BridgeResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Link method ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMethod {
    /// Pair by scanning a QR image.
    Qr,
    /// Pair by typing a short code on the phone.
    Phone,
}

impl LinkMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMethod::Qr => "qr",
            LinkMethod::Phone => "phone",
        }
    }
}

// ── Events ─────────────────────────────────────────────────────────────

/// Everything the underlying connection can tell us, already decoded.
/// QR rendering happens on the client side — the bridge only forwards bytes.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A fresh pairing QR image (PNG bytes).
    QrCode(Vec<u8>),
    /// A pairing code for phone-number linking.
    PairingCode(String),
    /// The session is open and receiving.
    Connected,
    /// The connection is gone. Terminal for this connection instance; a new
    /// link attempt creates a fresh instance.
    Closed(String),
    /// An outgoing message was sent from the linked phone.
    OutgoingMessage { id: String, to: String, body: Option<String> },
}

// ── Session state machine ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Paired,
    Open,
    Closed,
}

impl SessionState {
    /// Apply one connection event. `Closed` is absorbing; message traffic
    /// never changes state.
    pub fn apply(self, event: &SessionEvent) -> SessionState {
        if self == SessionState::Closed {
            return SessionState::Closed;
        }
        match event {
            SessionEvent::QrCode(_) | SessionEvent::PairingCode(_) => SessionState::Paired,
            SessionEvent::Connected => SessionState::Open,
            SessionEvent::Closed(_) => SessionState::Closed,
            SessionEvent::OutgoingMessage { .. } => self,
        }
    }
}

// ── Client traits ──────────────────────────────────────────────────────

/// A live connection for one number. The registry exclusively owns these.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Delete an already-sent outgoing message on the network.
    async fn delete_message(&self, to: &str, message_id: &str) -> BridgeResult<()>;

    /// Graceful logout. Failures are logged by callers, never fatal.
    async fn logout(&self) -> BridgeResult<()>;
}

/// A freshly established connection plus its event stream. The receiver is
/// handed to the event bridge exactly once.
pub struct Connection {
    pub handle: Arc<dyn ConnectionHandle>,
    pub events: mpsc::Receiver<SessionEvent>,
}

#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    /// Establish a connection for `number`, starting the pairing handshake
    /// with the requested method.
    async fn connect(&self, number: &str, method: LinkMethod) -> BridgeResult<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_happy_path() {
        let mut state = SessionState::Connecting;
        state = state.apply(&SessionEvent::QrCode(vec![1, 2, 3]));
        assert_eq!(state, SessionState::Paired);
        state = state.apply(&SessionEvent::Connected);
        assert_eq!(state, SessionState::Open);
        state = state.apply(&SessionEvent::Closed("logout".into()));
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn messages_do_not_change_state() {
        let state = SessionState::Open;
        let next = state.apply(&SessionEvent::OutgoingMessage {
            id: "m1".into(),
            to: "555".into(),
            body: Some("hi".into()),
        });
        assert_eq!(next, SessionState::Open);
    }

    #[test]
    fn closed_is_terminal() {
        let state = SessionState::Closed;
        assert_eq!(state.apply(&SessionEvent::Connected), SessionState::Closed);
        assert_eq!(state.apply(&SessionEvent::QrCode(vec![])), SessionState::Closed);
    }

    #[test]
    fn pairing_code_also_moves_to_paired() {
        let state = SessionState::Connecting;
        assert_eq!(state.apply(&SessionEvent::PairingCode("ABCD-1234".into())), SessionState::Paired);
    }
}
