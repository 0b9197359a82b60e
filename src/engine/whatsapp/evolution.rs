// walink Engine — Evolution API WhatsApp Client
//
// Production `WhatsAppClient` backed by an Evolution-API-style WhatsApp-Web
// sidecar: one sidecar instance per linked number (instance name = number),
// commands over its HTTP API, events back through a localhost webhook
// listener that this module translates into `SessionEvent`s and routes to
// the owning per-number channel.
//
// The sidecar owns pairing, encryption, and message transport; nothing in
// here touches the WhatsApp wire protocol.

use crate::atoms::error::{BridgeError, BridgeResult};
use crate::engine::whatsapp::{Connection, ConnectionHandle, LinkMethod, SessionEvent, WhatsAppClient};
use async_trait::async_trait;
use base64::Engine as _;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Settings ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EvolutionSettings {
    /// Sidecar base URL.
    pub api_url: String,
    /// Sidecar API key (sent as the `apikey` header).
    pub api_key: String,
    /// Local port the webhook listener binds on 127.0.0.1.
    pub webhook_port: u16,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        EvolutionSettings {
            api_url: "http://127.0.0.1:8085".into(),
            api_key: String::new(),
            webhook_port: 8086,
        }
    }
}

impl EvolutionSettings {
    /// Resolve from `WA_API_URL` / `WA_API_KEY` / `WA_WEBHOOK_PORT`, falling
    /// back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        EvolutionSettings {
            api_url: std::env::var("WA_API_URL").unwrap_or(defaults.api_url),
            api_key: std::env::var("WA_API_KEY").unwrap_or(defaults.api_key),
            webhook_port: std::env::var("WA_WEBHOOK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.webhook_port),
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────────

type EventSenders = Arc<Mutex<HashMap<String, mpsc::Sender<SessionEvent>>>>;

pub struct EvolutionClient {
    settings: EvolutionSettings,
    http: reqwest::Client,
    /// number → live event channel. Webhook payloads are routed by the
    /// `instance` field; a number with no entry here has no live connection.
    senders: EventSenders,
}

impl EvolutionClient {
    pub fn new(settings: EvolutionSettings) -> Self {
        EvolutionClient { settings, http: reqwest::Client::new(), senders: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Start the webhook listener in a background task. Call once at startup.
    pub fn spawn_webhook_listener(&self, stop: Arc<AtomicBool>) {
        let senders = self.senders.clone();
        let port = self.settings.webhook_port;
        tokio::spawn(async move {
            if let Err(e) = run_webhook_listener(senders, port, stop).await {
                warn!("[whatsapp] Webhook listener exited: {}", e);
            }
        });
    }
}

#[async_trait]
impl WhatsAppClient for EvolutionClient {
    async fn connect(&self, number: &str, method: LinkMethod) -> BridgeResult<Connection> {
        let url = format!("{}/instance/create", self.settings.api_url);
        // Unique token per instance avoids "token already exists" collisions
        // when re-linking a number.
        let token = format!("walink-{}", &uuid::Uuid::new_v4().to_string().replace('-', "")[..12]);
        let body = json!({
            "instanceName": number,
            "token": token,
            "qrcode": method == LinkMethod::Qr,
            "number": number,
            "webhook": format!("http://127.0.0.1:{}/webhook/whatsapp", self.settings.webhook_port),
        });

        info!("[whatsapp] Creating instance for {} ({})", number, method.as_str());

        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::connection(number, e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail: String = text.chars().take(300).collect();
            return Err(BridgeError::connection(
                number,
                format!("instance create failed ({}): {}", status, detail),
            ));
        }

        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().insert(number.to_string(), tx.clone());

        // The create response can already carry the first QR or pairing
        // code; later refreshes arrive via the webhook.
        let resp_json: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        match method {
            LinkMethod::Qr => {
                if let Some(png) = extract_qr_png(&resp_json) {
                    let _ = tx.send(SessionEvent::QrCode(png)).await;
                }
            }
            LinkMethod::Phone => {
                if let Some(code) = resp_json["pairingCode"]
                    .as_str()
                    .or_else(|| resp_json["qrcode"]["pairingCode"].as_str())
                {
                    let _ = tx.send(SessionEvent::PairingCode(code.to_string())).await;
                }
            }
        }

        let handle = EvolutionHandle {
            http: self.http.clone(),
            api_url: self.settings.api_url.clone(),
            api_key: self.settings.api_key.clone(),
            instance: number.to_string(),
            senders: self.senders.clone(),
        };
        Ok(Connection { handle: Arc::new(handle), events: rx })
    }
}

// ── Connection handle ──────────────────────────────────────────────────

struct EvolutionHandle {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    instance: String,
    senders: EventSenders,
}

#[async_trait]
impl ConnectionHandle for EvolutionHandle {
    async fn delete_message(&self, to: &str, message_id: &str) -> BridgeResult<()> {
        let url = format!("{}/chat/deleteMessageForEveryone/{}", self.api_url, self.instance);
        let body = json!({
            "id": message_id,
            "remoteJid": to,
            "fromMe": true,
        });
        let resp = self
            .http
            .delete(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::connection(&self.instance, e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let detail: String = text.chars().take(200).collect();
            return Err(BridgeError::connection(
                &self.instance,
                format!("delete failed ({}): {}", status, detail),
            ));
        }
        Ok(())
    }

    async fn logout(&self) -> BridgeResult<()> {
        // Unregister the event route first; a logout without a close webhook
        // must not leave a stale sender behind.
        self.senders.lock().remove(&self.instance);

        let url = format!("{}/instance/logout/{}", self.api_url, self.instance);
        let resp = self
            .http
            .delete(&url)
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| BridgeError::connection(&self.instance, e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let detail: String = text.chars().take(200).collect();
        info!("[whatsapp] Logout {} response [{}]: {}", self.instance, status, detail);
        // Best effort: also drop the sidecar instance so a re-link starts clean.
        let url = format!("{}/instance/delete/{}", self.api_url, self.instance);
        let _ = self.http.delete(&url).header("apikey", &self.api_key).send().await;
        Ok(())
    }
}

// ── Webhook listener ───────────────────────────────────────────────────

/// Minimal HTTP listener for sidecar webhooks, bound to 127.0.0.1. Replies
/// 200 immediately, then translates the payload off the socket.
async fn run_webhook_listener(senders: EventSenders, port: u16, stop: Arc<AtomicBool>) -> BridgeResult<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Config(format!("bind webhook listener on {}: {}", addr, e)))?;

    info!("[whatsapp] Webhook listener started on {}", addr);

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let accept = tokio::time::timeout(std::time::Duration::from_secs(2), listener.accept()).await;
        let (mut stream, _peer) = match accept {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("[whatsapp] Accept error: {}", e);
                continue;
            }
            Err(_) => continue, // timeout — re-check stop signal
        };

        let mut buf = vec![0u8; 65536];
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(_) => continue,
        };
        let request = String::from_utf8_lossy(&buf[..n]).to_string();

        // The sidecar expects a quick 200.
        let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
        let _ = stream.write_all(response.as_bytes()).await;
        drop(stream);

        let body = match request.find("\r\n\r\n") {
            Some(idx) => &request[idx + 4..],
            None => continue,
        };
        let payload: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => continue,
        };

        dispatch_webhook(&senders, &payload).await;
    }

    Ok(())
}

/// Translate one webhook payload into session events for the owning number.
async fn dispatch_webhook(senders: &EventSenders, payload: &serde_json::Value) {
    let instance = payload["instance"].as_str().unwrap_or("");
    let tx = match senders.lock().get(instance) {
        Some(tx) => tx.clone(),
        None => return, // no live connection for this number
    };

    match payload["event"].as_str().unwrap_or("") {
        "qrcode.updated" => {
            if let Some(png) = extract_qr_png(&payload["data"]) {
                let _ = tx.send(SessionEvent::QrCode(png)).await;
            }
        }
        "connection.update" => {
            let state = payload["data"]["state"].as_str().unwrap_or("");
            if let Some(code) = payload["data"]["pairingCode"].as_str() {
                let _ = tx.send(SessionEvent::PairingCode(code.to_string())).await;
            }
            if state == "open" || state == "connected" {
                let _ = tx.send(SessionEvent::Connected).await;
            } else if state == "close" || state == "closed" {
                let reason = payload["data"]["statusReason"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| "connection closed".into());
                let _ = tx.send(SessionEvent::Closed(reason)).await;
                senders.lock().remove(instance);
            }
        }
        "messages.upsert" => {
            let data = &payload["data"];
            let messages = match data.as_array() {
                Some(arr) => arr.clone(),
                None => vec![data.clone()],
            };
            for msg in messages {
                let key = &msg["key"];
                // Only the linked phone's own outgoing traffic matters here.
                if !key["fromMe"].as_bool().unwrap_or(false) {
                    continue;
                }
                let id = key["id"].as_str().unwrap_or("").to_string();
                let to = key["remoteJid"].as_str().unwrap_or("").to_string();
                if id.is_empty() || to.is_empty() {
                    continue;
                }
                let body = msg["message"]["conversation"]
                    .as_str()
                    .or_else(|| msg["message"]["extendedTextMessage"]["text"].as_str())
                    .map(str::to_string);
                let _ = tx.send(SessionEvent::OutgoingMessage { id, to, body }).await;
            }
        }
        _ => {}
    }
}

/// Extract QR PNG bytes from the sidecar's data-URL base64 formats.
fn extract_qr_png(value: &serde_json::Value) -> Option<Vec<u8>> {
    let data_url = value["qrcode"]["base64"]
        .as_str()
        .or_else(|| value["base64"].as_str())
        .or_else(|| value["qrcode"].as_str().filter(|s| s.starts_with("data:")))?;
    let b64 = data_url.rsplit(',').next()?;
    base64::engine::general_purpose::STANDARD.decode(b64).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_qr_png_handles_data_url() {
        let png = b"\x89PNG-ish";
        let b64 = base64::engine::general_purpose::STANDARD.encode(png);
        let value = json!({ "qrcode": { "base64": format!("data:image/png;base64,{}", b64) } });
        assert_eq!(extract_qr_png(&value).unwrap(), png);
    }

    #[test]
    fn extract_qr_png_handles_flat_base64() {
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"qr");
        let value = json!({ "base64": b64 });
        assert_eq!(extract_qr_png(&value).unwrap(), b"qr");
    }

    #[test]
    fn extract_qr_png_rejects_missing() {
        assert!(extract_qr_png(&json!({})).is_none());
        assert!(extract_qr_png(&json!({ "qrcode": "not-a-data-url" })).is_none());
    }

    #[tokio::test]
    async fn dispatch_routes_outgoing_messages_by_instance() {
        let senders: EventSenders = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel(8);
        senders.lock().insert("5551234".into(), tx);

        let payload = json!({
            "instance": "5551234",
            "event": "messages.upsert",
            "data": {
                "key": { "id": "MSG1", "remoteJid": "5559999@s.whatsapp.net", "fromMe": true },
                "message": { "conversation": "hello" }
            }
        });
        dispatch_webhook(&senders, &payload).await;

        match rx.recv().await.unwrap() {
            SessionEvent::OutgoingMessage { id, to, body } => {
                assert_eq!(id, "MSG1");
                assert_eq!(to, "5559999@s.whatsapp.net");
                assert_eq!(body.as_deref(), Some("hello"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn dispatch_ignores_inbound_and_unknown_instances() {
        let senders: EventSenders = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel(8);
        senders.lock().insert("5551234".into(), tx);

        // fromMe: false → ignored
        dispatch_webhook(
            &senders,
            &json!({
                "instance": "5551234",
                "event": "messages.upsert",
                "data": { "key": { "id": "M", "remoteJid": "x", "fromMe": false } }
            }),
        )
        .await;
        // unknown instance → dropped
        dispatch_webhook(
            &senders,
            &json!({ "instance": "other", "event": "connection.update", "data": { "state": "open" } }),
        )
        .await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn logout_unregisters_the_sender_without_a_webhook() {
        let senders: EventSenders = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::channel(8);
        senders.lock().insert("5551234".into(), tx);

        let handle = EvolutionHandle {
            http: reqwest::Client::new(),
            api_url: "http://127.0.0.1:9".into(),
            api_key: String::new(),
            instance: "5551234".into(),
            senders: senders.clone(),
        };
        // The sidecar is unreachable; the route must be gone regardless.
        let _ = handle.logout().await;
        assert!(senders.lock().is_empty());
    }

    #[tokio::test]
    async fn close_event_unregisters_the_sender() {
        let senders: EventSenders = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel(8);
        senders.lock().insert("5551234".into(), tx);

        dispatch_webhook(
            &senders,
            &json!({ "instance": "5551234", "event": "connection.update", "data": { "state": "close" } }),
        )
        .await;

        assert!(matches!(rx.recv().await, Some(SessionEvent::Closed(_))));
        assert!(senders.lock().is_empty());
    }
}
