// walink Engine — Telegram Bot Bridge
//
// Connects the bridge to Telegram via the Bot API using long-polling
// (getUpdates). No public URL needed, no webhooks — the process pulls
// updates directly from Telegram's servers.
//
// The `TelegramApi` trait is the seam: the event bridge and the tests only
// ever see the trait, `HttpTelegram` is the reqwest-backed production
// implementation.

use crate::atoms::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ── Telegram API Types ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TgResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUpdate {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub from: Option<TgUser>,
    pub chat: TgChat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub message: Option<TgMessage>,
    pub data: Option<String>,
}

// ── Inline keyboards ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        InlineButton { text: text.into(), callback_data: callback_data.into() }
    }
}

/// Rows of buttons, Bot API shape.
pub type Keyboard = Vec<Vec<InlineButton>>;

// ── API seam ───────────────────────────────────────────────────────────

#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> BridgeResult<Vec<TgUpdate>>;
    async fn send_message(&self, chat_id: &str, text: &str) -> BridgeResult<()>;
    async fn send_message_with_keyboard(
        &self,
        chat_id: &str,
        text: &str,
        keyboard: Keyboard,
    ) -> BridgeResult<()>;
    /// Send a photo (PNG bytes) with a caption — used for pairing QR images.
    async fn send_photo(&self, chat_id: &str, png: Vec<u8>, caption: &str) -> BridgeResult<()>;
    async fn answer_callback(&self, callback_id: &str) -> BridgeResult<()>;
}

// ── Production implementation ──────────────────────────────────────────

const TG_API: &str = "https://api.telegram.org/bot";

/// Telegram message limit = 4096 chars; split below it.
const CHUNK_LIMIT: usize = 4000;

pub struct HttpTelegram {
    client: reqwest::Client,
    token: String,
}

impl HttpTelegram {
    pub fn new(token: impl Into<String>) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(HttpTelegram { client, token: token.into() })
    }

    fn url(&self, method: &str) -> String {
        format!("{}{}/{}", TG_API, self.token, method)
    }

    /// Verify the token with getMe; returns the bot's username.
    pub async fn get_me(&self) -> BridgeResult<String> {
        let resp: TgResponse<serde_json::Value> =
            self.client.get(self.url("getMe")).send().await?.json().await?;
        if !resp.ok {
            return Err(BridgeError::Telegram(format!(
                "getMe failed: {}",
                resp.description.unwrap_or_default()
            )));
        }
        let result = resp.result.ok_or_else(|| BridgeError::Telegram("getMe: no result".into()))?;
        Ok(result["username"].as_str().unwrap_or("unknown").to_string())
    }

    async fn post_message(&self, body: serde_json::Value) -> BridgeResult<()> {
        let resp = self.client.post(self.url("sendMessage")).json(&body).send().await;
        match resp {
            Ok(r) if !r.status().is_success() => {
                // Retry without Markdown parse mode (some bodies break MD parsing).
                let mut retry = body.clone();
                if let Some(obj) = retry.as_object_mut() {
                    obj.remove("parse_mode");
                }
                let _ = self.client.post(self.url("sendMessage")).json(&retry).send().await;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("[telegram] sendMessage failed: {}", e);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl TelegramApi for HttpTelegram {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> BridgeResult<Vec<TgUpdate>> {
        let url = format!(
            "{}?offset={}&timeout={}&allowed_updates=[\"message\",\"callback_query\"]",
            self.url("getUpdates"),
            offset,
            timeout_secs
        );
        let resp: TgResponse<Vec<TgUpdate>> = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(timeout_secs + 10))
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            return Err(BridgeError::Telegram(format!(
                "getUpdates error: {}",
                resp.description.unwrap_or_default()
            )));
        }
        Ok(resp.result.unwrap_or_default())
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> BridgeResult<()> {
        for chunk in split_message(text, CHUNK_LIMIT) {
            self.post_message(json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            }))
            .await?;
        }
        Ok(())
    }

    async fn send_message_with_keyboard(
        &self,
        chat_id: &str,
        text: &str,
        keyboard: Keyboard,
    ) -> BridgeResult<()> {
        self.post_message(json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "reply_markup": { "inline_keyboard": keyboard },
        }))
        .await
    }

    async fn send_photo(&self, chat_id: &str, png: Vec<u8>, caption: &str) -> BridgeResult<()> {
        let part = reqwest::multipart::Part::bytes(png)
            .file_name("qr.png")
            .mime_str("image/png")
            .map_err(|e| BridgeError::Telegram(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", part);
        let resp = self.client.post(self.url("sendPhoto")).multipart(form).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let detail: String = text.chars().take(200).collect();
            return Err(BridgeError::Telegram(format!("sendPhoto failed ({}): {}", status, detail)));
        }
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> BridgeResult<()> {
        let _ = self
            .client
            .post(self.url("answerCallbackQuery"))
            .json(&json!({ "callback_query_id": callback_id }))
            .send()
            .await;
        Ok(())
    }
}

// ── Message chunking ───────────────────────────────────────────────────

/// Split a long message into chunks at a given byte limit, preferring
/// newline/space breaks and never cutting inside a multibyte character.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        // Largest char boundary at or below the limit.
        let limit = (0..=max_len).rev().find(|&i| remaining.is_char_boundary(i)).unwrap_or(0);
        if limit == 0 {
            // Limit smaller than the first character; emit whole rather
            // than loop.
            chunks.push(remaining.to_string());
            break;
        }
        let split_at = remaining[..limit]
            .rfind('\n')
            .or_else(|| remaining[..limit].rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

// ── Command grammar ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    RequestPasskey,
    Verify(String),
    Link(String),
    DeletedMessages,
    AddUser(String),
    RemoveUser(String),
    ViewUser(String),
    ListUsers,
}

impl Command {
    /// Parse a message text into a command. Non-commands and unknown
    /// commands return `None` and are ignored by the bridge.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        let mut parts = text.splitn(2, char::is_whitespace);
        let head = parts.next()?;
        let arg = parts.next().map(|a| a.trim().to_string()).filter(|a| !a.is_empty());

        // "/start@MyBot" also counts.
        let head = head.split('@').next().unwrap_or(head);

        match (head, arg) {
            ("/start", _) => Some(Command::Start),
            ("/request_passkey", _) => Some(Command::RequestPasskey),
            ("/verify", Some(key)) => Some(Command::Verify(key)),
            ("/link", Some(number)) => Some(Command::Link(number)),
            ("/deleted_messages", _) => Some(Command::DeletedMessages),
            ("/add_user", Some(id)) => Some(Command::AddUser(id)),
            ("/remove_user", Some(id)) => Some(Command::RemoveUser(id)),
            ("/view_user", Some(id)) => Some(Command::ViewUser(id)),
            ("/list_users", _) => Some(Command::ListUsers),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    LinkQr(String),
    LinkPhone(String),
    Unlink(String),
    Keep(String),
    Delete(String),
}

impl Callback {
    pub fn parse(data: &str) -> Option<Callback> {
        if let Some(number) = data.strip_prefix("link_qr_") {
            Some(Callback::LinkQr(number.to_string()))
        } else if let Some(number) = data.strip_prefix("link_num_") {
            Some(Callback::LinkPhone(number.to_string()))
        } else if let Some(number) = data.strip_prefix("unlink_") {
            Some(Callback::Unlink(number.to_string()))
        } else if let Some(id) = data.strip_prefix("keep_") {
            Some(Callback::Keep(id.to_string()))
        } else if let Some(id) = data.strip_prefix("delete_") {
            Some(Callback::Delete(id.to_string()))
        } else {
            None
        }
    }
}
