//! Chat transport.
//!
//! [`ChatTransport`] is the seam the dispatcher sends through;
//! [`TelegramTransport`] implements it on top of the Telegram Bot API and
//! also long-polls the bot's commands.

use async_trait::async_trait;
use log::debug;
use reqwest::multipart;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::TransportError;

/// Chat identifier.
pub type ChatId = i64;

/// Message identifier, unique within a chat.
pub type MessageId = i64;

/// What the chat API reports back for a sent or edited message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: MessageId,
    /// Server-side id of the attached photo, reusable in later edits.
    pub photo_file_id: Option<String>,
}

/// Photo for an in-place media edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoInput<'a> {
    /// Fresh image bytes.
    Upload(&'a [u8]),
    /// A photo already stored by the chat service.
    FileId(&'a str),
}

/// Send and edit primitives the dispatcher needs from a chat service.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Post a new text message to `chat`.
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<SentMessage, TransportError>;

    /// Post a new photo message with `caption` to `chat`.
    async fn send_photo(
        &self,
        chat: ChatId,
        photo: &[u8],
        caption: &str,
    ) -> Result<SentMessage, TransportError>;

    /// Replace the text of a text message.
    async fn edit_text(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
    ) -> Result<(), TransportError>;

    /// Replace the photo and caption of a photo message. The returned
    /// [`SentMessage`] carries the file id of the photo now attached.
    async fn edit_media(
        &self,
        chat: ChatId,
        message: MessageId,
        photo: PhotoInput<'_>,
        caption: &str,
    ) -> Result<SentMessage, TransportError>;
}

/// A command typed by a user into one of the bot's chats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCommand {
    pub update_id: i64,
    pub chat: ChatId,
    pub user: Option<i64>,
    /// Command name without the leading slash or `@botname` suffix.
    pub command: String,
}

/// Telegram Bot API client.
pub struct TelegramTransport {
    http: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: MessageId,
    #[serde(default)]
    photo: Vec<PhotoSize>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    #[serde(default)]
    width: u32,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    chat: UpdateChat,
    #[serde(default)]
    from: Option<UpdateUser>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateChat {
    id: ChatId,
}

#[derive(Debug, Deserialize)]
struct UpdateUser {
    id: i64,
}

impl From<ApiMessage> for SentMessage {
    fn from(message: ApiMessage) -> Self {
        let photo_file_id = message
            .photo
            .into_iter()
            .max_by_key(|size| size.width)
            .map(|size| size.file_id);
        Self {
            message_id: message.message_id,
            photo_file_id,
        }
    }
}

impl TelegramTransport {
    /// Create a client for the bot identified by `token`.
    ///
    /// # Arguments
    ///
    /// * `token` - Bot token as issued by BotFather, e.g. `123456:ABC-...`
    pub fn new(token: &str) -> Self {
        Self::with_api_base(format!("https://api.telegram.org/bot{token}"))
    }

    /// Point the client at a different Bot API server.
    pub fn with_api_base(api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base,
        }
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: &Value,
    ) -> Result<T, TransportError> {
        let response = self
            .http
            .post(format!("{}/{method}", self.api_base))
            .json(body)
            .send()
            .await
            .map_err(|source| TransportError::Request { method, source })?;
        Self::decode(method, response).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &'static str,
        form: multipart::Form,
    ) -> Result<T, TransportError> {
        let response = self
            .http
            .post(format!("{}/{method}", self.api_base))
            .multipart(form)
            .send()
            .await
            .map_err(|source| TransportError::Request { method, source })?;
        Self::decode(method, response).await
    }

    async fn decode<T: DeserializeOwned>(
        method: &'static str,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|source| TransportError::Request { method, source })?;

        match body {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(TransportError::Rejected {
                method,
                description: description.unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    fn photo_part(photo: &[u8]) -> Result<multipart::Part, TransportError> {
        let filename = format!("printer_{}.jpg", chrono::Utc::now().timestamp());
        multipart::Part::bytes(photo.to_vec())
            .file_name(filename)
            .mime_str("image/jpeg")
            .map_err(|source| TransportError::Request {
                method: "attach photo",
                source,
            })
    }

    /// Register the bot's commands so clients offer them in the menu.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the Bot API refuses it.
    pub async fn set_commands(&self) -> Result<(), TransportError> {
        let body = json!({
            "commands": [
                { "command": "start", "description": "Bot can send stat in this chat" },
                { "command": "status", "description": "printer status" },
            ]
        });
        self.call_json::<bool>("setMyCommands", &body).await?;
        Ok(())
    }

    /// Long-poll for new commands after `offset`.
    ///
    /// # Arguments
    ///
    /// * `offset` - First update id to return; pass one past the last id seen
    /// * `timeout_secs` - How long the server may hold the request open
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails or times out
    /// - The Bot API answers with `ok: false`
    pub async fn poll_commands(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<IncomingCommand>, TransportError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        let updates: Vec<Update> = self.call_json("getUpdates", &body).await?;
        Ok(updates.into_iter().map(command_from_update).collect())
    }
}

/// Every update advances the offset, so non-command updates come back with
/// an empty `command`.
fn command_from_update(update: Update) -> IncomingCommand {
    let (chat, user, command) = match update.message {
        Some(message) => (
            message.chat.id,
            message.from.map(|user| user.id),
            message
                .text
                .as_deref()
                .and_then(parse_command)
                .unwrap_or_default(),
        ),
        None => (0, None, String::new()),
    };
    IncomingCommand {
        update_id: update.update_id,
        chat,
        user,
        command,
    }
}

/// `"/status@my_bot now"` → `"status"`.
fn parse_command(text: &str) -> Option<String> {
    let word = text.strip_prefix('/')?.split_whitespace().next()?;
    let name = word.split('@').next().unwrap_or(word);
    (!name.is_empty()).then(|| name.to_lowercase())
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<SentMessage, TransportError> {
        let body = json!({ "chat_id": chat, "text": text });
        let message: ApiMessage = self.call_json("sendMessage", &body).await?;
        Ok(message.into())
    }

    async fn send_photo(
        &self,
        chat: ChatId,
        photo: &[u8],
        caption: &str,
    ) -> Result<SentMessage, TransportError> {
        let form = multipart::Form::new()
            .text("chat_id", chat.to_string())
            .text("caption", caption.to_string())
            .part("photo", Self::photo_part(photo)?);
        let message: ApiMessage = self.call_multipart("sendPhoto", form).await?;
        Ok(message.into())
    }

    async fn edit_text(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
    ) -> Result<(), TransportError> {
        let body = json!({ "chat_id": chat, "message_id": message, "text": text });
        // The result is the edited message, or `true` for inline messages.
        self.call_json::<Value>("editMessageText", &body).await?;
        Ok(())
    }

    async fn edit_media(
        &self,
        chat: ChatId,
        message: MessageId,
        photo: PhotoInput<'_>,
        caption: &str,
    ) -> Result<SentMessage, TransportError> {
        let edited: ApiMessage = match photo {
            PhotoInput::FileId(file_id) => {
                let body = json!({
                    "chat_id": chat,
                    "message_id": message,
                    "media": { "type": "photo", "media": file_id, "caption": caption },
                });
                self.call_json("editMessageMedia", &body).await?
            }
            PhotoInput::Upload(bytes) => {
                let media = json!({ "type": "photo", "media": "attach://photo", "caption": caption });
                let form = multipart::Form::new()
                    .text("chat_id", chat.to_string())
                    .text("message_id", message.to_string())
                    .text("media", media.to_string())
                    .part("photo", Self::photo_part(bytes)?);
                self.call_multipart("editMessageMedia", form).await?
            }
        };
        debug!("Edited media of message {} in chat {}", message, chat);
        Ok(edited.into())
    }
}
