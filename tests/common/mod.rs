#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use print_herald::error::TransportError;
use print_herald::transport::{ChatId, ChatTransport, MessageId, PhotoInput, SentMessage};
use print_herald::{Dispatcher, ImageSource, PrinterRpc};
use serde_json::Value;
use tokio::sync::Notify;

pub const CHATS: [ChatId; 2] = [-100, 200];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SendText {
        chat: ChatId,
        text: String,
    },
    SendPhoto {
        chat: ChatId,
        caption: String,
    },
    EditText {
        chat: ChatId,
        message: MessageId,
        text: String,
    },
    EditMediaKeep {
        chat: ChatId,
        message: MessageId,
        file_id: String,
        caption: String,
    },
    EditMediaUpload {
        chat: ChatId,
        message: MessageId,
        caption: String,
    },
}

impl Call {
    pub fn chat(&self) -> ChatId {
        match self {
            Call::SendText { chat, .. }
            | Call::SendPhoto { chat, .. }
            | Call::EditText { chat, .. }
            | Call::EditMediaKeep { chat, .. }
            | Call::EditMediaUpload { chat, .. } => *chat,
        }
    }

    pub fn is_new_message(&self) -> bool {
        matches!(self, Call::SendText { .. } | Call::SendPhoto { .. })
    }

    pub fn text(&self) -> &str {
        match self {
            Call::SendText { text, .. } | Call::EditText { text, .. } => text,
            Call::SendPhoto { caption, .. }
            | Call::EditMediaKeep { caption, .. }
            | Call::EditMediaUpload { caption, .. } => caption,
        }
    }
}

type Gate = (Arc<Notify>, Arc<Notify>);

/// Records every transport call; can fail a chosen chat or hold one call open.
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicI64,
    failing_chat: Mutex<Option<ChatId>>,
    gate: Mutex<Option<Gate>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_chat(&self, chat: Option<ChatId>) {
        *self.failing_chat.lock().unwrap() = chat;
    }

    /// Make the next call block until `release` is notified. `entered` is
    /// notified once that call has started.
    pub fn hold_next_call(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    async fn record(&self, call: Call) -> Result<MessageId, TransportError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        let chat = call.chat();
        self.calls.lock().unwrap().push(call);

        if *self.failing_chat.lock().unwrap() == Some(chat) {
            return Err(TransportError::Rejected {
                method: "fake",
                description: format!("chat {chat} not found"),
            });
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<SentMessage, TransportError> {
        let message_id = self
            .record(Call::SendText {
                chat,
                text: text.to_string(),
            })
            .await?;
        Ok(SentMessage {
            message_id,
            photo_file_id: None,
        })
    }

    async fn send_photo(
        &self,
        chat: ChatId,
        _photo: &[u8],
        caption: &str,
    ) -> Result<SentMessage, TransportError> {
        let message_id = self
            .record(Call::SendPhoto {
                chat,
                caption: caption.to_string(),
            })
            .await?;
        Ok(SentMessage {
            message_id,
            photo_file_id: Some(format!("photo-{message_id}")),
        })
    }

    async fn edit_text(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
    ) -> Result<(), TransportError> {
        self.record(Call::EditText {
            chat,
            message,
            text: text.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn edit_media(
        &self,
        chat: ChatId,
        message: MessageId,
        photo: PhotoInput<'_>,
        caption: &str,
    ) -> Result<SentMessage, TransportError> {
        let (call, file_id) = match photo {
            PhotoInput::FileId(file_id) => (
                Call::EditMediaKeep {
                    chat,
                    message,
                    file_id: file_id.to_string(),
                    caption: caption.to_string(),
                },
                Some(file_id.to_string()),
            ),
            PhotoInput::Upload(_) => (
                Call::EditMediaUpload {
                    chat,
                    message,
                    caption: caption.to_string(),
                },
                None,
            ),
        };
        let id = self.record(call).await?;
        Ok(SentMessage {
            message_id: message,
            photo_file_id: file_id.or_else(|| Some(format!("photo-edit-{id}"))),
        })
    }
}

/// Image source with canned bytes and call counters; can hold one snapshot
/// fetch open to stand in for a slow camera.
#[derive(Default)]
pub struct FakeImages {
    pub thumbnails: AtomicUsize,
    pub snapshots: AtomicUsize,
    snapshot_gate: Mutex<Option<Gate>>,
}

impl FakeImages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next snapshot fetch block until `release` is notified.
    /// `entered` is notified once that fetch has started.
    pub fn hold_next_snapshot(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.snapshot_gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn thumbnail_count(&self) -> usize {
        self.thumbnails.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for FakeImages {
    async fn thumbnail(&self, filename: &str) -> Option<Vec<u8>> {
        self.thumbnails.fetch_add(1, Ordering::SeqCst);
        Some(format!("thumb:{filename}").into_bytes())
    }

    async fn snapshot(&self) -> Option<Vec<u8>> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        let gate = self.snapshot_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        Some(b"snapshot".to_vec())
    }
}

/// Backend answering from a method → result table.
#[derive(Default)]
pub struct FakeRpc {
    responses: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &str, result: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_string(), result);
    }

    pub fn forget(&self, method: &str) {
        self.responses.lock().unwrap().remove(method);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PrinterRpc for FakeRpc {
    async fn call(&self, method: &str, _params: Value) -> Option<Value> {
        self.calls.lock().unwrap().push(method.to_string());
        self.responses.lock().unwrap().get(method).cloned()
    }
}

pub fn dispatcher(transport: &Arc<FakeTransport>, images: &Arc<FakeImages>) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        CHATS.to_vec(),
        transport.clone(),
        images.clone(),
    ))
}
