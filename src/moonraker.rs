//! JSON-RPC client for the Moonraker websocket API.
//!
//! A background task owns the websocket, reconnects with exponential backoff,
//! and forwards push notifications as [`PrinterMessage`]s over a channel.
//! Requests issued through [`MoonrakerClient`] while the socket is down
//! resolve to `None` immediately; callers treat that as "try again later".

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::classifier::LifecycleSignal;
use crate::config::constants::{
    PRINTER_CHANNEL_CAPACITY, RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY, RPC_TIMEOUT,
};
use crate::error::ConnectionError;

/// Request/response access to the printer backend.
#[async_trait]
pub trait PrinterRpc: Send + Sync {
    /// Issue `method` with `params`. `None` means no answer: not connected,
    /// timed out, or the backend returned an error.
    async fn call(&self, method: &str, params: Value) -> Option<Value>;
}

/// Message pushed from the backend connection to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterMessage {
    /// The websocket is up; baseline and subscriptions must be redone.
    Connected,
    /// The websocket dropped. A reconnect is already scheduled.
    ConnectionLost,
    /// Partial status patch from `notify_status_update`.
    StatusUpdate(Value),
    /// Host statistics from `notify_proc_stat_update`.
    ProcStatUpdate(Value),
    /// Klippy lifecycle notification.
    Klippy(LifecycleSignal),
}

struct RpcRequest {
    method: String,
    params: Value,
    reply: oneshot::Sender<Option<Value>>,
}

/// Handle to the backend connection. Cheap to clone.
#[derive(Clone)]
pub struct MoonrakerClient {
    requests: mpsc::Sender<RpcRequest>,
    connected: Arc<AtomicBool>,
}

impl MoonrakerClient {
    /// Spawn the connection task and return the client handle together with
    /// the stream of backend messages.
    pub fn connect(ws_url: Url, cancel: CancellationToken) -> (Self, mpsc::Receiver<PrinterMessage>) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (message_tx, message_rx) = mpsc::channel(PRINTER_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(connection_loop(
            ws_url,
            request_rx,
            message_tx,
            Arc::clone(&connected),
            cancel,
        ));

        let client = Self {
            requests: request_tx,
            connected,
        };
        (client, message_rx)
    }

    /// True while the websocket is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrinterRpc for MoonrakerClient {
    async fn call(&self, method: &str, params: Value) -> Option<Value> {
        if !self.is_connected() {
            debug!("Skipping '{}': backend not connected", method);
            return None;
        }

        let (reply, response) = oneshot::channel();
        let request = RpcRequest {
            method: method.to_string(),
            params,
            reply,
        };
        self.requests.send(request).await.ok()?;

        match tokio::time::timeout(RPC_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!("RPC call '{}' timed out", method);
                None
            }
        }
    }
}

/// Subscribe to push updates for `objects`.
pub async fn subscribe_objects(rpc: &dyn PrinterRpc, objects: Value) -> Option<Value> {
    rpc.call("printer.objects.subscribe", json!({ "objects": objects }))
        .await
}

/// Backend server information (versions, klippy connection state).
pub async fn server_info(rpc: &dyn PrinterRpc) -> Option<Value> {
    rpc.call("server.info", json!({})).await
}

/// Thumbnails generated for a gcode file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Thumbnail {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub size: u64,
    pub thumbnail_path: String,
}

/// List the thumbnails of `filename`, largest first.
pub async fn thumbnails(rpc: &dyn PrinterRpc, filename: &str) -> Vec<Thumbnail> {
    let Some(result) = rpc
        .call("server.files.thumbnails", json!({ "filename": filename }))
        .await
    else {
        return Vec::new();
    };

    let mut list: Vec<Thumbnail> = serde_json::from_value(result).unwrap_or_default();
    list.sort_by(|a, b| b.size.cmp(&a.size));
    list
}

// ── Connection task ─────────────────────────────────────────────────

async fn connection_loop(
    ws_url: Url,
    mut requests: mpsc::Receiver<RpcRequest>,
    messages: mpsc::Sender<PrinterMessage>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let endpoint = redacted(&ws_url);
    let mut attempt: u32 = 0;

    loop {
        info!("Connecting to printer backend at {}", endpoint);

        let handshake = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(ws_url.as_str()) => result,
        };

        match handshake {
            Ok((stream, _response)) => {
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                info!("Connected to printer backend at {}", endpoint);

                if messages.send(PrinterMessage::Connected).await.is_err() {
                    break;
                }

                let result = session(stream, &mut requests, &messages, &cancel).await;
                connected.store(false, Ordering::SeqCst);

                if cancel.is_cancelled() {
                    break;
                }
                match result {
                    Ok(()) => info!("Printer backend connection closed"),
                    Err(e) => warn!("Printer backend connection lost: {}", e),
                }
                if messages.send(PrinterMessage::ConnectionLost).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    "Failed to connect to {} (attempt {}): {}",
                    endpoint,
                    attempt + 1,
                    e
                );
            }
        }

        refuse_queued(&mut requests);

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        info!("Reconnecting in {:.1}s", delay.as_secs_f64());

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Connection task for {} exiting", endpoint);
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drive one established connection until it closes.
async fn session(
    stream: Socket,
    requests: &mut mpsc::Receiver<RpcRequest>,
    messages: &mpsc::Sender<PrinterMessage>,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    let (mut write, mut read) = stream.split();
    let mut pending: HashMap<u64, oneshot::Sender<Option<Value>>> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.close().await;
                return Ok(());
            }
            Some(request) = requests.recv() => {
                let id = next_id;
                next_id += 1;
                let frame = json!({
                    "jsonrpc": "2.0",
                    "method": request.method,
                    "params": request.params,
                    "id": id,
                });
                write.send(Message::Text(frame.to_string().into())).await?;
                pending.insert(id, request.reply);
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Some(Frame::Response { id, result }) => {
                        if let Some(reply) = pending.remove(&id) {
                            let _ = reply.send(result);
                        }
                    }
                    Some(Frame::Notification(message)) => {
                        if messages.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Frame::Ignored(method)) => debug!("Ignoring notification '{}'", method),
                    None => debug!("Unparseable frame from backend"),
                },
                Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Answer requests queued while disconnected instead of leaving them to time out.
fn refuse_queued(requests: &mut mpsc::Receiver<RpcRequest>) {
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(None);
    }
}

// ── Wire parsing ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, PartialEq)]
enum Frame {
    Response { id: u64, result: Option<Value> },
    Notification(PrinterMessage),
    Ignored(String),
}

fn parse_frame(text: &str) -> Option<Frame> {
    let raw: RawFrame = serde_json::from_str(text).ok()?;

    if let Some(id) = raw.id {
        let result = match raw.error {
            Some(error) => {
                warn!("RPC request {} failed ({}): {}", id, error.code, error.message);
                None
            }
            None => Some(raw.result.unwrap_or(Value::Null)),
        };
        return Some(Frame::Response { id, result });
    }

    let method = raw.method?;
    let first_param = || raw.params.get(0).cloned().unwrap_or(Value::Null);
    let message = match method.as_str() {
        "notify_status_update" => PrinterMessage::StatusUpdate(first_param()),
        "notify_proc_stat_update" => PrinterMessage::ProcStatUpdate(first_param()),
        "notify_klippy_disconnected" => PrinterMessage::Klippy(LifecycleSignal::Disconnected),
        "notify_klippy_shutdown" => PrinterMessage::Klippy(LifecycleSignal::Shutdown),
        "notify_klippy_ready" => PrinterMessage::Klippy(LifecycleSignal::Ready),
        _ => return Some(Frame::Ignored(method)),
    };
    Some(Frame::Notification(message))
}

/// Exponential backoff with a deterministic ±25% spread.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RECONNECT_INITIAL_DELAY.as_secs_f64() * 2.0_f64.powi(attempt.min(16) as i32);
    let capped = base.min(RECONNECT_MAX_DELAY.as_secs_f64());
    let jitter = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64((capped * jitter).max(0.0))
}

/// Endpoint for log lines, without the access token.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
