//! Per-bot pipeline: backend messages → status store → classifier →
//! dispatcher, plus the periodic refresh and chat commands.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::classifier::{self, Event, LifecycleSignal};
use crate::config::constants::{UPDATES_POLL_TIMEOUT_SECS, UPDATES_RETRY_DELAY};
use crate::dispatcher::{Dispatcher, SendOutcome};
use crate::moonraker::{self, PrinterMessage, PrinterRpc};
use crate::status::{self, StatusStore};
use crate::transport::{ChatId, IncomingCommand, TelegramTransport};

/// Chat command understood by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// `/start`: report the chat id so it can be added to the config.
    Start { chat: ChatId },
    /// `/status`: push the current status.
    Status { chat: ChatId, user: Option<i64> },
}

impl BotCommand {
    fn from_incoming(incoming: &IncomingCommand) -> Option<Self> {
        match incoming.command.as_str() {
            "start" => Some(Self::Start {
                chat: incoming.chat,
            }),
            "status" => Some(Self::Status {
                chat: incoming.chat,
                user: incoming.user,
            }),
            _ => None,
        }
    }
}

/// One printer relayed into the bot's chats.
pub struct Bot {
    name: String,
    store: StatusStore,
    dispatcher: Arc<Dispatcher>,
    rpc: Arc<dyn PrinterRpc>,
    admins: Vec<i64>,
}

impl Bot {
    /// # Arguments
    ///
    /// * `name` - Printer name, prefixed to log lines
    /// * `dispatcher` - Dispatcher shared with the spawned broadcasts
    /// * `rpc` - Backend connection used for resync and info refreshes
    /// * `admins` - Users allowed to run `/status`; empty allows everyone
    pub fn new(
        name: String,
        dispatcher: Arc<Dispatcher>,
        rpc: Arc<dyn PrinterRpc>,
        admins: Vec<i64>,
    ) -> Self {
        Self {
            name,
            store: StatusStore::new(),
            dispatcher,
            rpc,
            admins,
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Apply one backend message. Returns the spawned dispatch, if the
    /// message produced an event.
    pub async fn handle_printer_message(
        &mut self,
        message: PrinterMessage,
    ) -> Option<JoinHandle<SendOutcome>> {
        match message {
            PrinterMessage::Connected => {
                self.resync().await;
                None
            }
            PrinterMessage::ConnectionLost => {
                self.on_signal(LifecycleSignal::Disconnected).await
            }
            PrinterMessage::Klippy(signal) => self.on_signal(signal).await,
            PrinterMessage::StatusUpdate(patch) => {
                let transition = self.store.apply_patch(&patch);
                let event = classifier::classify(&transition.previous, &transition.current)?;
                Some(self.dispatch(event))
            }
            PrinterMessage::ProcStatUpdate(patch) => {
                self.store.apply_host_stats(&patch);
                None
            }
        }
    }

    /// Periodic refresh; dispatches only while a print is running.
    pub fn on_tick(&self) -> Option<JoinHandle<SendOutcome>> {
        match classifier::classify_tick(self.store.status()) {
            Some(event) => Some(self.dispatch(event)),
            None => {
                debug!("[{}] Not printing, skipping scheduled update", self.name);
                None
            }
        }
    }

    /// React to a chat command.
    pub fn handle_command(&self, command: &BotCommand) -> Option<JoinHandle<SendOutcome>> {
        match command {
            BotCommand::Start { chat } => {
                info!("[{}] /start from chat {}", self.name, chat);
                None
            }
            BotCommand::Status { chat, user } => {
                if !self.is_admin(*user) {
                    warn!(
                        "[{}] Ignoring /status from non-admin {:?} in chat {}",
                        self.name, user, chat
                    );
                    return None;
                }
                Some(self.dispatch(Event::StateChange))
            }
        }
    }

    /// Admin check; an empty admin list lets everyone in.
    pub fn is_admin(&self, user: Option<i64>) -> bool {
        self.admins.is_empty() || user.is_some_and(|user| self.admins.contains(&user))
    }

    /// Re-read everything after a (re)connect before trusting patches.
    async fn resync(&mut self) {
        if !self
            .store
            .baseline(self.rpc.as_ref(), status::baseline_objects())
            .await
        {
            warn!("[{}] Baseline query unanswered", self.name);
        }

        if let Some(result) =
            moonraker::subscribe_objects(self.rpc.as_ref(), status::subscribed_objects()).await
        {
            // The subscription reply carries the full state of every object.
            if let Some(status) = result.get("status") {
                self.store.apply_patch(status);
            }
        }

        if let Some(server) = moonraker::server_info(self.rpc.as_ref()).await {
            info!(
                "[{}] Backend {} (klippy {})",
                self.name,
                server["moonraker_version"].as_str().unwrap_or("unknown version"),
                server["klippy_state"].as_str().unwrap_or("unknown"),
            );
        }

        let info = self.store.refresh_info(self.rpc.as_ref()).await;
        info!("[{}] Printer state: {}", self.name, info.state.as_str());
    }

    async fn on_signal(&mut self, signal: LifecycleSignal) -> Option<JoinHandle<SendOutcome>> {
        info!("[{}] Lifecycle signal {:?}", self.name, signal);
        self.store.refresh_info(self.rpc.as_ref()).await;
        Some(self.dispatch(classifier::classify_signal(signal)))
    }

    /// Hand the event to the dispatcher without blocking the pipeline, so
    /// patches keep flowing while a broadcast is in flight.
    fn dispatch(&self, event: Event) -> JoinHandle<SendOutcome> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let status = self.store.status().clone();
        let info = self.store.info().clone();
        tokio::spawn(async move { dispatcher.on_event(event, &status, &info).await })
    }

    /// Process backend messages, scheduled ticks, and commands until
    /// `cancel` fires or the backend channel closes.
    pub async fn run(
        mut self,
        mut printer: mpsc::Receiver<PrinterMessage>,
        mut commands: mpsc::Receiver<BotCommand>,
        tick_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + tick_interval,
            tick_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("[{}] Bot running", self.name);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(message) = printer.recv() => {
                    self.handle_printer_message(message).await;
                }
                Some(command) = commands.recv() => {
                    self.handle_command(&command);
                }
                _ = ticker.tick() => {
                    self.on_tick();
                }
                else => break,
            }
        }
        info!("[{}] Bot stopped", self.name);
    }
}

/// Long-poll the chat service for commands and forward them to the bot.
pub async fn poll_commands(
    transport: Arc<TelegramTransport>,
    commands: mpsc::Sender<BotCommand>,
    cancel: CancellationToken,
) {
    if let Err(e) = transport.set_commands().await {
        warn!("Failed to register bot commands: {}", e);
    }

    let mut offset = 0;
    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = transport.poll_commands(offset, UPDATES_POLL_TIMEOUT_SECS) => result,
        };

        match polled {
            Ok(updates) => {
                for incoming in updates {
                    offset = offset.max(incoming.update_id + 1);
                    if let Some(command) = BotCommand::from_incoming(&incoming) {
                        if commands.send(command).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Failed to poll chat commands: {}", e);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(UPDATES_RETRY_DELAY) => {}
                }
            }
        }
    }
}
