//! Print Herald - relays 3D printer telemetry into chat notifications.
//!
//! The library turns the push notifications of a Moonraker backend into print
//! lifecycle events and keeps one chat message per print job up to date,
//! editing it in place instead of posting a new message for every change.
//!
//! # Core Components
//!
//! * [`status`] - Cumulative telemetry store with deep-merge patching
//! * [`classifier`] - Lifecycle events from status transitions
//! * [`dispatcher`] - Message composition, per-job message tracking, send guard
//! * [`format`] - Notification text
//! * [`moonraker`] - JSON-RPC websocket client with reconnect
//! * [`transport`] - Telegram Bot API client
//! * [`image_fetcher`] - Thumbnails and camera snapshots
//! * [`bot`] - Per-bot pipeline wiring everything together
//! * [`config`] - Configuration file loading
//! * [`error`] - Error types
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use print_herald::*;
//!
//! let config = Config::load()?;
//! let bot_config = &config.bots[0];
//! let (client, printer_rx) = MoonrakerClient::connect(bot_config.printer.websocket_url()?, cancel);
//! // Build a Dispatcher and a Bot, then `bot.run(printer_rx, ...)`.
//! ```

pub mod bot;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod image_fetcher;
pub mod moonraker;
pub mod status;
pub mod transport;

pub use bot::{Bot, BotCommand};
pub use classifier::{Event, LifecycleSignal};
pub use config::{BotConfig, Config};
pub use dispatcher::{Dispatcher, JobId, SendOutcome, TrackedMessage};
pub use error::Error;
pub use image_fetcher::{ImageSource, PrinterImages};
pub use moonraker::{MoonrakerClient, PrinterMessage, PrinterRpc};
pub use status::{PrinterInfo, PrinterStatus, StatusStore};
pub use transport::{ChatTransport, TelegramTransport};
