//! Configuration loading and validation.
//!
//! The configuration is a TOML file holding one `[[bots]]` entry per
//! printer. Tunables that are not worth exposing live in [`constants`].

use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "PRINT_HERALD_CONFIG";

/// Configuration file used when [`CONFIG_PATH_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "./config.toml";

/// Top-level configuration: one entry per bot.
///
/// Every bot runs its own independent pipeline (printer connection, status
/// store, dispatcher), so a single process can relay several printers.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bots: Vec<BotConfig>,
}

/// Configuration for a single chat bot bound to a single printer.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Telegram bot token.
    pub token: String,

    /// User ids allowed to issue `/status`. Empty means everyone.
    #[serde(default)]
    pub admins: Vec<i64>,

    /// Chats that receive notifications, in delivery order.
    pub chats: Vec<i64>,

    pub printer: PrinterConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Printer backend endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PrinterConfig {
    /// Display name, used in log lines.
    #[serde(default = "default_printer_name")]
    pub name: String,

    /// Base URL of the backend, e.g. `http://192.168.100.100:7125/`.
    pub url: String,

    /// Snapshot URL of the printer camera.
    pub cam_url: String,

    /// Access token appended to the websocket URL.
    #[serde(default)]
    pub token: String,

    /// Flip camera snapshots vertically (camera mounted upside-down).
    #[serde(default)]
    pub flip_camera: bool,
}

/// Periodic status refresh while a print is running.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: constants::DEFAULT_TICK_INTERVAL_SECS,
        }
    }
}

fn default_printer_name() -> String {
    "Printer".to_string()
}

impl Config {
    /// Load the configuration from the file named by `PRINT_HERALD_CONFIG`,
    /// falling back to `./config.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The file is not valid TOML or does not match the expected shape
    /// - A value fails validation (empty token or chat list, bad URL, zero interval)
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(Path::new(&path))
    }

    /// Read and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents and
    /// [`ConfigError::InvalidValue`] or [`ConfigError::InvalidUrl`] for
    /// values that fail validation. Errors name the offending field as
    /// `bots[i].field`.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bots.is_empty() {
            return Err(invalid("bots", "at least one bot must be configured"));
        }

        for (index, bot) in self.bots.iter().enumerate() {
            if bot.token.trim().is_empty() {
                return Err(invalid(&format!("bots[{index}].token"), "must not be empty"));
            }
            if bot.chats.is_empty() {
                return Err(invalid(
                    &format!("bots[{index}].chats"),
                    "at least one chat id is required",
                ));
            }
            if bot.schedule.interval_secs == 0 {
                return Err(invalid(
                    &format!("bots[{index}].schedule.interval_secs"),
                    "must be greater than zero",
                ));
            }
            parse_url(&format!("bots[{index}].printer.url"), &bot.printer.url)?;
            parse_url(&format!("bots[{index}].printer.cam_url"), &bot.printer.cam_url)?;
        }

        Ok(())
    }
}

impl PrinterConfig {
    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Websocket endpoint of the backend, carrying the access token.
    ///
    /// `http://host:7125/` becomes `ws://host:7125/websocket?token=...`;
    /// `https` maps to `wss`.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` does not parse or cannot carry a websocket
    /// scheme.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url = parse_url("printer.url", &self.url)?;

        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| invalid("printer.url", "scheme cannot be mapped to a websocket scheme"))?;

        let path = format!("{}/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);

        if self.token.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().append_pair("token", &self.token);
        }

        Ok(url)
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field: field.to_string(),
        value: value.to_string(),
        source,
    })
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Application constants used throughout the system.
pub mod constants {
    use std::time::Duration;

    /// Default interval between periodic status refreshes.
    pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

    /// How long an RPC call may wait for its response.
    pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

    /// First reconnect delay after the backend connection drops.
    pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

    /// Upper bound on the reconnect delay.
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

    /// Attempts made to fetch a camera snapshot before giving up.
    pub const MAX_IMAGE_RETRIES: u32 = 3;

    /// Delay between snapshot attempts.
    pub const IMAGE_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Per-request timeout for thumbnail and camera downloads.
    pub const IMAGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Long-poll timeout for chat command updates, in seconds.
    pub const UPDATES_POLL_TIMEOUT_SECS: u64 = 30;

    /// Delay before polling chat updates again after a failure.
    pub const UPDATES_RETRY_DELAY: Duration = Duration::from_secs(15);

    /// Nesting depth below which status patches are merged key-wise.
    pub const MAX_MERGE_DEPTH: usize = 16;

    /// Capacity of the channel carrying backend messages to a bot.
    pub const PRINTER_CHANNEL_CAPACITY: usize = 256;
}
