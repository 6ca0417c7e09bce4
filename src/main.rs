use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use print_herald::bot::{self, Bot};
use print_herald::config::{BotConfig, Config};
use print_herald::{Dispatcher, MoonrakerClient, PrinterImages, PrinterRpc, TelegramTransport};

/// Print Herald - relays 3D printer telemetry into chat notifications.
///
/// Connects to one or more Moonraker backends and keeps a single Telegram
/// message per print job up to date: a thumbnail when the print starts, a
/// live camera snapshot while it runs, and a final message when it is
/// cancelled or fails.
///
/// # Environment Variables
///
/// * `PRINT_HERALD_CONFIG` - Path to the TOML configuration (default: "./config.toml")
/// * `RUST_LOG` - Log level (default: "info")
///
/// # Usage
///
/// ```bash
/// export PRINT_HERALD_CONFIG="/etc/print-herald/config.toml"
/// ./print-herald
/// ```
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let config = Config::load().context("Failed to load configuration")?;

    info!("Print Herald starting with {} bot(s)", config.bots.len());

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    for bot_config in &config.bots {
        let task = start_bot(bot_config, cancel.child_token()).with_context(|| {
            format!("Failed to start bot for '{}'", bot_config.printer.name)
        })?;
        tasks.push(task);
    }

    shutdown_signal().await;
    info!("Stopping bots");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Bot task failed: {}", e);
        }
    }

    Ok(())
}

/// Wire up the connection, transport, dispatcher, and pipeline of one bot.
fn start_bot(
    config: &BotConfig,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, print_herald::Error> {
    let ws_url = config.printer.websocket_url()?;

    info!(
        "Relaying '{}' ({}) to {} chat(s)",
        config.printer.name,
        config.printer.base_url(),
        config.chats.len()
    );

    let (client, printer_rx) = MoonrakerClient::connect(ws_url, cancel.clone());
    let rpc: Arc<dyn PrinterRpc> = Arc::new(client);

    let telegram = Arc::new(TelegramTransport::new(&config.token));
    let images = Arc::new(PrinterImages::new(&config.printer, Arc::clone(&rpc)));
    let dispatcher = Arc::new(Dispatcher::new(
        config.chats.clone(),
        telegram.clone(),
        images,
    ));

    let (command_tx, command_rx) = mpsc::channel(16);
    tokio::spawn(bot::poll_commands(telegram, command_tx, cancel.clone()));

    let bot = Bot::new(
        config.printer.name.clone(),
        dispatcher,
        rpc,
        config.admins.clone(),
    );
    let interval = Duration::from_secs(config.schedule.interval_secs);
    Ok(tokio::spawn(bot.run(printer_rx, command_rx, interval, cancel)))
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
