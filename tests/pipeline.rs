mod common;

use std::sync::Arc;

use common::{CHATS, Call, FakeImages, FakeRpc, FakeTransport, dispatcher};
use print_herald::status::KlippyState;
use print_herald::{Bot, BotCommand, LifecycleSignal, PrinterMessage, SendOutcome};
use serde_json::{Value, json};

struct Harness {
    bot: Bot,
    rpc: Arc<FakeRpc>,
    transport: Arc<FakeTransport>,
    images: Arc<FakeImages>,
}

fn harness(admins: Vec<i64>) -> Harness {
    let transport = FakeTransport::new();
    let images = FakeImages::new();
    let rpc = FakeRpc::new();
    rpc.respond(
        "printer.info",
        json!({ "state": "ready", "state_message": "Printer is ready" }),
    );
    let bot = Bot::new(
        "voron".to_string(),
        dispatcher(&transport, &images),
        rpc.clone(),
        admins,
    );
    Harness {
        bot,
        rpc,
        transport,
        images,
    }
}

impl Harness {
    /// Feed one message and wait for the dispatch it spawned, if any.
    async fn feed(&mut self, message: PrinterMessage) -> Option<SendOutcome> {
        let handle = self.bot.handle_printer_message(message).await?;
        Some(handle.await.unwrap())
    }

    async fn patch(&mut self, patch: Value) -> Option<SendOutcome> {
        self.feed(PrinterMessage::StatusUpdate(patch)).await
    }

    async fn connect_idle(&mut self) {
        self.rpc.respond(
            "printer.objects.query",
            json!({ "status": { "print_stats": { "state": "standby", "filename": "" } } }),
        );
        assert_eq!(self.feed(PrinterMessage::Connected).await, None);
    }
}

#[tokio::test]
async fn connect_resyncs_before_trusting_patches() {
    let mut h = harness(vec![]);
    h.rpc.respond(
        "printer.objects.subscribe",
        json!({ "status": { "extruder": { "temperature": 24.5 } } }),
    );
    h.rpc.respond("server.info", json!({ "moonraker_version": "v0.9" }));
    h.connect_idle().await;

    assert_eq!(
        h.rpc.calls(),
        vec![
            "printer.objects.query",
            "printer.objects.subscribe",
            "server.info",
            "printer.info",
        ]
    );
    let status = h.bot.store().status();
    assert_eq!(status.str_field("print_stats", "state"), Some("standby"));
    assert_eq!(status.f64_field("extruder", "temperature"), Some(24.5));
    assert_eq!(h.bot.store().info().state, KlippyState::Ready);
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn print_run_threads_one_message_per_chat() {
    let mut h = harness(vec![]);
    h.connect_idle().await;

    let started = h
        .patch(json!({ "print_stats": { "state": "printing", "filename": "benchy.gcode" } }))
        .await;
    assert_eq!(started, Some(SendOutcome::Delivered { chats: 2 }));
    assert_eq!(h.images.thumbnail_count(), 1);
    let job = h.bot.dispatcher().current_job().expect("job started");
    let first = h.bot.dispatcher().tracked_message(job, CHATS[0]).unwrap();

    // Temperature-only patches are not events.
    assert_eq!(h.patch(json!({ "extruder": { "temperature": 215.0 } })).await, None);

    let progressed = h
        .patch(json!({ "display_status": { "message": "Layer 2/100" } }))
        .await;
    assert_eq!(progressed, Some(SendOutcome::Delivered { chats: 2 }));
    assert_eq!(h.bot.dispatcher().current_job(), Some(job));

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[..2].iter().all(Call::is_new_message));
    assert!(calls[2..].iter().all(|call| !call.is_new_message()));
    assert!(matches!(
        &calls[2],
        Call::EditMediaUpload { message, .. } if *message == first.message_id
    ));
    assert!(calls[2].text().contains("M117 Layer 2/100"));

    h.transport.clear();
    let cancelled = h.patch(json!({ "print_stats": { "state": "standby" } })).await;
    assert_eq!(cancelled, Some(SendOutcome::Delivered { chats: 2 }));
    let calls = h.transport.calls();
    assert!(calls.iter().all(Call::is_new_message));
    assert!(calls[0].text().starts_with("Cancelled\n"));
    assert_eq!(h.bot.dispatcher().current_job(), None);
    assert_eq!(h.bot.dispatcher().tracked_count(), 0);
}

#[tokio::test]
async fn pause_and_resume_stay_on_the_same_job() {
    let mut h = harness(vec![]);
    h.connect_idle().await;
    h.patch(json!({ "print_stats": { "state": "printing", "filename": "benchy.gcode" } }))
        .await;
    let job = h.bot.dispatcher().current_job().unwrap();
    h.transport.clear();

    h.patch(json!({ "print_stats": { "state": "paused" } })).await;
    h.patch(json!({ "print_stats": { "state": "printing" } })).await;

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|call| !call.is_new_message()));
    assert!(calls[0].text().starts_with("Paused\n"));
    assert_eq!(h.bot.dispatcher().current_job(), Some(job));
}

#[tokio::test]
async fn lost_connection_reports_error_and_ends_job() {
    let mut h = harness(vec![]);
    h.connect_idle().await;
    h.patch(json!({ "print_stats": { "state": "printing", "filename": "benchy.gcode" } }))
        .await;
    h.transport.clear();

    // A dropped link leaves printer.info unanswered.
    h.rpc.forget("printer.info");
    let outcome = h.feed(PrinterMessage::ConnectionLost).await;

    assert_eq!(outcome, Some(SendOutcome::Delivered { chats: 2 }));
    assert_eq!(h.bot.store().info().state, KlippyState::Unknown);
    let calls = h.transport.calls();
    assert!(calls.iter().all(|call| matches!(call, Call::SendText { .. })));
    assert!(calls[0].text().starts_with("Error!\n"));
    assert_eq!(h.bot.dispatcher().current_job(), None);
}

#[tokio::test]
async fn klippy_shutdown_and_ready_signals() {
    let mut h = harness(vec![]);
    h.connect_idle().await;

    h.rpc.respond(
        "printer.info",
        json!({ "state": "shutdown", "state_message": "MCU 'mcu' shutdown: Timer too close" }),
    );
    h.feed(PrinterMessage::Klippy(LifecycleSignal::Shutdown)).await;
    let calls = h.transport.calls();
    assert!(calls[0].text().starts_with("Error!\nPrinter status: shutdown\n"));
    assert!(calls[0].text().contains("Timer too close"));

    h.transport.clear();
    h.rpc.respond("printer.info", json!({ "state": "ready" }));
    h.feed(PrinterMessage::Klippy(LifecycleSignal::Ready)).await;
    let calls = h.transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].text().starts_with("Printer status: standby\n"));
    assert_eq!(h.bot.store().info().state, KlippyState::Ready);
}

#[tokio::test]
async fn scheduled_refresh_only_while_printing() {
    let mut h = harness(vec![]);
    h.connect_idle().await;
    assert!(h.bot.on_tick().is_none());

    h.patch(json!({ "print_stats": { "state": "printing", "filename": "benchy.gcode" } }))
        .await;
    h.transport.clear();

    let outcome = h.bot.on_tick().expect("tick while printing").await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered { chats: 2 });
    assert!(h.transport.calls().iter().all(|call| !call.is_new_message()));
    assert_eq!(h.images.snapshot_count(), 1);
}

#[tokio::test]
async fn status_command_requires_admin() {
    let h = harness(vec![42]);

    let denied = BotCommand::Status {
        chat: CHATS[0],
        user: Some(7),
    };
    assert!(h.bot.handle_command(&denied).is_none());
    let anonymous = BotCommand::Status {
        chat: CHATS[0],
        user: None,
    };
    assert!(h.bot.handle_command(&anonymous).is_none());
    assert!(h.bot.handle_command(&BotCommand::Start { chat: 5 }).is_none());

    let allowed = BotCommand::Status {
        chat: CHATS[0],
        user: Some(42),
    };
    let outcome = h.bot.handle_command(&allowed).unwrap().await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered { chats: 2 });
}

#[tokio::test]
async fn empty_admin_list_allows_everyone() {
    let h = harness(vec![]);
    assert!(h.bot.is_admin(None));
    assert!(h.bot.is_admin(Some(1)));
}

#[tokio::test]
async fn host_stats_are_merged_without_events() {
    let mut h = harness(vec![]);
    let outcome = h
        .feed(PrinterMessage::ProcStatUpdate(json!({
            "moonraker_stats": { "cpu_usage": 3.5, "memory": 41000 },
            "cpu_temp": 48.2,
        })))
        .await;
    assert_eq!(outcome, None);
    h.feed(PrinterMessage::ProcStatUpdate(json!({ "moonraker_stats": { "cpu_usage": 4.0 } })))
        .await;

    let stats = h.bot.store().host_stats();
    assert_eq!(stats["moonraker_stats"]["cpu_usage"], json!(4.0));
    assert_eq!(stats["moonraker_stats"]["memory"], json!(41000));
    assert_eq!(stats["cpu_temp"], json!(48.2));
    assert!(h.transport.calls().is_empty());
}
