//! Notification dispatcher.
//!
//! Maps lifecycle events to chat messages and keeps one message per print
//! job per chat, editing it in place as the print progresses. At most one
//! broadcast is in flight at a time: a broadcast that would overlap a running
//! one is dropped, not queued, because the next update supersedes it anyway.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use log::{debug, error, info, warn};

use crate::classifier::Event;
use crate::error::TransportError;
use crate::format::format_message;
use crate::image_fetcher::ImageSource;
use crate::status::{PrinterInfo, PrinterStatus};
use crate::transport::{ChatId, ChatTransport, MessageId, PhotoInput, SentMessage};

/// Identifies one print run's message thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Handle to the message representing a job in one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    pub message_id: MessageId,
    pub photo_file_id: Option<String>,
}

impl TrackedMessage {
    pub fn has_photo(&self) -> bool {
        self.photo_file_id.is_some()
    }
}

impl From<SentMessage> for TrackedMessage {
    fn from(sent: SentMessage) -> Self {
        Self {
            message_id: sent.message_id,
            photo_file_id: sent.photo_file_id,
        }
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every configured chat was updated.
    Delivered { chats: usize },
    /// Another broadcast was in flight; nothing was sent.
    Dropped,
    /// A chat failed; the chats before it keep their update.
    Aborted { delivered: usize, error: String },
}

#[derive(Debug, Default)]
struct JobState {
    current: Option<JobId>,
    issued: u64,
    tracked: HashMap<(JobId, ChatId), TrackedMessage>,
}

/// Clears the in-flight flag when the broadcast ends, however it ends.
struct SendGuard<'a>(&'a AtomicBool);

impl<'a> SendGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the job id and tracked messages of one bot.
pub struct Dispatcher {
    chats: Vec<ChatId>,
    transport: Arc<dyn ChatTransport>,
    images: Arc<dyn ImageSource>,
    sending: AtomicBool,
    state: Mutex<JobState>,
}

impl Dispatcher {
    /// Create a dispatcher broadcasting to `chats` in order.
    ///
    /// # Arguments
    ///
    /// * `chats` - Chat ids receiving every notification, in delivery order
    /// * `transport` - Chat service used to send and edit messages
    /// * `images` - Source of thumbnails and camera snapshots
    pub fn new(
        chats: Vec<ChatId>,
        transport: Arc<dyn ChatTransport>,
        images: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            chats,
            transport,
            images,
            sending: AtomicBool::new(false),
            state: Mutex::new(JobState::default()),
        }
    }

    /// Compose and broadcast the notification for `event`.
    ///
    /// The job is resolved before any await. `cancel_print` and `error`
    /// detach the current job immediately and send untracked; their old
    /// messages are forgotten once the broadcast is over.
    pub async fn on_event(
        &self,
        event: Event,
        status: &PrinterStatus,
        info: &PrinterInfo,
    ) -> SendOutcome {
        let (job, ending) = self.resolve_job(event, status);
        info!(
            "Dispatching {} ({})",
            event,
            job.map_or_else(|| "untracked".to_string(), |job| job.to_string())
        );

        let image = self.resolve_image(event, status, info).await;
        let text = format!(
            "{}{}",
            text_prefix(event),
            format_message(info, status, Local::now())
        );

        let outcome = self.send(&text, image.as_deref(), job).await;

        if let Some(ending) = ending {
            self.forget_job(ending);
        }
        outcome
    }

    /// Broadcast `text` (and `photo`) to every chat, reusing the job's
    /// tracked messages when `job` is set.
    pub async fn send(&self, text: &str, photo: Option<&[u8]>, job: Option<JobId>) -> SendOutcome {
        let Some(_guard) = SendGuard::acquire(&self.sending) else {
            warn!("Previous send still running, dropping update");
            return SendOutcome::Dropped;
        };

        let mut delivered = 0;
        for &chat in &self.chats {
            let result = match job {
                Some(job) => self.send_tracked(job, chat, text, photo).await,
                None => self.send_new(chat, text, photo).await.map(|_| ()),
            };

            if let Err(e) = result {
                error!("Failed to deliver update to chat {}: {}", chat, e);
                return SendOutcome::Aborted {
                    delivered,
                    error: e.to_string(),
                };
            }
            delivered += 1;
        }

        SendOutcome::Delivered { chats: delivered }
    }

    /// Job that later events will edit, if a print run is in progress.
    pub fn current_job(&self) -> Option<JobId> {
        self.lock().current
    }

    /// Message representing `job` in `chat`.
    pub fn tracked_message(&self, job: JobId, chat: ChatId) -> Option<TrackedMessage> {
        self.lock().tracked.get(&(job, chat)).cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().tracked.len()
    }

    /// True while a broadcast holds the send guard.
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Job the event's message belongs to, assigning one for the first
    /// event of a print run.
    ///
    /// Job-ending events detach the current job here, before any await, so
    /// an event dispatched while their broadcast is still running starts a
    /// fresh job. The detached job is returned as the second element.
    fn resolve_job(&self, event: Event, status: &PrinterStatus) -> (Option<JobId>, Option<JobId>) {
        let mut state = self.lock();
        if event.ends_job() {
            let ending = state.current.take();
            if let Some(job) = ending {
                debug!("Ending {}", job);
            }
            return (None, ending);
        }

        let assign = match event {
            Event::StartPrint | Event::PausePrint => true,
            Event::StateChange => status.is_printing(),
            Event::CancelPrint | Event::Error => false,
        };

        if assign && state.current.is_none() {
            state.issued += 1;
            let job = JobId(state.issued);
            debug!("Starting {}", job);
            state.current = Some(job);
        }
        (state.current, None)
    }

    /// Drop the tracked messages of an ended job.
    fn forget_job(&self, job: JobId) {
        let mut state = self.lock();
        state.tracked.retain(|(tracked_job, _), _| *tracked_job != job);
        debug!("Forgot messages of {}", job);
    }

    async fn resolve_image(
        &self,
        event: Event,
        status: &PrinterStatus,
        info: &PrinterInfo,
    ) -> Option<Vec<u8>> {
        match event {
            Event::StartPrint => match status.filename() {
                Some(filename) => self.images.thumbnail(filename).await,
                None => None,
            },
            Event::PausePrint | Event::StateChange => {
                if info.is_ready() && status.is_printing() {
                    self.images.snapshot().await
                } else {
                    None
                }
            }
            Event::CancelPrint => self.images.snapshot().await,
            Event::Error => None,
        }
    }

    async fn send_new(
        &self,
        chat: ChatId,
        text: &str,
        photo: Option<&[u8]>,
    ) -> Result<SentMessage, TransportError> {
        match photo {
            Some(photo) => self.transport.send_photo(chat, photo, text).await,
            None => self.transport.send_text(chat, text).await,
        }
    }

    async fn send_tracked(
        &self,
        job: JobId,
        chat: ChatId,
        text: &str,
        photo: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let tracked = self.tracked_message(job, chat);

        let Some(tracked) = tracked else {
            let sent = self.send_new(chat, text, photo).await?;
            self.track(job, chat, sent.into());
            return Ok(());
        };

        match (tracked.photo_file_id.as_deref(), photo) {
            (Some(file_id), None) => {
                self.transport
                    .edit_media(chat, tracked.message_id, PhotoInput::FileId(file_id), text)
                    .await?;
            }
            (Some(_), Some(bytes)) => {
                let edited = self
                    .transport
                    .edit_media(chat, tracked.message_id, PhotoInput::Upload(bytes), text)
                    .await?;
                let photo_file_id = edited.photo_file_id.or(tracked.photo_file_id);
                self.track(
                    job,
                    chat,
                    TrackedMessage {
                        message_id: tracked.message_id,
                        photo_file_id,
                    },
                );
            }
            (None, _) => {
                self.transport
                    .edit_text(chat, tracked.message_id, text)
                    .await?;
            }
        }
        Ok(())
    }

    /// Record a message for `job`, unless the job ended meanwhile.
    fn track(&self, job: JobId, chat: ChatId, message: TrackedMessage) {
        let mut state = self.lock();
        if state.current == Some(job) {
            state.tracked.insert((job, chat), message);
        }
    }
}

fn text_prefix(event: Event) -> &'static str {
    match event {
        Event::PausePrint => "Paused\n",
        Event::CancelPrint => "Cancelled\n",
        Event::Error => "Error!\n",
        Event::StartPrint | Event::StateChange => "",
    }
}
