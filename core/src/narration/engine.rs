//! Async driver for the narration state machine.
//!
//! One task owns the [`Narrator`] and is the only writer of playback state.
//! Callers talk to it through a cloneable [`NarrationHandle`]; every trigger
//! (play, seek, rate change, ...) goes through the same command channel, so
//! the cancel-before-issue protocol needs no locks.
//!
//! Synthesis requests run as spawned tasks tagged with their request id. On
//! cancel the driver stops the port, aborts the task and waits until it is
//! gone before anything new is issued, so at most one request is ever
//! outstanding.

use super::machine::{validate_rate, Effect, Narrator, PlaybackState, RequestId};
use crate::book::{Book, BookMeta, Position};
use crate::content::{load_book, ContentProvider};
use crate::progress::ProgressStore;
use crate::synthesis::{SpeechRequest, SynthesisFailure, SynthesisPort};
use crate::voice::VoiceSelector;
use crate::{NarratorError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

const DEFAULT_INTRO_TEMPLATE: &str = "Hi, and welcome to this episode of our book narration. \
Today's book is {title}, written by {author}. It is well worth reading, so let's listen together!";

#[derive(Clone, Debug)]
pub struct NarrationConfig {
    /// Quiet period after the last rate change before playback restarts
    pub rate_settle: Duration,
    /// Quiet period after the last position change before progress is saved
    pub save_debounce: Duration,
    pub rate: f32,
    pub intro_template: String,
    pub event_capacity: usize,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        let ms = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(default))
        };
        Self {
            rate_settle: ms("NARRATOR_RATE_SETTLE_MS", 200),
            save_debounce: ms("NARRATOR_SAVE_DEBOUNCE_MS", 1000),
            rate: std::env::var("NARRATOR_RATE")
                .ok()
                .and_then(|s| s.parse::<f32>().ok())
                .and_then(|r| validate_rate(r).ok())
                .unwrap_or(1.0),
            intro_template: std::env::var("NARRATOR_INTRO_TEMPLATE")
                .unwrap_or_else(|_| DEFAULT_INTRO_TEMPLATE.to_string()),
            event_capacity: 256,
        }
    }
}

impl NarrationConfig {
    pub fn intro_text(&self, book: &Book) -> String {
        self.intro_template
            .replace("{title}", &book.title)
            .replace("{author}", &book.author)
    }
}

/// Observable engine output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NarrationEvent {
    StateChanged { state: PlaybackState },
    PositionChanged { position: Position, percentage: f64 },
    /// Dismissible notice for a genuine synthesis failure
    Error { message: String },
    Finished,
    ProgressSaved { position: Position, percentage: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationSnapshot {
    pub book_id: String,
    pub state: PlaybackState,
    pub position: Position,
    pub percentage: f64,
    pub rate: f32,
    pub voice: Option<String>,
    pub last_error: Option<String>,
    pub in_flight: Option<RequestId>,
}

#[derive(Debug)]
enum Command {
    Play,
    PlayIntro,
    Pause,
    Seek(Position),
    NextChapter,
    PrevChapter,
    SetRate(f32),
    DismissError,
    Close,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<()>>,
}

struct Outcome {
    id: RequestId,
    result: std::result::Result<(), SynthesisFailure>,
}

/// Cloneable control surface of a running engine
#[derive(Clone)]
pub struct NarrationHandle {
    commands: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<NarrationSnapshot>,
    events: broadcast::Sender<NarrationEvent>,
    book: Arc<Book>,
}

impl NarrationHandle {
    async fn send(&self, command: Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .map_err(|_| NarratorError::EngineClosed)?;
        rx.await.map_err(|_| NarratorError::EngineClosed)?
    }

    pub async fn play(&self) -> Result<()> {
        self.send(Command::Play).await
    }

    pub async fn play_intro(&self) -> Result<()> {
        self.send(Command::PlayIntro).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn seek(&self, chapter: usize, paragraph: usize) -> Result<()> {
        self.send(Command::Seek(Position::new(chapter, paragraph)))
            .await
    }

    pub async fn next_chapter(&self) -> Result<()> {
        self.send(Command::NextChapter).await
    }

    pub async fn prev_chapter(&self) -> Result<()> {
        self.send(Command::PrevChapter).await
    }

    pub async fn set_rate(&self, rate: f32) -> Result<()> {
        self.send(Command::SetRate(rate)).await
    }

    pub async fn dismiss_error(&self) -> Result<()> {
        self.send(Command::DismissError).await
    }

    /// Cancel any in-flight request, flush a pending save and stop the engine
    pub async fn close(&self) -> Result<()> {
        self.send(Command::Close).await
    }

    pub fn snapshot(&self) -> NarrationSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NarrationEvent> {
        self.events.subscribe()
    }

    pub fn book(&self) -> &Book {
        &self.book
    }
}

pub struct NarrationEngine {
    book: Arc<Book>,
    seed: Position,
    port: Arc<dyn SynthesisPort>,
    voices: Arc<VoiceSelector>,
    store: Arc<ProgressStore>,
    cfg: NarrationConfig,
}

impl NarrationEngine {
    /// Load a book through `provider` and prepare an engine for it.
    ///
    /// A content failure is returned as `LoadError` and no engine exists for
    /// that book.
    pub async fn open(
        meta: BookMeta,
        provider: &dyn ContentProvider,
        port: Arc<dyn SynthesisPort>,
        voices: Arc<VoiceSelector>,
        store: Arc<ProgressStore>,
        cfg: NarrationConfig,
    ) -> Result<Self> {
        let book = load_book(provider, meta).await?;
        Ok(Self::new(book, port, voices, store, cfg))
    }

    /// Prepare an engine for an already loaded book, seeding the position
    /// from the progress store.
    pub fn new(
        book: Book,
        port: Arc<dyn SynthesisPort>,
        voices: Arc<VoiceSelector>,
        store: Arc<ProgressStore>,
        cfg: NarrationConfig,
    ) -> Self {
        let seed = match store.load(&book.id) {
            Ok(Some(record)) => record.position(),
            Ok(None) => Position::default(),
            Err(e) => {
                warn!(target = "narration", book = %book.id, error = %e, "Stored progress unreadable; starting from the beginning");
                Position::default()
            }
        };
        Self {
            book: Arc::new(book),
            seed,
            port,
            voices,
            store,
            cfg,
        }
    }

    /// Spawn the driver task
    pub fn start(self) -> (NarrationHandle, JoinHandle<()>) {
        let narrator = Narrator::new(
            (*self.book).clone(),
            self.seed,
            self.cfg.rate,
            self.cfg.intro_text(&self.book),
        );
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(self.cfg.event_capacity.max(1));
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        let mut driver = Driver {
            book_id: self.book.id.clone(),
            narrator,
            port: self.port,
            voices: self.voices,
            store: self.store,
            cfg: self.cfg,
            outcomes: outcomes_tx,
            speaking: None,
            rate_deadline: None,
            save_deadline: None,
            pending_save: None,
            events: events_tx.clone(),
            snapshot: watch::channel(NarrationSnapshot {
                book_id: self.book.id.clone(),
                state: PlaybackState::Idle,
                position: Position::default(),
                percentage: 0.0,
                rate: 1.0,
                voice: None,
                last_error: None,
                in_flight: None,
            })
            .0,
        };
        driver.publish_snapshot();

        let handle = NarrationHandle {
            commands: commands_tx,
            snapshot: driver.snapshot.subscribe(),
            events: events_tx,
            book: Arc::clone(&self.book),
        };

        info!(
            target = "narration",
            book = %driver.book_id,
            position = %driver.narrator.position(),
            backend = driver.port.name(),
            "Narration engine started"
        );
        let task = tokio::spawn(driver.run(commands_rx, outcomes_rx));
        (handle, task)
    }
}

struct Driver {
    book_id: String,
    narrator: Narrator,
    port: Arc<dyn SynthesisPort>,
    voices: Arc<VoiceSelector>,
    store: Arc<ProgressStore>,
    cfg: NarrationConfig,
    outcomes: mpsc::UnboundedSender<Outcome>,
    speaking: Option<(RequestId, JoinHandle<()>)>,
    rate_deadline: Option<Instant>,
    save_deadline: Option<Instant>,
    pending_save: Option<(Position, f64)>,
    events: broadcast::Sender<NarrationEvent>,
    snapshot: watch::Sender<NarrationSnapshot>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Request>,
        mut outcomes: mpsc::UnboundedReceiver<Outcome>,
    ) {
        loop {
            let rate_at = self.rate_deadline;
            let save_at = self.save_deadline;
            tokio::select! {
                request = commands.recv() => match request {
                    Some(Request { command, reply }) => {
                        let closing = matches!(command, Command::Close);
                        let result = self.handle(command).await;
                        let _ = reply.send(result);
                        if closing {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(outcome) = outcomes.recv() => self.on_outcome(outcome).await,
                _ = wait_until(rate_at) => {
                    self.rate_deadline = None;
                    debug!(target = "narration", rate = self.narrator.rate(), "Rate settled");
                    let fx = self.narrator.apply_rate();
                    self.apply(fx).await;
                }
                _ = wait_until(save_at) => self.flush_save(),
            }
        }
        info!(target = "narration", book = %self.book_id, "Narration engine stopped");
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        debug!(target = "narration", command = ?command, state = ?self.narrator.state(), "Command");
        let fx = match command {
            Command::Play => self.narrator.play(),
            Command::PlayIntro => self.narrator.play_intro(),
            Command::Pause => {
                self.rate_deadline = None;
                self.narrator.pause()
            }
            Command::Seek(target) => self.narrator.seek(target)?,
            Command::NextChapter => self.narrator.next_chapter(),
            Command::PrevChapter => self.narrator.prev_chapter(),
            Command::SetRate(rate) => {
                if self.narrator.set_rate(rate)? {
                    self.rate_deadline = Some(Instant::now() + self.cfg.rate_settle);
                }
                Vec::new()
            }
            Command::DismissError => self.narrator.dismiss_error(),
            Command::Close => {
                self.shutdown().await;
                return Ok(());
            }
        };
        self.apply(fx).await;
        Ok(())
    }

    async fn on_outcome(&mut self, outcome: Outcome) {
        if matches!(self.speaking, Some((id, _)) if id == outcome.id) {
            self.speaking = None;
        }
        let fx = match outcome.result {
            Ok(()) => self.narrator.on_completed(outcome.id),
            Err(failure) => self.narrator.on_failed(outcome.id, failure.reason),
        };
        self.apply(fx).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Cancel(id) => self.cancel(id).await,
                Effect::Speak { id, text, rate } => self.speak(id, text, rate),
                Effect::State(state) => {
                    info!(target = "narration", book = %self.book_id, state = ?state, "Playback state changed");
                    let _ = self.events.send(NarrationEvent::StateChanged { state });
                }
                Effect::Progress {
                    position,
                    percentage,
                } => {
                    let _ = self.events.send(NarrationEvent::PositionChanged {
                        position,
                        percentage,
                    });
                    self.pending_save = Some((position, percentage));
                    self.save_deadline = Some(Instant::now() + self.cfg.save_debounce);
                }
                Effect::Error(message) => {
                    warn!(target = "narration", book = %self.book_id, error = %message, "Synthesis failed");
                    let _ = self.events.send(NarrationEvent::Error { message });
                }
                Effect::Finished => {
                    info!(target = "narration", book = %self.book_id, "Reached the end of the book");
                    let _ = self.events.send(NarrationEvent::Finished);
                }
            }
        }
        self.publish_snapshot();
    }

    async fn cancel(&mut self, id: RequestId) {
        self.port.cancel().await;
        if let Some((speaking_id, task)) = self.speaking.take() {
            task.abort();
            // wait until the request is really gone
            let _ = task.await;
            debug!(target = "narration", id = speaking_id, "Synthesis request cancelled");
        } else {
            debug!(target = "narration", id, "Cancel with no task outstanding");
        }
    }

    fn speak(&mut self, id: RequestId, text: String, rate: f32) {
        let request = SpeechRequest {
            text,
            voice: self.voices.current().map(|v| v.id),
            rate,
        };
        debug!(
            target = "narration",
            id,
            voice = ?request.voice,
            rate,
            chars = request.text.chars().count(),
            "Issuing synthesis request"
        );
        let port = Arc::clone(&self.port);
        let outcomes = self.outcomes.clone();
        let task = tokio::spawn(async move {
            let result = port.speak(request).await;
            let _ = outcomes.send(Outcome { id, result });
        });
        self.speaking = Some((id, task));
    }

    fn flush_save(&mut self) {
        self.save_deadline = None;
        let Some((position, percentage)) = self.pending_save.take() else {
            return;
        };
        match self.store.save(&self.book_id, position, percentage) {
            Ok(record) => {
                let _ = self.events.send(NarrationEvent::ProgressSaved {
                    position,
                    percentage: record.percentage,
                });
            }
            // superseded by the next debounced save; no retry
            Err(e) => warn!(target = "progress", book = %self.book_id, error = %e, "Failed to save progress"),
        }
    }

    async fn shutdown(&mut self) {
        let fx = self.narrator.pause();
        self.apply(fx).await;
        if let Some((id, _)) = self.speaking {
            self.cancel(id).await;
        }
        self.rate_deadline = None;
        self.flush_save();
    }

    fn publish_snapshot(&mut self) {
        let snapshot = NarrationSnapshot {
            book_id: self.book_id.clone(),
            state: self.narrator.state(),
            position: self.narrator.position(),
            percentage: self.narrator.percentage(),
            rate: self.narrator.rate(),
            voice: self.voices.current().map(|v| v.id),
            last_error: self.narrator.last_error().map(str::to_string),
            in_flight: self.narrator.in_flight(),
        };
        self.snapshot.send_replace(snapshot);
    }
}
