//! Pure narration state machine.
//!
//! [`Narrator`] owns playback state and position and never performs I/O.
//! Every trigger returns the list of [`Effect`]s the driver must carry out,
//! in order. Two rules hold for every transition:
//!
//! - a `Cancel` for the in-flight request always precedes a new `Speak`;
//! - completions and failures are matched against the in-flight request id,
//!   so a late callback from a cancelled request is dropped.

use crate::book::{Book, Position};
use crate::synthesis::FailureReason;
use crate::{NarratorError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MIN_RATE: f32 = 0.5;
pub const MAX_RATE: f32 = 3.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Idle,
    PlayingIntro,
    PlayingContent,
    Error,
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::PlayingIntro | PlaybackState::PlayingContent)
    }
}

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Stop the in-flight request and discard its outcome
    Cancel(RequestId),
    /// Issue a synthesis request
    Speak {
        id: RequestId,
        text: String,
        rate: f32,
    },
    State(PlaybackState),
    Progress {
        position: Position,
        percentage: f64,
    },
    /// A genuine synthesis failure to surface to the user
    Error(String),
    /// The last paragraph of the last chapter completed
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: RequestId,
    rate: f32,
}

pub fn validate_rate(rate: f32) -> Result<f32> {
    if rate.is_finite() && (MIN_RATE..=MAX_RATE).contains(&rate) {
        Ok(rate)
    } else {
        Err(NarratorError::InvalidRate(rate))
    }
}

pub struct Narrator {
    book: Book,
    intro_text: String,
    position: Position,
    state: PlaybackState,
    rate: f32,
    in_flight: Option<InFlight>,
    next_id: RequestId,
    finished: bool,
    last_error: Option<String>,
}

impl Narrator {
    pub fn new(book: Book, seed: Position, rate: f32, intro_text: String) -> Self {
        let position = book.clamp_seed(seed);
        Self {
            book,
            intro_text,
            position,
            state: PlaybackState::Idle,
            rate: rate.clamp(MIN_RATE, MAX_RATE),
            in_flight: None,
            next_id: 1,
            finished: false,
            last_error: None,
        }
    }

    pub fn book(&self) -> &Book {
        &self.book
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight.map(|f| f.id)
    }

    pub fn percentage(&self) -> f64 {
        if self.finished && self.book.total_paragraphs() > 0 {
            100.0
        } else {
            self.book.percentage(self.position)
        }
    }

    // ---- triggers ----

    /// Start narrating at the current position. No-op while a request is
    /// already playing; a playing state left without one (the port
    /// interrupted it on its own) re-issues the current paragraph.
    pub fn play(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.state.is_playing() && self.in_flight.is_some() {
            return fx;
        }
        self.last_error = None;
        self.cancel_in_flight(&mut fx);
        self.issue_paragraph(&mut fx);
        fx
    }

    /// Narrate the templated introduction; content follows at
    /// `{current chapter, 0}` once it completes.
    pub fn play_intro(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.last_error = None;
        self.cancel_in_flight(&mut fx);
        let text = self.intro_text.clone();
        self.issue(text, &mut fx);
        self.set_state(PlaybackState::PlayingIntro, &mut fx);
        fx
    }

    /// Stop playback. Idempotent: pausing an idle narrator does nothing.
    pub fn pause(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.state.is_playing() {
            return fx;
        }
        self.cancel_in_flight(&mut fx);
        self.set_state(PlaybackState::Idle, &mut fx);
        fx
    }

    /// Jump to `target` and narrate from there. Accepted from any state; an
    /// error is cleared.
    pub fn seek(&mut self, target: Position) -> Result<Vec<Effect>> {
        if !self.book.contains(target) {
            return Err(NarratorError::InvalidPosition {
                chapter: target.chapter,
                paragraph: target.paragraph,
            });
        }
        Ok(self.jump(target))
    }

    pub fn next_chapter(&mut self) -> Vec<Effect> {
        let next = self.position.chapter + 1;
        if next >= self.book.chapter_count() {
            return Vec::new();
        }
        self.jump(Position::new(next, 0))
    }

    pub fn prev_chapter(&mut self) -> Vec<Effect> {
        if self.position.chapter == 0 {
            return Vec::new();
        }
        self.jump(Position::new(self.position.chapter - 1, 0))
    }

    /// Record a new rate. Returns true when playback is active and a restart
    /// should follow once the rate has settled.
    pub fn set_rate(&mut self, rate: f32) -> Result<bool> {
        self.rate = validate_rate(rate)?;
        Ok(self.state.is_playing())
    }

    /// Re-issue the current position at the settled rate.
    ///
    /// No-op when not playing, or when the in-flight request already runs at
    /// the current rate.
    pub fn apply_rate(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.state.is_playing() {
            return fx;
        }
        if let Some(f) = self.in_flight {
            if (f.rate - self.rate).abs() < f32::EPSILON {
                return fx;
            }
        }
        self.cancel_in_flight(&mut fx);
        self.issue_paragraph(&mut fx);
        fx
    }

    /// Clear the surfaced error notice
    pub fn dismiss_error(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.last_error = None;
        if self.state == PlaybackState::Error {
            self.set_state(PlaybackState::Idle, &mut fx);
        }
        fx
    }

    // ---- synthesis outcomes ----

    pub fn on_completed(&mut self, id: RequestId) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.take_active(id) {
            return fx;
        }
        match self.state {
            PlaybackState::PlayingIntro => {
                let start = Position::new(self.position.chapter, 0);
                self.move_to(start, &mut fx);
                self.issue_paragraph(&mut fx);
            }
            PlaybackState::PlayingContent => match self.book.advance(self.position) {
                Some(next) => {
                    self.move_to(next, &mut fx);
                    self.issue_paragraph(&mut fx);
                }
                None => self.finish(&mut fx),
            },
            PlaybackState::Idle | PlaybackState::Error => {}
        }
        fx
    }

    pub fn on_failed(&mut self, id: RequestId, reason: FailureReason) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.take_active(id) {
            return fx;
        }
        if reason.is_cancellation() {
            debug!(target = "narration", id, reason = %reason, "Cancellation absorbed");
            return fx;
        }
        let message = reason.to_string();
        self.last_error = Some(message.clone());
        self.set_state(PlaybackState::Error, &mut fx);
        fx.push(Effect::Error(message));
        fx
    }

    // ---- internals ----

    fn take_active(&mut self, id: RequestId) -> bool {
        match self.in_flight {
            Some(f) if f.id == id => {
                self.in_flight = None;
                true
            }
            _ => {
                debug!(target = "narration", id, active = ?self.in_flight(), "Stale synthesis callback ignored");
                false
            }
        }
    }

    fn jump(&mut self, target: Position) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.last_error = None;
        self.cancel_in_flight(&mut fx);
        self.move_to(target, &mut fx);
        self.issue_paragraph(&mut fx);
        fx
    }

    fn cancel_in_flight(&mut self, fx: &mut Vec<Effect>) {
        if let Some(f) = self.in_flight.take() {
            fx.push(Effect::Cancel(f.id));
        }
    }

    fn set_state(&mut self, state: PlaybackState, fx: &mut Vec<Effect>) {
        if self.state != state {
            self.state = state;
            fx.push(Effect::State(state));
        }
    }

    fn move_to(&mut self, position: Position, fx: &mut Vec<Effect>) {
        let changed = position != self.position || self.finished;
        self.position = position;
        self.finished = false;
        if changed {
            fx.push(Effect::Progress {
                position,
                percentage: self.percentage(),
            });
        }
    }

    fn issue(&mut self, text: String, fx: &mut Vec<Effect>) {
        let id = self.next_id;
        self.next_id += 1;
        self.in_flight = Some(InFlight {
            id,
            rate: self.rate,
        });
        fx.push(Effect::Speak {
            id,
            text,
            rate: self.rate,
        });
    }

    /// Issue the paragraph at the current position, normalising forward
    /// first. Finishes when nothing is left to read.
    fn issue_paragraph(&mut self, fx: &mut Vec<Effect>) {
        let Some(pos) = self.book.normalize(self.position) else {
            self.finish(fx);
            return;
        };
        self.move_to(pos, fx);
        let text = self.book.paragraph(pos).unwrap_or_default().to_string();
        self.issue(text, fx);
        self.set_state(PlaybackState::PlayingContent, fx);
    }

    fn finish(&mut self, fx: &mut Vec<Effect>) {
        if let Some(last) = self.book.last_position() {
            if self.position > last {
                self.position = last;
            }
        }
        self.finished = true;
        fx.push(Effect::Progress {
            position: self.position,
            percentage: self.percentage(),
        });
        self.set_state(PlaybackState::Idle, fx);
        fx.push(Effect::Finished);
    }
}
