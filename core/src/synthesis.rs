//! Synthesis Port contract.
//!
//! The engine treats speech synthesis as an opaque capability: it hands over
//! `(text, voice, rate)` and waits for exactly one terminal outcome. At most
//! one request is in flight at a time; the engine guarantees that by
//! cancelling before it issues.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Voice as reported by a synthesis backend's catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    pub locale: String,
}

/// One synthesis request. Never spans a paragraph boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: Option<String>,
    pub rate: f32,
}

/// Why a request ended without completing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Cancelled,
    Interrupted,
    Other(String),
}

impl FailureReason {
    /// Cancellation-class outcomes are expected after our own cancel and are
    /// never surfaced as playback errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FailureReason::Cancelled | FailureReason::Interrupted)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Interrupted => write!(f, "interrupted"),
            FailureReason::Other(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisFailure {
    pub reason: FailureReason,
}

impl SynthesisFailure {
    pub fn new(reason: FailureReason) -> Self {
        Self { reason }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Other(message.into()))
    }

    pub fn cancelled() -> Self {
        Self::new(FailureReason::Cancelled)
    }
}

impl std::fmt::Display for SynthesisFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "synthesis failed: {}", self.reason)
    }
}

impl std::error::Error for SynthesisFailure {}

/// Text-to-speech capability consumed by the narration engine.
#[async_trait]
pub trait SynthesisPort: Send + Sync {
    /// Speak `request` to completion.
    ///
    /// Resolves with `Ok(())` once the audio finished, or with a failure. A
    /// request stopped through [`SynthesisPort::cancel`] should resolve with a
    /// cancellation-class reason. The future may also simply be dropped.
    async fn speak(&self, request: SpeechRequest) -> std::result::Result<(), SynthesisFailure>;

    /// Stop whatever is currently being spoken. Must be idempotent.
    async fn cancel(&self);

    /// Voice catalog. It may be empty at first and fill in later; receivers
    /// are notified on every change.
    fn catalog(&self) -> watch::Receiver<Vec<VoiceInfo>>;

    /// Short backend name for logs
    fn name(&self) -> &str {
        "synthesis"
    }
}
