//! Narration engine.
//!
//! - [`machine`]: the pure state machine (positions, states, request ids)
//! - [`engine`]: the tokio driver that executes its effects against a
//!   [`SynthesisPort`](crate::synthesis::SynthesisPort) and the progress store
//!
//! Env overrides (see [`NarrationConfig`]):
//! - NARRATOR_RATE, NARRATOR_RATE_SETTLE_MS, NARRATOR_SAVE_DEBOUNCE_MS
//! - NARRATOR_INTRO_TEMPLATE (`{title}` and `{author}` placeholders)

pub mod engine;
pub mod machine;

pub use engine::{
    NarrationConfig, NarrationEngine, NarrationEvent, NarrationHandle, NarrationSnapshot,
};
pub use machine::{Effect, Narrator, PlaybackState, RequestId, MAX_RATE, MIN_RATE};
