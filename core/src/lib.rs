// Narrator Core Library
// Resumable long-form text narration runtime

pub mod book;
pub mod content;
pub mod narration;
pub mod progress;
pub mod synthesis;
pub mod voice;

// Export core types
pub use book::{split_paragraphs, Book, BookMeta, Chapter, Position};
pub use content::{
    load_book, ChapterSource, ContentProvider, FsContentProvider, HttpContentProvider, Library,
    LibraryEntry,
};
pub use narration::{
    NarrationConfig, NarrationEngine, NarrationEvent, NarrationHandle, NarrationSnapshot,
    PlaybackState,
};
pub use progress::{
    backup_file_name, BlobBackend, FileBackend, MemoryBackend, ProgressRecord, ProgressSnapshot,
    ProgressStore, PROGRESS_KEY,
};
pub use synthesis::{FailureReason, SpeechRequest, SynthesisFailure, SynthesisPort, VoiceInfo};
pub use voice::{VoiceCandidate, VoicePreferences, VoiceRanking, VoiceSelector};

#[cfg(feature = "rocksdb")]
pub use progress::RocksDbBackend;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NarratorError {
    #[error("Load error: {0}")]
    LoadError(String),

    #[error("Synthesis error: {0}")]
    SynthesisError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Import validation error: {0}")]
    ImportValidationError(String),

    #[error("Invalid position: chapter {chapter}, paragraph {paragraph}")]
    InvalidPosition { chapter: usize, paragraph: usize },

    #[error("Invalid rate: {0}")]
    InvalidRate(f32),

    #[error("Unknown voice: {0}")]
    UnknownVoice(String),

    #[error("Narration engine is closed")]
    EngineClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, NarratorError>;
