//! Shared test doubles for narration tests
#![allow(dead_code)]

use async_trait::async_trait;
use narrator_core::{
    Book, BookMeta, Chapter, FailureReason, SpeechRequest, SynthesisFailure, SynthesisPort,
    VoiceInfo,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

type Reply = oneshot::Sender<Result<(), SynthesisFailure>>;

/// Synthesis port driven by the test: every `speak` blocks until the test
/// completes or fails it, and the port tracks how many requests are alive.
pub struct ScriptedPort {
    requests: Mutex<Vec<SpeechRequest>>,
    current: Mutex<Option<Reply>>,
    outstanding: Arc<AtomicUsize>,
    max_outstanding: AtomicUsize,
    cancels: AtomicUsize,
    catalog: watch::Sender<Vec<VoiceInfo>>,
}

struct OutstandingGuard(Arc<AtomicUsize>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedPort {
    pub fn new() -> Arc<Self> {
        let (catalog, _) = watch::channel(Vec::new());
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            outstanding: Arc::new(AtomicUsize::new(0)),
            max_outstanding: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            catalog,
        })
    }

    pub fn set_catalog(&self, voices: Vec<VoiceInfo>) {
        self.catalog.send_replace(voices);
    }

    /// Resolve the pending request successfully
    pub fn complete(&self) -> bool {
        self.resolve(Ok(()))
    }

    pub fn fail(&self, reason: FailureReason) -> bool {
        self.resolve(Err(SynthesisFailure::new(reason)))
    }

    fn resolve(&self, result: Result<(), SynthesisFailure>) -> bool {
        match self.current.lock().unwrap().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn requests(&self) -> Vec<SpeechRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.text).collect()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisPort for ScriptedPort {
    async fn speak(&self, request: SpeechRequest) -> Result<(), SynthesisFailure> {
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);
        let _guard = OutstandingGuard(Arc::clone(&self.outstanding));

        let (tx, rx) = oneshot::channel();
        self.requests.lock().unwrap().push(request);
        *self.current.lock().unwrap() = Some(tx);
        rx.await.unwrap_or_else(|_| Err(SynthesisFailure::cancelled()))
    }

    async fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.current.lock().unwrap().take() {
            let _ = tx.send(Err(SynthesisFailure::new(FailureReason::Interrupted)));
        }
    }

    fn catalog(&self) -> watch::Receiver<Vec<VoiceInfo>> {
        self.catalog.subscribe()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Book with chapter sizes given by `shape`; paragraph text is `c{c}p{p}`
pub fn book(id: &str, shape: &[usize]) -> Book {
    let chapters = shape
        .iter()
        .enumerate()
        .map(|(c, n)| Chapter {
            id: format!("ch{}", c),
            title: format!("Chapter {}", c + 1),
            paragraphs: (0..*n).map(|p| format!("c{}p{}", c, p)).collect(),
        })
        .collect();
    Book::new(
        BookMeta {
            id: id.to_string(),
            title: "The Little Prince".to_string(),
            author: "Antoine de Saint-Exupéry".to_string(),
        },
        chapters,
    )
}

/// Let spawned tasks run until they block. Time is paused in these tests,
/// so the sleep only advances once everything else is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
