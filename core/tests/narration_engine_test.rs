//! Integration tests for the narration engine driver
mod common;

use common::{book, settle, ScriptedPort};
use narrator_core::{
    BlobBackend, FailureReason, MemoryBackend, NarrationConfig, NarrationEngine, NarrationEvent,
    NarrationHandle, NarratorError, PlaybackState, Position, ProgressStore, VoiceInfo,
    VoicePreferences, VoiceSelector,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn test_config() -> NarrationConfig {
    NarrationConfig {
        rate_settle: Duration::from_millis(200),
        save_debounce: Duration::from_millis(1000),
        rate: 1.0,
        intro_template: "Welcome! Today's book is {title} by {author}.".to_string(),
        event_capacity: 256,
    }
}

fn start(
    shape: &[usize],
    store: Arc<ProgressStore>,
    voices: Arc<VoiceSelector>,
) -> (Arc<ScriptedPort>, NarrationHandle) {
    let port = ScriptedPort::new();
    let engine = NarrationEngine::new(book("b1", shape), port.clone(), voices, store, test_config());
    let (handle, _task) = engine.start();
    (port, handle)
}

fn start_default(shape: &[usize]) -> (Arc<ScriptedPort>, NarrationHandle, Arc<ProgressStore>) {
    let store = Arc::new(ProgressStore::in_memory());
    let voices = Arc::new(VoiceSelector::new(VoicePreferences::default()));
    let (port, handle) = start(shape, Arc::clone(&store), voices);
    (port, handle, store)
}

/// Engine over a store that already holds `seed` for the book
fn start_at(shape: &[usize], seed: Position) -> (Arc<ScriptedPort>, NarrationHandle) {
    let store = Arc::new(ProgressStore::in_memory());
    store.save("b1", seed, 0.0).unwrap();
    let voices = Arc::new(VoiceSelector::new(VoicePreferences::default()));
    start(shape, store, voices)
}

fn drain(rx: &mut broadcast::Receiver<NarrationEvent>) -> Vec<NarrationEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

/// Counts writes and can be told to fail them
#[derive(Default)]
struct CountingBackend {
    inner: MemoryBackend,
    writes: AtomicUsize,
    fail: bool,
}

impl BlobBackend for CountingBackend {
    fn read(&self, key: &str) -> narrator_core::Result<Option<Vec<u8>>> {
        self.inner.read(key)
    }

    fn write(&self, key: &str, value: &[u8]) -> narrator_core::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NarratorError::PersistenceError("disk full".into()));
        }
        self.inner.write(key, value)
    }
}

#[tokio::test(start_paused = true)]
async fn test_plays_whole_book_then_idles_at_100() {
    let (port, handle, _store) = start_default(&[2, 3]);
    let mut events = handle.subscribe();

    handle.play().await.unwrap();
    settle().await;
    assert_eq!(handle.snapshot().state, PlaybackState::PlayingContent);

    let mut last = handle.snapshot().percentage;
    for _ in 0..5 {
        assert!(port.complete());
        settle().await;
        let pct = handle.snapshot().percentage;
        assert!(pct >= last, "percentage went backwards: {} -> {}", last, pct);
        last = pct;
    }

    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::Idle);
    assert_eq!(snap.percentage, 100.0);
    assert_eq!(snap.position, Position::new(1, 2));
    assert_eq!(port.texts(), vec!["c0p0", "c0p1", "c1p0", "c1p1", "c1p2"]);
    assert_eq!(port.max_outstanding(), 1);
    assert!(drain(&mut events).contains(&NarrationEvent::Finished));
}

#[tokio::test(start_paused = true)]
async fn test_seek_mid_sequence_recomputes_percentage() {
    let (port, handle, _store) = start_default(&[2, 3]);

    handle.play().await.unwrap();
    settle().await;
    assert!(port.complete());
    settle().await;
    assert_eq!(handle.snapshot().position, Position::new(0, 1));

    handle.seek(1, 1).await.unwrap();
    settle().await;

    let snap = handle.snapshot();
    assert_eq!(snap.position, Position::new(1, 1));
    assert_eq!(snap.percentage, 60.0);
    assert_eq!(snap.state, PlaybackState::PlayingContent);
    assert_eq!(port.texts().last().map(String::as_str), Some("c1p1"));
    assert_eq!(port.cancels(), 1);
    assert_eq!(port.max_outstanding(), 1);
    assert_eq!(port.outstanding(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_seeks_keep_single_request_outstanding() {
    let (port, handle, _store) = start_default(&[4, 4, 4]);

    handle.play().await.unwrap();
    for c in 0..3 {
        for p in 0..4 {
            handle.seek(c, p).await.unwrap();
        }
    }
    settle().await;

    assert!(port.max_outstanding() <= 1);
    assert_eq!(port.outstanding(), 1);
    assert!(port.complete());
    settle().await;
    // (2,3) was the last paragraph
    assert_eq!(handle.snapshot().state, PlaybackState::Idle);
    assert_eq!(handle.snapshot().percentage, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_seek_out_of_range_is_rejected() {
    let (port, handle, _store) = start_default(&[2, 3]);
    let err = handle.seek(0, 5).await.unwrap_err();
    assert!(matches!(err, NarratorError::InvalidPosition { chapter: 0, paragraph: 5 }));
    settle().await;
    assert!(port.requests().is_empty());
    assert_eq!(handle.snapshot().state, PlaybackState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_intro_chains_into_chapter_start() {
    let store = Arc::new(ProgressStore::in_memory());
    store.save("b1", Position::new(1, 2), 80.0).unwrap();
    let voices = Arc::new(VoiceSelector::new(VoicePreferences::default()));
    let (port, handle) = start(&[2, 3], store, voices);
    assert_eq!(handle.snapshot().position, Position::new(1, 2));

    handle.play_intro().await.unwrap();
    settle().await;
    assert_eq!(handle.snapshot().state, PlaybackState::PlayingIntro);
    assert_eq!(
        port.texts(),
        vec!["Welcome! Today's book is The Little Prince by Antoine de Saint-Exupéry."]
    );

    assert!(port.complete());
    settle().await;
    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::PlayingContent);
    assert_eq!(snap.position, Position::new(1, 0));
    assert_eq!(port.texts()[1], "c1p0");
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_intro_does_not_chain_into_content() {
    let (port, handle) = start_at(&[2, 3], Position::new(1, 2));
    handle.play_intro().await.unwrap();
    settle().await;
    assert_eq!(handle.snapshot().state, PlaybackState::PlayingIntro);

    handle.pause().await.unwrap();
    settle().await;
    assert_eq!(port.cancels(), 1);
    assert!(!port.complete());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::Idle);
    assert_eq!(snap.position, Position::new(1, 2));
    assert!(snap.last_error.is_none());
    assert_eq!(port.requests().len(), 1);
    assert_eq!(port.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_seek_during_intro_plays_content_at_target() {
    let (port, handle, _store) = start_default(&[2, 3]);
    handle.play_intro().await.unwrap();
    settle().await;

    handle.seek(1, 1).await.unwrap();
    settle().await;
    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::PlayingContent);
    assert_eq!(snap.position, Position::new(1, 1));
    assert_eq!(port.texts()[1], "c1p1");
    assert_eq!(port.requests().len(), 2);
    assert_eq!(port.cancels(), 1);
    assert_eq!(port.max_outstanding(), 1);

    assert!(port.complete());
    settle().await;
    assert_eq!(handle.snapshot().position, Position::new(1, 2));
}

#[tokio::test(start_paused = true)]
async fn test_rate_change_during_intro_restarts_content_in_place() {
    let (port, handle) = start_at(&[2, 3], Position::new(1, 2));
    handle.play_intro().await.unwrap();
    settle().await;

    handle.set_rate(1.6).await.unwrap();
    settle().await;
    assert_eq!(port.requests().len(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let requests = port.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].text, "c1p2");
    assert_eq!(requests[1].rate, 1.6);
    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::PlayingContent);
    assert_eq!(snap.position, Position::new(1, 2));
    assert_eq!(port.cancels(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(port.requests().len(), 2);
    assert_eq!(port.max_outstanding(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_right_after_issue_is_not_an_error() {
    let (port, handle, _store) = start_default(&[2, 3]);
    let mut events = handle.subscribe();

    for _ in 0..5 {
        handle.play().await.unwrap();
        handle.pause().await.unwrap();
    }
    handle.play().await.unwrap();
    settle().await;
    handle.pause().await.unwrap();
    settle().await;

    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::Idle);
    assert!(snap.last_error.is_none());
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, NarrationEvent::Error { .. })));
    assert_eq!(port.outstanding(), 0);

    // pausing an idle engine touches nothing
    let cancels = port.cancels();
    handle.pause().await.unwrap();
    assert_eq!(port.cancels(), cancels);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_outcome_is_absorbed() {
    let (port, handle, _store) = start_default(&[2, 3]);
    handle.play().await.unwrap();
    settle().await;
    assert!(port.fail(FailureReason::Interrupted));
    settle().await;

    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::PlayingContent);
    assert!(snap.last_error.is_none());
    assert_eq!(snap.position, Position::new(0, 0));

    // play picks the paragraph up again
    handle.play().await.unwrap();
    settle().await;
    assert_eq!(port.texts(), vec!["c0p0", "c0p0"]);
    assert_eq!(port.outstanding(), 1);
    assert_eq!(handle.snapshot().state, PlaybackState::PlayingContent);
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_error_then_retry() {
    let (port, handle, _store) = start_default(&[2, 3]);
    let mut events = handle.subscribe();

    handle.play().await.unwrap();
    settle().await;
    assert!(port.fail(FailureReason::Other("audio device lost".into())));
    settle().await;

    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::Error);
    assert_eq!(snap.last_error.as_deref(), Some("audio device lost"));
    assert!(drain(&mut events).contains(&NarrationEvent::Error {
        message: "audio device lost".into()
    }));

    handle.play().await.unwrap();
    settle().await;
    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::PlayingContent);
    assert!(snap.last_error.is_none());
    assert_eq!(port.texts(), vec!["c0p0", "c0p0"]);
}

#[tokio::test(start_paused = true)]
async fn test_dismiss_error_returns_to_idle() {
    let (port, handle, _store) = start_default(&[2, 3]);
    handle.play().await.unwrap();
    settle().await;
    assert!(port.fail(FailureReason::Other("boom".into())));
    settle().await;

    handle.dismiss_error().await.unwrap();
    let snap = handle.snapshot();
    assert_eq!(snap.state, PlaybackState::Idle);
    assert!(snap.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rate_change_while_paused_issues_nothing() {
    let (port, handle, _store) = start_default(&[2, 3]);
    handle.set_rate(1.5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(port.requests().is_empty());
    assert_eq!(handle.snapshot().rate, 1.5);

    handle.play().await.unwrap();
    settle().await;
    assert_eq!(port.requests()[0].rate, 1.5);
}

#[tokio::test(start_paused = true)]
async fn test_rate_change_while_playing_restarts_after_settle() {
    let (port, handle, _store) = start_default(&[2, 3]);
    handle.play().await.unwrap();
    settle().await;
    assert!(port.complete());
    settle().await;
    assert_eq!(port.requests().len(), 2);

    // slider drag: several edits inside the settle window
    handle.set_rate(1.2).await.unwrap();
    settle().await;
    handle.set_rate(1.4).await.unwrap();
    settle().await;
    handle.set_rate(1.6).await.unwrap();
    settle().await;
    assert_eq!(port.requests().len(), 2);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let requests = port.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].text, "c0p1");
    assert_eq!(requests[2].rate, 1.6);
    assert_eq!(handle.snapshot().position, Position::new(0, 1));
    assert_eq!(port.max_outstanding(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_rate_is_rejected() {
    let (_port, handle, _store) = start_default(&[2, 3]);
    assert!(matches!(
        handle.set_rate(0.0).await,
        Err(NarratorError::InvalidRate(_))
    ));
    assert_eq!(handle.snapshot().rate, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_chapter_navigation() {
    let (port, handle, _store) = start_default(&[2, 3]);
    handle.prev_chapter().await.unwrap();
    settle().await;
    assert!(port.requests().is_empty());

    handle.next_chapter().await.unwrap();
    settle().await;
    assert_eq!(handle.snapshot().position, Position::new(1, 0));
    assert_eq!(handle.snapshot().state, PlaybackState::PlayingContent);

    handle.next_chapter().await.unwrap();
    settle().await;
    assert_eq!(port.requests().len(), 1);

    handle.prev_chapter().await.unwrap();
    settle().await;
    assert_eq!(handle.snapshot().position, Position::new(0, 0));
    assert_eq!(port.texts(), vec!["c1p0", "c0p0"]);
}

#[tokio::test(start_paused = true)]
async fn test_progress_saves_are_debounced() {
    let backend = Arc::new(CountingBackend::default());
    let store = Arc::new(ProgressStore::new(backend.clone()));
    let voices = Arc::new(VoiceSelector::new(VoicePreferences::default()));
    let (port, handle) = start(&[2, 3], Arc::clone(&store), voices);

    handle.play().await.unwrap();
    settle().await;
    for _ in 0..3 {
        assert!(port.complete());
        settle().await;
    }
    assert_eq!(backend.writes.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(backend.writes.load(Ordering::SeqCst), 1);
    let record = store.load("b1").unwrap().unwrap();
    assert_eq!(record.position(), Position::new(1, 1));
    assert_eq!(record.percentage, 60.0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_does_not_interrupt_playback() {
    let backend = Arc::new(CountingBackend {
        fail: true,
        ..Default::default()
    });
    let store = Arc::new(ProgressStore::new(backend.clone()));
    let voices = Arc::new(VoiceSelector::new(VoicePreferences::default()));
    let (port, handle) = start(&[2, 3], store, voices);

    handle.play().await.unwrap();
    settle().await;
    assert!(port.complete());
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(backend.writes.load(Ordering::SeqCst), 1);
    assert_eq!(handle.snapshot().state, PlaybackState::PlayingContent);
    assert!(port.complete());
    settle().await;
    assert_eq!(handle.snapshot().position, Position::new(1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_pending_save() {
    let (port, handle, store) = start_default(&[2, 3]);
    handle.play().await.unwrap();
    settle().await;
    assert!(port.complete());
    settle().await;

    handle.close().await.unwrap();
    let record = store.load("b1").unwrap().unwrap();
    assert_eq!(record.position(), Position::new(0, 1));
    assert_eq!(port.outstanding(), 0);
    assert!(matches!(handle.play().await, Err(NarratorError::EngineClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_requests_use_selected_voice() {
    let voices = Arc::new(VoiceSelector::new(VoicePreferences {
        locales: vec!["zh-TW".into()],
        include_names: vec![],
        preferred_names: vec!["Meijia".into()],
        quality_markers: vec!["Enhanced".into()],
        preferred_bonus: 2,
        quality_bonus: 1,
    }));
    voices.update_catalog(&[
        VoiceInfo {
            id: "tingting".into(),
            name: "Tingting".into(),
            locale: "zh-TW".into(),
        },
        VoiceInfo {
            id: "meijia".into(),
            name: "Meijia".into(),
            locale: "zh-TW".into(),
        },
    ]);
    let store = Arc::new(ProgressStore::in_memory());
    let (port, handle) = start(&[1], store, Arc::clone(&voices));

    handle.play().await.unwrap();
    settle().await;
    assert_eq!(port.requests()[0].voice.as_deref(), Some("meijia"));

    voices.select("tingting").unwrap();
    handle.seek(0, 0).await.unwrap();
    settle().await;
    assert_eq!(port.requests()[1].voice.as_deref(), Some("tingting"));
}
