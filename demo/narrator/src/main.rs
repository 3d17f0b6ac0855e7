mod command;
mod config;

use command::{Command, HELP};
use config::{ContentConfig, NarratorAppConfig};
use narrator_audio::CommandSynthesizer;
use narrator_core::{
    backup_file_name, ContentProvider, FileBackend, FsContentProvider, HttpContentProvider,
    Library, NarrationEngine, NarrationEvent, NarrationHandle, NarratorError, ProgressStore,
    SynthesisPort, VoiceSelector,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// An open book: the engine handle plus its background tasks
struct Session {
    handle: NarrationHandle,
    engine_task: JoinHandle<()>,
    printer_task: JoinHandle<()>,
}

impl Session {
    async fn close(self) {
        if let Err(e) = self.handle.close().await {
            warn!(target = "narrator", error = %e, "Engine already stopped");
        }
        let _ = self.engine_task.await;
        self.printer_task.abort();
    }
}

struct App {
    cfg: NarratorAppConfig,
    library: Library,
    provider: Box<dyn ContentProvider>,
    store: Arc<ProgressStore>,
    synth: Arc<CommandSynthesizer>,
    voices: Arc<VoiceSelector>,
    session: Option<Session>,
}

impl App {
    fn handle(&self) -> Result<&NarrationHandle, NarratorError> {
        self.session
            .as_ref()
            .map(|s| &s.handle)
            .ok_or_else(|| NarratorError::LoadError("no book open; use `open <book>`".into()))
    }

    async fn run(&mut self, cmd: Command) -> Result<(), NarratorError> {
        match cmd {
            Command::Help => println!("{}", HELP),
            Command::List => {
                for (entry, pct) in self.library.with_progress(&self.store) {
                    println!(
                        "  {:<8} {} by {}  [{:.0}%]",
                        entry.id, entry.title, entry.author, pct
                    );
                }
            }
            Command::Open(id) => self.open(&id).await?,
            Command::Play => self.handle()?.play().await?,
            Command::Pause => self.handle()?.pause().await?,
            Command::Intro => self.handle()?.play_intro().await?,
            Command::Next => self.handle()?.next_chapter().await?,
            Command::Prev => self.handle()?.prev_chapter().await?,
            Command::Seek(c, p) => self.handle()?.seek(c, p).await?,
            Command::Rate(x) => self.handle()?.set_rate(x).await?,
            Command::Voices => {
                let current = self.voices.current().map(|v| v.id);
                let ranked = self.voices.ranked();
                if ranked.is_empty() {
                    println!("  no matching voices; the engine default is used");
                }
                for v in ranked {
                    let mark = if current.as_deref() == Some(v.id.as_str()) { "*" } else { " " };
                    println!("{} {:<24} {:<28} {:<8} score {}", mark, v.id, v.name, v.locale, v.quality_score);
                }
            }
            Command::Voice(id) => {
                self.voices.select(&id)?;
                println!("voice set to {} (from the next paragraph)", id);
            }
            Command::Status => self.status()?,
            Command::Dismiss => self.handle()?.dismiss_error().await?,
            Command::Export(path) => {
                let path = path.unwrap_or_else(|| {
                    PathBuf::from(backup_file_name(chrono::Local::now().date_naive()))
                });
                let data = self.store.export_all()?;
                tokio::fs::write(&path, data).await?;
                println!("progress exported to {}", path.display());
            }
            Command::Import(path) => {
                let data = tokio::fs::read_to_string(&path).await?;
                let n = self.store.import_all(&data)?;
                println!("restored progress for {} book(s)", n);
                if self.session.is_some() {
                    println!("reopen the current book to pick up its restored position");
                }
            }
            Command::Quit => {}
        }
        Ok(())
    }

    async fn open(&mut self, id: &str) -> Result<(), NarratorError> {
        let meta = self
            .library
            .get(id)
            .map(|e| e.meta())
            .ok_or_else(|| NarratorError::LoadError(format!("Book not found: {}", id)))?;
        if let Some(previous) = self.session.take() {
            previous.close().await;
        }

        let engine = NarrationEngine::open(
            meta,
            self.provider.as_ref(),
            Arc::clone(&self.synth) as Arc<dyn SynthesisPort>,
            Arc::clone(&self.voices),
            Arc::clone(&self.store),
            self.cfg.narration.clone(),
        )
        .await?;
        let (handle, engine_task) = engine.start();
        let printer_task = spawn_printer(&handle);

        let snap = handle.snapshot();
        println!(
            "opened \"{}\" by {}: {} chapter(s), resuming at chapter {} paragraph {} ({:.0}%)",
            handle.book().title,
            handle.book().author,
            handle.book().chapter_count(),
            snap.position.chapter + 1,
            snap.position.paragraph + 1,
            snap.percentage
        );
        self.session = Some(Session {
            handle,
            engine_task,
            printer_task,
        });
        Ok(())
    }

    fn status(&self) -> Result<(), NarratorError> {
        let handle = self.handle()?;
        let snap = handle.snapshot();
        let chapter_title = handle
            .book()
            .chapters
            .get(snap.position.chapter)
            .map(|c| c.title.as_str())
            .unwrap_or("-");
        println!(
            "{:?} | {} | chapter {} paragraph {} | {:.1}% | rate {:.2} | voice {}",
            snap.state,
            chapter_title,
            snap.position.chapter + 1,
            snap.position.paragraph + 1,
            snap.percentage,
            snap.rate,
            snap.voice.as_deref().unwrap_or("default")
        );
        if let Some(text) = handle.book().paragraph(snap.position) {
            println!("  > {}", text);
        }
        if let Some(err) = snap.last_error {
            println!("  ! {} (use `dismiss`)", err);
        }
        Ok(())
    }
}

fn spawn_printer(handle: &NarrationHandle) -> JoinHandle<()> {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NarrationEvent::StateChanged { state }) => println!("[state] {:?}", state),
                Ok(NarrationEvent::PositionChanged { position, percentage }) => println!(
                    "[position] chapter {} paragraph {} ({:.1}%)",
                    position.chapter + 1,
                    position.paragraph + 1,
                    percentage
                ),
                Ok(NarrationEvent::Error { message }) => println!("[error] {} (use `dismiss`)", message),
                Ok(NarrationEvent::Finished) => println!("[done] end of the book"),
                Ok(NarrationEvent::ProgressSaved { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target = "narrator", skipped = n, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn build_provider(
    cfg: &NarratorAppConfig,
    library: Library,
) -> Result<Box<dyn ContentProvider>, NarratorError> {
    let provider: Box<dyn ContentProvider> = match &cfg.content {
        ContentConfig::Dir(root) => Box::new(FsContentProvider::new(root, library)),
        ContentConfig::Http { base_url, timeout } => {
            Box::new(HttpContentProvider::new(base_url.clone(), library, *timeout)?)
        }
    };
    Ok(provider)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        "info,narrator_core=info,narrator_audio=info,narrator=info".to_string()
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(target = "narrator", "Starting narrator: Library → Content → Voice → Engine → TTS");

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = NarratorAppConfig::load();

    let library = Library::load(&cfg.library).await?;
    let provider = build_provider(&cfg, library.clone())?;
    let store = Arc::new(ProgressStore::new(Arc::new(FileBackend::new(&cfg.store_dir))));

    let synth = Arc::new(CommandSynthesizer::new(cfg.tts.clone()));
    let voices = Arc::new(VoiceSelector::new(cfg.voices.clone()));
    let follow_task = voices.follow(synth.catalog());
    synth.refresh_voices().await;
    // rank now so a configured voice can be selected right away
    voices.update_catalog(&synth.catalog().borrow());
    if let Some(id) = cfg.voice.as_deref() {
        if let Err(e) = voices.select(id) {
            warn!(target = "narrator", error = %e, "Configured voice unavailable");
        }
    }

    let mut app = App {
        cfg,
        library,
        provider,
        store,
        synth,
        voices,
        session: None,
    };

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(target = "narrator", error = %e, "Failed to read stdin");
                        break;
                    }
                };
                match command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(cmd)) => {
                        if let Err(e) = app.run(cmd).await {
                            println!("error: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => println!("{}", msg),
                }
            }
            _ = signal::ctrl_c() => {
                info!(target = "narrator", "Shutting down...");
                break;
            }
        }
    }

    if let Some(session) = app.session.take() {
        session.close().await;
    }
    follow_task.abort();
    Ok(())
}
