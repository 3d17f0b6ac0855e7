use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use narrator_audio::{CommandSynthesizerConfig, Engine};
use narrator_core::{NarrationConfig, VoicePreferences};

/// High-level configuration for the terminal narrator
#[derive(Clone, Debug)]
pub struct NarratorAppConfig {
    /// Library catalog (JSON array of books)
    pub library: PathBuf,
    pub content: ContentConfig,
    /// Directory of the progress store file
    pub store_dir: PathBuf,
    /// Voice id to select once the catalog is known
    pub voice: Option<String>,
    pub narration: NarrationConfig,
    pub voices: VoicePreferences,
    pub tts: CommandSynthesizerConfig,
}

/// Where book content comes from
#[derive(Clone, Debug, PartialEq)]
pub enum ContentConfig {
    Dir(PathBuf),
    Http { base_url: String, timeout: Duration },
}

impl Default for ContentConfig {
    fn default() -> Self {
        match std::env::var("NARRATOR_CONTENT_URL")
            .ok()
            .filter(|s| !s.is_empty())
        {
            Some(base_url) => ContentConfig::Http {
                base_url,
                timeout: Duration::from_millis(
                    std::env::var("NARRATOR_CONTENT_TIMEOUT_MS")
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(10_000),
                ),
            },
            None => ContentConfig::Dir(
                std::env::var("NARRATOR_CONTENT_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(".")),
            ),
        }
    }
}

impl Default for NarratorAppConfig {
    fn default() -> Self {
        Self {
            library: std::env::var("NARRATOR_LIBRARY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("books.json")),
            content: ContentConfig::default(),
            store_dir: std::env::var("NARRATOR_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".narrator")),
            voice: std::env::var("NARRATOR_VOICE").ok().filter(|s| !s.is_empty()),
            narration: NarrationConfig::default(),
            voices: VoicePreferences::default(),
            tts: CommandSynthesizerConfig::default(),
        }
    }
}

impl NarratorAppConfig {
    /// Load configuration from a TOML file (path via NARRATOR_CONFIG or ./narrator.toml),
    /// overlaying values onto the env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("NARRATOR_CONFIG").unwrap_or_else(|_| "narrator.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "narrator", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::from_toml(&s, default.clone()) {
                Ok(cfg) => {
                    tracing::info!(target = "narrator", path = %path, "Loaded TOML config");
                    cfg
                }
                Err(e) => {
                    tracing::warn!(target = "narrator", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "narrator", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn from_toml(s: &str, base: Self) -> Result<Self, toml::de::Error> {
        Ok(toml::from_str::<NarratorToml>(s)?.overlay(base))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct NarratorToml {
    pub library: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub voice: Option<String>,
    pub content: Option<ContentToml>,
    pub narration: Option<NarrationToml>,
    pub voices: Option<VoicesToml>,
    pub tts: Option<TtsToml>,
}

impl NarratorToml {
    fn overlay(self, mut base: NarratorAppConfig) -> NarratorAppConfig {
        if let Some(x) = self.library {
            base.library = x;
        }
        if let Some(x) = self.store_dir {
            base.store_dir = x;
        }
        if let Some(x) = self.voice {
            base.voice = Some(x);
        }
        if let Some(c) = self.content {
            c.apply(&mut base.content);
        }
        if let Some(n) = self.narration {
            n.apply(&mut base.narration);
        }
        if let Some(v) = self.voices {
            v.apply(&mut base.voices);
        }
        if let Some(t) = self.tts {
            t.apply(&mut base.tts);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ContentToml {
    pub root: Option<PathBuf>,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}
impl ContentToml {
    fn apply(self, c: &mut ContentConfig) {
        // a base_url switches to HTTP, a root back to the filesystem
        if let Some(base_url) = self.base_url {
            let timeout = match c {
                ContentConfig::Http { timeout, .. } => *timeout,
                ContentConfig::Dir(_) => Duration::from_millis(10_000),
            };
            *c = ContentConfig::Http { base_url, timeout };
        } else if let Some(root) = self.root {
            *c = ContentConfig::Dir(root);
        }
        if let (Some(ms), ContentConfig::Http { timeout, .. }) = (self.timeout_ms, c) {
            *timeout = Duration::from_millis(ms);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct NarrationToml {
    pub rate: Option<f32>,
    pub rate_settle_ms: Option<u64>,
    pub save_debounce_ms: Option<u64>,
    pub intro_template: Option<String>,
}
impl NarrationToml {
    fn apply(self, n: &mut NarrationConfig) {
        if let Some(x) = self.rate {
            if x.is_finite() {
                n.rate = x.clamp(narrator_core::narration::MIN_RATE, narrator_core::narration::MAX_RATE);
            }
        }
        if let Some(x) = self.rate_settle_ms {
            n.rate_settle = Duration::from_millis(x);
        }
        if let Some(x) = self.save_debounce_ms {
            n.save_debounce = Duration::from_millis(x);
        }
        if let Some(x) = self.intro_template {
            n.intro_template = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct VoicesToml {
    pub locales: Option<Vec<String>>,
    pub include_names: Option<Vec<String>>,
    pub preferred_names: Option<Vec<String>>,
    pub quality_markers: Option<Vec<String>>,
    pub preferred_bonus: Option<u32>,
    pub quality_bonus: Option<u32>,
}
impl VoicesToml {
    fn apply(self, v: &mut VoicePreferences) {
        if let Some(x) = self.locales {
            v.locales = x;
        }
        if let Some(x) = self.include_names {
            v.include_names = x;
        }
        if let Some(x) = self.preferred_names {
            v.preferred_names = x;
        }
        if let Some(x) = self.quality_markers {
            v.quality_markers = x;
        }
        if let Some(x) = self.preferred_bonus {
            v.preferred_bonus = x;
        }
        if let Some(x) = self.quality_bonus {
            v.quality_bonus = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TtsToml {
    pub engine: Option<Engine>,
    pub player: Option<String>,
    pub volume: Option<f32>,
    pub timeout_ms: Option<u64>,
    pub temp_dir: Option<PathBuf>,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub piper_voice_dir: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
}
impl TtsToml {
    fn apply(self, t: &mut CommandSynthesizerConfig) {
        if let Some(x) = self.engine {
            t.engine = Some(x);
        }
        if let Some(x) = self.player {
            t.player = Some(x);
        }
        if let Some(x) = self.volume {
            t.volume = x.clamp(0.5, 2.0);
        }
        if let Some(x) = self.timeout_ms {
            t.timeout_ms = x;
        }
        if let Some(x) = self.temp_dir {
            t.temp_dir = x;
        }
        if let Some(x) = self.piper_bin {
            t.piper_bin = Some(x);
        }
        if let Some(x) = self.piper_voice {
            t.piper_voice = Some(x);
        }
        if let Some(x) = self.piper_voice_dir {
            t.piper_voice_dir = Some(x);
        }
        if let Some(x) = self.espeak_bin {
            t.espeak_bin = Some(x);
        }
    }
}
