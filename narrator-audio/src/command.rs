//! Speech synthesis through local CLI engines, with graceful degradation:
//! - Prefer Piper (higher quality, requires a voice model)
//! - Fall back to espeak-ng (widely available)
//! - If neither is present, log the text and wait roughly as long as
//!   reading it aloud would take
//!
//! Every utterance is synthesized to a temporary WAV file and played with the
//! first available player (aplay, paplay, ffplay). Child processes are killed
//! as soon as the request is cancelled or dropped.
//!
//! Env overrides:
//! - PIPER_BIN, PIPER_VOICE, PIPER_VOICE_DIR
//! - ESPEAK_BIN
//! - TTS_ENGINE (piper|espeak-ng|none), TTS_PLAYER, TTS_VOLUME
//! - TTS_TIMEOUT_MS, TTS_TEMP_DIR, TTS_FALLBACK_MS_PER_CHAR

use crate::utils::{gen_id, get_from_env_or_path, get_from_path, now_ms};
use crate::voices::{parse_espeak_voices, piper_voice_file, piper_voices_in};
use async_trait::async_trait;
use narrator_core::{NarratorError, SpeechRequest, SynthesisFailure, SynthesisPort, VoiceInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    Piper,
    EspeakNg,
    None,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Piper => "piper",
            Engine::EspeakNg => "espeak-ng",
            Engine::None => "none",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "piper" => Some(Engine::Piper),
            "espeak" | "espeak-ng" => Some(Engine::EspeakNg),
            "none" => Some(Engine::None),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CommandSynthesizerConfig {
    pub temp_dir: PathBuf,
    pub timeout_ms: u64,
    /// Output gain (0.5–2.0)
    pub volume: f32,
    /// Forced engine; detected from the installed binaries when unset
    pub engine: Option<Engine>,
    /// Preferred player binary name
    pub player: Option<String>,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub piper_voice_dir: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
    /// Reading pace of the log-only fallback at rate 1.0
    pub fallback_ms_per_char: u64,
}

impl Default for CommandSynthesizerConfig {
    fn default() -> Self {
        let temp_dir = std::env::var("TTS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let timeout_ms = std::env::var("TTS_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60_000);
        let volume = std::env::var("TTS_VOLUME")
            .ok()
            .and_then(|s| s.parse::<f32>().ok())
            .unwrap_or(1.0);
        let fallback_ms_per_char = std::env::var("TTS_FALLBACK_MS_PER_CHAR")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);

        Self {
            temp_dir,
            timeout_ms,
            volume,
            engine: std::env::var("TTS_ENGINE").ok().and_then(|s| Engine::parse(&s)),
            player: std::env::var("TTS_PLAYER").ok(),
            piper_bin: get_from_env_or_path("PIPER_BIN", "piper"),
            piper_voice: std::env::var("PIPER_VOICE").ok().map(PathBuf::from),
            piper_voice_dir: std::env::var("PIPER_VOICE_DIR").ok().map(PathBuf::from),
            espeak_bin: get_from_env_or_path("ESPEAK_BIN", "espeak-ng")
                .or_else(|| get_from_path("espeak")),
            fallback_ms_per_char,
        }
    }
}

fn select_engine(cfg: &CommandSynthesizerConfig) -> Engine {
    if let Some(engine) = cfg.engine {
        return engine;
    }
    // Piper is useless without a model
    if cfg.piper_bin.is_some() && (cfg.piper_voice.is_some() || cfg.piper_voice_dir.is_some()) {
        return Engine::Piper;
    }
    if cfg.espeak_bin.is_some() {
        return Engine::EspeakNg;
    }
    Engine::None
}

fn select_player(pref: Option<&str>) -> Option<PathBuf> {
    if let Some(bin) = pref.and_then(get_from_path) {
        return Some(bin);
    }
    get_from_path("aplay")
        .or_else(|| get_from_path("paplay"))
        .or_else(|| get_from_path("ffplay"))
}

/// Removes the WAV file when the request ends, however it ends
struct TempWav(PathBuf);

impl TempWav {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempWav {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub struct CommandSynthesizer {
    cfg: CommandSynthesizerConfig,
    engine: Engine,
    player: Option<PathBuf>,
    // bumped on every cancel; speaking requests watch it
    cancel_gen: watch::Sender<u64>,
    catalog: watch::Sender<Vec<VoiceInfo>>,
}

impl CommandSynthesizer {
    pub fn new(cfg: CommandSynthesizerConfig) -> Self {
        let engine = select_engine(&cfg);
        let player = select_player(cfg.player.as_deref());
        if let Some(ref p) = cfg.piper_bin {
            info!(target = "tts", bin = ?p, "Detected Piper binary");
        }
        if let Some(ref e) = cfg.espeak_bin {
            info!(target = "tts", bin = ?e, "Detected espeak-ng binary");
        }
        match (&engine, &player) {
            (Engine::None, _) => {
                warn!(target = "tts", "No TTS engine detected; narration will be logged only")
            }
            (_, None) => warn!(target = "tts", "No audio player found; audio will not be heard"),
            (_, Some(p)) => info!(target = "tts", engine = engine.as_str(), player = ?p, "Speech output ready"),
        }
        Self {
            cfg,
            engine,
            player,
            cancel_gen: watch::channel(0).0,
            catalog: watch::channel(Vec::new()).0,
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Re-read the engine's voice list and publish it to catalog watchers.
    pub async fn refresh_voices(&self) -> usize {
        let voices = match self.engine {
            Engine::Piper => self.piper_catalog().await,
            Engine::EspeakNg => self.espeak_catalog().await,
            Engine::None => Vec::new(),
        };
        let count = voices.len();
        info!(target = "tts", engine = self.engine.as_str(), voices = count, "Voice catalog refreshed");
        self.catalog.send_replace(voices);
        count
    }

    async fn piper_catalog(&self) -> Vec<VoiceInfo> {
        let mut voices = match self.cfg.piper_voice_dir.clone() {
            Some(dir) => tokio::task::spawn_blocking(move || piper_voices_in(&dir))
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(model) = self.cfg.piper_voice.as_deref().and_then(piper_voice_file) {
            if !voices.iter().any(|v| v.id == model.id) {
                voices.push(model);
            }
        }
        voices
    }

    async fn espeak_catalog(&self) -> Vec<VoiceInfo> {
        let Some(bin) = self.cfg.espeak_bin.as_ref() else {
            return Vec::new();
        };
        match Command::new(bin).arg("--voices").output().await {
            Ok(output) if output.status.success() => {
                parse_espeak_voices(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(target = "tts", status = ?output.status, "espeak-ng --voices failed");
                Vec::new()
            }
            Err(e) => {
                warn!(target = "tts", error = %e, "Could not list espeak-ng voices");
                Vec::new()
            }
        }
    }

    fn resolve_piper_voice(&self, voice: Option<&str>) -> Option<PathBuf> {
        if let Some(v) = voice.filter(|v| !v.is_empty()) {
            let as_path = PathBuf::from(v);
            if as_path.exists() {
                return Some(as_path);
            }
            if let Some(dir) = &self.cfg.piper_voice_dir {
                for candidate in [dir.join(v), dir.join(format!("{}.onnx", v))] {
                    if candidate.exists() {
                        return Some(candidate);
                    }
                }
            }
        }
        self.cfg.piper_voice.clone()
    }

    async fn synth_with_piper(
        &self,
        voice: Option<&str>,
        rate: f32,
        text: &str,
        out_wav: &Path,
    ) -> narrator_core::Result<()> {
        let piper = self
            .cfg
            .piper_bin
            .as_ref()
            .ok_or_else(|| NarratorError::SynthesisError("Piper binary not found".into()))?;
        let model = self.resolve_piper_voice(voice).ok_or_else(|| {
            NarratorError::SynthesisError(
                "Piper voice not found; set PIPER_VOICE or PIPER_VOICE_DIR".into(),
            )
        })?;

        let mut cmd = Command::new(piper);
        cmd.arg("-m").arg(model);
        cmd.arg("-f").arg(out_wav);
        let length_scale = (1.0f32 / rate).clamp(0.3, 2.0);
        cmd.arg("--length_scale").arg(format!("{:.2}", length_scale));
        debug!(target = "tts", command = ?cmd, "Running piper");
        run_with_stdin(cmd, text, "Piper").await
    }

    async fn synth_with_espeak(
        &self,
        voice: Option<&str>,
        rate: f32,
        text: &str,
        out_wav: &Path,
    ) -> narrator_core::Result<()> {
        let espeak = self
            .cfg
            .espeak_bin
            .as_ref()
            .ok_or_else(|| NarratorError::SynthesisError("espeak-ng not found".into()))?;
        let wpm = (160.0 * rate).round().clamp(80.0, 450.0) as i32;
        let amp = (100.0 * self.cfg.volume).round().clamp(50.0, 200.0) as i32;

        let mut cmd = Command::new(espeak);
        if let Some(v) = voice.filter(|v| !v.is_empty()) {
            cmd.arg("-v").arg(v);
        }
        cmd.arg("-s").arg(wpm.to_string());
        cmd.arg("-a").arg(amp.to_string());
        cmd.arg("-w").arg(out_wav);
        cmd.arg("--stdin");
        debug!(target = "tts", command = ?cmd, "Running espeak-ng");
        run_with_stdin(cmd, text, "espeak-ng").await
    }

    async fn play(&self, wav: &Path) -> narrator_core::Result<()> {
        let Some(player) = self.player.as_ref() else {
            debug!(target = "tts", path = ?wav, "No audio player; skipping playback");
            return Ok(());
        };
        let mut cmd = Command::new(player);
        if player.file_name().and_then(|s| s.to_str()) == Some("ffplay") {
            cmd.arg("-autoexit").arg("-nodisp").arg("-loglevel").arg("quiet");
        }
        cmd.arg(wav)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = cmd.status().await?;
        if !status.success() {
            return Err(NarratorError::SynthesisError(format!(
                "player exited with {}",
                status
            )));
        }
        Ok(())
    }

    async fn narrate_to_log(&self, text: &str, rate: f32) {
        let chars = text.chars().count();
        info!(target = "tts", chars, "(no engine) {}", text);
        let ms = (chars as f64 * self.cfg.fallback_ms_per_char as f64 / rate as f64) as u64;
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn speak_to_end(&self, request: SpeechRequest) -> Result<(), SynthesisFailure> {
        let rate = request.rate.clamp(0.5, 3.0);
        let voice = request.voice.as_deref();
        if self.engine == Engine::None {
            self.narrate_to_log(&request.text, rate).await;
            return Ok(());
        }

        let wav = TempWav(
            self.cfg
                .temp_dir
                .join(format!("narrator_{}.wav", gen_id())),
        );
        let limit = Duration::from_millis(self.cfg.timeout_ms);
        let t0 = now_ms();
        let synth = match self.engine {
            Engine::Piper => {
                timeout(limit, self.synth_with_piper(voice, rate, &request.text, wav.path())).await
            }
            _ => {
                timeout(limit, self.synth_with_espeak(voice, rate, &request.text, wav.path()))
                    .await
            }
        };
        match synth {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(target = "tts", engine = self.engine.as_str(), error = %e, "Synthesis failed");
                return Err(SynthesisFailure::other(e.to_string()));
            }
            Err(_) => {
                warn!(target = "tts", timeout_ms = self.cfg.timeout_ms, "Synthesis timed out");
                return Err(SynthesisFailure::other(format!(
                    "synthesis timed out after {} ms",
                    self.cfg.timeout_ms
                )));
            }
        }
        let synthesis_ms = now_ms() - t0;

        // espeak-ng applies the gain itself
        if self.engine == Engine::Piper && (self.cfg.volume - 1.0).abs() > f32::EPSILON {
            if let Err(e) = scale_wav_file(wav.path(), self.cfg.volume).await {
                warn!(target = "tts", error = %e, "Failed to scale volume for WAV");
            }
        }

        let play_start = now_ms();
        self.play(wav.path()).await.map_err(|e| {
            warn!(target = "tts", error = %e, "Playback failed");
            SynthesisFailure::other(e.to_string())
        })?;
        debug!(
            target = "tts",
            engine = self.engine.as_str(),
            synthesis_ms,
            playback_ms = now_ms() - play_start,
            "Utterance done"
        );
        Ok(())
    }
}

async fn run_with_stdin(mut cmd: Command, text: &str, what: &str) -> narrator_core::Result<()> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(NarratorError::SynthesisError(format!(
            "{} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn scale_wav_file(path: &Path, gain: f32) -> std::io::Result<()> {
    let mut buf = tokio::fs::read(path).await?;
    if scale_wav_pcm16(&mut buf, gain) {
        tokio::fs::write(path, &buf).await?;
    }
    Ok(())
}

/// Scale the samples of a 16-bit PCM WAV in place. Returns false when `buf`
/// is not a WAV with a data chunk.
pub fn scale_wav_pcm16(buf: &mut [u8], gain: f32) -> bool {
    if buf.len() < 12 || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return false;
    }
    let mut idx = 12;
    while idx + 8 <= buf.len() {
        let size =
            u32::from_le_bytes([buf[idx + 4], buf[idx + 5], buf[idx + 6], buf[idx + 7]]) as usize;
        if &buf[idx..idx + 4] == b"data" {
            let start = idx + 8;
            let end = (start + size).min(buf.len());
            for chunk in buf[start..end].chunks_exact_mut(2) {
                let s = i16::from_le_bytes([chunk[0], chunk[1]]);
                let scaled = (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
            return true;
        }
        idx += 8 + size;
    }
    false
}

#[async_trait]
impl SynthesisPort for CommandSynthesizer {
    async fn speak(&self, request: SpeechRequest) -> Result<(), SynthesisFailure> {
        if request.text.trim().is_empty() {
            return Ok(());
        }
        let mut cancelled = self.cancel_gen.subscribe();
        tokio::select! {
            result = self.speak_to_end(request) => result,
            _ = cancelled.changed() => {
                debug!(target = "tts", "Utterance cancelled");
                Err(SynthesisFailure::cancelled())
            }
        }
    }

    async fn cancel(&self) {
        self.cancel_gen.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn catalog(&self) -> watch::Receiver<Vec<VoiceInfo>> {
        self.catalog.subscribe()
    }

    fn name(&self) -> &str {
        self.engine.as_str()
    }
}
