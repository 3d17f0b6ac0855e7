//! Voice catalogs of the local engines.
//!
//! espeak-ng lists its voices as a table on `--voices`; Piper voices are
//! `.onnx` models in a directory, named `<locale>-<speaker>-<quality>`.

use narrator_core::VoiceInfo;
use std::path::Path;
use tracing::debug;

/// Parse the table printed by `espeak-ng --voices`.
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File                 Other Languages
///  5  cmn             --/M      Chinese_(Mandarin) sit/cmn              (zh-cmn 5)(zh 5)
/// ```
pub fn parse_espeak_voices(table: &str) -> Vec<VoiceInfo> {
    table
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("Pty"))
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let language = fields[1];
            Some(VoiceInfo {
                id: language.to_string(),
                name: fields[3].replace('_', " "),
                locale: language.to_string(),
            })
        })
        .collect()
}

/// Piper models found in `dir`. Unreadable directories yield nothing.
pub fn piper_voices_in(dir: &Path) -> Vec<VoiceInfo> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(target = "tts", dir = ?dir, error = %e, "Piper voice dir unreadable");
            return Vec::new();
        }
    };

    let mut voices: Vec<VoiceInfo> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let stem = file_name.strip_suffix(".onnx")?;
            Some(piper_voice(stem))
        })
        .collect();
    voices.sort_by(|a, b| a.id.cmp(&b.id));
    voices
}

/// Catalog entry for a single Piper model file
pub fn piper_voice_file(path: &Path) -> Option<VoiceInfo> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".onnx")?;
    Some(piper_voice(stem))
}

fn piper_voice(stem: &str) -> VoiceInfo {
    let mut parts = stem.splitn(3, '-');
    let locale = parts.next().unwrap_or_default().to_string();
    let speaker = parts.next().unwrap_or(stem);
    let name = match parts.next() {
        Some(quality) => format!("{} ({})", speaker, quality),
        None => speaker.to_string(),
    };
    VoiceInfo {
        id: stem.to_string(),
        name,
        locale,
    }
}
