// Narrator audio: speech output through locally installed CLI engines

pub mod command;
pub mod voices;

pub(crate) mod utils;

pub use command::{scale_wav_pcm16, CommandSynthesizer, CommandSynthesizerConfig, Engine};
pub use voices::{parse_espeak_voices, piper_voice_file, piper_voices_in};
