pub mod tts;

pub use tts::{SpeechClient, SpeechError};
