use std::time::Duration;

use base64::Engine;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use tianyi_core::config::SpeechConfig;
use tianyi_core::error::TianyiError;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("speech request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("speech service rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("speech synthesis timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl From<SpeechError> for TianyiError {
    fn from(e: SpeechError) -> Self {
        TianyiError::Upstream {
            service: "speech".to_string(),
            reason: e.to_string(),
        }
    }
}

/// Client for the speech synthesizer.
///
/// The synthesizer exposes one endpoint taking the speaking text and a
/// voice tone; the tone selects a reference voice on the server side.
pub struct SpeechClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    tones: Vec<String>,
}

impl SpeechClient {
    pub fn new(cfg: &SpeechConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            tones: cfg.tones.clone(),
        }
    }

    pub fn available_tones(&self) -> &[String] {
        &self.tones
    }

    /// Clamp a model-picked tone to the configured set.
    pub fn resolve_tone<'a>(&'a self, tone: &'a str) -> &'a str {
        if self.tones.iter().any(|t| t == tone) {
            tone
        } else {
            self.tones.first().map(String::as_str).unwrap_or("normal")
        }
    }

    /// Synthesize `text` with the given tone, returning raw wav bytes.
    pub async fn synthesize(&self, text: &str, tone: &str) -> Result<Vec<u8>, SpeechError> {
        let tone = self.resolve_tone(tone);
        debug!(tone, chars = text.chars().count(), "synthesizing speech");

        let request = self
            .http
            .post(format!("{}/tts", self.base_url))
            .json(&json!({ "text": text, "tone": tone, "text_language": "zh" }))
            .send();

        let resp = match tokio::time::timeout(self.timeout, request).await {
            Ok(resp) => resp?,
            Err(_) => {
                return Err(SpeechError::Timeout {
                    secs: self.timeout.as_secs(),
                })
            }
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status, "speech synthesis failed");
            return Err(SpeechError::Api { status, message });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Base64 form used in response frames.
pub fn encode_audio(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SpeechClient {
        SpeechClient::new(&SpeechConfig {
            base_url: "http://localhost:9880".to_string(),
            timeout_secs: 60,
            tones: vec!["normal".to_string(), "happy".to_string()],
        })
    }

    #[test]
    fn unknown_tone_falls_back_to_first() {
        let c = client();
        assert_eq!(c.resolve_tone("happy"), "happy");
        assert_eq!(c.resolve_tone("不存在"), "normal");
    }

    #[test]
    fn audio_encoding_is_plain_base64() {
        assert_eq!(encode_audio(b"RIFF"), "UklGRg==");
        assert_eq!(encode_audio(b""), "");
    }
}
