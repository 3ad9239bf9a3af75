use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use tianyi_core::config::LlmConfig;

use crate::error::{AgentError, Result};

const RETRY_BASE_DELAY_MS: u64 = 500;

/// Client for the language-model API (OpenAI-compatible chat completions).
///
/// Every call carries a deadline; failed calls are retried with factor-2
/// exponential backoff plus jitter. 4xx responses other than 429 are not
/// retried — the request itself is wrong.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(cfg: &LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_retries: cfg.max_retries,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    /// Plain completion: one system prompt, one user message.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        self.send_with_retry(system, user, false).await
    }

    /// JSON-mode completion. The model is constrained to emit a single JSON
    /// object; callers still run the output through [`extract_json`]
    /// because some providers wrap it in fences anyway.
    pub async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        self.send_with_retry(system, user, true).await
    }

    async fn send_with_retry(&self, system: &str, user: &str, json_mode: bool) -> Result<String> {
        let mut last_err = AgentError::Parse("no attempts made".to_string());
        for attempt in 0..self.max_retries {
            match self.send_once(system, user, json_mode).await {
                Ok(content) => return Ok(content),
                Err(AgentError::Api { status, message }) if status < 500 && status != 429 => {
                    return Err(AgentError::Api { status, message });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "model call failed");
                    last_err = e;
                }
            }
            if attempt + 1 < self.max_retries {
                tokio::time::sleep(Duration::from_millis(backoff_ms(attempt))).await;
            }
        }
        Err(last_err)
    }

    async fn send_once(&self, system: &str, user: &str, json_mode: bool) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "max_tokens": 4096,
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        debug!(model = %self.model, json_mode, "sending model request");
        let request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let resp = match tokio::time::timeout(self.timeout, request).await {
            Ok(resp) => resp?,
            Err(_) => {
                return Err(AgentError::Timeout {
                    secs: self.timeout.as_secs(),
                })
            }
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AgentError::Api { status, message });
        }

        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let parsed: ApiResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AgentError::Parse("response carried no choices".to_string()))
    }
}

/// Factor-2 backoff with sub-millisecond clock noise as jitter.
fn backoff_ms(attempt: u32) -> u64 {
    let base = RETRY_BASE_DELAY_MS << attempt;
    let noise = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0);
    base + noise % base
}

/// Cut a model reply down to the JSON payload it should contain.
///
/// Strips markdown fences, then trims to the outermost `{…}` or `[…]` span
/// so prose before or after the payload does not break parsing.
pub fn extract_json(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s = s.trim();

    let object = span(s, '{', '}');
    let array = span(s, '[', ']');
    match (object, array) {
        (Some((os, oe)), Some((as_, ae))) => {
            if as_ < os {
                &s[as_..=ae]
            } else {
                &s[os..=oe]
            }
        }
        (Some((os, oe)), None) => &s[os..=oe],
        (None, Some((as_, ae))) => &s[as_..=ae],
        (None, None) => s,
    }
}

fn span(s: &str, open: char, close: char) -> Option<(usize, usize)> {
    let start = s.find(open)?;
    let end = s.rfind(close)?;
    (end > start).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_strips_fences() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(raw), "{\"a\": 1}");
    }

    #[test]
    fn extract_trims_surrounding_prose() {
        let raw = "好的，这是结果：[{\"tool\": \"memory_search\"}] 希望有帮助";
        assert_eq!(extract_json(raw), "[{\"tool\": \"memory_search\"}]");
    }

    #[test]
    fn extract_prefers_outermost_payload() {
        let raw = "[{\"inner\": {\"x\": 1}}]";
        assert_eq!(extract_json(raw), raw);
    }

    #[test]
    fn extract_passes_through_bare_text() {
        assert_eq!(extract_json("no json here"), "no json here");
    }
}
