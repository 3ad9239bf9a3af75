use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use tianyi_core::config::VisionConfig;

use crate::image_ops::VisionError;

const DESCRIBE_PROMPT: &str = "请用中文简要描述这张图片的内容，包括画面中的人物、物体、场景和文字。\
     描述要客观具体，不要加入猜测或评价，100字以内。";

/// Client for the vision describer (OpenAI-compatible chat API with image
/// content blocks).
pub struct VisionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl VisionClient {
    pub fn new(cfg: &VisionConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        }
    }

    /// Describe a normalized JPEG. Returns the model's plain-text
    /// description.
    pub async fn describe(&self, jpeg_bytes: &[u8]) -> Result<String, VisionError> {
        let data_url = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(jpeg_bytes)
        );
        debug!(bytes = jpeg_bytes.len(), model = %self.model, "describing image");

        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": data_url } },
                    { "type": "text", "text": DESCRIBE_PROMPT },
                ],
            }],
            "max_tokens": 512,
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status, "vision describe failed");
            return Err(VisionError::Api { status, message });
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

        let parsed: ApiResponse = resp.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default())
    }
}
