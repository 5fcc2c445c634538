//! Raw LLM transports: an Anthropic Messages client and an OpenAI-compatible
//! chat client. Domain wrappers (normalization, vision, analyst) build on
//! these.

use super::{retry_after_secs, ProviderError, ProviderResult};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const TEXT_TIMEOUT: Duration = Duration::from_secs(60);
pub const VISION_TIMEOUT: Duration = Duration::from_secs(120);

/// An image attachment for a multimodal prompt.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub media_type: String,
    pub base64_data: String,
}

/// Pull the first JSON object out of an LLM reply that may carry prose or
/// code fences around it.
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    url: String,
    api_key: Option<String>,
}

impl AnthropicClient {
    pub fn new(url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("cadastro-backend/1.0 (llm)")
            .build()?;
        Ok(Self { http, url, api_key })
    }

    pub async fn complete(
        &self,
        model: &str,
        system: &str,
        user_text: &str,
        images: &[ImageInput],
        timeout: Duration,
    ) -> ProviderResult<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::ConfigMissing("LLM_A_KEY"))?;

        let mut content: Vec<Value> = images
            .iter()
            .map(|img| {
                json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": img.media_type,
                        "data": img.base64_data,
                    }
                })
            })
            .collect();
        content.push(json!({"type": "text", "text": user_text}));

        let body = json!({
            "model": model,
            "max_tokens": 2048,
            "temperature": 0,
            "system": system,
            "messages": [{"role": "user", "content": content}],
        });

        let response = self
            .http
            .post(&self.url)
            .timeout(timeout)
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::BAD_REQUEST && !images.is_empty() {
                return Err(ProviderError::ImageFormatInvalid);
            }
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(status, retry));
        }

        let payload: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        let text = payload
            .content
            .into_iter()
            .filter(|c| c.kind.as_deref() == Some("text"))
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ProviderError::ParseError("empty completion".to_string()));
        }
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("cadastro-backend/1.0 (llm)")
            .build()?;
        Ok(Self { http, url, api_key })
    }

    pub async fn complete(
        &self,
        model: &str,
        system: &str,
        user_text: &str,
        images: &[ImageInput],
        timeout: Duration,
    ) -> ProviderResult<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::ConfigMissing("LLM_B_KEY"))?;

        let user_content: Value = if images.is_empty() {
            Value::String(user_text.to_string())
        } else {
            let mut parts: Vec<Value> = vec![json!({"type": "text", "text": user_text})];
            for img in images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", img.media_type, img.base64_data)
                    }
                }));
            }
            Value::Array(parts)
        };

        let body = json!({
            "model": model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content},
            ],
        });

        let response = self
            .http
            .post(&self.url)
            .timeout(timeout)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::BAD_REQUEST && !images.is_empty() {
                return Err(ProviderError::ImageFormatInvalid);
            }
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(status, retry));
        }

        let payload: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::ParseError("empty completion".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"address\": \"Rua A, 10\"}\n```\nDone.";
        let value = extract_json(reply).unwrap();
        assert_eq!(value["address"], "Rua A, 10");
    }

    #[test]
    fn extracts_bare_json() {
        let value = extract_json("{\"a\": 1}").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn rejects_textual_reply() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} backwards {").is_none());
    }
}
