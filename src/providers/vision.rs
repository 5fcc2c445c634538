//! Vision LLM clients: cheap pre-classification, an independent second
//! classifier for cross-validation, and the deep establishment analysis.

use super::llm::{extract_json, AnthropicClient, ImageInput, OpenAiClient, VISION_TIMEOUT};
use super::{ProviderError, ProviderResult};
use crate::models::PhotoCategory;
use serde::Deserialize;
use serde_json::Value;

const CLASSIFY_SYSTEM: &str = "\
Classifique a foto de um estabelecimento comercial em exatamente uma \
categoria: FACADE, INTERIOR, PRODUCT, MENU ou OTHER. Responda somente com \
JSON: {\"category\": string, \"labels\": [string], \"confidence\": number}";

const ANALYZE_SYSTEM: &str = "\
Você analisa fotos de fachada de estabelecimentos comerciais para uma equipe \
de vendas. Avalie qualidade da sinalização, presença de marca, nível de \
profissionalismo, público e ambiente. Responda somente com JSON: \
{\"signage_quality\": \"EXCELLENT\"|\"GOOD\"|\"FAIR\"|\"POOR\", \
\"branding_present\": bool, \
\"professionalism_level\": \"HIGH\"|\"MEDIUM\"|\"LOW\", \
\"audience\": string, \"ambience\": string, \
\"visual_indicators\": object, \"confidence\": number}";

/// One classification vote from one vision source.
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoClassification {
    pub category: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub confidence: Option<f64>,
}

impl PhotoClassification {
    pub fn parsed_category(&self) -> Option<PhotoCategory> {
        PhotoCategory::parse(&self.category)
    }
}

/// Deep analysis payload; field names mirror the visual-analysis schema.
#[derive(Debug, Clone, Deserialize)]
pub struct DeepVisualAnalysis {
    pub signage_quality: Option<String>,
    pub branding_present: Option<bool>,
    pub professionalism_level: Option<String>,
    pub audience: Option<String>,
    pub ambience: Option<String>,
    pub visual_indicators: Option<Value>,
    pub confidence: Option<f64>,
}

pub struct VisionClient {
    anthropic: AnthropicClient,
    openai: OpenAiClient,
    deep_model: String,
    precls_model: String,
    secondary_model: String,
}

impl VisionClient {
    pub fn new(
        anthropic: AnthropicClient,
        openai: OpenAiClient,
        deep_model: String,
        precls_model: String,
        secondary_model: String,
    ) -> Self {
        Self {
            anthropic,
            openai,
            deep_model,
            precls_model,
            secondary_model,
        }
    }

    pub fn deep_model_id(&self) -> &str {
        &self.deep_model
    }

    pub fn precls_model_id(&self) -> &str {
        &self.precls_model
    }

    fn image(image_bytes: &[u8]) -> ImageInput {
        use base64::Engine;
        ImageInput {
            media_type: sniff_media_type(image_bytes).to_string(),
            base64_data: base64::engine::general_purpose::STANDARD.encode(image_bytes),
        }
    }

    fn parse_classification(reply: &str) -> ProviderResult<PhotoClassification> {
        let value = extract_json(reply)
            .ok_or_else(|| ProviderError::ParseError("no JSON in classify reply".to_string()))?;
        serde_json::from_value(value).map_err(|e| ProviderError::ParseError(e.to_string()))
    }

    /// Cheap pre-classification with the primary vision source.
    pub async fn classify_photo(&self, image_bytes: &[u8]) -> ProviderResult<PhotoClassification> {
        let reply = self
            .anthropic
            .complete(
                &self.precls_model,
                CLASSIFY_SYSTEM,
                "Classifique esta foto.",
                &[Self::image(image_bytes)],
                VISION_TIMEOUT,
            )
            .await?;
        Self::parse_classification(&reply)
    }

    /// Independent second opinion for photo cross-validation.
    pub async fn classify_photo_secondary(
        &self,
        image_bytes: &[u8],
    ) -> ProviderResult<PhotoClassification> {
        let reply = self
            .openai
            .complete(
                &self.secondary_model,
                CLASSIFY_SYSTEM,
                "Classifique esta foto.",
                &[Self::image(image_bytes)],
                VISION_TIMEOUT,
            )
            .await?;
        Self::parse_classification(&reply)
    }

    /// Deep analysis over a batch of facade photos with record context.
    pub async fn analyze_photos(
        &self,
        images: &[Vec<u8>],
        context_text: &str,
    ) -> ProviderResult<DeepVisualAnalysis> {
        if images.is_empty() {
            return Err(ProviderError::InvalidInput("no images".to_string()));
        }
        let inputs: Vec<ImageInput> = images.iter().map(|b| Self::image(b)).collect();
        let reply = self
            .anthropic
            .complete(
                &self.deep_model,
                ANALYZE_SYSTEM,
                context_text,
                &inputs,
                VISION_TIMEOUT,
            )
            .await?;
        let value = extract_json(&reply)
            .ok_or_else(|| ProviderError::ParseError("no JSON in analysis reply".to_string()))?;
        serde_json::from_value(value).map_err(|e| ProviderError::ParseError(e.to_string()))
    }
}

/// Best-effort content sniffing; the vision APIs reject mislabeled bytes.
fn sniff_media_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0x47, 0x49, 0x46]) {
        "image/gif"
    } else if bytes.len() > 11 && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_reply_parses() {
        let parsed = VisionClient::parse_classification(
            "{\"category\": \"FACADE\", \"labels\": [\"storefront\"], \"confidence\": 92}",
        )
        .unwrap();
        assert_eq!(parsed.parsed_category(), Some(PhotoCategory::Facade));
        assert_eq!(parsed.labels, vec!["storefront"]);
    }

    #[test]
    fn unknown_category_is_none() {
        let parsed = VisionClient::parse_classification("{\"category\": \"SELFIE\"}").unwrap();
        assert_eq!(parsed.parsed_category(), None);
    }

    #[test]
    fn media_type_sniffing() {
        assert_eq!(sniff_media_type(&[0x89, b'P', b'N', b'G', 0, 0, 0, 0]), "image/png");
        assert_eq!(sniff_media_type(b"GIF89a"), "image/gif");
        assert_eq!(sniff_media_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
        assert_eq!(sniff_media_type(&[0xFF, 0xD8, 0xFF]), "image/jpeg");
    }
}
