//! Thin typed clients for the external providers.
//!
//! Clients never mutate records and never retry on their own; retries are
//! the queue's job. Every call carries an explicit timeout and maps provider
//! failures onto the shared error taxonomy.

pub mod cnpj;
pub mod cpf;
pub mod geocode;
pub mod llm;
pub mod places;
pub mod text_llm;
pub mod vision;

use crate::models::Config;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Exhaustive provider error taxonomy. Each worker maps a failure to exactly
/// one kind; the kind decides the retry policy.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("authentication expired")]
    AuthExpired,
    #[error("not found")]
    NotFound,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("provider payload did not conform: {0}")]
    ParseError(String),
    #[error("image format rejected by vision model")]
    ImageFormatInvalid,
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::TransientNetwork(_) => "TransientNetwork",
            ProviderError::RateLimited { .. } => "RateLimited",
            ProviderError::AuthExpired => "AuthExpired",
            ProviderError::NotFound => "NotFound",
            ProviderError::InvalidInput(_) => "InvalidInput",
            ProviderError::ParseError(_) => "ParseError",
            ProviderError::ImageFormatInvalid => "ImageFormatInvalid",
            ProviderError::ConfigMissing(_) => "ConfigMissing",
            ProviderError::Internal(_) => "Internal",
        }
    }

    /// Whether the queue should retry the job for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::TransientNetwork(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::Internal(_)
        )
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProviderError::TransientNetwork(err.to_string())
        } else if err.is_decode() {
            ProviderError::ParseError(err.to_string())
        } else {
            ProviderError::Internal(err.to_string())
        }
    }

    /// Map a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: StatusCode, retry_after_secs: Option<u64>) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after_secs },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthExpired,
            StatusCode::NOT_FOUND => ProviderError::NotFound,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ProviderError::InvalidInput(format!("provider returned {}", status))
            }
            s if s.is_server_error() => {
                ProviderError::TransientNetwork(format!("provider returned {}", s))
            }
            s => ProviderError::Internal(format!("unexpected status {}", s)),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

pub(crate) fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Sliding-window limiter to respect provider quotas.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    current: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(LimiterState {
                current: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.window_start.elapsed();
                if elapsed >= self.window {
                    state.current = 0;
                    state.window_start = Instant::now();
                }
                if state.current < self.max_requests {
                    state.current += 1;
                    None
                } else {
                    Some(self.window - elapsed)
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Bundle of all provider clients, built once at startup.
pub struct Providers {
    pub cnpj: cnpj::CnpjClient,
    pub cpf: cpf::CpfClient,
    pub geocoder_a: geocode::GeocoderA,
    pub geocoder_b: geocode::GeocoderB,
    pub places: places::PlacesClient,
    pub text_llm_a: text_llm::AddressNormalizerLlm,
    pub text_llm_b: text_llm::AddressNormalizerLlm,
    pub vision: vision::VisionClient,
    pub analyst_llm: llm::AnthropicClient,
}

impl Providers {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let anthropic = llm::AnthropicClient::new(
            config.llm_a_url.clone(),
            config.llm_a_key.clone(),
        )?;
        let openai = llm::OpenAiClient::new(config.llm_b_url.clone(), config.llm_b_key.clone())?;

        Ok(Self {
            cnpj: cnpj::CnpjClient::new(config.cnpj_api_url.clone(), config.cnpj_api_key.clone())?,
            cpf: cpf::CpfClient::new(
                config.cpf_api_url.clone(),
                config.cpf_token_url.clone(),
                config.cpf_client_id.clone(),
                config.cpf_client_secret.clone(),
                config.cpf_fallback_url.clone(),
            )?,
            geocoder_a: geocode::GeocoderA::new(
                config.geocoder_a_url.clone(),
                config.geocoder_a_key.clone(),
            )?,
            geocoder_b: geocode::GeocoderB::new(config.geocoder_b_url.clone())?,
            places: places::PlacesClient::new(
                config.places_url.clone(),
                config.places_key.clone(),
            )?,
            text_llm_a: text_llm::AddressNormalizerLlm::anthropic(
                anthropic.clone(),
                config.llm_a_model.clone(),
            ),
            text_llm_b: text_llm::AddressNormalizerLlm::openai(
                openai.clone(),
                config.llm_b_model.clone(),
            ),
            vision: vision::VisionClient::new(
                anthropic.clone(),
                openai,
                config.vision_model.clone(),
                config.vision_precls_model.clone(),
                config.llm_b_model.clone(),
            ),
            analyst_llm: anthropic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert_eq!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(30)).kind(),
            "RateLimited"
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, None).kind(),
            "AuthExpired"
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::NOT_FOUND, None).kind(),
            "NotFound"
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::BAD_REQUEST, None).kind(),
            "InvalidInput"
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, None).kind(),
            "TransientNetwork"
        );
    }

    #[test]
    fn retry_policy_follows_kind() {
        assert!(ProviderError::TransientNetwork("x".into()).is_retryable());
        assert!(ProviderError::RateLimited { retry_after_secs: None }.is_retryable());
        assert!(ProviderError::Internal("x".into()).is_retryable());
        assert!(!ProviderError::NotFound.is_retryable());
        assert!(!ProviderError::InvalidInput("x".into()).is_retryable());
        assert!(!ProviderError::ParseError("x".into()).is_retryable());
        assert!(!ProviderError::ConfigMissing("KEY").is_retryable());
    }
}
