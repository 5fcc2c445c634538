//! CPF registry client: authenticated primary endpoint with token caching,
//! open fallback endpoint when the primary is unavailable.

use super::{retry_after_secs, ProviderError, ProviderResult};
use crate::models::CpfData;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const TIMEOUT: Duration = Duration::from_secs(15);
/// Refresh the OAuth token this long before its reported expiry.
const TOKEN_SAFETY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct PrimaryResponse {
    nome: Option<String>,
    situacao: Option<SituacaoInfo>,
    nascimento: Option<String>,
    obito: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SituacaoInfo {
    descricao: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FallbackResponse {
    nome: Option<String>,
    situacao: Option<String>,
    #[serde(rename = "dataNascimento")]
    data_nascimento: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct CpfClient {
    http: Client,
    api_url: String,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    fallback_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl CpfClient {
    pub fn new(
        api_url: String,
        token_url: String,
        client_id: Option<String>,
        client_secret: Option<String>,
        fallback_url: String,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(TIMEOUT)
            .user_agent("cadastro-backend/1.0 (cpf lookup)")
            .build()?;
        Ok(Self {
            http,
            api_url,
            token_url,
            client_id,
            client_secret,
            fallback_url,
            token: Mutex::new(None),
        })
    }

    async fn fetch_token(&self) -> ProviderResult<String> {
        let (id, secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => return Err(ProviderError::ConfigMissing("CPF_CLIENT_ID/SECRET")),
        };

        {
            let cached = self.token.lock().await;
            if let Some(t) = cached.as_ref() {
                if t.expires_at > Instant::now() {
                    return Ok(t.token.clone());
                }
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(id, Some(secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let lifetime = Duration::from_secs(payload.expires_in)
            .saturating_sub(TOKEN_SAFETY_MARGIN);
        let mut cached = self.token.lock().await;
        *cached = Some(CachedToken {
            token: payload.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(payload.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn lookup_primary(&self, cpf11: &str) -> ProviderResult<CpfData> {
        let token = self.fetch_token().await?;
        let url = format!("{}/{}", self.api_url.trim_end_matches('/'), cpf11);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }
        let payload: PrimaryResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(CpfData {
            cpf_name: payload.nome,
            cpf_status: payload.situacao.and_then(|s| s.descricao),
            cpf_birth: payload.nascimento,
            cpf_deceased: Some(payload.obito.is_some()),
        })
    }

    async fn lookup_fallback(&self, cpf11: &str) -> ProviderResult<CpfData> {
        let url = format!("{}/{}", self.fallback_url.trim_end_matches('/'), cpf11);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }
        let payload: FallbackResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(CpfData {
            cpf_name: payload.nome,
            cpf_status: payload.situacao,
            cpf_birth: payload.data_nascimento,
            cpf_deceased: None,
        })
    }

    /// Primary with one token refresh on auth expiry, then fallback.
    pub async fn lookup(&self, cpf11: &str) -> ProviderResult<CpfData> {
        if cpf11.len() != 11 || !cpf11.chars().all(|c| c.is_ascii_digit()) {
            return Err(ProviderError::InvalidInput(format!(
                "expected 11 digits, got {}",
                cpf11.len()
            )));
        }

        let primary = match self.lookup_primary(cpf11).await {
            Err(ProviderError::AuthExpired) => {
                self.invalidate_token().await;
                self.lookup_primary(cpf11).await
            }
            other => other,
        };

        match primary {
            Ok(data) => {
                debug!(cpf = cpf11, "CPF primary lookup done");
                Ok(data)
            }
            Err(e) => {
                warn!(cpf = cpf11, error = %e, "CPF primary failed; trying fallback");
                self.lookup_fallback(cpf11).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primary_payload() {
        let raw = serde_json::json!({
            "ni": "52998224725",
            "nome": "João da Silva",
            "situacao": {"codigo": "0", "descricao": "Regular"},
            "nascimento": "1980-05-01"
        });
        let parsed: PrimaryResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.nome.as_deref(), Some("João da Silva"));
        assert_eq!(
            parsed.situacao.unwrap().descricao.as_deref(),
            Some("Regular")
        );
    }

    #[test]
    fn parses_fallback_payload() {
        let raw = serde_json::json!({
            "nome": "João da Silva",
            "situacao": "Regular",
            "dataNascimento": "01/05/1980"
        });
        let parsed: FallbackResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.situacao.as_deref(), Some("Regular"));
        assert_eq!(parsed.data_nascimento.as_deref(), Some("01/05/1980"));
    }
}
