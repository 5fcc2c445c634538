//! CNPJ tax-registry client.

use super::{retry_after_secs, ProviderError, ProviderResult, RateLimiter};
use crate::models::{Partner, RegistryData};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Registry payloads arrive loosely structured; every field is optional and
/// the mapping below is defensive.
#[derive(Debug, Deserialize)]
struct RegistryResponse {
    razao_social: Option<String>,
    capital_social: Option<serde_json::Value>,
    natureza_juridica: Option<Labeled>,
    porte: Option<Labeled>,
    simples: Option<SimplesInfo>,
    #[serde(default)]
    socios: Vec<SocioInfo>,
    estabelecimento: Option<EstablishmentInfo>,
}

#[derive(Debug, Deserialize)]
struct Labeled {
    descricao: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SimplesInfo {
    simples: Option<String>,
    mei: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SocioInfo {
    nome: Option<String>,
    cpf_cnpj_socio: Option<String>,
    qualificacao_socio: Option<Labeled>,
    data_entrada_sociedade: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EstablishmentInfo {
    nome_fantasia: Option<String>,
    tipo_logradouro: Option<String>,
    logradouro: Option<String>,
    numero: Option<String>,
    bairro: Option<String>,
    cep: Option<String>,
    situacao_cadastral: Option<String>,
    data_inicio_atividade: Option<String>,
    atividade_principal: Option<Labeled>,
    cidade: Option<NamedInfo>,
    estado: Option<StateInfo>,
    #[serde(default)]
    inscricoes_estaduais: Vec<StateRegistration>,
}

#[derive(Debug, Deserialize)]
struct NamedInfo {
    nome: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateInfo {
    sigla: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateRegistration {
    ativo: Option<bool>,
}

fn yes(value: &Option<String>) -> Option<bool> {
    value
        .as_deref()
        .map(|v| matches!(v.trim().to_ascii_uppercase().as_str(), "SIM" | "S" | "TRUE" | "1"))
}

impl RegistryResponse {
    fn into_registry_data(self) -> RegistryData {
        let est = self.estabelecimento;
        let (trade_name, address, status, opening, activity, registrations) = match est {
            Some(e) => {
                let street = [
                    e.tipo_logradouro.as_deref().unwrap_or(""),
                    e.logradouro.as_deref().unwrap_or(""),
                ]
                .join(" ")
                .trim()
                .to_string();
                let mut parts: Vec<String> = Vec::new();
                if !street.is_empty() {
                    parts.push(street);
                }
                if let Some(n) = e.numero.filter(|n| !n.is_empty()) {
                    parts.push(n);
                }
                if let Some(b) = e.bairro.filter(|b| !b.is_empty()) {
                    parts.push(b);
                }
                let city_name = e.cidade.and_then(|c| c.nome);
                let uf = e.estado.and_then(|s| s.sigla);
                match (&city_name, &uf) {
                    (Some(c), Some(u)) => parts.push(format!("{}/{}", c, u)),
                    (Some(c), None) => parts.push(c.clone()),
                    _ => {}
                }
                if let Some(cep) = e.cep.filter(|c| !c.is_empty()) {
                    parts.push(cep);
                }
                let fiscal = if e.inscricoes_estaduais.is_empty() {
                    None
                } else if e
                    .inscricoes_estaduais
                    .iter()
                    .any(|r| r.ativo.unwrap_or(false))
                {
                    Some("ENABLED".to_string())
                } else {
                    Some("DISABLED".to_string())
                };
                (
                    e.nome_fantasia,
                    Some(parts.join(", ")).filter(|a| !a.is_empty()),
                    e.situacao_cadastral,
                    e.data_inicio_atividade,
                    e.atividade_principal.and_then(|a| a.descricao),
                    fiscal,
                )
            }
            None => (None, None, None, None, None, None),
            };

        RegistryData {
            legal_name: self.razao_social,
            trade_name,
            registry_address: address,
            registry_status: status,
            opening_date: opening,
            legal_nature: self.natureza_juridica.and_then(|n| n.descricao),
            main_activity: activity,
            simples_nacional: self.simples.as_ref().and_then(|s| yes(&s.simples)),
            mei_optant: self.simples.as_ref().and_then(|s| yes(&s.mei)),
            fiscal_registration_status: registrations,
            partners: self
                .socios
                .into_iter()
                .filter_map(|s| {
                    Some(Partner {
                        name: s.nome?,
                        tax_id: s.cpf_cnpj_socio,
                        role: s.qualificacao_socio.and_then(|q| q.descricao),
                        since: s.data_entrada_sociedade,
                    })
                })
                .collect(),
            capital: self.capital_social.and_then(|v| match v {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.replace(',', ".").parse().ok(),
                _ => None,
            }),
            size: self.porte.and_then(|p| p.descricao),
        }
    }
}

pub struct CnpjClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: RateLimiter,
}

impl CnpjClient {
    pub fn new(base_url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(TIMEOUT)
            .user_agent("cadastro-backend/1.0 (registry lookup)")
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            // Public registry endpoints throttle hard.
            limiter: RateLimiter::new(3, Duration::from_secs(60)),
        })
    }

    pub async fn lookup(&self, cnpj14: &str) -> ProviderResult<RegistryData> {
        if cnpj14.len() != 14 || !cnpj14.chars().all(|c| c.is_ascii_digit()) {
            return Err(ProviderError::InvalidInput(format!(
                "expected 14 digits, got {}",
                cnpj14.len()
            )));
        }
        self.limiter.acquire().await;

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), cnpj14);
        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("x_api_token", key);
        }
        let response = request.send().await.map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }

        let payload: RegistryResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        let data = payload.into_registry_data();
        debug!(cnpj = cnpj14, status = ?data.registry_status, "Registry lookup done");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_payload() {
        let raw = serde_json::json!({
            "razao_social": "PADARIA X LTDA",
            "capital_social": "10000.00",
            "natureza_juridica": {"descricao": "Sociedade Empresária Limitada"},
            "porte": {"descricao": "ME"},
            "simples": {"simples": "Sim", "mei": "Não"},
            "socios": [
                {
                    "nome": "João da Silva",
                    "cpf_cnpj_socio": "52998224725",
                    "qualificacao_socio": {"descricao": "Sócio-Administrador"},
                    "data_entrada_sociedade": "2015-03-01"
                }
            ],
            "estabelecimento": {
                "nome_fantasia": "Padaria X",
                "tipo_logradouro": "Rua",
                "logradouro": "A",
                "numero": "10",
                "bairro": "Centro",
                "cep": "01000000",
                "situacao_cadastral": "Ativa",
                "data_inicio_atividade": "2015-03-01",
                "atividade_principal": {"descricao": "Padaria e confeitaria"},
                "cidade": {"nome": "São Paulo"},
                "estado": {"sigla": "SP"},
                "inscricoes_estaduais": [{"ativo": true}]
            }
        });
        let parsed: RegistryResponse = serde_json::from_value(raw).unwrap();
        let data = parsed.into_registry_data();

        assert_eq!(data.legal_name.as_deref(), Some("PADARIA X LTDA"));
        assert_eq!(data.trade_name.as_deref(), Some("Padaria X"));
        assert!(data.registry_address.as_deref().unwrap().contains("Rua A, 10"));
        assert!(data.registry_address.as_deref().unwrap().contains("São Paulo/SP"));
        assert!(data.is_active());
        assert_eq!(data.simples_nacional, Some(true));
        assert_eq!(data.mei_optant, Some(false));
        assert_eq!(data.fiscal_registration_status.as_deref(), Some("ENABLED"));
        assert_eq!(data.partners.len(), 1);
        assert_eq!(data.partners[0].tax_id.as_deref(), Some("52998224725"));
        assert_eq!(data.capital, Some(10000.0));
    }

    #[test]
    fn tolerates_sparse_payload() {
        let parsed: RegistryResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        let data = parsed.into_registry_data();
        assert!(data.legal_name.is_none());
        assert!(data.registry_address.is_none());
        assert!(!data.is_active());
        assert!(data.partners.is_empty());
    }
}
