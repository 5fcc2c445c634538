//! LLM-backed address normalization. Two of these run independently (one per
//! transport) and their outputs are reconciled downstream.

use super::llm::{extract_json, AnthropicClient, OpenAiClient, TEXT_TIMEOUT};
use super::{ProviderError, ProviderResult};
use crate::crossval::address::NormalizedAddress;

const SYSTEM_PROMPT: &str = "\
Você normaliza endereços brasileiros. Expanda abreviações (R. -> Rua, \
Av. -> Avenida, Dr. -> Doutor), corrija caixa e acentuação, converta o \
estado para a sigla de duas letras. Não invente logradouros, números ou \
bairros que não estejam no texto. Responda somente com JSON: \
{\"address\": string, \"city\": string, \"state\": string, \"changes\": [string]}";

enum Transport {
    Anthropic(AnthropicClient),
    OpenAi(OpenAiClient),
}

pub struct AddressNormalizerLlm {
    transport: Transport,
    model: String,
}

impl AddressNormalizerLlm {
    pub fn anthropic(client: AnthropicClient, model: String) -> Self {
        Self {
            transport: Transport::Anthropic(client),
            model,
        }
    }

    pub fn openai(client: OpenAiClient, model: String) -> Self {
        Self {
            transport: Transport::OpenAi(client),
            model,
        }
    }

    pub async fn normalize_address(
        &self,
        address: &str,
        city: &str,
        state: &str,
    ) -> ProviderResult<NormalizedAddress> {
        if address.trim().is_empty() {
            return Err(ProviderError::InvalidInput("empty address".to_string()));
        }
        let user = format!(
            "Endereço: {}\nCidade: {}\nEstado: {}",
            address.trim(),
            city.trim(),
            state.trim()
        );

        let reply = match &self.transport {
            Transport::Anthropic(client) => {
                client
                    .complete(&self.model, SYSTEM_PROMPT, &user, &[], TEXT_TIMEOUT)
                    .await?
            }
            Transport::OpenAi(client) => {
                client
                    .complete(&self.model, SYSTEM_PROMPT, &user, &[], TEXT_TIMEOUT)
                    .await?
            }
        };

        let value = extract_json(&reply)
            .ok_or_else(|| ProviderError::ParseError("no JSON in normalization reply".to_string()))?;
        let normalized: NormalizedAddress = serde_json::from_value(value)
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        if normalized.address.trim().is_empty() {
            return Err(ProviderError::ParseError(
                "normalization returned empty address".to_string(),
            ));
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_address_shape_parses() {
        let value = extract_json(
            "{\"address\": \"Rua A, 10\", \"city\": \"São Paulo\", \"state\": \"SP\", \
             \"changes\": [\"R. -> Rua\"]}",
        )
        .unwrap();
        let parsed: NormalizedAddress = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.address, "Rua A, 10");
        assert_eq!(parsed.state, "SP");
        assert_eq!(parsed.changes, vec!["R. -> Rua"]);
    }
}
