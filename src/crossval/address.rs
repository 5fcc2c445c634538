//! Triple cross-validation of address normalization: two independent LLMs
//! against the deterministic rule-based normalizer.

use super::similarity::{
    normalize_address_rule_based, normalize_city_rule_based, normalize_state_rule_based,
    semantic_similarity,
};
use serde::{Deserialize, Serialize};

/// A normalized address triple produced by one normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub address: String,
    pub city: String,
    pub state: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

impl NormalizedAddress {
    fn concat(&self) -> String {
        format!("{} {} {}", self.address, self.city, self.state)
    }
}

/// Outcome of the reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct AddressResolution {
    pub chosen: NormalizedAddress,
    pub source: AddressSource,
    pub confidence: u8,
    pub divergences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressSource {
    CrossValidated,
    LlmA,
    LlmB,
    Regex,
}

impl AddressSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressSource::CrossValidated => "CROSS_VALIDATED",
            AddressSource::LlmA => "LLM_A",
            AddressSource::LlmB => "LLM_B",
            AddressSource::Regex => "REGEX",
        }
    }
}

/// Rule-based leg of the triple, built from the raw fields.
pub fn rule_based_leg(address: &str, city: &str, state: &str) -> NormalizedAddress {
    NormalizedAddress {
        address: normalize_address_rule_based(address),
        city: normalize_city_rule_based(city),
        state: normalize_state_rule_based(state),
        changes: Vec::new(),
    }
}

/// Reconcile the three normalizations. The resolution ladder is evaluated in
/// order and the first matching rule wins.
pub fn reconcile_addresses(
    llm_a: Option<&NormalizedAddress>,
    llm_b: Option<&NormalizedAddress>,
    rule: &NormalizedAddress,
) -> AddressResolution {
    let sim = |x: &NormalizedAddress, y: &NormalizedAddress| {
        semantic_similarity(&x.concat(), &y.concat())
    };

    match (llm_a, llm_b) {
        (Some(a), Some(b)) => {
            let ab = sim(a, b);
            let ar = sim(a, rule);
            let br = sim(b, rule);

            if ab >= 80.0 && ar >= 80.0 && br >= 80.0 {
                return AddressResolution {
                    chosen: a.clone(),
                    source: AddressSource::CrossValidated,
                    confidence: 100,
                    divergences: Vec::new(),
                };
            }
            if ab >= 90.0 {
                return AddressResolution {
                    chosen: a.clone(),
                    source: AddressSource::LlmA,
                    confidence: 98,
                    divergences: Vec::new(),
                };
            }
            if ab >= 80.0 {
                return AddressResolution {
                    chosen: a.clone(),
                    source: AddressSource::LlmA,
                    confidence: 95,
                    divergences: Vec::new(),
                };
            }
            if ab >= 70.0 {
                return AddressResolution {
                    chosen: a.clone(),
                    source: AddressSource::LlmA,
                    confidence: 90,
                    divergences: Vec::new(),
                };
            }
            // Below 70% the LLMs disagree; the rule-based leg arbitrates.
            if ar >= 75.0 && br < 65.0 {
                return AddressResolution {
                    chosen: a.clone(),
                    source: AddressSource::LlmA,
                    confidence: 88,
                    divergences: vec!["LLM-B diverged (hallucination flag)".to_string()],
                };
            }
            if br >= 75.0 && ar < 65.0 {
                return AddressResolution {
                    chosen: b.clone(),
                    source: AddressSource::LlmB,
                    confidence: 88,
                    divergences: vec!["LLM-A diverged (hallucination flag)".to_string()],
                };
            }
            AddressResolution {
                chosen: a.clone(),
                source: AddressSource::LlmA,
                confidence: 80,
                divergences: vec![format!(
                    "all three normalizers diverged (LLM-A vs LLM-B {:.0}%, LLM-A vs rule {:.0}%, LLM-B vs rule {:.0}%)",
                    ab, ar, br
                )],
            }
        }
        (Some(a), None) => {
            let ar = sim(a, rule);
            if ar >= 60.0 {
                AddressResolution {
                    chosen: a.clone(),
                    source: AddressSource::LlmA,
                    confidence: 85,
                    divergences: Vec::new(),
                }
            } else {
                AddressResolution {
                    chosen: rule.clone(),
                    source: AddressSource::Regex,
                    confidence: 65,
                    divergences: vec!["LLM-A diverged (hallucination flag)".to_string()],
                }
            }
        }
        (None, Some(b)) => {
            let br = sim(b, rule);
            if br >= 60.0 {
                AddressResolution {
                    chosen: b.clone(),
                    source: AddressSource::LlmB,
                    confidence: 82,
                    divergences: Vec::new(),
                }
            } else {
                AddressResolution {
                    chosen: rule.clone(),
                    source: AddressSource::Regex,
                    confidence: 65,
                    divergences: vec!["LLM-B diverged (hallucination flag)".to_string()],
                }
            }
        }
        (None, None) => AddressResolution {
            chosen: rule.clone(),
            source: AddressSource::Regex,
            confidence: 60,
            divergences: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(address: &str) -> NormalizedAddress {
        NormalizedAddress {
            address: address.to_string(),
            city: "São Paulo".to_string(),
            state: "SP".to_string(),
            changes: Vec::new(),
        }
    }

    #[test]
    fn full_consensus_is_cross_validated() {
        let a = addr("Rua A, 10");
        let b = addr("Rua A, 10");
        let rule = addr("Rua A, 10");
        let res = reconcile_addresses(Some(&a), Some(&b), &rule);
        assert_eq!(res.source, AddressSource::CrossValidated);
        assert_eq!(res.confidence, 100);
        assert!(res.divergences.is_empty());
    }

    #[test]
    fn llm_agreement_without_rule() {
        let a = addr("Rua A, 10");
        let b = addr("Rua A, 10");
        let rule = addr("Travessa Completamente Diferente Qualquer, 999");
        let res = reconcile_addresses(Some(&a), Some(&b), &rule);
        assert_eq!(res.source, AddressSource::LlmA);
        assert_eq!(res.confidence, 98);
    }

    #[test]
    fn hallucination_on_llm_a_prefers_llm_b() {
        // LLM-A invents a street; LLM-B matches the rule-based output.
        let a = addr("Avenida Inventada do Modelo, 777");
        let b = addr("Rua A, 10");
        let rule = addr("Rua A, 10");
        let res = reconcile_addresses(Some(&a), Some(&b), &rule);
        assert_eq!(res.source, AddressSource::LlmB);
        assert_eq!(res.confidence, 88);
        assert!(res.divergences[0].contains("LLM-A diverged"));
    }

    #[test]
    fn lone_llm_checked_against_rule() {
        let a = addr("Rua A, 10");
        let rule = addr("Rua A, 10");
        let res = reconcile_addresses(Some(&a), None, &rule);
        assert_eq!(res.source, AddressSource::LlmA);
        assert_eq!(res.confidence, 85);

        let wild = addr("Avenida Inventada do Modelo, 777");
        let res = reconcile_addresses(Some(&wild), None, &rule);
        assert_eq!(res.source, AddressSource::Regex);
        assert_eq!(res.confidence, 65);
        assert!(!res.divergences.is_empty());
    }

    #[test]
    fn no_llms_falls_back_to_rule() {
        let rule = addr("Rua A, 10");
        let res = reconcile_addresses(None, None, &rule);
        assert_eq!(res.source, AddressSource::Regex);
        assert_eq!(res.confidence, 60);
    }

    #[test]
    fn total_disagreement_keeps_llm_a_low_confidence() {
        let a = addr("Rua Um, 1");
        let b = addr("Avenida Dois, 2222 Bloco Z");
        let rule = addr("Travessa Tres Nada A Ver, 33333");
        let res = reconcile_addresses(Some(&a), Some(&b), &rule);
        assert_eq!(res.source, AddressSource::LlmA);
        assert_eq!(res.confidence, 80);
        assert!(!res.divergences.is_empty());
    }
}
