//! Cross-validation of the two Places search strategies.

use super::similarity::{best_similarity, canonical, semantic_similarity, token_containment};
use crate::models::PlaceCrossMethod;
use serde::Serialize;

/// Minimal projection of a Places result needed for reconciliation.
#[derive(Debug, Clone)]
pub struct PlaceSummary {
    pub place_id: String,
    pub display_name: String,
    pub formatted_address: String,
}

/// Outcome of Places reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct PlacesResolution {
    pub accepted: bool,
    pub method: Option<PlaceCrossMethod>,
    pub confidence: u8,
    pub name_sim: f64,
    pub address_sim: f64,
    pub name_validated: bool,
    pub address_validated: bool,
    pub accepted_by_high_address: bool,
    pub divergences: Vec<String>,
    /// Index into the candidate order: 0 = nearby, 1 = text.
    pub chosen_index: Option<usize>,
}

fn looks_like_generic_address(name: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "rua", "avenida", "travessa", "alameda", "estrada", "rodovia", "praca", "largo",
    ];
    let c = canonical(name);
    PREFIXES.iter().any(|p| c.starts_with(p))
}

struct Thresholds {
    name: f64,
    address: f64,
}

fn thresholds_for(candidate: &PlaceSummary, from_nearby: bool) -> Thresholds {
    if looks_like_generic_address(&candidate.display_name) {
        Thresholds { name: 50.0, address: 70.0 }
    } else if from_nearby {
        Thresholds { name: 55.0, address: 65.0 }
    } else {
        Thresholds { name: 50.0, address: 60.0 }
    }
}

/// Hybrid clause: strong location corroboration overrides a name mismatch.
const HYBRID_ADDRESS_MIN: f64 = 68.0;
const HYBRID_NAME_MIN: f64 = 45.0;

/// Address match against the record's known addresses. Those are usually
/// terser than the provider's fully-qualified formatted address, so token
/// containment counts alongside plain similarity.
fn address_similarity(place_address: &str, candidates: &[&str]) -> f64 {
    candidates
        .iter()
        .filter(|c| !c.trim().is_empty())
        .map(|c| {
            let similar = semantic_similarity(place_address, c);
            let contained = token_containment(c, place_address) * 100.0;
            similar.max(contained)
        })
        .fold(0.0, f64::max)
}

/// Reconcile nearby- and text-mode results against the record's known names
/// and addresses. Candidates are tried nearby-first; the first to pass its
/// thresholds (or the hybrid clause) wins.
pub fn reconcile_places(
    nearby: Option<&PlaceSummary>,
    text: Option<&PlaceSummary>,
    name_candidates: &[&str],
    address_candidates: &[&str],
) -> PlacesResolution {
    if let (Some(n), Some(t)) = (nearby, text) {
        if n.place_id == t.place_id {
            return PlacesResolution {
                accepted: true,
                method: Some(PlaceCrossMethod::BothMatch),
                confidence: 100,
                name_sim: best_similarity(&n.display_name, name_candidates),
                address_sim: address_similarity(&n.formatted_address, address_candidates),
                name_validated: true,
                address_validated: true,
                accepted_by_high_address: false,
                divergences: Vec::new(),
                chosen_index: Some(0),
            };
        }
    }

    let candidates: [(Option<&PlaceSummary>, PlaceCrossMethod); 2] = [
        (nearby, PlaceCrossMethod::Nearby),
        (text, PlaceCrossMethod::Text),
    ];

    let mut divergences = Vec::new();
    for (index, (candidate, method)) in candidates.iter().enumerate() {
        let Some(candidate) = candidate else { continue };
        let name_sim = best_similarity(&candidate.display_name, name_candidates);
        let address_sim = address_similarity(&candidate.formatted_address, address_candidates);
        let limits = thresholds_for(candidate, *method == PlaceCrossMethod::Nearby);

        let name_ok = name_sim >= limits.name;
        let address_ok = address_sim >= limits.address;
        let hybrid = address_sim >= HYBRID_ADDRESS_MIN && name_sim >= HYBRID_NAME_MIN;

        if (name_ok && address_ok) || hybrid {
            let accepted_by_high_address = !(name_ok && address_ok) && hybrid;
            let confidence = if accepted_by_high_address {
                70
            } else {
                (((name_sim + address_sim) / 2.0).round() as u8).clamp(60, 95)
            };
            return PlacesResolution {
                accepted: true,
                method: Some(*method),
                confidence,
                name_sim,
                address_sim,
                name_validated: name_ok,
                address_validated: address_ok || hybrid,
                accepted_by_high_address,
                divergences,
                chosen_index: Some(index),
            };
        }
        divergences.push(format!(
            "{} result '{}' rejected (name {:.0}%, address {:.0}%)",
            method.as_str(),
            candidate.display_name,
            name_sim,
            address_sim
        ));
    }

    PlacesResolution {
        accepted: false,
        method: None,
        confidence: 0,
        name_sim: 0.0,
        address_sim: 0.0,
        name_validated: false,
        address_validated: false,
        accepted_by_high_address: false,
        divergences,
        chosen_index: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(id: &str, name: &str, address: &str) -> PlaceSummary {
        PlaceSummary {
            place_id: id.to_string(),
            display_name: name.to_string(),
            formatted_address: address.to_string(),
        }
    }

    #[test]
    fn same_place_id_is_both_match() {
        let n = place("P1", "Padaria X", "Rua A, 10, São Paulo");
        let t = place("P1", "Padaria X", "Rua A, 10, São Paulo");
        let res = reconcile_places(Some(&n), Some(&t), &["Padaria X"], &["Rua A, 10"]);
        assert!(res.accepted);
        assert_eq!(res.method, Some(PlaceCrossMethod::BothMatch));
        assert_eq!(res.confidence, 100);
    }

    #[test]
    fn nearby_named_establishment_passes() {
        let n = place("P1", "Padaria X", "Rua A, 10, Centro, São Paulo");
        let res = reconcile_places(Some(&n), None, &["Padaria X"], &["Rua A, 10 Centro São Paulo"]);
        assert!(res.accepted);
        assert_eq!(res.method, Some(PlaceCrossMethod::Nearby));
        assert!(res.name_validated);
        assert!(res.address_validated);
        assert!(!res.accepted_by_high_address);
    }

    #[test]
    fn full_provider_address_matches_terse_candidate() {
        let n = place(
            "P1",
            "Padaria X",
            "Rua A, 10 - Centro, São Paulo - SP, 01000-000, Brasil",
        );
        let res = reconcile_places(Some(&n), None, &["Padaria X"], &["Rua A, 10"]);
        assert!(res.accepted);
        assert!(res.address_validated);
        assert!(!res.accepted_by_high_address);
    }

    #[test]
    fn hybrid_acceptance_on_strong_address() {
        // Different trading name at the exact registered address.
        let n = place("P1", "Lanchonete do João", "Rua A, 10, Centro, São Paulo");
        let res = reconcile_places(
            Some(&n),
            None,
            &["Bar do João"],
            &["Rua A, 10, Centro, São Paulo"],
        );
        assert!(res.accepted);
        assert!(res.accepted_by_high_address);
        assert_eq!(res.confidence, 70);
    }

    #[test]
    fn rejection_leaves_no_choice() {
        let n = place("P1", "Farmácia Outra", "Avenida Z, 999, Campinas");
        let res = reconcile_places(Some(&n), None, &["Padaria X"], &["Rua A, 10, São Paulo"]);
        assert!(!res.accepted);
        assert!(res.chosen_index.is_none());
        assert!(!res.divergences.is_empty());
    }

    #[test]
    fn text_fallback_when_nearby_rejects() {
        let n = place("P1", "Loja Errada", "Avenida Z, 999, Campinas");
        let t = place("P2", "Padaria X", "Rua A, 10, São Paulo");
        let res = reconcile_places(
            Some(&n),
            Some(&t),
            &["Padaria X"],
            &["Rua A, 10, São Paulo"],
        );
        assert!(res.accepted);
        assert_eq!(res.method, Some(PlaceCrossMethod::Text));
        assert_eq!(res.chosen_index, Some(1));
    }

    #[test]
    fn generic_address_name_with_no_name_match_rejects() {
        // A result named after the street itself cannot ride the hybrid
        // clause when the establishment name is completely unrelated.
        let n = place("P1", "Rua A 10", "Rua A, 10, São Paulo");
        let res = reconcile_places(Some(&n), None, &["Padaria X"], &["Rua A, 10, São Paulo"]);
        assert!(!res.accepted);
    }
}
