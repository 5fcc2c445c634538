//! Cross-validation engine: pure reconciliation functions over outputs of
//! independent sources.

pub mod address;
pub mod coords;
pub mod photos;
pub mod places;
pub mod similarity;

use similarity::semantic_similarity;

/// Trade-name match: best pairwise semantic similarity among the raw name,
/// the registry trade name, and the Places display name, in percent.
pub fn nome_fantasia_match(
    name_raw: Option<&str>,
    trade_name: Option<&str>,
    places_display_name: Option<&str>,
) -> Option<u8> {
    let names: Vec<&str> = [name_raw, trade_name, places_display_name]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect();
    if names.len() < 2 {
        return None;
    }
    let mut best = 0.0f64;
    for i in 0..names.len() {
        for j in (i + 1)..names.len() {
            best = best.max(semantic_similarity(names[i], names[j]));
        }
    }
    Some(best.round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_name_match_takes_best_pair() {
        let m = nome_fantasia_match(Some("Padaria X"), Some("Padaria X Ltda"), Some("Padaria X"));
        assert_eq!(m, Some(100));
    }

    #[test]
    fn trade_name_match_needs_two_names() {
        assert_eq!(nome_fantasia_match(Some("Padaria X"), None, None), None);
        assert_eq!(nome_fantasia_match(None, None, None), None);
    }
}
