//! Semantic text similarity and the rule-based address normalizer.
//!
//! Similarity expands a fixed abbreviation table on both sides, strips
//! accents and punctuation, then combines a Levenshtein ratio with Jaccard
//! over tokens. Scores are percentages.

use std::collections::HashSet;

/// Abbreviation -> expansion pairs applied before comparison and by the
/// rule-based normalizer. Matching is token-exact, case-insensitive, with an
/// optional trailing dot.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("r", "rua"),
    ("av", "avenida"),
    ("tv", "travessa"),
    ("al", "alameda"),
    ("pc", "praca"),
    ("pca", "praca"),
    ("est", "estrada"),
    ("rod", "rodovia"),
    ("jd", "jardim"),
    ("pq", "parque"),
    ("vl", "vila"),
    ("lgo", "largo"),
    ("dr", "doutor"),
    ("dra", "doutora"),
    ("prof", "professor"),
    ("profa", "professora"),
    ("eng", "engenheiro"),
    ("cel", "coronel"),
    ("gal", "general"),
    ("mal", "marechal"),
    ("pres", "presidente"),
    ("sen", "senador"),
    ("dep", "deputado"),
    ("gov", "governador"),
    ("sta", "santa"),
    ("sto", "santo"),
    ("n", "numero"),
    ("no", "numero"),
    ("num", "numero"),
    ("s/n", "sem numero"),
];

/// Full state name (ascii lowercase) -> two-letter code.
const STATE_NAMES: &[(&str, &str)] = &[
    ("acre", "AC"),
    ("alagoas", "AL"),
    ("amapa", "AP"),
    ("amazonas", "AM"),
    ("bahia", "BA"),
    ("ceara", "CE"),
    ("distrito federal", "DF"),
    ("espirito santo", "ES"),
    ("goias", "GO"),
    ("maranhao", "MA"),
    ("mato grosso", "MT"),
    ("mato grosso do sul", "MS"),
    ("minas gerais", "MG"),
    ("para", "PA"),
    ("paraiba", "PB"),
    ("parana", "PR"),
    ("pernambuco", "PE"),
    ("piaui", "PI"),
    ("rio de janeiro", "RJ"),
    ("rio grande do norte", "RN"),
    ("rio grande do sul", "RS"),
    ("rondonia", "RO"),
    ("roraima", "RR"),
    ("santa catarina", "SC"),
    ("sao paulo", "SP"),
    ("sergipe", "SE"),
    ("tocantins", "TO"),
];

/// Accentless city name -> canonical accented form. Capitals plus a few
/// large municipalities that show up constantly in ingest files.
const CITY_CANONICAL: &[(&str, &str)] = &[
    ("sao paulo", "São Paulo"),
    ("rio de janeiro", "Rio de Janeiro"),
    ("belo horizonte", "Belo Horizonte"),
    ("brasilia", "Brasília"),
    ("salvador", "Salvador"),
    ("fortaleza", "Fortaleza"),
    ("curitiba", "Curitiba"),
    ("manaus", "Manaus"),
    ("recife", "Recife"),
    ("porto alegre", "Porto Alegre"),
    ("belem", "Belém"),
    ("goiania", "Goiânia"),
    ("sao luis", "São Luís"),
    ("maceio", "Maceió"),
    ("natal", "Natal"),
    ("teresina", "Teresina"),
    ("joao pessoa", "João Pessoa"),
    ("aracaju", "Aracaju"),
    ("cuiaba", "Cuiabá"),
    ("campo grande", "Campo Grande"),
    ("florianopolis", "Florianópolis"),
    ("vitoria", "Vitória"),
    ("macapa", "Macapá"),
    ("rio branco", "Rio Branco"),
    ("boa vista", "Boa Vista"),
    ("porto velho", "Porto Velho"),
    ("palmas", "Palmas"),
    ("campinas", "Campinas"),
    ("guarulhos", "Guarulhos"),
    ("ribeirao preto", "Ribeirão Preto"),
    ("uberlandia", "Uberlândia"),
    ("niteroi", "Niterói"),
];

/// ASCII-fold the Latin-1 accents that occur in Brazilian addresses.
pub fn strip_accents(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'é' | 'ê' | 'è' | 'ë' => 'e',
            'É' | 'Ê' | 'È' | 'Ë' => 'E',
            'í' | 'î' | 'ì' | 'ï' => 'i',
            'Í' | 'Î' | 'Ì' | 'Ï' => 'I',
            'ó' | 'ô' | 'õ' | 'ò' | 'ö' => 'o',
            'Ó' | 'Ô' | 'Õ' | 'Ò' | 'Ö' => 'O',
            'ú' | 'û' | 'ù' | 'ü' => 'u',
            'Ú' | 'Û' | 'Ù' | 'Ü' => 'U',
            'ç' => 'c',
            'Ç' => 'C',
            _ => c,
        })
        .collect()
}

fn expand_token(token: &str) -> &str {
    let bare = token.trim_end_matches('.');
    for (abbr, full) in ABBREVIATIONS {
        if bare.eq_ignore_ascii_case(abbr) {
            return full;
        }
    }
    token
}

/// Canonical comparison form: accent-folded, lowercased, abbreviations
/// expanded, punctuation collapsed to spaces.
pub fn canonical(input: &str) -> String {
    let folded = strip_accents(input).to_lowercase();
    let spaced: String = folded
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '/' { c } else { ' ' })
        .collect();
    spaced
        .split_whitespace()
        .map(expand_token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let inter = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Semantic similarity in percent: equivalence expansion, then
/// `0.5 * levenshtein-ratio + 0.5 * jaccard-on-tokens`.
pub fn semantic_similarity(a: &str, b: &str) -> f64 {
    let ca = canonical(a);
    let cb = canonical(b);
    if ca.is_empty() && cb.is_empty() {
        return 100.0;
    }
    if ca.is_empty() || cb.is_empty() {
        return 0.0;
    }
    let lev = strsim::normalized_levenshtein(&ca, &cb);
    let jac = jaccard(&ca, &cb);
    (0.5 * lev + 0.5 * jac) * 100.0
}

/// Fraction of `a`'s tokens present in `b`, after canonicalization. Catches
/// the common case of a terse input address being a prefix of the registry's
/// fully-qualified one.
pub fn token_containment(a: &str, b: &str) -> f64 {
    let ca = canonical(a);
    let cb = canonical(b);
    let tokens_a: Vec<&str> = ca.split_whitespace().collect();
    if tokens_a.is_empty() {
        return 0.0;
    }
    let tokens_b: HashSet<&str> = cb.split_whitespace().collect();
    let contained = tokens_a.iter().filter(|t| tokens_b.contains(*t)).count();
    contained as f64 / tokens_a.len() as f64
}

/// Best pairwise similarity against a set of candidates.
pub fn best_similarity(target: &str, candidates: &[&str]) -> f64 {
    candidates
        .iter()
        .filter(|c| !c.trim().is_empty())
        .map(|c| semantic_similarity(target, c))
        .fold(0.0, f64::max)
}

fn title_case_word(word: &str) -> String {
    // Portuguese connectives stay lowercase inside a name.
    const CONNECTIVES: &[&str] = &["de", "da", "do", "das", "dos", "e"];
    let lower = word.to_lowercase();
    if CONNECTIVES.contains(&lower.as_str()) {
        return lower;
    }
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Deterministic rule-based address normalizer. Idempotent: expansions never
/// re-match the abbreviation table.
pub fn normalize_address_rule_based(address: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for raw_token in address.split_whitespace() {
        // Keep punctuation that separates address parts, normalize the token.
        let trailing_comma = raw_token.ends_with(',');
        let token = raw_token.trim_matches(|c: char| c == ',');
        if token.is_empty() {
            continue;
        }
        let expanded = expand_token(token);
        let word = if expanded != token {
            expanded
                .split_whitespace()
                .map(title_case_word)
                .collect::<Vec<_>>()
                .join(" ")
        } else if token.chars().any(|c| c.is_alphabetic()) {
            title_case_word(token)
        } else {
            token.to_string()
        };
        if trailing_comma {
            out.push(format!("{},", word));
        } else {
            out.push(word);
        }
    }
    out.join(" ")
}

/// Normalize a city: fix case and re-apply canonical accents where known.
pub fn normalize_city_rule_based(city: &str) -> String {
    let key = strip_accents(city).to_lowercase();
    let key = key.split_whitespace().collect::<Vec<_>>().join(" ");
    for (plain, canonical_name) in CITY_CANONICAL {
        if key == *plain {
            return canonical_name.to_string();
        }
    }
    city.split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize a state to its two-letter code, if recognizable.
pub fn normalize_state_rule_based(state: &str) -> String {
    let trimmed = state.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return trimmed.to_ascii_uppercase();
    }
    let key = strip_accents(trimmed).to_lowercase();
    let key = key.split_whitespace().collect::<Vec<_>>().join(" ");
    for (name, code) in STATE_NAMES {
        if key == *name {
            return code.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_abbreviations_for_comparison() {
        let sim = semantic_similarity("R. A, 10", "Rua A, 10");
        assert!(sim > 95.0, "got {}", sim);
    }

    #[test]
    fn accent_insensitive() {
        let sim = semantic_similarity("Avenida São João", "Avenida Sao Joao");
        assert!(sim > 99.0, "got {}", sim);
    }

    #[test]
    fn different_streets_score_low() {
        let sim = semantic_similarity("Rua A, 10", "Avenida Z, 999");
        assert!(sim < 50.0, "got {}", sim);
    }

    #[test]
    fn rule_normalizer_expands_and_cases() {
        assert_eq!(
            normalize_address_rule_based("R. dr. joão, 10"),
            "Rua Doutor João, 10"
        );
        assert_eq!(normalize_address_rule_based("AV. BRASIL 100"), "Avenida Brasil 100");
    }

    #[test]
    fn rule_normalizer_is_idempotent() {
        let inputs = [
            "R. A, 10",
            "Av. Paulista, 1578",
            "Tv. do Comercio s/n",
            "RUA DAS FLORES, 22",
        ];
        for input in inputs {
            let once = normalize_address_rule_based(input);
            let twice = normalize_address_rule_based(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn state_normalization() {
        assert_eq!(normalize_state_rule_based("sp"), "SP");
        assert_eq!(normalize_state_rule_based("São Paulo"), "SP");
        assert_eq!(normalize_state_rule_based("Minas Gerais"), "MG");
    }

    #[test]
    fn city_accent_fix() {
        assert_eq!(normalize_city_rule_based("sao paulo"), "São Paulo");
        assert_eq!(normalize_city_rule_based("GOIANIA"), "Goiânia");
        assert_eq!(normalize_city_rule_based("Itu"), "Itu");
    }

    #[test]
    fn containment_tolerates_fuller_registry_address() {
        let raw = "R. A, 10";
        let registry = "Rua A, 10, Centro, São Paulo/SP, 01000-000";
        assert!(token_containment(raw, registry) >= 0.99);

        let divergent = "R. Z, 999";
        assert!(token_containment(divergent, registry) < 0.5);
    }

    #[test]
    fn best_similarity_takes_max() {
        let best = best_similarity("Padaria X", &["Padoca", "Padaria X"]);
        assert!(best > 99.0);
    }
}
