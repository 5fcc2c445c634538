//! Source map: labels every logical field of a record with its origin and
//! trust level. Pure function of the record; recomputed on demand, never
//! persisted.
//!
//! The governing rule: only the tax document from the input file is trusted
//! a priori. Every other input-only field is capped at confidence 30 until
//! an external source corroborates it.

use crate::crossval::similarity::{semantic_similarity, token_containment};
use crate::models::{DocumentKind, PlaceCrossMethod, Record};
use serde::Serialize;
use serde_json::{json, Value};

pub const INPUT_BASELINE: u8 = 30;
pub const REGISTRY_BASELINE: u8 = 95;
pub const GEOCODER_A_BASELINE: u8 = 90;
pub const GEOCODER_B_BASELINE: u8 = 85;
pub const PLACES_BASELINE: u8 = 85;
pub const VISION_BASELINE: u8 = 75;
const CROSS_BONUS_SMALL: u8 = 5;
const CROSS_BONUS_LARGE: u8 = 10;
const DISAGREEMENT_PENALTY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    Input,
    CnpjRegistry,
    CpfRegistry,
    GeocoderA,
    GeocoderB,
    Places,
    VisionLlm,
    CrossValidated,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Input => "INPUT",
            Origin::CnpjRegistry => "CNPJ_REGISTRY",
            Origin::CpfRegistry => "CPF_REGISTRY",
            Origin::GeocoderA => "GEOCODER_A",
            Origin::GeocoderB => "GEOCODER_B",
            Origin::Places => "PLACES",
            Origin::VisionLlm => "VISION_LLM",
            Origin::CrossValidated => "CROSS_VALIDATED",
        }
    }
}

/// One labeled field of the source map.
#[derive(Debug, Clone, Serialize)]
pub struct FieldOrigin {
    pub field: String,
    pub label: String,
    pub value: Value,
    pub source: Origin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_source: Option<Origin>,
    pub confidence: u8,
    pub validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence: Option<String>,
}

impl FieldOrigin {
    fn new(field: &str, label: &str, value: Value, source: Origin, confidence: u8) -> Self {
        Self {
            field: field.to_string(),
            label: label.to_string(),
            value,
            source,
            secondary_source: None,
            confidence,
            validated: source != Origin::Input,
            divergence: None,
        }
    }

    fn corroborated(mut self, by: Origin, bonus: u8) -> Self {
        self.secondary_source = Some(by);
        self.source = Origin::CrossValidated;
        self.confidence = self.confidence.saturating_add(bonus).min(100);
        self.validated = true;
        self
    }

    fn diverged(mut self, note: String) -> Self {
        self.confidence = self.confidence.saturating_sub(DISAGREEMENT_PENALTY);
        self.divergence = Some(note);
        self
    }
}

fn opt_value<T: Serialize>(value: &Option<T>) -> Value {
    value
        .as_ref()
        .map(|v| serde_json::to_value(v).unwrap_or(Value::Null))
        .unwrap_or(Value::Null)
}

/// Build the full source map in a fixed field order. Deterministic for a
/// given record state.
pub fn build_source_map(record: &Record) -> Vec<FieldOrigin> {
    let mut map = Vec::new();

    // The document anchors everything. It is trusted at 100 once its digit
    // count matches; `validated` only flips when a registry confirmed it.
    map.push(FieldOrigin {
        field: "document".to_string(),
        label: "Documento fiscal".to_string(),
        value: json!(record.document),
        source: Origin::Input,
        secondary_source: match record.document_kind {
            DocumentKind::Cnpj if record.document_validated => Some(Origin::CnpjRegistry),
            DocumentKind::Cpf if record.document_validated => Some(Origin::CpfRegistry),
            _ => None,
        },
        confidence: if record.document_kind == DocumentKind::Invalid {
            0
        } else {
            100
        },
        validated: record.document_validated,
        divergence: None,
    });

    // Raw establishment name; validated only by the trade-name cross-check.
    let name_match = record.nome_fantasia_match.unwrap_or(0);
    let mut name = FieldOrigin::new(
        "name_raw",
        "Nome informado",
        opt_value(&record.raw.name_raw),
        Origin::Input,
        INPUT_BASELINE,
    );
    if name_match >= 80 {
        name.confidence = PLACES_BASELINE;
        name = name.corroborated(Origin::Places, CROSS_BONUS_SMALL);
    }
    map.push(name);

    if let Some(registry) = &record.registry {
        map.push(FieldOrigin::new(
            "legal_name",
            "Razão social",
            opt_value(&registry.legal_name),
            Origin::CnpjRegistry,
            REGISTRY_BASELINE,
        ));

        let mut trade = FieldOrigin::new(
            "trade_name",
            "Nome fantasia",
            opt_value(&registry.trade_name),
            Origin::CnpjRegistry,
            REGISTRY_BASELINE,
        );
        if name_match >= 80 {
            trade = trade.corroborated(Origin::Places, CROSS_BONUS_SMALL);
        }
        map.push(trade);

        let mut registry_address = FieldOrigin::new(
            "registry_address",
            "Endereço de registro",
            opt_value(&registry.registry_address),
            Origin::CnpjRegistry,
            REGISTRY_BASELINE,
        );
        if record.divergence_address == Some(true) {
            registry_address = registry_address
                .diverged("endereço informado diverge do endereço de registro".to_string());
        }
        map.push(registry_address);

        map.push(FieldOrigin::new(
            "registry_status",
            "Situação cadastral",
            opt_value(&registry.registry_status),
            Origin::CnpjRegistry,
            REGISTRY_BASELINE,
        ));
        map.push(FieldOrigin::new(
            "main_activity",
            "Atividade principal",
            opt_value(&registry.main_activity),
            Origin::CnpjRegistry,
            REGISTRY_BASELINE,
        ));
        map.push(FieldOrigin::new(
            "partners",
            "Quadro societário",
            serde_json::to_value(&registry.partners).unwrap_or(Value::Null),
            Origin::CnpjRegistry,
            REGISTRY_BASELINE,
        ));
    }

    if let Some(cpf) = &record.cpf_info {
        map.push(FieldOrigin::new(
            "cpf_name",
            "Nome do titular",
            opt_value(&cpf.cpf_name),
            Origin::CpfRegistry,
            REGISTRY_BASELINE,
        ));
        map.push(FieldOrigin::new(
            "cpf_status",
            "Situação do CPF",
            opt_value(&cpf.cpf_status),
            Origin::CpfRegistry,
            REGISTRY_BASELINE,
        ));
    }

    // Raw address: input-only unless it matches the registry address.
    let mut raw_address = FieldOrigin::new(
        "address_raw",
        "Endereço informado",
        opt_value(&record.raw.address_raw),
        Origin::Input,
        INPUT_BASELINE,
    );
    if record.divergence_address == Some(false) {
        raw_address.confidence = REGISTRY_BASELINE;
        raw_address = raw_address.corroborated(Origin::CnpjRegistry, CROSS_BONUS_SMALL);
    }
    map.push(raw_address);

    // Normalized address: still input-derived text; corroboration comes from
    // the registry or the geocoder's formatted address.
    if let Some(normalized) = &record.normalization.address_normalized {
        // Similarity or token containment both count as corroboration: the
        // normalized address is usually terser than the registry's.
        let agrees = |candidate: &str| {
            semantic_similarity(normalized, candidate) >= 70.0
                || token_containment(normalized, candidate) >= 0.8
        };
        let registry_agrees = record
            .registry
            .as_ref()
            .and_then(|r| r.registry_address.as_deref())
            .map(agrees)
            .unwrap_or(false);
        let geo_agrees = record
            .geo
            .formatted_address
            .as_deref()
            .map(agrees)
            .unwrap_or(false);

        let mut field = FieldOrigin::new(
            "address_normalized",
            "Endereço normalizado",
            json!(normalized),
            Origin::Input,
            INPUT_BASELINE,
        );
        field.validated = false;
        if registry_agrees {
            field.confidence = REGISTRY_BASELINE;
            field = field.corroborated(Origin::CnpjRegistry, CROSS_BONUS_SMALL);
        } else if geo_agrees {
            field.confidence = GEOCODER_A_BASELINE;
            field = field.corroborated(Origin::GeocoderA, CROSS_BONUS_SMALL);
        }
        map.push(field);
    }

    if let (Some(lat), Some(lng)) = (record.geo.lat, record.geo.lng) {
        let source = match record.geo.source.as_deref() {
            Some("GEOCODER_B") => Origin::GeocoderB,
            _ => Origin::GeocoderA,
        };
        let baseline = if source == Origin::GeocoderB {
            GEOCODER_B_BASELINE
        } else {
            GEOCODER_A_BASELINE
        };
        let mut coords = FieldOrigin::new(
            "coordinates",
            "Coordenadas",
            json!({"lat": lat, "lng": lng}),
            source,
            record.geo.confidence.unwrap_or(baseline),
        );
        if record.geo.max_divergence_m.is_some() {
            let other = if source == Origin::GeocoderA {
                Origin::GeocoderB
            } else {
                Origin::GeocoderA
            };
            coords.secondary_source = Some(other);
        }
        if record.geo.within_state == Some(false) {
            coords = coords.diverged("coordenadas fora do estado declarado".to_string());
        }
        map.push(coords);
    }

    if let Some(place_id) = &record.place.place_id {
        let mut place = FieldOrigin::new(
            "place",
            "Estabelecimento localizado",
            json!({
                "place_id": place_id,
                "rating": record.place.rating,
                "review_count": record.place.review_count,
                "website": record.place.website,
            }),
            Origin::Places,
            record.place.cross_confidence.unwrap_or(PLACES_BASELINE),
        );
        if record.place.cross_method == Some(PlaceCrossMethod::BothMatch) {
            place.confidence = PLACES_BASELINE;
            place = place.corroborated(Origin::Places, CROSS_BONUS_LARGE);
        }
        map.push(place);

        if let Some(phone) = &record.place.phone {
            let mut field = FieldOrigin::new(
                "phone",
                "Telefone",
                json!(phone),
                Origin::Places,
                PLACES_BASELINE,
            );
            if let Some(raw_phone) = &record.raw.phone_raw {
                let digits = |s: &str| -> String {
                    s.chars().filter(|c| c.is_ascii_digit()).collect()
                };
                if !digits(raw_phone).is_empty() && digits(raw_phone) == digits(phone) {
                    field.secondary_source = Some(Origin::Input);
                    field.confidence = field
                        .confidence
                        .saturating_add(CROSS_BONUS_SMALL)
                        .min(100);
                }
            }
            map.push(field);
        }
    }

    if record.visual.signage_quality.is_some() || record.visual.professionalism_level.is_some() {
        let mut visual = FieldOrigin::new(
            "visual_analysis",
            "Análise visual",
            json!({
                "signage_quality": record.visual.signage_quality,
                "branding_present": record.visual.branding_present,
                "professionalism_level": record.visual.professionalism_level,
            }),
            Origin::VisionLlm,
            record.visual.confidence.unwrap_or(VISION_BASELINE),
        );
        if record.visual.sources_available.unwrap_or(0) >= 2 {
            visual = visual.corroborated(Origin::VisionLlm, CROSS_BONUS_LARGE);
        }
        map.push(visual);
    }

    map
}

/// Mean confidence across the map; the analyst's source score.
pub fn source_score(map: &[FieldOrigin]) -> u8 {
    if map.is_empty() {
        return 0;
    }
    let sum: u32 = map.iter().map(|f| f.confidence as u32).sum();
    (sum / map.len() as u32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawInput, RegistryData};

    fn base_record() -> Record {
        Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput {
                name_raw: Some("Padaria X".to_string()),
                address_raw: Some("R. A, 10".to_string()),
                phone_raw: Some("(11) 1111-1111".to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn input_only_fields_capped_at_thirty() {
        let record = base_record();
        let map = build_source_map(&record);
        for field in map.iter().filter(|f| f.field != "document") {
            if field.source == Origin::Input {
                assert!(
                    field.confidence <= INPUT_BASELINE,
                    "{} has confidence {}",
                    field.field,
                    field.confidence
                );
                assert!(!field.validated);
            }
        }
    }

    #[test]
    fn document_is_trusted_at_100() {
        let record = base_record();
        let map = build_source_map(&record);
        let doc = &map[0];
        assert_eq!(doc.field, "document");
        assert_eq!(doc.confidence, 100);
        assert!(!doc.validated);
    }

    #[test]
    fn registry_fields_carry_registry_baseline() {
        let mut record = base_record();
        record.registry = Some(RegistryData {
            legal_name: Some("PADARIA X LTDA".to_string()),
            registry_status: Some("Ativa".to_string()),
            ..Default::default()
        });
        let map = build_source_map(&record);
        let legal = map.iter().find(|f| f.field == "legal_name").unwrap();
        assert_eq!(legal.source, Origin::CnpjRegistry);
        assert_eq!(legal.confidence, REGISTRY_BASELINE);
        assert!(legal.validated);
    }

    #[test]
    fn name_cross_validation_lifts_input_name() {
        let mut record = base_record();
        record.nome_fantasia_match = Some(95);
        let map = build_source_map(&record);
        let name = map.iter().find(|f| f.field == "name_raw").unwrap();
        assert_eq!(name.source, Origin::CrossValidated);
        assert!(name.validated);
        assert_eq!(name.confidence, 90);
    }

    #[test]
    fn out_of_state_coordinates_lose_confidence() {
        let mut record = base_record();
        record.geo.lat = Some(-22.9);
        record.geo.lng = Some(-43.2);
        record.geo.source = Some("GEOCODER_A".to_string());
        record.geo.confidence = Some(90);
        record.geo.within_state = Some(false);
        let map = build_source_map(&record);
        let coords = map.iter().find(|f| f.field == "coordinates").unwrap();
        assert_eq!(coords.confidence, 80);
        assert!(coords.divergence.is_some());
    }

    #[test]
    fn map_is_deterministic() {
        let mut record = base_record();
        record.nome_fantasia_match = Some(90);
        record.geo.lat = Some(-23.55);
        record.geo.lng = Some(-46.63);
        let a = serde_json::to_string(&build_source_map(&record)).unwrap();
        let b = serde_json::to_string(&build_source_map(&record)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn source_score_is_mean_confidence() {
        let map = vec![
            FieldOrigin::new("a", "A", Value::Null, Origin::Input, 30),
            FieldOrigin::new("b", "B", Value::Null, Origin::CnpjRegistry, 90),
        ];
        assert_eq!(source_score(&map), 60);
        assert_eq!(source_score(&[]), 0);
    }
}
