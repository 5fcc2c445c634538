//! Universal confidence aggregator: merges per-stage confidences and flags
//! into the final score, category, traffic-light level, and the alert and
//! recommendation lists.
//!
//! The aggregation is monotone: raising any constituent stage confidence
//! (with flags unchanged) never lowers the output.

use crate::models::{
    ConfidenceCategory, ConfidenceData, ConfidenceLevel, ConfidenceWeights, DocumentKind, Record,
};

struct Flags {
    document_invalid: bool,
    registry_inactive: bool,
    out_of_state: bool,
    duplicate: bool,
    address_divergence: bool,
    cpf_not_partner: bool,
    place_missing: bool,
    thin_analysis: bool,
    photo_vote_disputed: bool,
}

impl Flags {
    fn from_record(record: &Record) -> Self {
        Self {
            document_invalid: record.document_kind == DocumentKind::Invalid,
            registry_inactive: record
                .registry
                .as_ref()
                .map(|r| !r.is_active())
                .unwrap_or(false),
            out_of_state: record.geo.within_state == Some(false),
            duplicate: record.duplicates.alert == Some(true),
            address_divergence: record.divergence_address == Some(true),
            cpf_not_partner: record.document_kind == DocumentKind::Cpf
                && record.duplicates.cpf_is_partner == Some(false),
            place_missing: record.place.place_id.is_none(),
            thin_analysis: record.visual.sources_available.unwrap_or(0) < 2,
            photo_vote_disputed: record.visual.classification_disputed == Some(true),
        }
    }

    fn has_critical(&self) -> bool {
        self.document_invalid || self.registry_inactive
    }
}

/// Aggregate the record's stage confidences into the universal confidence.
pub fn aggregate(record: &Record, weights: &ConfidenceWeights) -> ConfidenceData {
    let flags = Flags::from_record(record);

    let components: [(f64, f64); 6] = [
        (
            record.normalization.confidence.unwrap_or(0) as f64,
            weights.normalization,
        ),
        (record.geo.confidence.unwrap_or(0) as f64, weights.geocoding),
        (
            record.place.cross_confidence.unwrap_or(0) as f64,
            weights.places,
        ),
        (record.visual.confidence.unwrap_or(0) as f64, weights.visual),
        (
            record.nome_fantasia_match.unwrap_or(0) as f64,
            weights.name_match,
        ),
        (
            if record.document_validated { 100.0 } else { 30.0 },
            weights.document,
        ),
    ];

    let weight_sum: f64 = components.iter().map(|(_, w)| w).sum();
    let mut base = if weight_sum > 0.0 {
        components.iter().map(|(v, w)| v * w).sum::<f64>() / weight_sum
    } else {
        0.0
    };

    if flags.out_of_state {
        base -= 10.0;
    }
    if flags.duplicate {
        base -= 5.0;
    }
    if flags.registry_inactive {
        base -= 20.0;
    }
    if flags.thin_analysis {
        base -= 5.0;
    }

    let overall = base.clamp(0.0, 100.0).round() as u8;

    let category = if overall >= weights.cutoff_excellent {
        ConfidenceCategory::Excellent
    } else if overall >= weights.cutoff_high {
        ConfidenceCategory::High
    } else if overall >= weights.cutoff_medium {
        ConfidenceCategory::Medium
    } else {
        ConfidenceCategory::Low
    };
    let level = match category {
        ConfidenceCategory::Excellent => ConfidenceLevel::Green,
        ConfidenceCategory::High => ConfidenceLevel::Yellow,
        ConfidenceCategory::Medium => ConfidenceLevel::Orange,
        ConfidenceCategory::Low => ConfidenceLevel::Red,
    };

    let (alerts, recommendations) = rule_table(record, &flags, overall);
    let needs_review = matches!(level, ConfidenceLevel::Orange | ConfidenceLevel::Red)
        || flags.has_critical();

    ConfidenceData {
        overall: Some(overall),
        category: Some(category),
        level: Some(level),
        needs_review: Some(needs_review),
        alerts,
        recommendations,
    }
}

fn rule_table(record: &Record, flags: &Flags, overall: u8) -> (Vec<String>, Vec<String>) {
    let mut alerts = Vec::new();
    let mut recommendations = Vec::new();

    if flags.document_invalid {
        alerts.push(format!(
            "Documento inválido — apenas {} dígitos",
            record.document.len()
        ));
    }
    if flags.registry_inactive {
        alerts.push("Empresa inativa no registro fiscal".to_string());
    }
    if flags.out_of_state {
        alerts.push("Coordenadas fora do estado declarado".to_string());
    }
    if flags.duplicate {
        alerts.push(format!(
            "Endereço duplicado com {} registro(s)",
            record.duplicates.count.unwrap_or(0)
        ));
    }
    if flags.address_divergence {
        alerts.push("Endereço informado diverge do endereço de registro".to_string());
    }
    if flags.cpf_not_partner {
        alerts.push("CPF não consta em nenhum quadro societário".to_string());
    }
    if flags.thin_analysis && record.stages.analysis.status().is_terminal() {
        alerts.push("Validação cruzada de fotos indisponível".to_string());
    }
    if flags.photo_vote_disputed {
        alerts.push("Classificação de fotos divergente entre fontes; revisar".to_string());
        recommendations.push("Reclassificar fotos manualmente".to_string());
    }

    if flags.place_missing {
        recommendations.push("Verificar presença física do estabelecimento".to_string());
    }
    if record.place.rating.map(|r| r < 3.0).unwrap_or(false) {
        recommendations.push("Avaliações baixas; validar reputação local".to_string());
    }
    if record.visual.signage_quality.is_none() {
        recommendations.push("Solicitar fotos da fachada".to_string());
    }
    if overall < 50 {
        recommendations.push("Reprocessar etapas com baixa confiança".to_string());
    }

    (alerts, recommendations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawInput, RegistryData};

    fn record_with(
        normalization: u8,
        geocoding: u8,
        places: u8,
        visual: u8,
        name_match: u8,
        validated: bool,
    ) -> Record {
        let mut record = Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput::default(),
        );
        record.normalization.confidence = Some(normalization);
        record.geo.confidence = Some(geocoding);
        record.place.cross_confidence = Some(places);
        record.place.place_id = Some("P1".to_string());
        record.visual.confidence = Some(visual);
        record.visual.sources_available = Some(2);
        record.nome_fantasia_match = Some(name_match);
        record.document_validated = validated;
        record.registry = Some(RegistryData {
            registry_status: Some("Ativa".to_string()),
            ..Default::default()
        });
        record
    }

    #[test]
    fn strong_record_is_green() {
        let record = record_with(100, 100, 100, 90, 95, true);
        let c = aggregate(&record, &ConfidenceWeights::default());
        assert!(c.overall.unwrap() >= 85, "got {:?}", c.overall);
        assert_eq!(c.level, Some(ConfidenceLevel::Green));
        assert_eq!(c.needs_review, Some(false));
    }

    #[test]
    fn weights_produce_expected_average() {
        // All components at 80 with document validated at 100.
        let record = record_with(80, 80, 80, 80, 80, true);
        let c = aggregate(&record, &ConfidenceWeights::default());
        // 80*0.9 + 100*0.1 = 82
        assert_eq!(c.overall, Some(82));
    }

    #[test]
    fn monotone_in_each_component() {
        let weights = ConfidenceWeights::default();
        let base = record_with(50, 50, 50, 50, 50, false);
        let base_score = aggregate(&base, &weights).overall.unwrap();

        for i in 0..5 {
            let mut bumped = record_with(50, 50, 50, 50, 50, false);
            match i {
                0 => bumped.normalization.confidence = Some(90),
                1 => bumped.geo.confidence = Some(90),
                2 => bumped.place.cross_confidence = Some(90),
                3 => bumped.visual.confidence = Some(90),
                _ => bumped.nome_fantasia_match = Some(90),
            }
            let bumped_score = aggregate(&bumped, &weights).overall.unwrap();
            assert!(
                bumped_score >= base_score,
                "component {} decreased the aggregate",
                i
            );
        }
    }

    #[test]
    fn inactive_registry_penalty_and_alert() {
        let mut record = record_with(90, 90, 90, 90, 90, true);
        record.registry.as_mut().unwrap().registry_status = Some("Baixada".to_string());
        let c = aggregate(&record, &ConfidenceWeights::default());
        let without = {
            let record = record_with(90, 90, 90, 90, 90, true);
            aggregate(&record, &ConfidenceWeights::default()).overall.unwrap()
        };
        assert_eq!(c.overall.unwrap(), without - 20);
        assert!(c.alerts.iter().any(|a| a.contains("inativa")));
        assert_eq!(c.needs_review, Some(true));
    }

    #[test]
    fn disputed_photo_vote_raises_review_alert() {
        let mut record = record_with(90, 90, 90, 60, 90, true);
        record.visual.classification_disputed = Some(true);
        let c = aggregate(&record, &ConfidenceWeights::default());
        assert!(c
            .alerts
            .iter()
            .any(|a| a.contains("Classificação de fotos divergente")));
        assert!(c
            .recommendations
            .iter()
            .any(|r| r.contains("Reclassificar fotos")));

        let mut record = record_with(90, 90, 90, 60, 90, true);
        record.visual.classification_disputed = Some(false);
        let c = aggregate(&record, &ConfidenceWeights::default());
        assert!(!c.alerts.iter().any(|a| a.contains("divergente entre fontes")));
    }

    #[test]
    fn invalid_document_alert_names_digit_count() {
        let mut record = Record::new("12345".to_string(), DocumentKind::Invalid, RawInput::default());
        record.normalization.confidence = Some(60);
        let c = aggregate(&record, &ConfidenceWeights::default());
        assert!(c
            .alerts
            .iter()
            .any(|a| a.contains("Documento inválido") && a.contains("5 dígitos")));
        assert_eq!(c.needs_review, Some(true));
    }

    #[test]
    fn deterministic_output() {
        let record = record_with(70, 80, 90, 60, 50, true);
        let a = serde_json::to_string(&aggregate(&record, &ConfidenceWeights::default())).unwrap();
        let b = serde_json::to_string(&aggregate(&record, &ConfidenceWeights::default())).unwrap();
        assert_eq!(a, b);
    }
}
