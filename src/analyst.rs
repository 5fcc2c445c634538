//! Holistic analyst: assembles the full per-source context, asks the
//! reasoning LLM for a verdict, and falls back to a deterministic rubric
//! when the reply cannot be parsed.

use crate::models::{AnalystData, AnalystStatus, Record, TypologyData};
use crate::providers::llm::extract_json;
use crate::source_map::{build_source_map, source_score, FieldOrigin, Origin};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

pub const ANALYST_SYSTEM: &str = "\
Você é um analista de cadastro de clientes comerciais. O único dado de \
entrada confiável é o documento fiscal; todo o resto foi rederivado de \
fontes externas com níveis de confiança próprios. Avalie o conjunto e emita \
um veredito. Regras: APPROVED exige pontuação de fontes >= 80, nenhum alerta \
crítico e campos principais validados por fonte externa; \
APPROVED_WITH_CAVEATS para pontuação 60-79 sem divergência crítica; \
REQUIRES_REVIEW para 40-59 ou divergências relevantes; REJECTED para \
pontuação < 40, empresa inativa, divergência grave ou documento ausente. \
Atribua também uma tipologia comercial (código curto como F1/H3 e nome). \
Responda somente com JSON: {\"status\": string, \"confidence_overall\": number, \
\"trusted_fields\": [string], \"untrusted_fields\": [string], \
\"divergences_found\": [string], \"critical_alerts\": [string], \
\"secondary_alerts\": [string], \"recommendations\": [string], \
\"executive_summary\": string, \"typology_code\": string, \
\"typology_name\": string, \"typology_confidence\": number, \
\"typology_rationale\": string}";

/// Verdict payload as returned by the reasoning model.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalystVerdict {
    pub status: String,
    pub confidence_overall: Option<f64>,
    #[serde(default)]
    pub trusted_fields: Vec<String>,
    #[serde(default)]
    pub untrusted_fields: Vec<String>,
    #[serde(default)]
    pub divergences_found: Vec<String>,
    #[serde(default)]
    pub critical_alerts: Vec<String>,
    #[serde(default)]
    pub secondary_alerts: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub executive_summary: Option<String>,
    pub typology_code: Option<String>,
    pub typology_name: Option<String>,
    pub typology_confidence: Option<f64>,
    pub typology_rationale: Option<String>,
}

/// Validated fields grouped by the source that vouched for them.
fn validated_by_source(map: &[FieldOrigin]) -> Value {
    let mut grouped = serde_json::Map::new();
    for field in map.iter().filter(|f| f.validated) {
        let source = field
            .secondary_source
            .filter(|_| field.source == Origin::CrossValidated)
            .unwrap_or(field.source);
        let entry = grouped
            .entry(source.as_str().to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(obj) = entry {
            obj.insert(
                field.field.clone(),
                json!({"value": field.value, "confidence": field.confidence}),
            );
        }
    }
    Value::Object(grouped)
}

/// The exact structured context the analyst consumes. Also served verbatim
/// by the API for audit.
pub fn build_analyst_context(record: &Record) -> Value {
    let map = build_source_map(record);
    let score = source_score(&map);

    json!({
        "document": {
            "value": record.document,
            "kind": record.document_kind.as_str(),
            "validated": record.document_validated,
        },
        "raw_input": {
            "name": record.raw.name_raw,
            "address": record.raw.address_raw,
            "city": record.raw.city_raw,
            "state": record.raw.state_raw,
            "phone": record.raw.phone_raw,
            "zip": record.raw.zip_raw,
            "trust": "untrusted input hints",
        },
        "source_map": map,
        "source_score": score,
        "validated_data": validated_by_source(&map),
        "alerts": record.confidence.alerts,
        "divergences": {
            "normalization": record.normalization.divergences,
            "address_vs_registry": record.divergence_address,
            "geo_max_divergence_m": record.geo.max_divergence_m,
        },
        "potential": {
            "score": record.scoring.potential_score,
            "category": record.scoring.potential_category,
        },
    })
}

pub fn build_user_prompt(context: &Value) -> String {
    format!(
        "Contexto consolidado do cadastro:\n{}\n\nEmita o veredito JSON.",
        serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string())
    )
}

pub fn parse_verdict(reply: &str) -> Option<AnalystVerdict> {
    let value = extract_json(reply)?;
    let verdict: AnalystVerdict = serde_json::from_value(value).ok()?;
    AnalystStatus::parse(&verdict.status)?;
    Some(verdict)
}

/// Deterministic rubric used both as the instruction baseline and as the
/// safety net for unparseable model output.
pub fn rubric_status(score: u8, has_critical_alert: bool, has_divergence: bool) -> AnalystStatus {
    if has_critical_alert || score < 40 {
        AnalystStatus::Rejected
    } else if score < 60 {
        AnalystStatus::RequiresReview
    } else if score < 80 || has_divergence {
        AnalystStatus::ApprovedWithCaveats
    } else {
        AnalystStatus::Approved
    }
}

/// Convert a parsed verdict into the persisted analyst fields.
pub fn verdict_to_data(verdict: &AnalystVerdict) -> (AnalystData, TypologyData) {
    let status = AnalystStatus::parse(&verdict.status).unwrap_or(AnalystStatus::RequiresReview);
    let analyst = AnalystData {
        status: Some(status),
        confidence: verdict
            .confidence_overall
            .map(|c| c.clamp(0.0, 100.0).round() as u8),
        summary: verdict.executive_summary.clone(),
        critical_alerts: verdict.critical_alerts.clone(),
        secondary_alerts: verdict.secondary_alerts.clone(),
        recommendations: verdict.recommendations.clone(),
        divergences: verdict.divergences_found.clone(),
        trusted_fields: verdict.trusted_fields.clone(),
        untrusted_fields: verdict.untrusted_fields.clone(),
        processed_at: Some(Utc::now()),
    };
    let typology = TypologyData {
        code: verdict.typology_code.clone(),
        name: verdict.typology_name.clone(),
        confidence: verdict
            .typology_confidence
            .map(|c| c.clamp(0.0, 100.0).round() as u8),
        rationale: verdict.typology_rationale.clone(),
    };
    (analyst, typology)
}

/// Fallback when the model reply cannot be parsed.
pub fn unparseable_fallback() -> AnalystData {
    AnalystData {
        status: Some(AnalystStatus::RequiresReview),
        confidence: Some(40),
        summary: None,
        critical_alerts: vec!["LLM output unparseable".to_string()],
        secondary_alerts: Vec::new(),
        recommendations: vec!["Reprocessar a análise final".to_string()],
        divergences: Vec::new(),
        trusted_fields: Vec::new(),
        untrusted_fields: Vec::new(),
        processed_at: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentKind, RawInput};

    #[test]
    fn verdict_parses_from_fenced_reply() {
        let reply = r#"Segue o veredito:
```json
{
  "status": "APPROVED",
  "confidence_overall": 91,
  "trusted_fields": ["legal_name"],
  "untrusted_fields": ["phone_raw"],
  "divergences_found": [],
  "critical_alerts": [],
  "secondary_alerts": [],
  "recommendations": ["Nenhuma"],
  "executive_summary": "Cadastro consistente.",
  "typology_code": "F1",
  "typology_name": "Padaria de bairro",
  "typology_confidence": 85,
  "typology_rationale": "Tipo e avaliações compatíveis."
}
```"#;
        let verdict = parse_verdict(reply).unwrap();
        assert_eq!(verdict.status, "APPROVED");
        let (analyst, typology) = verdict_to_data(&verdict);
        assert_eq!(analyst.status, Some(AnalystStatus::Approved));
        assert_eq!(analyst.confidence, Some(91));
        assert_eq!(typology.code.as_deref(), Some("F1"));
        assert_eq!(typology.confidence, Some(85));
    }

    #[test]
    fn bad_status_rejects_parse() {
        assert!(parse_verdict("{\"status\": \"MAYBE\"}").is_none());
        assert!(parse_verdict("not json at all").is_none());
    }

    #[test]
    fn rubric_ladder() {
        assert_eq!(rubric_status(90, false, false), AnalystStatus::Approved);
        assert_eq!(
            rubric_status(90, false, true),
            AnalystStatus::ApprovedWithCaveats
        );
        assert_eq!(
            rubric_status(70, false, false),
            AnalystStatus::ApprovedWithCaveats
        );
        assert_eq!(rubric_status(50, false, false), AnalystStatus::RequiresReview);
        assert_eq!(rubric_status(30, false, false), AnalystStatus::Rejected);
        assert_eq!(rubric_status(90, true, false), AnalystStatus::Rejected);
    }

    #[test]
    fn fallback_is_requires_review_at_40() {
        let data = unparseable_fallback();
        assert_eq!(data.status, Some(AnalystStatus::RequiresReview));
        assert_eq!(data.confidence, Some(40));
        assert!(data.critical_alerts.iter().any(|a| a.contains("unparseable")));
    }

    #[test]
    fn context_contains_source_map_and_raw_input() {
        let record = Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput {
                name_raw: Some("Padaria X".to_string()),
                ..Default::default()
            },
        );
        let context = build_analyst_context(&record);
        assert_eq!(context["document"]["value"], "11222333000181");
        assert_eq!(context["raw_input"]["name"], "Padaria X");
        assert!(context["source_map"].is_array());
        assert!(context["source_score"].is_number());
    }
}
