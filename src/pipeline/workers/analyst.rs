//! Holistic analyst worker: the final pipeline stage. Feeds the full source
//! context to the reasoning model and persists its verdict.

use super::{begin_stage, count_batch, finish_stage, is_last_attempt, load_record};
use crate::analyst::{
    build_analyst_context, build_user_prompt, parse_verdict, rubric_status, unparseable_fallback,
    verdict_to_data, ANALYST_SYSTEM,
};
use crate::models::{AnalystData, Stage, StageStatus};
use crate::pipeline::queue::{JobRecord, QueueName};
use crate::pipeline::Deps;
use crate::providers::llm::TEXT_TIMEOUT;
use crate::source_map::{build_source_map, source_score};
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

pub async fn run(deps: &Deps, job: &JobRecord) -> Result<Value> {
    let Some(mut record) = load_record(deps, job)? else {
        return Ok(json!({"dropped": true}));
    };
    begin_stage(deps, &mut record, Stage::Analyst)?;

    let context = build_analyst_context(&record);
    let prompt = build_user_prompt(&context);

    let reply = deps
        .providers
        .analyst_llm
        .complete(&deps.config.analyst_model, ANALYST_SYSTEM, &prompt, &[], TEXT_TIMEOUT)
        .await;

    let analyst_data = match reply {
        Ok(text) => match parse_verdict(&text) {
            Some(verdict) => {
                let (analyst, typology) = verdict_to_data(&verdict);
                record.typology = typology;
                analyst
            }
            None => {
                warn!(record_id = %record.id, "Analyst reply unparseable; flagging for review");
                unparseable_fallback()
            }
        },
        Err(e) if e.is_retryable() && !is_last_attempt(job) => {
            return Err(anyhow::anyhow!("analyst model retrying: {}", e));
        }
        Err(e) => {
            // No model available: fall back to the deterministic rubric over
            // the source score.
            warn!(record_id = %record.id, error = %e, "Analyst model unavailable; using rubric");
            let map = build_source_map(&record);
            let score = source_score(&map);
            let has_critical = !record.confidence.alerts.is_empty()
                && record
                    .confidence
                    .alerts
                    .iter()
                    .any(|a| a.contains("inválido") || a.contains("inativa"));
            let has_divergence = record.divergence_address == Some(true)
                || !record.normalization.divergences.is_empty();
            AnalystData {
                status: Some(rubric_status(score, has_critical, has_divergence)),
                confidence: Some(score),
                summary: Some("Veredito gerado pela régua determinística".to_string()),
                critical_alerts: Vec::new(),
                secondary_alerts: record.confidence.alerts.clone(),
                recommendations: record.confidence.recommendations.clone(),
                divergences: record.normalization.divergences.clone(),
                trusted_fields: Vec::new(),
                untrusted_fields: Vec::new(),
                processed_at: Some(Utc::now()),
            }
        }
    };

    let status = analyst_data.status;
    record.analyst = analyst_data;
    if record.analyst.processed_at.is_none() {
        record.analyst.processed_at = Some(Utc::now());
    }

    finish_stage(deps, &mut record, Stage::Analyst, StageStatus::Success, None)?;
    count_batch(deps, QueueName::Analyst, job, true);
    info!(
        record_id = %record.id,
        verdict = ?status,
        confidence = ?record.analyst.confidence,
        "Analyst verdict persisted"
    );

    Ok(json!({
        "status": "SUCCESS",
        "verdict": status.map(|s| s.as_str()),
        "confidence": record.analyst.confidence,
        "typology": record.typology.code,
    }))
}
