//! Record endpoints: ingest, inspection, per-record source/quality views,
//! and operator force-fail.

use super::{ApiError, ApiResult};
use crate::analyst::build_analyst_context;
use crate::models::{
    CandidateRow, DocumentKind, QualityData, QualityTier, RawInput, Record, Stage, StageStatus,
};
use crate::pipeline::queue::{JobOptions, JobPayload, QueueName};
use crate::pipeline::Deps;
use crate::source_map::{build_source_map, source_score, Origin};
use crate::validation::{detect_kind, strip_non_digits};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub candidates: Vec<CandidateRow>,
}

/// POST /records/ingest: consumes parsed candidate rows. Only the document
/// is required; rows without one are rejected individually.
pub async fn ingest(
    State(deps): State<Arc<Deps>>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Value> {
    if request.candidates.is_empty() {
        return Err(ApiError::BadRequest("no candidates provided".to_string()));
    }

    let mut created: Vec<String> = Vec::new();
    let mut rejected = 0usize;
    let mut skipped = 0usize;

    for (index, row) in request.candidates.into_iter().enumerate() {
        let digits = strip_non_digits(&row.document);
        if digits.is_empty() {
            rejected += 1;
            continue;
        }
        if deps.store.get_record_by_document(&digits)?.is_some() {
            skipped += 1;
            continue;
        }

        let record = Record::new(
            digits.clone(),
            detect_kind(&digits),
            RawInput {
                name_raw: row.name,
                address_raw: row.address,
                city_raw: row.city,
                state_raw: row.state,
                phone_raw: row.phone,
                zip_raw: row.zip,
            },
        );
        deps.store.upsert_record(&record)?;
        deps.queues.add(
            QueueName::DocLookup,
            JobPayload {
                record_id: record.id.clone(),
                batch_id: None,
                seq: Some(index as u32),
            },
            JobOptions {
                delay: Some(Duration::from_millis(500) * index as u32),
                ..Default::default()
            },
        );
        created.push(record.id);
    }

    info!(
        created = created.len(),
        rejected, skipped, "Ingest processed"
    );
    Ok(Json(json!({
        "success": true,
        "created": created.len(),
        "rejected": rejected,
        "skipped": skipped,
        "ids": created,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /records
pub async fn list(
    State(deps): State<Arc<Deps>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Value> {
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);
    let records = deps.store.list_records(limit, offset)?;
    Ok(Json(json!({
        "success": true,
        "total": deps.store.count_records()?,
        "count": records.len(),
        "records": records,
    })))
}

fn load(deps: &Deps, id: &str) -> Result<Record, ApiError> {
    deps.store
        .get_record(id)?
        .ok_or_else(|| ApiError::NotFound(format!("record {}", id)))
}

/// GET /records/:id
pub async fn get(State(deps): State<Arc<Deps>>, Path(id): Path<String>) -> ApiResult<Value> {
    let record = load(&deps, &id)?;
    Ok(Json(json!({"success": true, "record": record})))
}

/// DELETE /records/:id
pub async fn delete(State(deps): State<Arc<Deps>>, Path(id): Path<String>) -> ApiResult<Value> {
    load(&deps, &id)?;
    deps.store.delete_record(&id)?;
    info!(record_id = %id, "Record deleted by operator");
    Ok(Json(json!({"success": true, "deleted": id})))
}

/// GET /records/:id/result: full record, photos, consolidated analysis.
pub async fn result(State(deps): State<Arc<Deps>>, Path(id): Path<String>) -> ApiResult<Value> {
    let record = load(&deps, &id)?;
    let photos = deps.store.photos_for_record(&id)?;
    Ok(Json(json!({
        "success": true,
        "record": record,
        "photos": photos,
        "analysis": {
            "confidence": record.confidence,
            "analyst": record.analyst,
            "typology": record.typology,
            "potential": record.scoring,
        },
    })))
}

/// GET /records/:id/sources: the per-field source map.
pub async fn sources(State(deps): State<Arc<Deps>>, Path(id): Path<String>) -> ApiResult<Value> {
    let record = load(&deps, &id)?;
    let map = build_source_map(&record);
    Ok(Json(json!({
        "success": true,
        "sourceScore": source_score(&map),
        "fields": map,
    })))
}

/// Source-aware quality analysis of a record.
pub fn compute_quality(record: &Record) -> QualityData {
    let map = build_source_map(record);
    let score = source_score(&map);

    let populated = map
        .iter()
        .filter(|f| !f.value.is_null())
        .count() as u32;

    let mut critical_missing = Vec::new();
    if record.document_kind == DocumentKind::Invalid {
        critical_missing.push("document".to_string());
    }
    if record.document_kind == DocumentKind::Cnpj && record.registry.is_none() {
        critical_missing.push("registry".to_string());
    }
    if record.normalization.address_normalized.is_none() {
        critical_missing.push("address_normalized".to_string());
    }
    if record.geo.lat.is_none() {
        critical_missing.push("coordinates".to_string());
    }
    if record.place.place_id.is_none() {
        critical_missing.push("place_id".to_string());
    }

    let validated_sources: BTreeSet<&'static str> = map
        .iter()
        .filter(|f| f.validated)
        .map(|f| {
            f.secondary_source
                .filter(|_| f.source == Origin::CrossValidated)
                .unwrap_or(f.source)
                .as_str()
        })
        .collect();

    let tier = if score >= 85 {
        QualityTier::Excellent
    } else if score >= 70 {
        QualityTier::High
    } else if score >= 50 {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    };

    QualityData {
        score: Some(score),
        tier: Some(tier),
        populated_field_count: Some(populated),
        critical_missing_fields: critical_missing,
        validated_sources: validated_sources.into_iter().map(String::from).collect(),
    }
}

/// GET /records/:id/real-quality
pub async fn real_quality(
    State(deps): State<Arc<Deps>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let mut record = load(&deps, &id)?;
    let quality = compute_quality(&record);
    record.quality = quality.clone();
    deps.store.upsert_record(&record)?;
    Ok(Json(json!({"success": true, "quality": quality})))
}

/// GET /records/:id/analyst-context: the exact structured context the
/// analyst stage consumed.
pub async fn analyst_context(
    State(deps): State<Arc<Deps>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let record = load(&deps, &id)?;
    Ok(Json(json!({
        "success": true,
        "context": build_analyst_context(&record),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ForceFailRequest {
    pub pipeline: String,
    pub error: Option<String>,
}

/// POST /records/:id/force-fail
pub async fn force_fail(
    State(deps): State<Arc<Deps>>,
    Path(id): Path<String>,
    Json(request): Json<ForceFailRequest>,
) -> ApiResult<Value> {
    let stage = match request.pipeline.as_str() {
        "registry" => Stage::DocLookup,
        "normalization" => Stage::Normalization,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown pipeline {:?}; expected registry or normalization",
                other
            )))
        }
    };
    let mut record = load(&deps, &id)?;
    let state = record.stages.get_mut(stage);
    state.status = Some(StageStatus::Fail);
    state.finished_at = Some(chrono::Utc::now());
    state.error = Some(
        request
            .error
            .unwrap_or_else(|| "forced by operator".to_string()),
    );
    deps.store.upsert_record(&record)?;
    info!(record_id = %id, stage = stage.as_str(), "Stage force-failed by operator");
    Ok(Json(json!({
        "success": true,
        "record": id,
        "stage": stage.as_str(),
        "status": "FAIL",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RegistryData;

    #[test]
    fn quality_flags_missing_criticals() {
        let record = Record::new("12345".to_string(), DocumentKind::Invalid, RawInput::default());
        let quality = compute_quality(&record);
        assert!(quality
            .critical_missing_fields
            .contains(&"document".to_string()));
        assert!(quality
            .critical_missing_fields
            .contains(&"coordinates".to_string()));
        assert_eq!(quality.tier, Some(QualityTier::Poor));
    }

    #[test]
    fn quality_improves_with_registry_data() {
        let mut record = Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput::default(),
        );
        let before = compute_quality(&record).score.unwrap();
        record.registry = Some(RegistryData {
            legal_name: Some("PADARIA X LTDA".to_string()),
            registry_status: Some("Ativa".to_string()),
            registry_address: Some("Rua A, 10".to_string()),
            ..Default::default()
        });
        let after = compute_quality(&record);
        assert!(after.score.unwrap() > before);
        assert!(after
            .validated_sources
            .contains(&"CNPJ_REGISTRY".to_string()));
    }
}
