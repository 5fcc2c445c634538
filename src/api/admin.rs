//! Administrative operations: reset-stuck, pipeline unlock, and duplicate
//! merging.

use super::ApiResult;
use crate::crossval::similarity::canonical;
use crate::models::{Record, StageStatus};
use crate::pipeline::Deps;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ResetStuckQuery {
    #[serde(rename = "timeoutMinutes")]
    pub timeout_minutes: Option<i64>,
}

/// POST /pipeline/reset-stuck?timeoutMinutes=N: re-arms records stuck in
/// PROCESSING longer than the timeout.
pub async fn reset_stuck(
    State(deps): State<Arc<Deps>>,
    Query(query): Query<ResetStuckQuery>,
) -> ApiResult<Value> {
    let timeout = query
        .timeout_minutes
        .unwrap_or(deps.config.reset_stuck_minutes);
    let reset = deps.store.reset_stuck(timeout)?;
    info!(reset, timeout, "Stuck records reset");
    Ok(Json(json!({
        "success": true,
        "reset": reset,
        "timeoutMinutes": timeout,
    })))
}

/// Mark unanalyzed photos of error-state records as analyzed so aggregate
/// progress counters can move again.
fn mark_error_photos_analyzed(deps: &Deps) -> anyhow::Result<u64> {
    let mut marked = 0u64;
    for id in deps.store.all_record_ids()? {
        let Some(record) = deps.store.get_record(&id)? else {
            continue;
        };
        if record.stages.analysis.status() != StageStatus::Fail {
            continue;
        }
        for mut photo in deps.store.photos_for_record(&id)? {
            if photo.analyzed_by_ai {
                continue;
            }
            photo.analyzed_by_ai = true;
            photo.analyzed_at = Some(chrono::Utc::now());
            photo.analysis_result =
                Some(json!({"ok": false, "reason": "record in error state"}));
            deps.store.update_photo(&photo)?;
            marked += 1;
        }
    }
    Ok(marked)
}

/// POST /pipeline/unlock: mark-error-photos-analyzed, then flip records
/// whose photos are all analyzed to analysis SUCCESS.
pub async fn unlock(State(deps): State<Arc<Deps>>) -> ApiResult<Value> {
    let photos_marked = mark_error_photos_analyzed(&deps)?;

    let mut unlocked = 0u64;
    for id in deps.store.all_record_ids()? {
        let Some(mut record) = deps.store.get_record(&id)? else {
            continue;
        };
        if record.stages.analysis.status() == StageStatus::Success {
            continue;
        }
        let photos = deps.store.photos_for_record(&id)?;
        if photos.is_empty() || photos.iter().any(|p| !p.analyzed_by_ai) {
            continue;
        }
        let state = record.stages.get_mut(crate::models::Stage::Analysis);
        state.status = Some(StageStatus::Success);
        state.finished_at = Some(chrono::Utc::now());
        state.error = None;
        deps.store.upsert_record(&record)?;
        unlocked += 1;
    }

    info!(photos_marked, unlocked, "Pipeline unlock complete");
    Ok(Json(json!({
        "success": true,
        "photosMarked": photos_marked,
        "recordsUnlocked": unlocked,
    })))
}

/// Count of populated scalar values across the record JSON; the "richness"
/// used to pick a merge keeper.
fn richness(record: &Record) -> usize {
    fn count(value: &Value) -> usize {
        match value {
            Value::Null => 0,
            Value::Object(map) => map.values().map(count).sum(),
            Value::Array(items) => items.iter().map(count).sum(),
            _ => 1,
        }
    }
    serde_json::to_value(record).map(|v| count(&v)).unwrap_or(0)
}

/// Fill null fields of `keeper` from `donor`, recursively, without ever
/// overwriting a populated value.
fn fill_nulls(keeper: &mut Value, donor: &Value) {
    match (keeper, donor) {
        (Value::Object(kmap), Value::Object(dmap)) => {
            for (key, dvalue) in dmap {
                match kmap.get_mut(key) {
                    Some(kvalue) if kvalue.is_null() => {
                        *kvalue = dvalue.clone();
                    }
                    Some(kvalue) => fill_nulls(kvalue, dvalue),
                    None => {
                        kmap.insert(key.clone(), dvalue.clone());
                    }
                }
            }
        }
        (Value::Array(kitems), Value::Array(ditems)) if kitems.is_empty() => {
            *kitems = ditems.clone();
        }
        _ => {}
    }
}

/// POST /pipeline/merge-duplicates: groups records by normalized raw name,
/// keeps the richest member of each group, absorbs the peers' data and
/// photos, then deletes the peers.
pub async fn merge_duplicates(State(deps): State<Arc<Deps>>) -> ApiResult<Value> {
    let mut groups: HashMap<String, Vec<Record>> = HashMap::new();
    for id in deps.store.all_record_ids()? {
        let Some(record) = deps.store.get_record(&id)? else {
            continue;
        };
        let Some(name) = record.raw.name_raw.as_deref() else {
            continue;
        };
        let key = canonical(name);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(record);
    }

    let mut merged_groups = 0usize;
    let mut deleted = 0usize;
    for (_, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by_key(|r| std::cmp::Reverse(richness(r)));
        let keeper = members.remove(0);
        let mut keeper_value = serde_json::to_value(&keeper).map_err(anyhow::Error::from)?;

        for peer in &members {
            let peer_value = serde_json::to_value(peer).map_err(anyhow::Error::from)?;
            fill_nulls(&mut keeper_value, &peer_value);
        }
        // Identity always stays with the keeper.
        keeper_value["id"] = json!(keeper.id);
        keeper_value["document"] = json!(keeper.document);

        let merged: Record =
            serde_json::from_value(keeper_value).map_err(anyhow::Error::from)?;
        deps.store.upsert_record(&merged)?;

        for peer in &members {
            deps.store.transfer_photos(&peer.id, &keeper.id)?;
            deps.store.delete_record(&peer.id)?;
            deleted += 1;
        }
        merged_groups += 1;
    }

    info!(merged_groups, deleted, "Duplicate merge complete");
    Ok(Json(json!({
        "success": true,
        "groupsMerged": merged_groups,
        "recordsDeleted": deleted,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentKind, RawInput};

    #[test]
    fn fill_nulls_never_overwrites() {
        let mut keeper = json!({"a": 1, "b": null, "nested": {"x": null, "y": 2}});
        let donor = json!({"a": 99, "b": 2, "nested": {"x": 3, "y": 99}});
        fill_nulls(&mut keeper, &donor);
        assert_eq!(keeper["a"], 1);
        assert_eq!(keeper["b"], 2);
        assert_eq!(keeper["nested"]["x"], 3);
        assert_eq!(keeper["nested"]["y"], 2);
    }

    #[test]
    fn richness_orders_by_populated_fields() {
        let sparse = Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput::default(),
        );
        let mut rich = Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput {
                name_raw: Some("Padaria X".to_string()),
                address_raw: Some("Rua A, 10".to_string()),
                ..Default::default()
            },
        );
        rich.geo.lat = Some(-23.5);
        rich.geo.lng = Some(-46.6);
        assert!(richness(&rich) > richness(&sparse));
    }
}
