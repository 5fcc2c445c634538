//! Places worker: runs both search strategies, reconciles them against the
//! record's known names and addresses, downloads photos, and computes the
//! preliminary potential score.

use super::{begin_stage, chain, count_batch, finish_stage, is_last_attempt, load_record};
use crate::crossval::places::{reconcile_places, PlaceSummary};
use crate::crossval::nome_fantasia_match;
use crate::models::{Photo, Stage, StageStatus};
use crate::pipeline::queue::{JobRecord, QueueName};
use crate::pipeline::Deps;
use crate::providers::places::PlaceResult;
use crate::providers::ProviderError;
use crate::scoring::compute_potential;
use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const CHAIN_DELAY: Duration = Duration::from_millis(200);
/// Per-job spacing into the analysis queue when this record came from a
/// bulk seed; the vision provider throttles hard.
const ANALYSIS_STAGGER: Duration = Duration::from_secs(2);
const MAX_PHOTOS: usize = 10;

pub async fn run(deps: &Deps, job: &JobRecord) -> Result<Value> {
    let Some(mut record) = load_record(deps, job)? else {
        return Ok(json!({"dropped": true}));
    };
    begin_stage(deps, &mut record, Stage::Places)?;

    let (Some(lat), Some(lng)) = (record.geo.lat, record.geo.lng) else {
        finish_stage(
            deps,
            &mut record,
            Stage::Places,
            StageStatus::Incomplete,
            Some("reason=InvalidInput: record has no coordinates".to_string()),
        )?;
        count_batch(deps, QueueName::Places, job, false);
        return Ok(json!({"status": "INCOMPLETE"}));
    };

    let name_hint = record.name_hint().map(|s| s.to_string());
    let text_query = [
        name_hint.clone().unwrap_or_default(),
        record
            .normalization
            .address_normalized
            .clone()
            .unwrap_or_default(),
        record.best_city().unwrap_or("").to_string(),
        record.best_state().unwrap_or("").to_string(),
    ]
    .into_iter()
    .filter(|part| !part.trim().is_empty())
    .collect::<Vec<_>>()
    .join(", ");

    let cache_key = format!("{:.5},{:.5}|{}", lat, lng, text_query);
    let cached: Option<(Option<CachedPlace>, Option<CachedPlace>)> =
        deps.cache.get("places", &cache_key);

    let (nearby, text, retryable_miss) = match cached {
        Some((n, t)) => (n.map(CachedPlace::into_result), t.map(CachedPlace::into_result), false),
        None => {
            let (nearby, text) = tokio::join!(
                deps.providers.places.nearby(
                    record.geo.place_hint.as_deref(),
                    lat,
                    lng,
                    name_hint.as_deref(),
                ),
                deps.providers.places.text(&text_query),
            );
            let (nearby, retry_n) = flatten(&record.id, "nearby", nearby);
            let (text, retry_t) = flatten(&record.id, "text", text);
            let retryable = (retry_n || retry_t) && nearby.is_none() && text.is_none();
            if !retryable {
                deps.cache.set(
                    "places",
                    &cache_key,
                    &(
                        nearby.clone().map(CachedPlace::from_result),
                        text.clone().map(CachedPlace::from_result),
                    ),
                    Some(deps.config.ttl_places_secs),
                );
            }
            (nearby, text, retryable)
        }
    };

    if retryable_miss && !is_last_attempt(job) {
        return Err(anyhow::anyhow!("places provider transiently unavailable"));
    }

    let name_candidates: Vec<&str> = [
        record.raw.name_raw.as_deref(),
        record.registry.as_ref().and_then(|r| r.trade_name.as_deref()),
    ]
    .into_iter()
    .flatten()
    .collect();
    let address_candidates: Vec<&str> = [
        record.normalization.address_normalized.as_deref(),
        record
            .registry
            .as_ref()
            .and_then(|r| r.registry_address.as_deref()),
        record.raw.address_raw.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();

    let summaries: [Option<PlaceSummary>; 2] = [
        nearby.as_ref().map(summary_of),
        text.as_ref().map(summary_of),
    ];
    let resolution = reconcile_places(
        summaries[0].as_ref(),
        summaries[1].as_ref(),
        &name_candidates,
        &address_candidates,
    );

    if !resolution.accepted {
        record.place.cross_confidence = Some(0);
        finish_stage(
            deps,
            &mut record,
            Stage::Places,
            StageStatus::Fail,
            Some(format!(
                "reason=NotFound: no place matched ({})",
                resolution.divergences.join("; ")
            )),
        )?;
        count_batch(deps, QueueName::Places, job, false);
        return Ok(json!({"status": "FAIL", "divergences": resolution.divergences}));
    }

    let chosen = match resolution.chosen_index {
        Some(1) => text.as_ref(),
        _ => nearby.as_ref().or(text.as_ref()),
    }
    .expect("accepted resolution always has a chosen result");

    record.place.place_id = Some(chosen.place_id.clone());
    record.place.establishment_type = chosen.primary_type.clone();
    record.place.types_primary = Some(chosen.types.join(",")).filter(|t| !t.is_empty());
    record.place.rating = chosen.rating;
    record.place.review_count = chosen.review_count;
    record.place.opening_hours = chosen.opening_hours.clone();
    record.place.phone = chosen.phone.clone();
    record.place.website = chosen.website.clone();
    record.place.photo_refs = chosen.photo_refs.clone();
    record.place.name_validated = Some(resolution.name_validated);
    record.place.address_validated = Some(resolution.address_validated);
    record.place.cross_confidence = Some(resolution.confidence);
    record.place.cross_method = resolution.method;
    record.place.accepted_by_high_address = Some(resolution.accepted_by_high_address);

    record.nome_fantasia_match = nome_fantasia_match(
        record.raw.name_raw.as_deref(),
        record.registry.as_ref().and_then(|r| r.trade_name.as_deref()),
        Some(&chosen.display_name),
    );

    let photo_count = store_photos(deps, &record.id, &chosen.photo_refs).await?;
    record.scoring = compute_potential(&record, photo_count);

    finish_stage(deps, &mut record, Stage::Places, StageStatus::Success, None)?;
    count_batch(deps, QueueName::Places, job, true);
    info!(
        record_id = %record.id,
        place_id = %chosen.place_id,
        method = ?resolution.method,
        confidence = resolution.confidence,
        photos = photo_count,
        "Place accepted"
    );

    let analysis_delay = match job.payload.seq {
        Some(index) => ANALYSIS_STAGGER * index,
        None => CHAIN_DELAY,
    };
    chain(deps, QueueName::Analysis, &record.id, analysis_delay, job.payload.seq);

    Ok(json!({
        "status": "SUCCESS",
        "place_id": chosen.place_id,
        "method": resolution.method,
        "confidence": resolution.confidence,
        "name_sim": resolution.name_sim,
        "address_sim": resolution.address_sim,
        "photos": photo_count,
    }))
}

fn summary_of(result: &PlaceResult) -> PlaceSummary {
    PlaceSummary {
        place_id: result.place_id.clone(),
        display_name: result.display_name.clone(),
        formatted_address: result.formatted_address.clone(),
    }
}

/// Insert one Photo row per reference; persist bytes locally when the photo
/// dir is writable, otherwise keep only the external reference for
/// on-demand refetch.
async fn store_photos(deps: &Deps, record_id: &str, refs: &[String]) -> Result<usize> {
    let existing = deps.store.photos_for_record(record_id)?;
    if !existing.is_empty() {
        return Ok(existing.len());
    }

    let dir = Path::new(&deps.config.photo_dir);
    let dir_writable = std::fs::create_dir_all(dir).is_ok();
    let mut stored = 0usize;

    for (ordinal, external_ref) in refs.iter().take(MAX_PHOTOS).enumerate() {
        let mut file_name = None;
        if dir_writable {
            match deps.providers.places.fetch_photo(external_ref).await {
                Ok(bytes) => {
                    let ext = match crate::pipeline::workers::analysis::sniff_extension(&bytes) {
                        Some(ext) => ext,
                        None => "jpg",
                    };
                    let name = format!("{}.{}", uuid::Uuid::new_v4(), ext);
                    if std::fs::write(dir.join(&name), &bytes).is_ok() {
                        file_name = Some(name);
                    }
                }
                Err(e) => {
                    debug!(record_id, error = %e, "Photo download failed; keeping external ref");
                }
            }
        }

        deps.store.insert_photo(&Photo {
            id: uuid::Uuid::new_v4().to_string(),
            record_id: record_id.to_string(),
            file_name,
            external_ref: Some(external_ref.clone()),
            ordinal: ordinal as u32,
            category: None,
            category_confidence: None,
            file_hash: None,
            analyzed_by_ai: false,
            analysis_result: None,
            analyzed_at: None,
        })?;
        stored += 1;
    }
    Ok(stored)
}

/// Serializable subset of a place result for the cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CachedPlace {
    place_id: String,
    display_name: String,
    formatted_address: String,
    types: Vec<String>,
    primary_type: Option<String>,
    rating: Option<f64>,
    review_count: Option<u32>,
    phone: Option<String>,
    website: Option<String>,
    opening_hours: Option<std::collections::HashMap<u8, Vec<crate::models::OpenInterval>>>,
    photo_refs: Vec<String>,
}

impl CachedPlace {
    fn from_result(result: PlaceResult) -> Self {
        Self {
            place_id: result.place_id,
            display_name: result.display_name,
            formatted_address: result.formatted_address,
            types: result.types,
            primary_type: result.primary_type,
            rating: result.rating,
            review_count: result.review_count,
            phone: result.phone,
            website: result.website,
            opening_hours: result.opening_hours,
            photo_refs: result.photo_refs,
        }
    }

    fn into_result(self) -> PlaceResult {
        PlaceResult {
            place_id: self.place_id,
            display_name: self.display_name,
            formatted_address: self.formatted_address,
            types: self.types,
            primary_type: self.primary_type,
            rating: self.rating,
            review_count: self.review_count,
            phone: self.phone,
            website: self.website,
            opening_hours: self.opening_hours,
            photo_refs: self.photo_refs,
        }
    }
}

fn flatten(
    record_id: &str,
    mode: &str,
    result: Result<Option<PlaceResult>, ProviderError>,
) -> (Option<PlaceResult>, bool) {
    match result {
        Ok(r) => (r, false),
        Err(e) => {
            warn!(record_id, mode, error = %e, "Places search unavailable");
            (None, e.is_retryable())
        }
    }
}
