//! Geocoding worker: both geocoders in parallel, Haversine reconciliation,
//! bounding-box validation against the declared state and city.

use super::{begin_stage, chain, count_batch, finish_stage, is_last_attempt, load_record};
use crate::crossval::coords::{reconcile_coords, validate_point};
use crate::models::{Stage, StageStatus};
use crate::pipeline::queue::{JobRecord, QueueName};
use crate::pipeline::Deps;
use crate::providers::geocode::GeocodeHit;
use crate::providers::ProviderError;
use anyhow::Result;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const CHAIN_DELAY: Duration = Duration::from_millis(100);

pub async fn run(deps: &Deps, job: &JobRecord) -> Result<Value> {
    let Some(mut record) = load_record(deps, job)? else {
        return Ok(json!({"dropped": true}));
    };
    begin_stage(deps, &mut record, Stage::Geocoding)?;

    let address = record.best_address().unwrap_or("").to_string();
    let city = record.best_city().unwrap_or("").to_string();
    let state = record.best_state().unwrap_or("").to_string();
    let name_hint = record.name_hint().map(|s| s.to_string());

    if address.trim().is_empty() && city.trim().is_empty() {
        finish_stage(
            deps,
            &mut record,
            Stage::Geocoding,
            StageStatus::Incomplete,
            Some("reason=InvalidInput: no address, city, or state to geocode".to_string()),
        )?;
        count_batch(deps, QueueName::Geocoding, job, false);
        return Ok(json!({"status": "INCOMPLETE"}));
    }

    let cache_key = format!("{}|{}|{}", address, city, state);
    let cached: Option<(Option<GeoLeg>, Option<GeoLeg>)> = deps.cache.get("geocode", &cache_key);

    let (leg_a, leg_b, retryable_miss) = match cached {
        Some((a, b)) => (a, b, false),
        None => {
            let (a, b) = tokio::join!(
                deps.providers.geocoder_a.geocode(
                    &address,
                    Some(&city).filter(|c| !c.is_empty()).map(|s| s.as_str()),
                    Some(&state).filter(|s| !s.is_empty()).map(|s| s.as_str()),
                    name_hint.as_deref(),
                ),
                deps.providers.geocoder_b.geocode(&address, &city, &state),
            );
            let (a, retry_a) = flatten_leg(&record.id, "A", a);
            let (b, retry_b) = flatten_leg(&record.id, "B", b);
            let retryable = (retry_a || retry_b) && a.is_none() && b.is_none();
            if !retryable {
                deps.cache.set(
                    "geocode",
                    &cache_key,
                    &(a.clone(), b.clone()),
                    Some(deps.config.ttl_geocode_secs),
                );
            }
            (a, b, retryable)
        }
    };

    if retryable_miss && !is_last_attempt(job) {
        return Err(anyhow::anyhow!("both geocoders transiently unavailable"));
    }

    let resolution = reconcile_coords(
        leg_a.as_ref().map(|l| (l.lat, l.lng)),
        leg_b.as_ref().map(|l| (l.lat, l.lng)),
        Some(&state).filter(|s| !s.is_empty()).map(|s| s.as_str()),
    );

    let Some(resolution) = resolution else {
        finish_stage(
            deps,
            &mut record,
            Stage::Geocoding,
            StageStatus::Fail,
            Some("reason=NotFound: no geocoder produced coordinates".to_string()),
        )?;
        count_batch(deps, QueueName::Geocoding, job, false);
        return Ok(json!({"status": "FAIL", "reason": "NotFound"}));
    };

    let validation = validate_point(
        resolution.lat,
        resolution.lng,
        Some(&state).filter(|s| !s.is_empty()).map(|s| s.as_str()),
        Some(&city).filter(|c| !c.is_empty()).map(|s| s.as_str()),
    );
    if validation.within_state == Some(false) {
        warn!(
            record_id = %record.id,
            state = %state,
            "Geocoded point falls outside the declared state"
        );
    }

    record.geo.lat = Some(resolution.lat);
    record.geo.lng = Some(resolution.lng);
    record.geo.formatted_address = leg_a
        .as_ref()
        .and_then(|l| l.formatted_address.clone())
        .or_else(|| leg_b.as_ref().and_then(|l| l.formatted_address.clone()));
    record.geo.place_hint = leg_a.as_ref().and_then(|l| l.place_hint.clone());
    record.geo.validated = Some(validation.within_state.unwrap_or(false));
    record.geo.within_state = validation.within_state;
    record.geo.within_city = validation.within_city;
    record.geo.distance_to_center_m = validation.distance_to_center_m;
    record.geo.confidence = Some(resolution.confidence);
    record.geo.source = Some(resolution.source.as_str().to_string());
    record.geo.max_divergence_m = resolution.max_divergence_m;

    finish_stage(deps, &mut record, Stage::Geocoding, StageStatus::Success, None)?;
    count_batch(deps, QueueName::Geocoding, job, true);
    info!(
        record_id = %record.id,
        confidence = resolution.confidence,
        source = resolution.source.as_str(),
        "Geocoding reconciled"
    );

    chain(deps, QueueName::Places, &record.id, CHAIN_DELAY, job.payload.seq);
    chain(deps, QueueName::DuplicateDetection, &record.id, CHAIN_DELAY, job.payload.seq);

    Ok(json!({
        "status": "SUCCESS",
        "lat": resolution.lat,
        "lng": resolution.lng,
        "confidence": resolution.confidence,
        "within_state": validation.within_state,
        "max_divergence_m": resolution.max_divergence_m,
    }))
}

/// Cacheable projection of one geocoder leg.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct GeoLeg {
    pub lat: f64,
    pub lng: f64,
    pub formatted_address: Option<String>,
    pub place_hint: Option<String>,
}

fn flatten_leg(
    record_id: &str,
    which: &str,
    result: Result<Option<GeocodeHit>, ProviderError>,
) -> (Option<GeoLeg>, bool) {
    match result {
        Ok(Some(hit)) => (
            Some(GeoLeg {
                lat: hit.lat,
                lng: hit.lng,
                formatted_address: hit.formatted_address,
                place_hint: hit.place_hint,
            }),
            false,
        ),
        Ok(None) => (None, false),
        Err(e) => {
            warn!(record_id, geocoder = which, error = %e, "Geocoder leg unavailable");
            (None, e.is_retryable())
        }
    }
}
