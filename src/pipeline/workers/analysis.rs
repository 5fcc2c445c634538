//! Photo AI analysis worker: per-photo classification with caching and
//! majority-vote cross-validation, facade filtering, deep establishment
//! analysis, and the universal-confidence rollup.

use super::{begin_stage, chain, count_batch, finish_stage, is_last_attempt, load_record};
use crate::confidence::aggregate;
use crate::crossval::photos::reconcile_photo_votes;
use crate::models::{
    Photo, PhotoCategory, ProfessionalismLevel, SignageQuality, Stage, StageStatus,
};
use crate::pipeline::queue::{JobRecord, QueueName};
use crate::pipeline::Deps;
use crate::providers::ProviderError;
use crate::scoring::compute_potential;
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const CHAIN_DELAY: Duration = Duration::from_millis(500);

pub(crate) fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("png")
    } else if bytes.starts_with(&[0x47, 0x49, 0x46]) {
        Some("gif")
    } else if bytes.len() > 11 && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        Some("jpg")
    } else {
        None
    }
}

async fn photo_bytes(deps: &Deps, photo: &Photo) -> Option<Vec<u8>> {
    if let Some(name) = &photo.file_name {
        let path = Path::new(&deps.config.photo_dir).join(name);
        if let Ok(bytes) = std::fs::read(&path) {
            return Some(bytes);
        }
    }
    // Local copy absent; refetch from the provider.
    if let Some(external_ref) = &photo.external_ref {
        match deps.providers.places.fetch_photo(external_ref).await {
            Ok(bytes) => return Some(bytes),
            Err(e) => {
                debug!(photo_id = %photo.id, error = %e, "Photo refetch failed");
            }
        }
    }
    None
}

struct ClassifiedPhoto {
    photo: Photo,
    bytes: Option<Vec<u8>>,
}

pub async fn run(deps: &Deps, job: &JobRecord) -> Result<Value> {
    let Some(mut record) = load_record(deps, job)? else {
        return Ok(json!({"dropped": true}));
    };
    begin_stage(deps, &mut record, Stage::Analysis)?;

    let photos = deps.store.photos_for_record(&record.id)?;
    if photos.is_empty() {
        record.visual.sources_available = Some(0);
        record.scoring = compute_potential(&record, 0);
        record.confidence = aggregate(&record, &deps.config.weights);
        finish_stage(deps, &mut record, Stage::Analysis, StageStatus::Success, None)?;
        count_batch(deps, QueueName::Analysis, job, true);
        maybe_chain_analyst(deps, &record, job.payload.seq);
        return Ok(json!({"status": "SUCCESS", "photos": 0}));
    }

    let mut classified: Vec<ClassifiedPhoto> = Vec::new();
    let mut invalid_count = 0usize;
    let mut disputed_count = 0usize;
    let mut primary_used = false;
    let mut secondary_used = false;

    for mut photo in photos {
        if photo.analyzed_by_ai {
            // A previous run may already have flagged a split vote.
            if photo
                .analysis_result
                .as_ref()
                .and_then(|r| r.get("needs_review"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                disputed_count += 1;
            }
            classified.push(ClassifiedPhoto { photo, bytes: None });
            continue;
        }

        let Some(bytes) = photo_bytes(deps, &photo).await else {
            classified.push(ClassifiedPhoto { photo, bytes: None });
            continue;
        };

        let hash = hex::encode(Sha256::digest(&bytes));
        photo.file_hash = Some(hash.clone());

        let precls_model = deps.providers.vision.precls_model_id().to_string();
        let cached = deps.store.analysis_cache_get(
            &hash,
            &deps.config.prompt_version,
            &precls_model,
            deps.config.ttl_analysis_secs,
        )?;

        let vote_result = match cached {
            Some(result) => {
                debug!(photo_id = %photo.id, "Classification cache hit");
                serde_json::from_value::<CachedClassification>(result).ok()
            }
            None => None,
        };

        let classification = match vote_result {
            Some(cached) => Some(cached),
            None => {
                let (primary, secondary) = tokio::join!(
                    deps.providers.vision.classify_photo(&bytes),
                    deps.providers.vision.classify_photo_secondary(&bytes),
                );

                let mut votes: Vec<PhotoCategory> = Vec::new();
                let mut invalid = 0;
                for (is_primary, result) in [(true, primary), (false, secondary)] {
                    match result {
                        Ok(c) => {
                            if is_primary {
                                primary_used = true;
                            } else {
                                secondary_used = true;
                            }
                            if let Some(category) = c.parsed_category() {
                                votes.push(category);
                            }
                        }
                        Err(ProviderError::ImageFormatInvalid) => invalid += 1,
                        Err(e) => {
                            debug!(photo_id = %photo.id, error = %e, "Vision vote unavailable");
                        }
                    }
                }

                if invalid == 2 || (invalid == 1 && votes.is_empty()) {
                    photo.analysis_result = Some(json!({"formatInvalid": true}));
                    photo.analyzed_by_ai = true;
                    photo.analyzed_at = Some(Utc::now());
                    deps.store.update_photo(&photo)?;
                    invalid_count += 1;
                    classified.push(ClassifiedPhoto { photo, bytes: Some(bytes) });
                    continue;
                }

                reconcile_photo_votes(&votes).map(|resolution| {
                    let cached = CachedClassification {
                        category: resolution.category.as_str().to_string(),
                        confidence: resolution.confidence,
                        needs_review: resolution.needs_review,
                        cross_validation_unavailable: resolution.cross_validation_unavailable,
                    };
                    let _ = deps.store.analysis_cache_put(
                        &hash,
                        &deps.config.prompt_version,
                        &precls_model,
                        &serde_json::to_value(&cached).unwrap_or(Value::Null),
                    );
                    cached
                })
            }
        };

        if let Some(classification) = classification {
            if classification.needs_review {
                disputed_count += 1;
            }
            photo.category = PhotoCategory::parse(&classification.category);
            photo.category_confidence = Some(classification.confidence);
            photo.analysis_result = Some(json!({
                "category": classification.category,
                "confidence": classification.confidence,
                "needs_review": classification.needs_review,
                "cross_validation_unavailable": classification.cross_validation_unavailable,
            }));
            photo.analyzed_by_ai = true;
            photo.analyzed_at = Some(Utc::now());
            deps.store.update_photo(&photo)?;
        }
        classified.push(ClassifiedPhoto { photo, bytes: Some(bytes) });
    }

    let with_bytes: Vec<&ClassifiedPhoto> = classified
        .iter()
        .filter(|c| c.bytes.is_some() && c.photo.analysis_result.as_ref().map(|r| r.get("formatInvalid").is_none()).unwrap_or(true))
        .collect();

    if invalid_count > 0 && with_bytes.is_empty() {
        // Every image was rejected by the vision model; the record itself
        // still completes.
        record.visual.sources_available = Some(0);
        record.scoring = compute_potential(&record, classified.len());
        record.confidence = aggregate(&record, &deps.config.weights);
        finish_stage(deps, &mut record, Stage::Analysis, StageStatus::Success, None)?;
        count_batch(deps, QueueName::Analysis, job, true);
        maybe_chain_analyst(deps, &record, job.payload.seq);
        return Ok(json!({"status": "SUCCESS", "all_photos_invalid": true}));
    }

    // Facade photos feed the deep analysis; fall back to everything usable.
    let facade: Vec<&ClassifiedPhoto> = with_bytes
        .iter()
        .copied()
        .filter(|c| c.photo.category == Some(PhotoCategory::Facade))
        .collect();
    let pool: &[&ClassifiedPhoto] = if facade.is_empty() { &with_bytes } else { &facade };
    let deep_input: Vec<Vec<u8>> = pool
        .iter()
        .filter_map(|c| c.bytes.clone())
        .take(4)
        .collect();

    if !deep_input.is_empty() {
        let context = format!(
            "Estabelecimento: {}\nAtividade: {}\nEndereço: {}",
            record.name_hint().unwrap_or("desconhecido"),
            record
                .registry
                .as_ref()
                .and_then(|r| r.main_activity.as_deref())
                .unwrap_or("desconhecida"),
            record.best_address().unwrap_or("desconhecido"),
        );
        match deps.providers.vision.analyze_photos(&deep_input, &context).await {
            Ok(deep) => {
                primary_used = true;
                record.visual.signage_quality =
                    deep.signage_quality.as_deref().and_then(parse_signage);
                record.visual.branding_present = deep.branding_present;
                record.visual.professionalism_level = deep
                    .professionalism_level
                    .as_deref()
                    .and_then(parse_professionalism);
                record.visual.audience = deep.audience;
                record.visual.ambience = deep.ambience;
                record.visual.visual_indicators = deep.visual_indicators;
                record.visual.confidence =
                    deep.confidence.map(|c| c.clamp(0.0, 100.0).round() as u8);
            }
            Err(ProviderError::ImageFormatInvalid) => {
                warn!(record_id = %record.id, "Deep analysis rejected all images");
            }
            Err(e) if e.is_retryable() && !is_last_attempt(job) => {
                return Err(anyhow::anyhow!("deep vision analysis retrying: {}", e));
            }
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "Deep analysis unavailable");
            }
        }
    }

    if record.visual.confidence.is_none() {
        // Fall back to the average classification confidence.
        let confidences: Vec<u8> = classified
            .iter()
            .filter_map(|c| c.photo.category_confidence)
            .collect();
        if !confidences.is_empty() {
            let avg = confidences.iter().map(|&c| c as u32).sum::<u32>()
                / confidences.len() as u32;
            record.visual.confidence = Some(avg as u8);
        }
    }
    record.visual.sources_available =
        Some(primary_used as u8 + secondary_used as u8);
    record.visual.classification_disputed = Some(disputed_count > 0);

    record.scoring = compute_potential(&record, classified.len());
    record.confidence = aggregate(&record, &deps.config.weights);

    finish_stage(deps, &mut record, Stage::Analysis, StageStatus::Success, None)?;
    count_batch(deps, QueueName::Analysis, job, true);
    info!(
        record_id = %record.id,
        photos = classified.len(),
        invalid = invalid_count,
        confidence = ?record.visual.confidence,
        "Photo analysis complete"
    );

    maybe_chain_analyst(deps, &record, job.payload.seq);
    Ok(json!({
        "status": "SUCCESS",
        "photos": classified.len(),
        "invalid": invalid_count,
        "visual_confidence": record.visual.confidence,
        "overall_confidence": record.confidence.overall,
    }))
}

fn maybe_chain_analyst(deps: &Deps, record: &crate::models::Record, seq: Option<u32>) {
    if record.analyst.status.is_none() {
        chain(deps, QueueName::Analyst, &record.id, CHAIN_DELAY, seq);
    }
}

fn parse_signage(s: &str) -> Option<SignageQuality> {
    match s.trim().to_ascii_uppercase().as_str() {
        "EXCELLENT" => Some(SignageQuality::Excellent),
        "GOOD" => Some(SignageQuality::Good),
        "FAIR" => Some(SignageQuality::Fair),
        "POOR" => Some(SignageQuality::Poor),
        _ => None,
    }
}

fn parse_professionalism(s: &str) -> Option<ProfessionalismLevel> {
    match s.trim().to_ascii_uppercase().as_str() {
        "HIGH" => Some(ProfessionalismLevel::High),
        "MEDIUM" => Some(ProfessionalismLevel::Medium),
        "LOW" => Some(ProfessionalismLevel::Low),
        _ => None,
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CachedClassification {
    category: String,
    confidence: u8,
    /// The vote split across sources; carries the review alert forward even
    /// on a cache hit.
    #[serde(default)]
    needs_review: bool,
    cross_validation_unavailable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_sniffing() {
        assert_eq!(sniff_extension(&[0x89, b'P', b'N', b'G', 0, 0]), Some("png"));
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("jpg"));
        assert_eq!(sniff_extension(b"GIF89a..."), Some("gif"));
        assert_eq!(sniff_extension(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_extension(b"not an image"), None);
    }

    #[test]
    fn enum_parsing_tolerates_case() {
        assert_eq!(parse_signage("excellent"), Some(SignageQuality::Excellent));
        assert_eq!(parse_signage("POOR"), Some(SignageQuality::Poor));
        assert_eq!(parse_signage("???"), None);
        assert_eq!(parse_professionalism("High"), Some(ProfessionalismLevel::High));
    }
}
