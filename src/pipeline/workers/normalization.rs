//! Address normalization worker: two LLM legs and the rule-based leg,
//! reconciled into one normalized address with a calibrated confidence.

use super::{begin_stage, chain, count_batch, finish_stage, load_record};
use crate::crossval::address::{reconcile_addresses, rule_based_leg, NormalizedAddress};
use crate::models::{Stage, StageStatus};
use crate::pipeline::queue::{JobRecord, QueueName};
use crate::pipeline::Deps;
use anyhow::Result;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const CHAIN_DELAY: Duration = Duration::from_millis(100);

pub async fn run(deps: &Deps, job: &JobRecord) -> Result<Value> {
    let Some(mut record) = load_record(deps, job)? else {
        return Ok(json!({"dropped": true}));
    };
    begin_stage(deps, &mut record, Stage::Normalization)?;

    let address = record
        .raw
        .address_raw
        .clone()
        .or_else(|| {
            record
                .registry
                .as_ref()
                .and_then(|r| r.registry_address.clone())
        })
        .unwrap_or_default();
    let city = record.raw.city_raw.clone().unwrap_or_default();
    let state = record.raw.state_raw.clone().unwrap_or_default();

    if address.trim().is_empty() {
        // Too sparse to normalize, but geocoding may still work on city and
        // state alone.
        record.normalization.confidence = Some(0);
        record.normalization.city_normalized = Some(
            crate::crossval::similarity::normalize_city_rule_based(&city),
        )
        .filter(|c| !c.is_empty());
        record.normalization.state_normalized = Some(
            crate::crossval::similarity::normalize_state_rule_based(&state),
        )
        .filter(|s| !s.is_empty());
        finish_stage(
            deps,
            &mut record,
            Stage::Normalization,
            StageStatus::Incomplete,
            Some("reason=InvalidInput: empty address".to_string()),
        )?;
        count_batch(deps, QueueName::Normalization, job, true);
        chain(deps, QueueName::Geocoding, &record.id, CHAIN_DELAY, job.payload.seq);
        return Ok(json!({"status": "INCOMPLETE"}));
    }

    let (llm_a, llm_b) = tokio::join!(
        deps.providers.text_llm_a.normalize_address(&address, &city, &state),
        deps.providers.text_llm_b.normalize_address(&address, &city, &state),
    );
    let llm_a: Option<NormalizedAddress> = match llm_a {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(record_id = %record.id, error = %e, "LLM-A normalization unavailable");
            None
        }
    };
    let llm_b: Option<NormalizedAddress> = match llm_b {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(record_id = %record.id, error = %e, "LLM-B normalization unavailable");
            None
        }
    };

    let rule = rule_based_leg(&address, &city, &state);
    let resolution = reconcile_addresses(llm_a.as_ref(), llm_b.as_ref(), &rule);
    debug!(
        record_id = %record.id,
        source = resolution.source.as_str(),
        confidence = resolution.confidence,
        "Address normalization reconciled"
    );

    record.normalization.address_normalized = Some(resolution.chosen.address.clone());
    record.normalization.city_normalized =
        Some(resolution.chosen.city.clone()).filter(|c| !c.is_empty());
    record.normalization.state_normalized =
        Some(resolution.chosen.state.clone()).filter(|s| !s.is_empty());
    record.normalization.confidence = Some(resolution.confidence);
    record.normalization.source = Some(resolution.source.as_str().to_string());
    record.normalization.divergences = resolution.divergences.clone();

    finish_stage(deps, &mut record, Stage::Normalization, StageStatus::Success, None)?;
    count_batch(deps, QueueName::Normalization, job, true);
    chain(deps, QueueName::Geocoding, &record.id, CHAIN_DELAY, job.payload.seq);

    Ok(json!({
        "status": "SUCCESS",
        "source": resolution.source.as_str(),
        "confidence": resolution.confidence,
        "divergences": resolution.divergences,
    }))
}
