//! Document lookup worker: registry enrichment keyed by the tax document.

use super::{begin_stage, chain, count_batch, finish_stage, is_last_attempt, load_record};
use crate::crossval::similarity::{semantic_similarity, token_containment};
use crate::models::{CpfData, DocumentKind, RegistryData, Stage, StageStatus};
use crate::pipeline::queue::{JobRecord, QueueName};
use crate::pipeline::Deps;
use crate::validation::{checksum_valid, detect_kind};
use anyhow::Result;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const CHAIN_DELAY: Duration = Duration::from_millis(500);
/// Below this similarity the raw address is flagged as divergent.
const ADDRESS_DIVERGENCE_FLOOR: f64 = 50.0;

pub async fn run(deps: &Deps, job: &JobRecord) -> Result<Value> {
    let Some(mut record) = load_record(deps, job)? else {
        return Ok(json!({"dropped": true}));
    };
    begin_stage(deps, &mut record, Stage::DocLookup)?;

    let kind = detect_kind(&record.document);
    record.document_kind = kind;

    let outcome = match kind {
        DocumentKind::Invalid => {
            let document_len = record.document.len();
            finish_stage(
                deps,
                &mut record,
                Stage::DocLookup,
                StageStatus::NotApplicable,
                Some(format!(
                    "document has {} digits; expected 11 or 14",
                    document_len
                )),
            )?;
            count_batch(deps, QueueName::DocLookup, job, true);
            json!({"status": "NOT_APPLICABLE", "kind": "INVALID"})
        }
        DocumentKind::Cnpj => match lookup_cnpj(deps, job, &mut record).await? {
            Some(value) => value,
            None => return Err(anyhow::anyhow!("cnpj lookup retrying")),
        },
        DocumentKind::Cpf => lookup_cpf(deps, job, &mut record).await?,
    };

    // Downstream stages still run against whatever data is present.
    chain(deps, QueueName::Normalization, &record.id, CHAIN_DELAY, job.payload.seq);
    Ok(outcome)
}

async fn lookup_cnpj(deps: &Deps, job: &JobRecord, record: &mut crate::models::Record) -> Result<Option<Value>> {
    if !checksum_valid(&record.document, DocumentKind::Cnpj) {
        finish_stage(
            deps,
            record,
            Stage::DocLookup,
            StageStatus::Fail,
            Some("reason=InvalidInput: CNPJ checksum invalid".to_string()),
        )?;
        count_batch(deps, QueueName::DocLookup, job, false);
        return Ok(Some(json!({"status": "FAIL", "reason": "InvalidInput"})));
    }

    let cached: Option<RegistryData> = deps.cache.get("cnpj", &record.document);
    let registry = match cached {
        Some(data) => Ok(data),
        None => {
            let result = deps.providers.cnpj.lookup(&record.document).await;
            if let Ok(data) = &result {
                deps.cache.set(
                    "cnpj",
                    &record.document,
                    data,
                    Some(deps.config.ttl_cnpj_secs),
                );
            }
            result
        }
    };

    match registry {
        Ok(data) => {
            record.document_validated = true;
            if let (Some(raw), Some(reg)) =
                (record.raw.address_raw.as_deref(), data.registry_address.as_deref())
            {
                // A terse input address contained in the fuller registry
                // address is not a divergence.
                let divergent = semantic_similarity(raw, reg) < ADDRESS_DIVERGENCE_FLOOR
                    && token_containment(raw, reg) < 0.8;
                record.divergence_address = Some(divergent);
            }
            let active = data.is_active();
            record.registry = Some(data);
            finish_stage(deps, record, Stage::DocLookup, StageStatus::Success, None)?;
            count_batch(deps, QueueName::DocLookup, job, true);
            info!(record_id = %record.id, active, "CNPJ registry lookup succeeded");
            Ok(Some(json!({"status": "SUCCESS", "kind": "CNPJ", "active": active})))
        }
        Err(e) if e.is_retryable() && !is_last_attempt(job) => {
            warn!(record_id = %record.id, error = %e, "CNPJ lookup transient failure");
            Ok(None)
        }
        Err(e) => {
            finish_stage(
                deps,
                record,
                Stage::DocLookup,
                StageStatus::Fail,
                Some(format!("reason={}: {}", e.kind(), e)),
            )?;
            count_batch(deps, QueueName::DocLookup, job, false);
            Ok(Some(json!({"status": "FAIL", "reason": e.kind()})))
        }
    }
}

async fn lookup_cpf(deps: &Deps, job: &JobRecord, record: &mut crate::models::Record) -> Result<Value> {
    if !checksum_valid(&record.document, DocumentKind::Cpf) {
        finish_stage(
            deps,
            record,
            Stage::DocLookup,
            StageStatus::Fail,
            Some("reason=InvalidInput: CPF checksum invalid".to_string()),
        )?;
        count_batch(deps, QueueName::DocLookup, job, false);
        return Ok(json!({"status": "FAIL", "reason": "InvalidInput"}));
    }

    let cached: Option<CpfData> = deps.cache.get("cpf", &record.document);
    let lookup = match cached {
        Some(data) => Ok(data),
        None => {
            let result = deps.providers.cpf.lookup(&record.document).await;
            if let Ok(data) = &result {
                deps.cache.set(
                    "cpf",
                    &record.document,
                    data,
                    Some(deps.config.ttl_cpf_secs),
                );
            }
            result
        }
    };

    let value = match lookup {
        Ok(data) => {
            record.document_validated = true;
            record.cpf_info = Some(data);
            json!({"status": "SUCCESS", "kind": "CPF"})
        }
        Err(e) if e.is_retryable() && !is_last_attempt(job) => {
            warn!(record_id = %record.id, error = %e, "CPF lookup transient failure");
            return Err(anyhow::anyhow!("cpf lookup retrying: {}", e));
        }
        Err(e) => {
            // Both providers unavailable, but the checksum holds: keep the
            // record moving with a validation-only marker.
            warn!(record_id = %record.id, error = %e, "CPF providers failed; checksum-only");
            record.cpf_info = Some(CpfData {
                cpf_name: None,
                cpf_status: Some("validated-only".to_string()),
                cpf_birth: None,
                cpf_deceased: None,
            });
            json!({"status": "SUCCESS", "kind": "CPF", "mode": "validated-only"})
        }
    };
    finish_stage(deps, record, Stage::DocLookup, StageStatus::Success, None)?;
    count_batch(deps, QueueName::DocLookup, job, true);
    Ok(value)
}
