//! Duplicate detection worker: address-equality then coordinate-proximity
//! strategies, plus the partner-roster cross-check for CPF records.

use super::{count_batch, load_record};
use crate::models::{CpfPartnerRelation, DocumentKind, Record};
use crate::pipeline::queue::{JobRecord, QueueName};
use crate::pipeline::Deps;
use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Bounding square half-side, roughly 50 meters of latitude.
const COORD_EPS: f64 = 0.00045;

pub async fn run(deps: &Deps, job: &JobRecord) -> Result<Value> {
    let Some(mut record) = load_record(deps, job)? else {
        return Ok(json!({"dropped": true}));
    };

    // Strategy 1: exact equality on the normalized address.
    let mut duplicate_ids: Vec<String> = match &record.normalization.address_normalized {
        Some(address) if !address.trim().is_empty() => deps
            .store
            .find_by_normalized_address(address, &record.id)?,
        _ => Vec::new(),
    };

    // Strategy 2: coordinate proximity, only when the first found nothing.
    if duplicate_ids.is_empty() {
        if let (Some(lat), Some(lng)) = (record.geo.lat, record.geo.lng) {
            duplicate_ids = deps.store.find_by_coord_box(lat, lng, COORD_EPS, &record.id)?;
        }
    }

    record.duplicates.count = Some(duplicate_ids.len() as u32);
    record.duplicates.alert = Some(!duplicate_ids.is_empty());
    record.duplicates.address_ids = duplicate_ids.clone();

    // Annotate the matching peers symmetrically.
    for peer_id in &duplicate_ids {
        if let Some(mut peer) = deps.store.get_record(peer_id)? {
            if !peer.duplicates.address_ids.contains(&record.id) {
                peer.duplicates.address_ids.push(record.id.clone());
                peer.duplicates.count = Some(peer.duplicates.address_ids.len() as u32);
                peer.duplicates.alert = Some(true);
                deps.store.upsert_record(&peer)?;
            }
        }
    }

    let mut partner_match = None;
    if record.document_kind == DocumentKind::Cpf {
        partner_match = qsa_cross_check(deps, &record)?;
        match &partner_match {
            Some(relation) => {
                record.duplicates.cpf_is_partner = Some(true);
                record.duplicates.cpf_partner_relation = Some(relation.clone());
            }
            None => {
                record.duplicates.cpf_is_partner = Some(false);
                let alert = "CPF not found in any partner list".to_string();
                if !record.confidence.alerts.contains(&alert) {
                    record.confidence.alerts.push(alert);
                }
            }
        }
    }

    deps.store.upsert_record(&record)?;
    count_batch(deps, QueueName::DuplicateDetection, job, true);
    info!(
        record_id = %record.id,
        duplicates = duplicate_ids.len(),
        cpf_is_partner = ?record.duplicates.cpf_is_partner,
        "Duplicate detection done"
    );

    Ok(json!({
        "status": "SUCCESS",
        "duplicates": duplicate_ids,
        "cpf_is_partner": record.duplicates.cpf_is_partner,
        "partner_company": partner_match.map(|p| p.company_cnpj),
    }))
}

/// Scan CNPJ records whose partner roster carries this CPF.
fn qsa_cross_check(deps: &Deps, record: &Record) -> Result<Option<CpfPartnerRelation>> {
    let companies = deps.store.list_by_kind(DocumentKind::Cnpj)?;
    for company in companies {
        let Some(registry) = &company.registry else {
            continue;
        };
        for partner in &registry.partners {
            let matches = partner
                .tax_id
                .as_deref()
                .map(|tax_id| {
                    let digits: String =
                        tax_id.chars().filter(|c| c.is_ascii_digit()).collect();
                    // Registries often mask partner CPFs to the middle six
                    // digits; compare on the unmasked tail when so.
                    digits == record.document
                        || (digits.len() >= 6 && record.document.contains(&digits))
                })
                .unwrap_or(false);
            if matches {
                debug!(
                    record_id = %record.id,
                    company = %company.document,
                    "CPF found in partner roster"
                );
                return Ok(Some(CpfPartnerRelation {
                    company_id: company.id.clone(),
                    company_name: registry.legal_name.clone(),
                    company_cnpj: company.document.clone(),
                    partner_role: partner.role.clone(),
                    since: partner.since.clone(),
                }));
            }
        }
    }
    Ok(None)
}
