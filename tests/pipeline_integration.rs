//! End-to-end pipeline tests against an in-memory datastore.
//!
//! Providers point at unreachable endpoints, so every external call fails
//! fast and deterministically; the tests exercise the chaining, retry,
//! degradation, and ledger behavior that must hold regardless of provider
//! availability.

use axum::extract::{Json, Query, State};
use cadastro_backend::api;
use cadastro_backend::cache::Cache;
use cadastro_backend::models::{
    CandidateRow, Config, ConfidenceWeights, DocumentKind, StageStatus,
};
use cadastro_backend::pipeline::broadcaster::Broadcaster;
use cadastro_backend::pipeline::queue::QueueManager;
use cadastro_backend::pipeline::Deps;
use cadastro_backend::providers::Providers;
use cadastro_backend::storage::Store;
use std::sync::Arc;
use std::time::Duration;

const DEAD_ENDPOINT: &str = "http://127.0.0.1:9";

fn test_config() -> Config {
    Config {
        database_path: ":memory:".to_string(),
        port: 0,
        jwt_secret: "test-secret".to_string(),
        photo_dir: std::env::temp_dir()
            .join(format!("cadastro-test-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string(),
        admin_email: "ops@test".to_string(),
        admin_password: "test".to_string(),
        cnpj_api_url: DEAD_ENDPOINT.to_string(),
        cnpj_api_key: None,
        cpf_api_url: DEAD_ENDPOINT.to_string(),
        cpf_token_url: DEAD_ENDPOINT.to_string(),
        cpf_client_id: None,
        cpf_client_secret: None,
        cpf_fallback_url: DEAD_ENDPOINT.to_string(),
        geocoder_a_url: DEAD_ENDPOINT.to_string(),
        geocoder_a_key: None,
        geocoder_b_url: DEAD_ENDPOINT.to_string(),
        places_url: DEAD_ENDPOINT.to_string(),
        places_key: None,
        llm_a_url: DEAD_ENDPOINT.to_string(),
        llm_a_key: None,
        llm_b_url: DEAD_ENDPOINT.to_string(),
        llm_b_key: None,
        llm_a_model: "model-a".to_string(),
        llm_b_model: "model-b".to_string(),
        vision_model: "model-v".to_string(),
        vision_precls_model: "model-v".to_string(),
        analyst_model: "model-r".to_string(),
        prompt_version: "test".to_string(),
        ttl_cnpj_secs: 3600,
        ttl_cpf_secs: 3600,
        ttl_geocode_secs: 3600,
        ttl_places_secs: 3600,
        ttl_analysis_secs: 3600,
        backoff_base_ms: 10,
        backoff_cap_ms: 50,
        queue_highwater_mult: 10,
        reset_stuck_minutes: 30,
        weights: ConfidenceWeights::default(),
    }
}

fn build_deps(disabled_queues: bool) -> Arc<Deps> {
    let config = test_config();
    let store = Store::open_in_memory().unwrap();
    let cache = Cache::new(store.clone());
    let providers = Providers::from_config(&config).unwrap();
    let broadcaster = Broadcaster::new();
    let queues = if disabled_queues {
        Arc::new(QueueManager::disabled(broadcaster.clone()))
    } else {
        Arc::new(QueueManager::new(
            broadcaster.clone(),
            config.backoff_base_ms,
            config.backoff_cap_ms,
        ))
    };
    let deps = Arc::new(Deps {
        config,
        store,
        cache,
        providers,
        queues,
        broadcaster,
    });
    deps.start_pipeline();
    deps
}

fn candidate(document: &str, name: Option<&str>, address: Option<&str>) -> CandidateRow {
    CandidateRow {
        document: document.to_string(),
        name: name.map(String::from),
        address: address.map(String::from),
        city: Some("São Paulo".to_string()),
        state: Some("SP".to_string()),
        phone: None,
        zip: None,
    }
}

async fn wait_for<F>(deps: &Arc<Deps>, record_id: &str, mut predicate: F)
where
    F: FnMut(&cadastro_backend::models::Record) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let record = deps.store.get_record(record_id).unwrap().unwrap();
        if predicate(&record) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for record {}: stages {:?}",
                record_id,
                serde_json::to_string(&record.stages).unwrap()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cpf_with_valid_checksum_survives_provider_outage() {
    let deps = build_deps(false);

    let response = api::records::ingest(
        State(deps.clone()),
        Json(api::records::IngestRequest {
            candidates: vec![candidate("529.982.247-25", Some("João"), Some("R. A, 10"))],
        }),
    )
    .await
    .unwrap();
    let body = response.0;
    assert_eq!(body["success"], true);
    assert_eq!(body["created"], 1);
    let record_id = body["ids"][0].as_str().unwrap().to_string();

    // Both CPF providers are unreachable, but the checksum holds: the
    // document stage completes with a validation-only marker.
    wait_for(&deps, &record_id, |r| {
        r.stages.doc_lookup.status() == StageStatus::Success
    })
    .await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert_eq!(record.document_kind, DocumentKind::Cpf);
    assert_eq!(
        record.cpf_info.as_ref().unwrap().cpf_status.as_deref(),
        Some("validated-only")
    );
    assert!(!record.document_validated);

    // Chaining completeness: normalization always follows doc lookup, and
    // with no LLM available the rule-based normalizer carries it.
    wait_for(&deps, &record_id, |r| {
        r.stages.normalization.status() == StageStatus::Success
    })
    .await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert_eq!(
        record.normalization.address_normalized.as_deref(),
        Some("Rua A, 10")
    );
    assert_eq!(record.normalization.source.as_deref(), Some("REGEX"));
    assert_eq!(record.normalization.confidence, Some(60));
    assert_eq!(record.normalization.state_normalized.as_deref(), Some("SP"));

    // Geocoding exhausts retries against the dead endpoints and fails
    // terminally; places is never chained.
    wait_for(&deps, &record_id, |r| {
        r.stages.geocoding.status() == StageStatus::Fail
    })
    .await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert!(record
        .stages
        .geocoding
        .error
        .as_deref()
        .unwrap()
        .contains("NotFound"));
    assert_eq!(record.stages.places.status(), StageStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_document_is_not_applicable_but_still_chains() {
    let deps = build_deps(false);

    let response = api::records::ingest(
        State(deps.clone()),
        Json(api::records::IngestRequest {
            candidates: vec![candidate("12345", None, Some("Av. Central, 5"))],
        }),
    )
    .await
    .unwrap();
    let record_id = response.0["ids"][0].as_str().unwrap().to_string();

    wait_for(&deps, &record_id, |r| {
        r.stages.doc_lookup.status() == StageStatus::NotApplicable
    })
    .await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert_eq!(record.document_kind, DocumentKind::Invalid);

    // Normalization still runs on the raw hints.
    wait_for(&deps, &record_id, |r| {
        r.stages.normalization.status() == StageStatus::Success
    })
    .await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert_eq!(
        record.normalization.address_normalized.as_deref(),
        Some("Avenida Central, 5")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_cpf_checksum_fails_doc_stage_but_chains() {
    let deps = build_deps(false);

    let response = api::records::ingest(
        State(deps.clone()),
        Json(api::records::IngestRequest {
            candidates: vec![candidate("529.982.247-24", Some("João"), Some("R. A, 10"))],
        }),
    )
    .await
    .unwrap();
    let record_id = response.0["ids"][0].as_str().unwrap().to_string();

    wait_for(&deps, &record_id, |r| {
        r.stages.doc_lookup.status() == StageStatus::Fail
    })
    .await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert!(record
        .stages
        .doc_lookup
        .error
        .as_deref()
        .unwrap()
        .contains("InvalidInput"));

    // The pipeline still chains forward on whatever data is present.
    wait_for(&deps, &record_id, |r| {
        r.stages.normalization.status() == StageStatus::Success
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_address_yields_incomplete_normalization() {
    let deps = build_deps(false);

    let response = api::records::ingest(
        State(deps.clone()),
        Json(api::records::IngestRequest {
            candidates: vec![candidate("529.982.247-25", Some("João"), None)],
        }),
    )
    .await
    .unwrap();
    let record_id = response.0["ids"][0].as_str().unwrap().to_string();

    wait_for(&deps, &record_id, |r| {
        r.stages.normalization.status().is_terminal()
    })
    .await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert_eq!(
        record.stages.normalization.status(),
        StageStatus::Incomplete
    );
    assert_eq!(record.normalization.confidence, Some(0));
    // City and state still normalize, so geocoding is attempted anyway.
    assert_eq!(record.normalization.state_normalized.as_deref(), Some("SP"));
    wait_for(&deps, &record_id, |r| {
        r.stages.geocoding.status().is_terminal()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_ledger_stays_consistent_through_bulk_run() {
    let deps = build_deps(false);

    let response = api::records::ingest(
        State(deps.clone()),
        Json(api::records::IngestRequest {
            candidates: vec![
                candidate("529.982.247-25", Some("A"), Some("R. A, 1")),
                candidate("111.444.777-35", Some("B"), Some("R. B, 2")),
            ],
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.0["created"], 2);
    let ids: Vec<String> = response.0["ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();

    for id in &ids {
        wait_for(&deps, id, |r| r.stages.doc_lookup.status().is_terminal()).await;
    }

    // Bulk re-run of the doc stage with force: a fresh batch tracks both.
    let response = api::pipeline::start_doc(
        State(deps.clone()),
        Some(Json(api::pipeline::StartRequest {
            force: Some(true),
            scope: None,
        })),
    )
    .await
    .unwrap();
    assert_eq!(response.0["success"], true);
    assert_eq!(response.0["total"], 2);
    assert_eq!(response.0["reprocessing"], true);
    let batch_id = response.0["batchId"].as_str().unwrap().to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let batch = deps.store.get_batch(&batch_id).unwrap().unwrap();
        assert_eq!(batch.processed, batch.success + batch.failed);
        assert!(batch.processed <= batch.total);
        if batch.processed == batch.total {
            assert!(batch.finished_at.is_some());
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("batch never completed: {:?}", batch);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_store_outage_degrades_to_noop() {
    let deps = build_deps(true);

    let response = api::records::ingest(
        State(deps.clone()),
        Json(api::records::IngestRequest {
            candidates: vec![candidate("529.982.247-25", Some("João"), Some("R. A, 10"))],
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.0["success"], true);
    let record_id = response.0["ids"][0].as_str().unwrap().to_string();

    // The bulk start succeeds and reports the batch even though nothing was
    // actually scheduled.
    let response = api::pipeline::start_geocoding(State(deps.clone()), None)
        .await
        .unwrap();
    assert_eq!(response.0["success"], true);
    assert_eq!(response.0["total"], 1);
    assert_eq!(response.0["warning"], "queue store unavailable");

    let status = api::pipeline::status(State(deps.clone())).await.unwrap();
    assert_eq!(status.0["warning"], "queue store unavailable");
    assert_eq!(status.0["records"], 1);

    // Nothing ran: the record is untouched and readable.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = deps.store.get_record(&record_id).unwrap().unwrap();
    assert_eq!(record.stages.doc_lookup.status(), StageStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_stuck_requeues_only_old_processing_records() {
    let deps = build_deps(false);

    let mut record = cadastro_backend::models::Record::new(
        "11222333000181".to_string(),
        DocumentKind::Cnpj,
        Default::default(),
    );
    record.stages.geocoding.status = Some(StageStatus::Processing);
    record.stages.geocoding.started_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    deps.store.upsert_record(&record).unwrap();

    let response = api::admin::reset_stuck(
        State(deps.clone()),
        Query(api::admin::ResetStuckQuery {
            timeout_minutes: Some(30),
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.0["reset"], 1);

    let record = deps.store.get_record(&record.id).unwrap().unwrap();
    assert_eq!(record.stages.geocoding.status(), StageStatus::Pending);
    assert!(record.stages.geocoding.started_at.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn force_fail_marks_the_requested_stage() {
    let deps = build_deps(false);

    let record = cadastro_backend::models::Record::new(
        "11222333000181".to_string(),
        DocumentKind::Cnpj,
        Default::default(),
    );
    deps.store.upsert_record(&record).unwrap();

    let response = api::records::force_fail(
        State(deps.clone()),
        axum::extract::Path(record.id.clone()),
        Json(api::records::ForceFailRequest {
            pipeline: "registry".to_string(),
            error: Some("operator says no".to_string()),
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.0["success"], true);

    let record = deps.store.get_record(&record.id).unwrap().unwrap();
    assert_eq!(record.stages.doc_lookup.status(), StageStatus::Fail);
    assert_eq!(
        record.stages.doc_lookup.error.as_deref(),
        Some("operator says no")
    );

    // Unknown pipeline names are rejected.
    let error = api::records::force_fail(
        State(deps.clone()),
        axum::extract::Path(record.id.clone()),
        Json(api::records::ForceFailRequest {
            pipeline: "places".to_string(),
            error: None,
        }),
    )
    .await;
    assert!(error.is_err());
}
