//! Database-backed persistence for records, photos, batches, the analysis
//! cache, the processing log, and users.
//!
//! Key choices:
//! - WAL mode for concurrent reads during writes
//! - one connection behind a parking_lot mutex; statements are short-lived
//! - grouped payloads serialized as JSON columns, with scalar columns
//!   duplicated where SQL needs to filter or join
//! - batch counters updated by single-statement atomic increments

use crate::models::{
    Batch, BatchKind, BatchStatus, DocumentKind, Photo, PhotoCategory, Record, Stage, StageState,
    StageStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    document_kind TEXT NOT NULL,
    document_validated INTEGER NOT NULL DEFAULT 0,
    name_raw TEXT,
    address_raw TEXT,
    city_raw TEXT,
    state_raw TEXT,
    phone_raw TEXT,
    zip_raw TEXT,
    registry_json TEXT,
    cpf_json TEXT,
    divergence_address INTEGER,
    normalization_json TEXT,
    address_normalized TEXT,
    city_normalized TEXT,
    state_normalized TEXT,
    geo_json TEXT,
    lat REAL,
    lng REAL,
    place_json TEXT,
    place_id TEXT,
    visual_json TEXT,
    scoring_json TEXT,
    typology_json TEXT,
    quality_json TEXT,
    duplicates_json TEXT,
    confidence_json TEXT,
    confidence_overall INTEGER,
    confidence_level TEXT,
    needs_review INTEGER,
    analyst_json TEXT,
    analyst_status TEXT,
    nome_fantasia_match INTEGER,
    doc_lookup_status TEXT, doc_lookup_started_at INTEGER, doc_lookup_finished_at INTEGER, doc_lookup_error TEXT,
    normalization_status TEXT, normalization_started_at INTEGER, normalization_finished_at INTEGER, normalization_error TEXT,
    geocoding_status TEXT, geocoding_started_at INTEGER, geocoding_finished_at INTEGER, geocoding_error TEXT,
    places_status TEXT, places_started_at INTEGER, places_finished_at INTEGER, places_error TEXT,
    analysis_status TEXT, analysis_started_at INTEGER, analysis_finished_at INTEGER, analysis_error TEXT,
    analyst_stage_status TEXT, analyst_started_at INTEGER, analyst_finished_at INTEGER, analyst_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_document ON records(document);
CREATE INDEX IF NOT EXISTS idx_records_kind ON records(document_kind);
CREATE INDEX IF NOT EXISTS idx_records_address_norm ON records(address_normalized);
CREATE INDEX IF NOT EXISTS idx_records_coords ON records(lat, lng);
CREATE INDEX IF NOT EXISTS idx_records_analyst ON records(analyst_status);

CREATE TABLE IF NOT EXISTS photos (
    id TEXT PRIMARY KEY,
    record_id TEXT NOT NULL,
    file_name TEXT,
    external_ref TEXT,
    ordinal INTEGER NOT NULL,
    category TEXT,
    category_confidence INTEGER,
    file_hash TEXT,
    analyzed_by_ai INTEGER NOT NULL DEFAULT 0,
    analysis_result TEXT,
    analyzed_at INTEGER,
    FOREIGN KEY (record_id) REFERENCES records(id)
);

CREATE INDEX IF NOT EXISTS idx_photos_record ON photos(record_id, ordinal);

CREATE TABLE IF NOT EXISTS batches (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    total INTEGER NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    note TEXT
);

CREATE TABLE IF NOT EXISTS analysis_cache (
    photo_hash TEXT NOT NULL,
    prompt_version TEXT NOT NULL,
    model_id TEXT NOT NULL,
    result TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (photo_hash, prompt_version, model_id)
);

CREATE TABLE IF NOT EXISTS processing_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    stage TEXT NOT NULL,
    operation TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    execution_time_ms INTEGER,
    input_json TEXT,
    output_json TEXT,
    transformations_json TEXT,
    validations_json TEXT,
    alerts_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_proclog_correlation ON processing_log(correlation_id);
CREATE INDEX IF NOT EXISTS idx_proclog_stage ON processing_log(stage, timestamp DESC);

CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

/// Append-only structured log entry (see `processing_log`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub operation: String,
    pub level: String,
    pub message: String,
    pub execution_time_ms: Option<i64>,
    pub input_json: Option<serde_json::Value>,
    pub output_json: Option<serde_json::Value>,
    pub transformations_json: Option<serde_json::Value>,
    pub validations_json: Option<serde_json::Value>,
    pub alerts_json: Option<serde_json::Value>,
}

/// Percentile summary over recent stage completions.
#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub stage: String,
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub p99_ms: i64,
}

/// Authenticated operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serialize json column")
}

fn parse_json<T: for<'de> Deserialize<'de> + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn parse_json_opt<T: for<'de> Deserialize<'de>>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        conn.execute_batch(SCHEMA_SQL).context("Failed to run schema")?;
        info!(path, "Database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).context("Failed to run schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    pub fn upsert_record(&self, record: &Record) -> Result<()> {
        let conn = self.conn.lock();
        let stage_cols = |s: &StageState| {
            (
                s.status.map(|v| v.as_str().to_string()),
                s.started_at.map(ts),
                s.finished_at.map(ts),
                s.error.clone(),
            )
        };
        let (dl_s, dl_a, dl_f, dl_e) = stage_cols(&record.stages.doc_lookup);
        let (no_s, no_a, no_f, no_e) = stage_cols(&record.stages.normalization);
        let (ge_s, ge_a, ge_f, ge_e) = stage_cols(&record.stages.geocoding);
        let (pl_s, pl_a, pl_f, pl_e) = stage_cols(&record.stages.places);
        let (an_s, an_a, an_f, an_e) = stage_cols(&record.stages.analysis);
        let (ly_s, ly_a, ly_f, ly_e) = stage_cols(&record.stages.analyst);

        conn.execute(
            r#"INSERT INTO records (
                id, document, document_kind, document_validated,
                name_raw, address_raw, city_raw, state_raw, phone_raw, zip_raw,
                registry_json, cpf_json, divergence_address,
                normalization_json, address_normalized, city_normalized, state_normalized,
                geo_json, lat, lng,
                place_json, place_id,
                visual_json, scoring_json, typology_json, quality_json,
                duplicates_json, confidence_json, confidence_overall, confidence_level, needs_review,
                analyst_json, analyst_status, nome_fantasia_match,
                doc_lookup_status, doc_lookup_started_at, doc_lookup_finished_at, doc_lookup_error,
                normalization_status, normalization_started_at, normalization_finished_at, normalization_error,
                geocoding_status, geocoding_started_at, geocoding_finished_at, geocoding_error,
                places_status, places_started_at, places_finished_at, places_error,
                analysis_status, analysis_started_at, analysis_finished_at, analysis_error,
                analyst_stage_status, analyst_started_at, analyst_finished_at, analyst_error,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
                ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30,
                ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38, ?39, ?40,
                ?41, ?42, ?43, ?44, ?45, ?46, ?47, ?48, ?49, ?50,
                ?51, ?52, ?53, ?54, ?55, ?56, ?57, ?58, ?59, ?60
            )
            ON CONFLICT(id) DO UPDATE SET
                document = excluded.document,
                document_kind = excluded.document_kind,
                document_validated = excluded.document_validated,
                name_raw = excluded.name_raw,
                address_raw = excluded.address_raw,
                city_raw = excluded.city_raw,
                state_raw = excluded.state_raw,
                phone_raw = excluded.phone_raw,
                zip_raw = excluded.zip_raw,
                registry_json = excluded.registry_json,
                cpf_json = excluded.cpf_json,
                divergence_address = excluded.divergence_address,
                normalization_json = excluded.normalization_json,
                address_normalized = excluded.address_normalized,
                city_normalized = excluded.city_normalized,
                state_normalized = excluded.state_normalized,
                geo_json = excluded.geo_json,
                lat = excluded.lat,
                lng = excluded.lng,
                place_json = excluded.place_json,
                place_id = excluded.place_id,
                visual_json = excluded.visual_json,
                scoring_json = excluded.scoring_json,
                typology_json = excluded.typology_json,
                quality_json = excluded.quality_json,
                duplicates_json = excluded.duplicates_json,
                confidence_json = excluded.confidence_json,
                confidence_overall = excluded.confidence_overall,
                confidence_level = excluded.confidence_level,
                needs_review = excluded.needs_review,
                analyst_json = excluded.analyst_json,
                analyst_status = excluded.analyst_status,
                nome_fantasia_match = excluded.nome_fantasia_match,
                doc_lookup_status = excluded.doc_lookup_status,
                doc_lookup_started_at = excluded.doc_lookup_started_at,
                doc_lookup_finished_at = excluded.doc_lookup_finished_at,
                doc_lookup_error = excluded.doc_lookup_error,
                normalization_status = excluded.normalization_status,
                normalization_started_at = excluded.normalization_started_at,
                normalization_finished_at = excluded.normalization_finished_at,
                normalization_error = excluded.normalization_error,
                geocoding_status = excluded.geocoding_status,
                geocoding_started_at = excluded.geocoding_started_at,
                geocoding_finished_at = excluded.geocoding_finished_at,
                geocoding_error = excluded.geocoding_error,
                places_status = excluded.places_status,
                places_started_at = excluded.places_started_at,
                places_finished_at = excluded.places_finished_at,
                places_error = excluded.places_error,
                analysis_status = excluded.analysis_status,
                analysis_started_at = excluded.analysis_started_at,
                analysis_finished_at = excluded.analysis_finished_at,
                analysis_error = excluded.analysis_error,
                analyst_stage_status = excluded.analyst_stage_status,
                analyst_started_at = excluded.analyst_started_at,
                analyst_finished_at = excluded.analyst_finished_at,
                analyst_error = excluded.analyst_error,
                updated_at = excluded.updated_at
            "#,
            params![
                record.id,
                record.document,
                record.document_kind.as_str(),
                record.document_validated as i64,
                record.raw.name_raw,
                record.raw.address_raw,
                record.raw.city_raw,
                record.raw.state_raw,
                record.raw.phone_raw,
                record.raw.zip_raw,
                record.registry.as_ref().map(to_json).transpose()?,
                record.cpf_info.as_ref().map(to_json).transpose()?,
                record.divergence_address.map(|b| b as i64),
                to_json(&record.normalization)?,
                record.normalization.address_normalized,
                record.normalization.city_normalized,
                record.normalization.state_normalized,
                to_json(&record.geo)?,
                record.geo.lat,
                record.geo.lng,
                to_json(&record.place)?,
                record.place.place_id,
                to_json(&record.visual)?,
                to_json(&record.scoring)?,
                to_json(&record.typology)?,
                to_json(&record.quality)?,
                to_json(&record.duplicates)?,
                to_json(&record.confidence)?,
                record.confidence.overall.map(|v| v as i64),
                record.confidence.level.map(|l| l.as_str().to_string()),
                record.confidence.needs_review.map(|b| b as i64),
                to_json(&record.analyst)?,
                record.analyst.status.map(|s| s.as_str().to_string()),
                record.nome_fantasia_match.map(|v| v as i64),
                dl_s, dl_a, dl_f, dl_e,
                no_s, no_a, no_f, no_e,
                ge_s, ge_a, ge_f, ge_e,
                pl_s, pl_a, pl_f, pl_e,
                an_s, an_a, an_f, an_e,
                ly_s, ly_a, ly_f, ly_e,
                ts(record.created_at),
                ts(Utc::now()),
            ],
        )
        .context("Failed to upsert record")?;
        Ok(())
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
        let stage_state = |status: Option<String>,
                           started: Option<i64>,
                           finished: Option<i64>,
                           error: Option<String>| StageState {
            status: status.map(|s| StageStatus::from_str_or_pending(&s)),
            started_at: started.map(from_ts),
            finished_at: finished.map(from_ts),
            error,
        };

        let kind: String = row.get("document_kind")?;
        let mut record = Record {
            id: row.get("id")?,
            document: row.get("document")?,
            document_kind: DocumentKind::from_str_or_invalid(&kind),
            document_validated: row.get::<_, i64>("document_validated")? != 0,
            raw: crate::models::RawInput {
                name_raw: row.get("name_raw")?,
                address_raw: row.get("address_raw")?,
                city_raw: row.get("city_raw")?,
                state_raw: row.get("state_raw")?,
                phone_raw: row.get("phone_raw")?,
                zip_raw: row.get("zip_raw")?,
            },
            registry: parse_json_opt(row.get("registry_json")?),
            cpf_info: parse_json_opt(row.get("cpf_json")?),
            divergence_address: row
                .get::<_, Option<i64>>("divergence_address")?
                .map(|v| v != 0),
            normalization: parse_json(row.get("normalization_json")?),
            geo: parse_json(row.get("geo_json")?),
            place: parse_json(row.get("place_json")?),
            visual: parse_json(row.get("visual_json")?),
            scoring: parse_json(row.get("scoring_json")?),
            typology: parse_json(row.get("typology_json")?),
            quality: parse_json(row.get("quality_json")?),
            duplicates: parse_json(row.get("duplicates_json")?),
            confidence: parse_json(row.get("confidence_json")?),
            analyst: parse_json(row.get("analyst_json")?),
            nome_fantasia_match: row
                .get::<_, Option<i64>>("nome_fantasia_match")?
                .map(|v| v as u8),
            stages: Default::default(),
            created_at: from_ts(row.get("created_at")?),
            updated_at: from_ts(row.get("updated_at")?),
        };

        record.stages.doc_lookup = stage_state(
            row.get("doc_lookup_status")?,
            row.get("doc_lookup_started_at")?,
            row.get("doc_lookup_finished_at")?,
            row.get("doc_lookup_error")?,
        );
        record.stages.normalization = stage_state(
            row.get("normalization_status")?,
            row.get("normalization_started_at")?,
            row.get("normalization_finished_at")?,
            row.get("normalization_error")?,
        );
        record.stages.geocoding = stage_state(
            row.get("geocoding_status")?,
            row.get("geocoding_started_at")?,
            row.get("geocoding_finished_at")?,
            row.get("geocoding_error")?,
        );
        record.stages.places = stage_state(
            row.get("places_status")?,
            row.get("places_started_at")?,
            row.get("places_finished_at")?,
            row.get("places_error")?,
        );
        record.stages.analysis = stage_state(
            row.get("analysis_status")?,
            row.get("analysis_started_at")?,
            row.get("analysis_finished_at")?,
            row.get("analysis_error")?,
        );
        record.stages.analyst = stage_state(
            row.get("analyst_stage_status")?,
            row.get("analyst_started_at")?,
            row.get("analyst_finished_at")?,
            row.get("analyst_error")?,
        );
        Ok(record)
    }

    pub fn get_record(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM records WHERE id = ?1",
            params![id],
            Self::row_to_record,
        )
        .optional()
        .context("Failed to load record")
    }

    pub fn get_record_by_document(&self, document: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM records WHERE document = ?1 LIMIT 1",
            params![document],
            Self::row_to_record,
        )
        .optional()
        .context("Failed to load record by document")
    }

    pub fn delete_record(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM photos WHERE record_id = ?1", params![id])?;
        conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn list_records(&self, limit: usize, offset: usize) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM records ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn all_record_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM records ORDER BY created_at")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn list_by_kind(&self, kind: DocumentKind) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM records WHERE document_kind = ?1")?;
        let rows = stmt
            .query_map(params![kind.as_str()], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_records(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Ids eligible for a bulk stage run. With `force`, every record; without,
    /// records whose stage has not reached SUCCESS.
    pub fn candidates_for_stage(&self, stage: Stage, force: bool) -> Result<Vec<String>> {
        let column = Self::stage_status_column(stage);
        let conn = self.conn.lock();
        let sql = if force {
            "SELECT id FROM records ORDER BY created_at".to_string()
        } else {
            format!(
                "SELECT id FROM records WHERE {col} IS NULL OR {col} != 'SUCCESS' ORDER BY created_at",
                col = column
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn stage_status_column(stage: Stage) -> &'static str {
        match stage {
            Stage::DocLookup => "doc_lookup_status",
            Stage::Normalization => "normalization_status",
            Stage::Geocoding => "geocoding_status",
            Stage::Places => "places_status",
            Stage::Analysis => "analysis_status",
            Stage::Analyst => "analyst_stage_status",
        }
    }

    fn stage_time_columns(stage: Stage) -> (&'static str, &'static str, &'static str) {
        match stage {
            Stage::DocLookup => ("doc_lookup_started_at", "doc_lookup_finished_at", "doc_lookup_error"),
            Stage::Normalization => (
                "normalization_started_at",
                "normalization_finished_at",
                "normalization_error",
            ),
            Stage::Geocoding => ("geocoding_started_at", "geocoding_finished_at", "geocoding_error"),
            Stage::Places => ("places_started_at", "places_finished_at", "places_error"),
            Stage::Analysis => ("analysis_started_at", "analysis_finished_at", "analysis_error"),
            Stage::Analyst => ("analyst_started_at", "analyst_finished_at", "analyst_error"),
        }
    }

    /// Counts per status for one stage.
    pub fn stage_counts(&self, stage: Stage) -> Result<HashMap<String, u64>> {
        let column = Self::stage_status_column(stage);
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT COALESCE({col}, 'PENDING') AS s, COUNT(*) FROM records GROUP BY s",
            col = column
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    /// Operator reset of stuck PROCESSING stages. Returns reset count.
    pub fn reset_stuck(&self, timeout_minutes: i64) -> Result<u64> {
        let cutoff = ts(Utc::now()) - timeout_minutes * 60 * 1000;
        let conn = self.conn.lock();
        let mut total = 0u64;
        for stage in Stage::ALL {
            let status_col = Self::stage_status_column(stage);
            let (started_col, _, error_col) = Self::stage_time_columns(stage);
            let sql = format!(
                "UPDATE records SET {status} = 'PENDING', {started} = NULL, {error} = NULL
                 WHERE {status} = 'PROCESSING' AND {started} IS NOT NULL AND {started} < ?1",
                status = status_col,
                started = started_col,
                error = error_col,
            );
            total += conn.execute(&sql, params![cutoff])? as u64;
        }
        debug!(total, timeout_minutes, "Reset stuck records");
        Ok(total)
    }

    /// Exact-equality duplicate candidates on the normalized address.
    pub fn find_by_normalized_address(
        &self,
        address_normalized: &str,
        exclude_id: &str,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM records WHERE address_normalized = ?1 AND id != ?2",
        )?;
        let ids = stmt
            .query_map(params![address_normalized, exclude_id], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Coordinate-proximity duplicate candidates within a bounding square.
    pub fn find_by_coord_box(
        &self,
        lat: f64,
        lng: f64,
        eps: f64,
        exclude_id: &str,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM records
             WHERE lat IS NOT NULL AND lng IS NOT NULL
               AND lat BETWEEN ?1 AND ?2 AND lng BETWEEN ?3 AND ?4
               AND id != ?5",
        )?;
        let ids = stmt
            .query_map(
                params![lat - eps, lat + eps, lng - eps, lng + eps, exclude_id],
                |row| row.get::<_, String>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Photos
    // ------------------------------------------------------------------

    pub fn insert_photo(&self, photo: &Photo) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO photos
               (id, record_id, file_name, external_ref, ordinal, category,
                category_confidence, file_hash, analyzed_by_ai, analysis_result, analyzed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                photo.id,
                photo.record_id,
                photo.file_name,
                photo.external_ref,
                photo.ordinal as i64,
                photo.category.map(|c| c.as_str().to_string()),
                photo.category_confidence.map(|v| v as i64),
                photo.file_hash,
                photo.analyzed_by_ai as i64,
                photo
                    .analysis_result
                    .as_ref()
                    .map(to_json)
                    .transpose()?,
                photo.analyzed_at.map(ts),
            ],
        )
        .context("Failed to insert photo")?;
        Ok(())
    }

    fn row_to_photo(row: &Row) -> rusqlite::Result<Photo> {
        Ok(Photo {
            id: row.get("id")?,
            record_id: row.get("record_id")?,
            file_name: row.get("file_name")?,
            external_ref: row.get("external_ref")?,
            ordinal: row.get::<_, i64>("ordinal")? as u32,
            category: row
                .get::<_, Option<String>>("category")?
                .and_then(|s| PhotoCategory::parse(&s)),
            category_confidence: row
                .get::<_, Option<i64>>("category_confidence")?
                .map(|v| v as u8),
            file_hash: row.get("file_hash")?,
            analyzed_by_ai: row.get::<_, i64>("analyzed_by_ai")? != 0,
            analysis_result: parse_json_opt(row.get("analysis_result")?),
            analyzed_at: row.get::<_, Option<i64>>("analyzed_at")?.map(from_ts),
        })
    }

    pub fn photos_for_record(&self, record_id: &str) -> Result<Vec<Photo>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM photos WHERE record_id = ?1 ORDER BY ordinal")?;
        let photos = stmt
            .query_map(params![record_id], Self::row_to_photo)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    pub fn update_photo(&self, photo: &Photo) -> Result<()> {
        self.insert_photo(photo)
    }

    /// Re-parents all photos of `from` onto `to`, continuing the ordinal run.
    pub fn transfer_photos(&self, from: &str, to: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let next_ordinal: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM photos WHERE record_id = ?1",
            params![to],
            |r| r.get(0),
        )?;
        let moved = conn.execute(
            "UPDATE photos SET record_id = ?1, ordinal = ordinal + ?2 WHERE record_id = ?3",
            params![to, next_ordinal, from],
        )?;
        Ok(moved as u64)
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub fn insert_batch(&self, batch: &Batch) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO batches
               (id, kind, status, total, processed, success, failed, started_at, finished_at, note)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                batch.id,
                batch.kind.as_str(),
                batch.status.as_str(),
                batch.total as i64,
                batch.processed as i64,
                batch.success as i64,
                batch.failed as i64,
                ts(batch.started_at),
                batch.finished_at.map(ts),
                batch.note,
            ],
        )
        .context("Failed to insert batch")?;
        Ok(())
    }

    fn row_to_batch(row: &Row) -> rusqlite::Result<Batch> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        Ok(Batch {
            id: row.get("id")?,
            kind: match kind.as_str() {
                "DOC" => BatchKind::Doc,
                "NORMALIZATION" => BatchKind::Normalization,
                "GEOCODING" => BatchKind::Geocoding,
                "PLACES" => BatchKind::Places,
                "ANALYST" => BatchKind::Analyst,
                _ => BatchKind::Analysis,
            },
            status: match status.as_str() {
                "STARTED" => BatchStatus::Started,
                "COMPLETED" => BatchStatus::Completed,
                "ABORTED" => BatchStatus::Aborted,
                _ => BatchStatus::InProgress,
            },
            total: row.get::<_, i64>("total")? as u32,
            processed: row.get::<_, i64>("processed")? as u32,
            success: row.get::<_, i64>("success")? as u32,
            failed: row.get::<_, i64>("failed")? as u32,
            started_at: from_ts(row.get("started_at")?),
            finished_at: row.get::<_, Option<i64>>("finished_at")?.map(from_ts),
            note: row.get("note")?,
        })
    }

    pub fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM batches WHERE id = ?1",
            params![id],
            Self::row_to_batch,
        )
        .optional()
        .context("Failed to load batch")
    }

    pub fn recent_batches(&self, limit: usize) -> Result<Vec<Batch>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM batches ORDER BY started_at DESC LIMIT ?1")?;
        let batches = stmt
            .query_map(params![limit as i64], Self::row_to_batch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    /// Atomic ledger increment. Flips the batch to COMPLETED when the last
    /// job lands; returns the updated row.
    pub fn increment_batch(&self, id: &str, success: bool) -> Result<Option<Batch>> {
        let now = ts(Utc::now());
        {
            let conn = self.conn.lock();
            conn.execute(
                r#"UPDATE batches SET
                    processed = processed + 1,
                    success = success + CASE WHEN ?2 THEN 1 ELSE 0 END,
                    failed = failed + CASE WHEN ?2 THEN 0 ELSE 1 END,
                    status = CASE WHEN processed + 1 >= total THEN 'COMPLETED' ELSE 'IN_PROGRESS' END,
                    finished_at = CASE WHEN processed + 1 >= total THEN ?3 ELSE finished_at END
                   WHERE id = ?1 AND processed < total"#,
                params![id, success, now],
            )?;
        }
        self.get_batch(id)
    }

    // ------------------------------------------------------------------
    // Analysis cache
    // ------------------------------------------------------------------

    pub fn analysis_cache_get(
        &self,
        photo_hash: &str,
        prompt_version: &str,
        model_id: &str,
        max_age_secs: i64,
    ) -> Result<Option<serde_json::Value>> {
        let min_created = ts(Utc::now()) - max_age_secs * 1000;
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT result FROM analysis_cache
                 WHERE photo_hash = ?1 AND prompt_version = ?2 AND model_id = ?3 AND created_at >= ?4",
                params![photo_hash, prompt_version, model_id, min_created],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub fn analysis_cache_put(
        &self,
        photo_hash: &str,
        prompt_version: &str,
        model_id: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO analysis_cache
               (photo_hash, prompt_version, model_id, result, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                photo_hash,
                prompt_version,
                model_id,
                result.to_string(),
                ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processing log
    // ------------------------------------------------------------------

    pub fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO processing_log
               (correlation_id, timestamp, stage, operation, level, message,
                execution_time_ms, input_json, output_json, transformations_json,
                validations_json, alerts_json)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                entry.correlation_id,
                ts(entry.timestamp),
                entry.stage,
                entry.operation,
                entry.level,
                entry.message,
                entry.execution_time_ms,
                entry.input_json.as_ref().map(|v| v.to_string()),
                entry.output_json.as_ref().map(|v| v.to_string()),
                entry.transformations_json.as_ref().map(|v| v.to_string()),
                entry.validations_json.as_ref().map(|v| v.to_string()),
                entry.alerts_json.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    fn row_to_log(row: &Row) -> rusqlite::Result<ProcessingLogEntry> {
        Ok(ProcessingLogEntry {
            correlation_id: row.get("correlation_id")?,
            timestamp: from_ts(row.get("timestamp")?),
            stage: row.get("stage")?,
            operation: row.get("operation")?,
            level: row.get("level")?,
            message: row.get("message")?,
            execution_time_ms: row.get("execution_time_ms")?,
            input_json: parse_json_opt(row.get("input_json")?),
            output_json: parse_json_opt(row.get("output_json")?),
            transformations_json: parse_json_opt(row.get("transformations_json")?),
            validations_json: parse_json_opt(row.get("validations_json")?),
            alerts_json: parse_json_opt(row.get("alerts_json")?),
        })
    }

    pub fn logs_by_correlation(&self, correlation_id: &str) -> Result<Vec<ProcessingLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM processing_log WHERE correlation_id = ?1 ORDER BY timestamp",
        )?;
        let logs = stmt
            .query_map(params![correlation_id], Self::row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    /// Percentiles over the last 1000 completions of a stage.
    pub fn stage_metrics(&self, stage: &str) -> Result<StageMetrics> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT execution_time_ms FROM processing_log
             WHERE stage = ?1 AND execution_time_ms IS NOT NULL
             ORDER BY timestamp DESC LIMIT 1000",
        )?;
        let mut samples: Vec<i64> = stmt
            .query_map(params![stage], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        samples.sort_unstable();

        if samples.is_empty() {
            return Ok(StageMetrics {
                stage: stage.to_string(),
                count: 0,
                mean_ms: 0.0,
                min_ms: 0,
                max_ms: 0,
                p50_ms: 0,
                p95_ms: 0,
                p99_ms: 0,
            });
        }

        let pct = |p: f64| -> i64 {
            let idx = ((samples.len() as f64 - 1.0) * p).round() as usize;
            samples[idx.min(samples.len() - 1)]
        };
        let sum: i64 = samples.iter().sum();
        Ok(StageMetrics {
            stage: stage.to_string(),
            count: samples.len(),
            mean_ms: sum as f64 / samples.len() as f64,
            min_ms: samples[0],
            max_ms: *samples.last().unwrap(),
            p50_ms: pct(0.50),
            p95_ms: pct(0.95),
            p99_ms: pct(0.99),
        })
    }

    // ------------------------------------------------------------------
    // Cache entries (C2 backing)
    // ------------------------------------------------------------------

    pub fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let now = ts(Utc::now());
        let conn = self.conn.lock();
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((_, Some(expires))) if expires <= now => {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    pub fn cache_set(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> Result<()> {
        let expires = ttl_secs.map(|t| ts(Utc::now()) + t * 1000);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires],
        )?;
        Ok(())
    }

    pub fn cache_ttl_of(&self, key: &str) -> Result<Option<i64>> {
        let now = ts(Utc::now());
        let conn = self.conn.lock();
        let expires: Option<Option<i64>> = conn
            .query_row(
                "SELECT expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(expires.flatten().map(|e| ((e - now) / 1000).max(0)))
    }

    pub fn cache_delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])? > 0)
    }

    pub fn cache_delete_prefix(&self, prefix: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let pattern = format!("{}%", prefix);
        Ok(conn.execute(
            "DELETE FROM cache_entries WHERE key LIKE ?1",
            params![pattern],
        )? as u64)
    }

    pub fn cache_clear(&self) -> Result<u64> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM cache_entries", [])? as u64)
    }

    pub fn cache_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (id, email, name, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.email,
                user.name,
                user.password_hash,
                ts(user.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, email, name, password_hash, created_at FROM users WHERE email = ?1",
            params![email],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    password_hash: row.get(3)?,
                    created_at: from_ts(row.get(4)?),
                })
            },
        )
        .optional()
        .context("Failed to load user")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawInput, Record};

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn opens_file_backed_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cadastro.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        assert_eq!(store.count_records().unwrap(), 0);
        // Re-opening the same file is fine; the schema is idempotent.
        drop(store);
        let store = Store::open(path.to_str().unwrap()).unwrap();
        assert_eq!(store.count_records().unwrap(), 0);
    }

    fn record() -> Record {
        Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput {
                name_raw: Some("Padaria X".to_string()),
                address_raw: Some("R. A, 10".to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn record_round_trip() {
        let store = store();
        let mut rec = record();
        rec.stages.doc_lookup.status = Some(StageStatus::Success);
        rec.normalization.address_normalized = Some("Rua A, 10".to_string());
        rec.geo.lat = Some(-23.55);
        rec.geo.lng = Some(-46.63);
        store.upsert_record(&rec).unwrap();

        let loaded = store.get_record(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.document, rec.document);
        assert_eq!(loaded.stages.doc_lookup.status(), StageStatus::Success);
        assert_eq!(
            loaded.normalization.address_normalized.as_deref(),
            Some("Rua A, 10")
        );
        assert_eq!(loaded.geo.lat, Some(-23.55));
    }

    #[test]
    fn batch_counters_stay_consistent() {
        let store = store();
        let batch = Batch {
            id: "b1".to_string(),
            kind: BatchKind::Geocoding,
            status: BatchStatus::Started,
            total: 2,
            processed: 0,
            success: 0,
            failed: 0,
            started_at: Utc::now(),
            finished_at: None,
            note: None,
        };
        store.insert_batch(&batch).unwrap();

        let b = store.increment_batch("b1", true).unwrap().unwrap();
        assert_eq!(b.processed, 1);
        assert_eq!(b.success, 1);
        assert_eq!(b.status, BatchStatus::InProgress);
        assert_eq!(b.processed, b.success + b.failed);

        let b = store.increment_batch("b1", false).unwrap().unwrap();
        assert_eq!(b.processed, 2);
        assert_eq!(b.failed, 1);
        assert_eq!(b.status, BatchStatus::Completed);
        assert!(b.finished_at.is_some());

        // Over-increment is ignored once the batch is complete.
        let b = store.increment_batch("b1", true).unwrap().unwrap();
        assert_eq!(b.processed, 2);
        assert!(b.processed <= b.total);
    }

    #[test]
    fn cache_expiry_forces_miss() {
        let store = store();
        store.cache_set("cnpj:1", "{}", Some(3600)).unwrap();
        assert_eq!(store.cache_get("cnpj:1").unwrap().as_deref(), Some("{}"));

        store.cache_set("cnpj:2", "{}", Some(-1)).unwrap();
        assert_eq!(store.cache_get("cnpj:2").unwrap(), None);

        store.cache_set("cpf:1", "{}", None).unwrap();
        store.cache_set("cpf:2", "{}", None).unwrap();
        assert_eq!(store.cache_delete_prefix("cpf:").unwrap(), 2);
    }

    #[test]
    fn reset_stuck_only_touches_old_processing() {
        let store = store();
        let mut rec = record();
        rec.stages.geocoding.status = Some(StageStatus::Processing);
        rec.stages.geocoding.started_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.upsert_record(&rec).unwrap();

        let mut fresh = record();
        fresh.stages.geocoding.status = Some(StageStatus::Processing);
        fresh.stages.geocoding.started_at = Some(Utc::now());
        store.upsert_record(&fresh).unwrap();

        let reset = store.reset_stuck(30).unwrap();
        assert_eq!(reset, 1);

        let loaded = store.get_record(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.stages.geocoding.status(), StageStatus::Pending);
        let loaded_fresh = store.get_record(&fresh.id).unwrap().unwrap();
        assert_eq!(loaded_fresh.stages.geocoding.status(), StageStatus::Processing);
    }

    #[test]
    fn photo_transfer_preserves_ordering() {
        let store = store();
        let a = record();
        let b = record();
        store.upsert_record(&a).unwrap();
        store.upsert_record(&b).unwrap();

        for i in 0..2 {
            store
                .insert_photo(&Photo {
                    id: format!("pa{}", i),
                    record_id: a.id.clone(),
                    file_name: None,
                    external_ref: Some(format!("ref{}", i)),
                    ordinal: i,
                    category: None,
                    category_confidence: None,
                    file_hash: None,
                    analyzed_by_ai: false,
                    analysis_result: None,
                    analyzed_at: None,
                })
                .unwrap();
        }
        store
            .insert_photo(&Photo {
                id: "pb0".to_string(),
                record_id: b.id.clone(),
                file_name: None,
                external_ref: None,
                ordinal: 0,
                category: None,
                category_confidence: None,
                file_hash: None,
                analyzed_by_ai: false,
                analysis_result: None,
                analyzed_at: None,
            })
            .unwrap();

        let moved = store.transfer_photos(&a.id, &b.id).unwrap();
        assert_eq!(moved, 2);
        let photos = store.photos_for_record(&b.id).unwrap();
        assert_eq!(photos.len(), 3);
        let ordinals: Vec<u32> = photos.iter().map(|p| p.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn stage_metrics_percentiles() {
        let store = store();
        for i in 1..=100i64 {
            store
                .append_log(&ProcessingLogEntry {
                    correlation_id: "c".to_string(),
                    timestamp: Utc::now(),
                    stage: "geocoding".to_string(),
                    operation: "worker".to_string(),
                    level: "INFO".to_string(),
                    message: "done".to_string(),
                    execution_time_ms: Some(i * 10),
                    input_json: None,
                    output_json: None,
                    transformations_json: None,
                    validations_json: None,
                    alerts_json: None,
                })
                .unwrap();
        }
        let m = store.stage_metrics("geocoding").unwrap();
        assert_eq!(m.count, 100);
        assert_eq!(m.min_ms, 10);
        assert_eq!(m.max_ms, 1000);
        assert!((500..=510).contains(&m.p50_ms));
        assert!(m.p95_ms >= 940);
        assert!((505.0 - m.mean_ms).abs() < 1.0);
    }
}
