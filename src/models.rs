//! Core domain types for the enrichment pipeline.
//!
//! The `Record` is the central entity: it is created on ingest with only a
//! tax document plus untrusted raw hints, and is mutated stage by stage as
//! external sources confirm, replace, or contradict those hints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kind of Brazilian tax document, detected by digit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    Cnpj,
    Cpf,
    Invalid,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Cnpj => "CNPJ",
            DocumentKind::Cpf => "CPF",
            DocumentKind::Invalid => "INVALID",
        }
    }

    pub fn from_str_or_invalid(s: &str) -> Self {
        match s {
            "CNPJ" => DocumentKind::Cnpj,
            "CPF" => DocumentKind::Cpf,
            _ => DocumentKind::Invalid,
        }
    }
}

/// Pipeline stages tracked on the record.
///
/// Duplicate detection runs on its own queue but does not carry a per-record
/// stage slot; it annotates records in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DocLookup,
    Normalization,
    Geocoding,
    Places,
    Analysis,
    Analyst,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::DocLookup,
        Stage::Normalization,
        Stage::Geocoding,
        Stage::Places,
        Stage::Analysis,
        Stage::Analyst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DocLookup => "doc_lookup",
            Stage::Normalization => "normalization",
            Stage::Geocoding => "geocoding",
            Stage::Places => "places",
            Stage::Analysis => "analysis",
            Stage::Analyst => "analyst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "doc" | "doc_lookup" | "doc-lookup" => Some(Stage::DocLookup),
            "normalization" => Some(Stage::Normalization),
            "geocoding" => Some(Stage::Geocoding),
            "places" => Some(Stage::Places),
            "analysis" => Some(Stage::Analysis),
            "analyst" => Some(Stage::Analyst),
            _ => None,
        }
    }
}

/// Status of one stage on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Processing,
    Success,
    Fail,
    NotApplicable,
    Incomplete,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Processing => "PROCESSING",
            StageStatus::Success => "SUCCESS",
            StageStatus::Fail => "FAIL",
            StageStatus::NotApplicable => "NOT_APPLICABLE",
            StageStatus::Incomplete => "INCOMPLETE",
        }
    }

    pub fn from_str_or_pending(s: &str) -> Self {
        match s {
            "PROCESSING" => StageStatus::Processing,
            "SUCCESS" => StageStatus::Success,
            "FAIL" => StageStatus::Fail,
            "NOT_APPLICABLE" => StageStatus::NotApplicable,
            "INCOMPLETE" => StageStatus::Incomplete,
            _ => StageStatus::Pending,
        }
    }

    /// Terminal states never revert except through an operator reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Success
                | StageStatus::Fail
                | StageStatus::NotApplicable
                | StageStatus::Incomplete
        )
    }
}

/// Per-stage bookkeeping on a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageState {
    pub status: Option<StageStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StageState {
    pub fn status(&self) -> StageStatus {
        self.status.unwrap_or(StageStatus::Pending)
    }
}

/// The six stage slots of a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageStates {
    pub doc_lookup: StageState,
    pub normalization: StageState,
    pub geocoding: StageState,
    pub places: StageState,
    pub analysis: StageState,
    pub analyst: StageState,
}

impl StageStates {
    pub fn get(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::DocLookup => &self.doc_lookup,
            Stage::Normalization => &self.normalization,
            Stage::Geocoding => &self.geocoding,
            Stage::Places => &self.places,
            Stage::Analysis => &self.analysis,
            Stage::Analyst => &self.analyst,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageState {
        match stage {
            Stage::DocLookup => &mut self.doc_lookup,
            Stage::Normalization => &mut self.normalization,
            Stage::Geocoding => &mut self.geocoding,
            Stage::Places => &mut self.places,
            Stage::Analysis => &mut self.analysis,
            Stage::Analyst => &mut self.analyst,
        }
    }
}

/// Raw spreadsheet hints. Untrusted except for the document itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInput {
    pub name_raw: Option<String>,
    pub address_raw: Option<String>,
    pub city_raw: Option<String>,
    pub state_raw: Option<String>,
    pub phone_raw: Option<String>,
    pub zip_raw: Option<String>,
}

/// A company partner from the registry's QSA roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partner {
    pub name: String,
    pub tax_id: Option<String>,
    pub role: Option<String>,
    pub since: Option<String>,
}

/// CNPJ registry payload persisted on the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryData {
    pub legal_name: Option<String>,
    pub trade_name: Option<String>,
    pub registry_address: Option<String>,
    pub registry_status: Option<String>,
    pub opening_date: Option<String>,
    pub legal_nature: Option<String>,
    pub main_activity: Option<String>,
    pub simples_nacional: Option<bool>,
    pub mei_optant: Option<bool>,
    pub fiscal_registration_status: Option<String>,
    #[serde(default)]
    pub partners: Vec<Partner>,
    pub capital: Option<f64>,
    pub size: Option<String>,
}

impl RegistryData {
    pub fn is_active(&self) -> bool {
        self.registry_status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("ativa") || s.eq_ignore_ascii_case("active"))
            .unwrap_or(false)
    }
}

/// CPF registry payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpfData {
    pub cpf_name: Option<String>,
    pub cpf_status: Option<String>,
    pub cpf_birth: Option<String>,
    pub cpf_deceased: Option<bool>,
}

/// Output of the address normalization stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizationData {
    pub address_normalized: Option<String>,
    pub city_normalized: Option<String>,
    pub state_normalized: Option<String>,
    pub confidence: Option<u8>,
    pub source: Option<String>,
    #[serde(default)]
    pub divergences: Vec<String>,
}

/// Output of the geocoding stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoData {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub formatted_address: Option<String>,
    pub place_hint: Option<String>,
    pub validated: Option<bool>,
    pub within_state: Option<bool>,
    pub within_city: Option<bool>,
    pub distance_to_center_m: Option<f64>,
    pub confidence: Option<u8>,
    pub source: Option<String>,
    pub max_divergence_m: Option<f64>,
}

/// How the two Places search modes were reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceCrossMethod {
    Nearby,
    Text,
    BothMatch,
}

impl PlaceCrossMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceCrossMethod::Nearby => "nearby",
            PlaceCrossMethod::Text => "text",
            PlaceCrossMethod::BothMatch => "both_match",
        }
    }
}

/// A single open interval within a day, "HH:MM" 24h.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenInterval {
    pub open: String,
    pub close: String,
}

/// Output of the places stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaceData {
    pub place_id: Option<String>,
    pub establishment_type: Option<String>,
    pub types_primary: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    /// Day-of-week (0 = Sunday) to open intervals.
    pub opening_hours: Option<HashMap<u8, Vec<OpenInterval>>>,
    pub phone: Option<String>,
    pub website: Option<String>,
    #[serde(default)]
    pub photo_refs: Vec<String>,
    pub name_validated: Option<bool>,
    pub address_validated: Option<bool>,
    pub cross_confidence: Option<u8>,
    pub cross_method: Option<PlaceCrossMethod>,
    pub accepted_by_high_address: Option<bool>,
}

/// Signage quality judged from facade photos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignageQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfessionalismLevel {
    High,
    Medium,
    Low,
}

/// Output of the photo analysis stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualData {
    pub signage_quality: Option<SignageQuality>,
    pub branding_present: Option<bool>,
    pub professionalism_level: Option<ProfessionalismLevel>,
    pub audience: Option<String>,
    pub ambience: Option<String>,
    pub visual_indicators: Option<Value>,
    pub confidence: Option<u8>,
    /// How many independent vision sources contributed.
    pub sources_available: Option<u8>,
    /// At least one photo's classification vote split across sources.
    pub classification_disputed: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PotentialCategory {
    High,
    Medium,
    Low,
}

impl PotentialCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PotentialCategory::High => "HIGH",
            PotentialCategory::Medium => "MEDIUM",
            PotentialCategory::Low => "LOW",
        }
    }
}

/// Sales-potential rubric result (0..70).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringData {
    pub potential_score: Option<u8>,
    pub potential_category: Option<PotentialCategory>,
    pub breakdown: Option<Value>,
}

/// Commercial typology assigned by the analyst.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypologyData {
    pub code: Option<String>,
    pub name: Option<String>,
    pub confidence: Option<u8>,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    Poor,
    Fair,
    High,
    Excellent,
}

/// Field-population quality summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityData {
    pub score: Option<u8>,
    pub tier: Option<QualityTier>,
    pub populated_field_count: Option<u32>,
    #[serde(default)]
    pub critical_missing_fields: Vec<String>,
    #[serde(default)]
    pub validated_sources: Vec<String>,
}

/// Relation discovered by the QSA cross-check for CPF records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpfPartnerRelation {
    pub company_id: String,
    pub company_name: Option<String>,
    pub company_cnpj: String,
    pub partner_role: Option<String>,
    pub since: Option<String>,
}

/// Duplicate-detection annotations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuplicateData {
    #[serde(default)]
    pub address_ids: Vec<String>,
    pub count: Option<u32>,
    pub alert: Option<bool>,
    pub cpf_is_partner: Option<bool>,
    pub cpf_partner_relation: Option<CpfPartnerRelation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceCategory {
    Excellent,
    High,
    Medium,
    Low,
}

impl ConfidenceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceCategory::Excellent => "EXCELLENT",
            ConfidenceCategory::High => "HIGH",
            ConfidenceCategory::Medium => "MEDIUM",
            ConfidenceCategory::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    Green,
    Yellow,
    Orange,
    Red,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Green => "GREEN",
            ConfidenceLevel::Yellow => "YELLOW",
            ConfidenceLevel::Orange => "ORANGE",
            ConfidenceLevel::Red => "RED",
        }
    }
}

/// Aggregated universal confidence persisted on the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceData {
    pub overall: Option<u8>,
    pub category: Option<ConfidenceCategory>,
    pub level: Option<ConfidenceLevel>,
    pub needs_review: Option<bool>,
    #[serde(default)]
    pub alerts: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalystStatus {
    Approved,
    ApprovedWithCaveats,
    Rejected,
    RequiresReview,
}

impl AnalystStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalystStatus::Approved => "APPROVED",
            AnalystStatus::ApprovedWithCaveats => "APPROVED_WITH_CAVEATS",
            AnalystStatus::Rejected => "REJECTED",
            AnalystStatus::RequiresReview => "REQUIRES_REVIEW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => Some(AnalystStatus::Approved),
            "APPROVED_WITH_CAVEATS" => Some(AnalystStatus::ApprovedWithCaveats),
            "REJECTED" => Some(AnalystStatus::Rejected),
            "REQUIRES_REVIEW" => Some(AnalystStatus::RequiresReview),
            _ => None,
        }
    }
}

/// Final holistic verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalystData {
    pub status: Option<AnalystStatus>,
    pub confidence: Option<u8>,
    pub summary: Option<String>,
    #[serde(default)]
    pub critical_alerts: Vec<String>,
    #[serde(default)]
    pub secondary_alerts: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub divergences: Vec<String>,
    #[serde(default)]
    pub trusted_fields: Vec<String>,
    #[serde(default)]
    pub untrusted_fields: Vec<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One candidate establishment, mutated through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Digits only; the single a-priori trusted input field.
    pub document: String,
    pub document_kind: DocumentKind,
    /// Set when the relevant registry confirmed the document.
    pub document_validated: bool,
    #[serde(default)]
    pub raw: RawInput,
    pub registry: Option<RegistryData>,
    pub cpf_info: Option<CpfData>,
    /// Raw address vs. registry address disagreed below the similarity floor.
    pub divergence_address: Option<bool>,
    #[serde(default)]
    pub normalization: NormalizationData,
    #[serde(default)]
    pub geo: GeoData,
    #[serde(default)]
    pub place: PlaceData,
    #[serde(default)]
    pub visual: VisualData,
    #[serde(default)]
    pub scoring: ScoringData,
    #[serde(default)]
    pub typology: TypologyData,
    #[serde(default)]
    pub quality: QualityData,
    #[serde(default)]
    pub duplicates: DuplicateData,
    #[serde(default)]
    pub confidence: ConfidenceData,
    #[serde(default)]
    pub analyst: AnalystData,
    /// Best pairwise trade-name similarity, percent.
    pub nome_fantasia_match: Option<u8>,
    #[serde(default)]
    pub stages: StageStates,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(document_digits: String, kind: DocumentKind, raw: RawInput) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document: document_digits,
            document_kind: kind,
            document_validated: false,
            raw,
            registry: None,
            cpf_info: None,
            divergence_address: None,
            normalization: NormalizationData::default(),
            geo: GeoData::default(),
            place: PlaceData::default(),
            visual: VisualData::default(),
            scoring: ScoringData::default(),
            typology: TypologyData::default(),
            quality: QualityData::default(),
            duplicates: DuplicateData::default(),
            confidence: ConfidenceData::default(),
            analyst: AnalystData::default(),
            nome_fantasia_match: None,
            stages: StageStates::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Best available trade name for hints and matching.
    pub fn name_hint(&self) -> Option<&str> {
        self.registry
            .as_ref()
            .and_then(|r| r.trade_name.as_deref())
            .or(self.raw.name_raw.as_deref())
    }

    /// Best available address for geocoding.
    pub fn best_address(&self) -> Option<&str> {
        self.normalization
            .address_normalized
            .as_deref()
            .or_else(|| {
                self.registry
                    .as_ref()
                    .and_then(|r| r.registry_address.as_deref())
            })
            .or(self.raw.address_raw.as_deref())
    }

    pub fn best_city(&self) -> Option<&str> {
        self.normalization
            .city_normalized
            .as_deref()
            .or(self.raw.city_raw.as_deref())
    }

    pub fn best_state(&self) -> Option<&str> {
        self.normalization
            .state_normalized
            .as_deref()
            .or(self.raw.state_raw.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhotoCategory {
    Facade,
    Interior,
    Product,
    Menu,
    Other,
}

impl PhotoCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoCategory::Facade => "FACADE",
            PhotoCategory::Interior => "INTERIOR",
            PhotoCategory::Product => "PRODUCT",
            PhotoCategory::Menu => "MENU",
            PhotoCategory::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FACADE" | "FACHADA" => Some(PhotoCategory::Facade),
            "INTERIOR" => Some(PhotoCategory::Interior),
            "PRODUCT" | "PRODUTO" => Some(PhotoCategory::Product),
            "MENU" | "CARDAPIO" => Some(PhotoCategory::Menu),
            "OTHER" | "OUTRO" => Some(PhotoCategory::Other),
            _ => None,
        }
    }
}

/// A photo owned by exactly one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    pub id: String,
    pub record_id: String,
    /// Relative filename under the photo dir, when bytes were persisted.
    pub file_name: Option<String>,
    /// Provider reference for on-demand refetch when no local copy exists.
    pub external_ref: Option<String>,
    pub ordinal: u32,
    pub category: Option<PhotoCategory>,
    pub category_confidence: Option<u8>,
    pub file_hash: Option<String>,
    pub analyzed_by_ai: bool,
    pub analysis_result: Option<Value>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchKind {
    Doc,
    Normalization,
    Geocoding,
    Places,
    Analysis,
    Analyst,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Doc => "DOC",
            BatchKind::Normalization => "NORMALIZATION",
            BatchKind::Geocoding => "GEOCODING",
            BatchKind::Places => "PLACES",
            BatchKind::Analysis => "ANALYSIS",
            BatchKind::Analyst => "ANALYST",
        }
    }

    pub fn from_stage(stage: Stage) -> Self {
        match stage {
            Stage::DocLookup => BatchKind::Doc,
            Stage::Normalization => BatchKind::Normalization,
            Stage::Geocoding => BatchKind::Geocoding,
            Stage::Places => BatchKind::Places,
            Stage::Analysis => BatchKind::Analysis,
            Stage::Analyst => BatchKind::Analyst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Started,
    InProgress,
    Completed,
    Aborted,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Started => "STARTED",
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Aborted => "ABORTED",
        }
    }
}

/// Ledger row for one user-triggered bulk run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub kind: BatchKind,
    pub status: BatchStatus,
    pub total: u32,
    pub processed: u32,
    pub success: u32,
    pub failed: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// One row of the ingest payload. Only `document` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateRow {
    pub document: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub phone: Option<String>,
    pub zip: Option<String>,
}

/// Weights and cutoffs of the universal confidence aggregator.
///
/// Derived empirically upstream; kept configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub normalization: f64,
    pub geocoding: f64,
    pub places: f64,
    pub visual: f64,
    pub name_match: f64,
    pub document: f64,
    pub cutoff_excellent: u8,
    pub cutoff_high: u8,
    pub cutoff_medium: u8,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            normalization: 0.15,
            geocoding: 0.25,
            places: 0.25,
            visual: 0.15,
            name_match: 0.10,
            document: 0.10,
            cutoff_excellent: 85,
            cutoff_high: 70,
            cutoff_medium: 50,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub jwt_secret: String,
    pub photo_dir: String,
    pub admin_email: String,
    pub admin_password: String,

    pub cnpj_api_url: String,
    pub cnpj_api_key: Option<String>,
    pub cpf_api_url: String,
    pub cpf_token_url: String,
    pub cpf_client_id: Option<String>,
    pub cpf_client_secret: Option<String>,
    pub cpf_fallback_url: String,
    pub geocoder_a_url: String,
    pub geocoder_a_key: Option<String>,
    pub geocoder_b_url: String,
    pub places_url: String,
    pub places_key: Option<String>,
    pub llm_a_url: String,
    pub llm_a_key: Option<String>,
    pub llm_b_url: String,
    pub llm_b_key: Option<String>,
    pub llm_a_model: String,
    pub llm_b_model: String,
    /// Deep-analysis vision model id; cost knob.
    pub vision_model: String,
    pub vision_precls_model: String,
    pub analyst_model: String,
    pub prompt_version: String,

    pub ttl_cnpj_secs: i64,
    pub ttl_cpf_secs: i64,
    pub ttl_geocode_secs: i64,
    pub ttl_places_secs: i64,
    pub ttl_analysis_secs: i64,

    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub queue_highwater_mult: usize,
    pub reset_stuck_minutes: i64,

    pub weights: ConfidenceWeights,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        const DAY: i64 = 86_400;

        let mut weights = ConfidenceWeights::default();
        weights.normalization = env_parse("CONFIDENCE_W_NORMALIZATION", weights.normalization);
        weights.geocoding = env_parse("CONFIDENCE_W_GEOCODING", weights.geocoding);
        weights.places = env_parse("CONFIDENCE_W_PLACES", weights.places);
        weights.visual = env_parse("CONFIDENCE_W_VISUAL", weights.visual);
        weights.name_match = env_parse("CONFIDENCE_W_NAME_MATCH", weights.name_match);
        weights.document = env_parse("CONFIDENCE_W_DOCUMENT", weights.document);
        weights.cutoff_excellent =
            env_parse("CONFIDENCE_CUTOFF_EXCELLENT", weights.cutoff_excellent);
        weights.cutoff_high = env_parse("CONFIDENCE_CUTOFF_HIGH", weights.cutoff_high);
        weights.cutoff_medium = env_parse("CONFIDENCE_CUTOFF_MEDIUM", weights.cutoff_medium);

        Ok(Self {
            database_path: env_string("DATABASE_PATH", "./cadastro.db"),
            port: env_parse("PORT", 8080),
            jwt_secret: env_string("JWT_SECRET", "change-me-in-production"),
            photo_dir: env_string("PHOTO_DIR", "./photos"),
            admin_email: env_string("ADMIN_EMAIL", "admin@local"),
            admin_password: env_string("ADMIN_PASSWORD", "admin"),

            cnpj_api_url: env_string("CNPJ_API_URL", "https://publica.cnpj.ws/cnpj"),
            cnpj_api_key: env_opt("CNPJ_API_KEY"),
            cpf_api_url: env_string(
                "CPF_API_URL",
                "https://gateway.apiserpro.serpro.gov.br/consulta-cpf-df/v1/cpf",
            ),
            cpf_token_url: env_string(
                "CPF_TOKEN_URL",
                "https://gateway.apiserpro.serpro.gov.br/token",
            ),
            cpf_client_id: env_opt("CPF_CLIENT_ID"),
            cpf_client_secret: env_opt("CPF_CLIENT_SECRET"),
            cpf_fallback_url: env_string("CPF_FALLBACK_URL", "https://api.cpfcnpj.com.br/cpf"),
            geocoder_a_url: env_string(
                "GEOCODER_A_URL",
                "https://maps.googleapis.com/maps/api/geocode/json",
            ),
            geocoder_a_key: env_opt("GEOCODER_A_KEY"),
            geocoder_b_url: env_string(
                "GEOCODER_B_URL",
                "https://nominatim.openstreetmap.org/search",
            ),
            places_url: env_string("PLACES_URL", "https://places.googleapis.com/v1"),
            places_key: env_opt("PLACES_KEY"),
            llm_a_url: env_string("LLM_A_URL", "https://api.anthropic.com/v1/messages"),
            llm_a_key: env_opt("LLM_A_KEY"),
            llm_b_url: env_string("LLM_B_URL", "https://api.openai.com/v1/chat/completions"),
            llm_b_key: env_opt("LLM_B_KEY"),
            llm_a_model: env_string("LLM_A_MODEL", "claude-3-5-haiku-latest"),
            llm_b_model: env_string("LLM_B_MODEL", "gpt-4o-mini"),
            vision_model: env_string("VISION_MODEL", "claude-3-5-haiku-latest"),
            vision_precls_model: env_string("VISION_PRECLS_MODEL", "claude-3-5-haiku-latest"),
            analyst_model: env_string("ANALYST_MODEL", "claude-sonnet-4"),
            prompt_version: env_string("PROMPT_VERSION", "v3"),

            ttl_cnpj_secs: env_parse("TTL_CNPJ_SECS", 30 * DAY),
            ttl_cpf_secs: env_parse("TTL_CPF_SECS", 7 * DAY),
            ttl_geocode_secs: env_parse("TTL_GEOCODE_SECS", 30 * DAY),
            ttl_places_secs: env_parse("TTL_PLACES_SECS", 30 * DAY),
            ttl_analysis_secs: env_parse("TTL_ANALYSIS_SECS", 30 * DAY),

            backoff_base_ms: env_parse("BACKOFF_BASE_MS", 2000),
            backoff_cap_ms: env_parse("BACKOFF_CAP_MS", 30_000),
            queue_highwater_mult: env_parse("QUEUE_HIGHWATER_MULT", 10),
            reset_stuck_minutes: env_parse("RESET_STUCK_MINUTES", 30),

            weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_terminality() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Processing.is_terminal());
        assert!(StageStatus::Success.is_terminal());
        assert!(StageStatus::Fail.is_terminal());
        assert!(StageStatus::NotApplicable.is_terminal());
        assert!(StageStatus::Incomplete.is_terminal());
    }

    #[test]
    fn stage_parse_accepts_aliases() {
        assert_eq!(Stage::parse("doc"), Some(Stage::DocLookup));
        assert_eq!(Stage::parse("doc-lookup"), Some(Stage::DocLookup));
        assert_eq!(Stage::parse("analyst"), Some(Stage::Analyst));
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn record_best_address_priority() {
        let mut record = Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput {
                address_raw: Some("R. A, 10".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(record.best_address(), Some("R. A, 10"));

        record.registry = Some(RegistryData {
            registry_address: Some("Rua A, 10, Centro".to_string()),
            ..Default::default()
        });
        assert_eq!(record.best_address(), Some("Rua A, 10, Centro"));

        record.normalization.address_normalized = Some("Rua A, 10".to_string());
        assert_eq!(record.best_address(), Some("Rua A, 10"));
    }

    #[test]
    fn analyst_status_round_trip() {
        for s in [
            AnalystStatus::Approved,
            AnalystStatus::ApprovedWithCaveats,
            AnalystStatus::Rejected,
            AnalystStatus::RequiresReview,
        ] {
            assert_eq!(AnalystStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(
            AnalystStatus::parse("approved"),
            Some(AnalystStatus::Approved)
        );
        assert_eq!(AnalystStatus::parse("nope"), None);
    }
}
