//! Source adapter contracts + per-source fetch/parse implementations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{current_roc_year, MarketSegment, Provenance, RawDisclosureRecord, SourceKind};
use radar_storage::{FetchError, FetchedPayload, HttpFetcher};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod detail;
pub mod environmental;
pub mod labor;
pub mod mops;
pub mod tables;

pub use detail::{parse_company_detail, CompanyDetail, DetailScraper};
pub use environmental::EnvironmentalPenaltyAdapter;
pub use labor::LaborViolationAdapter;
pub use mops::MopsTableAdapter;
pub use tables::{parse_table, TableSchema, TableSchemaRegistry};

pub const CRATE_NAME: &str = "radar-adapters";

/// First ROC year the exchange publishes the compensation tables for.
pub const DEFAULT_FIRST_ROC_YEAR: i32 = 107;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl FetchedPage {
    pub fn from_payload(payload: FetchedPayload, content_type: impl Into<String>) -> Self {
        Self {
            url: payload.url,
            content_type: content_type.into(),
            body: payload.body,
            sha256: payload.sha256,
            fetched_at: payload.fetched_at,
            from_cache: payload.from_cache,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            source_url: self.url.clone(),
            payload_sha256: self.sha256.clone(),
            fetched_at: self.fetched_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Day stamp for cache namespaces.
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self { run_id, started_at }
    }
}

/// One isolated unit of work within a source sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum SyncUnit {
    Period { roc_year: i32, market: MarketSegment },
    Dataset { tag: String },
}

impl SyncUnit {
    pub fn label(&self) -> String {
        match self {
            SyncUnit::Period { roc_year, market } => format!("{market}/{roc_year}"),
            SyncUnit::Dataset { tag } => tag.clone(),
        }
    }
}

/// Caller-side narrowing of a source's unit axis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSelection {
    pub from_year: Option<i32>,
    pub to_year: Option<i32>,
    /// Empty means every market segment.
    pub markets: Vec<MarketSegment>,
    /// Empty means every configured dataset.
    pub datasets: Vec<String>,
}

impl UnitSelection {
    pub fn markets(&self) -> Vec<MarketSegment> {
        if self.markets.is_empty() {
            MarketSegment::ALL.to_vec()
        } else {
            self.markets.clone()
        }
    }

    pub fn wants_dataset(&self, tag: &str) -> bool {
        self.datasets.is_empty() || self.datasets.iter().any(|d| d.eq_ignore_ascii_case(tag))
    }

    /// Inclusive ROC year range clamped to `first_year`.
    pub fn years(&self, first_year: i32, now: DateTime<Utc>) -> Vec<i32> {
        let from = self.from_year.unwrap_or(first_year).max(first_year);
        let to = self.to_year.unwrap_or_else(|| current_roc_year(now));
        (from..=to).collect()
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid delimited payload: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("unexpected payload shape: {0}")]
    Shape(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait DisclosureAdapter: Send + Sync {
    fn source_kind(&self) -> SourceKind;
    fn source_tag(&self) -> &str;

    /// Fails fast on configuration the source cannot run without.
    fn preflight(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn units(&self, selection: &UnitSelection, now: DateTime<Utc>) -> Vec<SyncUnit>;

    async fn fetch_unit(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        unit: &SyncUnit,
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    fn parse_unit(
        &self,
        unit: &SyncUnit,
        pages: &[FetchedPage],
    ) -> Result<Vec<RawDisclosureRecord>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    #[default]
    Json,
    Csv,
}

impl DataFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DataFormat::Json => "json",
            DataFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            DataFormat::Json => "application/json",
            DataFormat::Csv => "text/csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub tag: String,
    /// Download endpoint; without it the dataset is read from the local drop directory.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub format: DataFormat,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub tag: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    /// Form field carrying the ROC year; the name differs per endpoint.
    #[serde(default)]
    pub year_param: Option<String>,
    #[serde(default)]
    pub first_year: Option<i32>,
    /// Fixed request parameters sent with every unit.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Upper bound on pages fetched per unit for paginated APIs.
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Run-level inputs shared by every adapter.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub schemas: Arc<TableSchemaRegistry>,
    pub moenv_api_key: Option<String>,
    pub data_dir: PathBuf,
}

pub fn adapter_for_source(
    config: &SourceConfig,
    settings: &AdapterSettings,
) -> Result<Box<dyn DisclosureAdapter>, AdapterError> {
    match config.kind {
        SourceKind::EmployeeBenefit
        | SourceKind::NonManagerSalary
        | SourceKind::WelfarePolicy
        | SourceKind::SalaryAdjustment => Ok(Box::new(MopsTableAdapter::from_config(
            config,
            settings.schemas.clone(),
        )?)),
        SourceKind::LaborViolation => Ok(Box::new(LaborViolationAdapter::from_config(
            config,
            settings.data_dir.clone(),
        ))),
        SourceKind::EnvironmentalPenalty => Ok(Box::new(EnvironmentalPenaltyAdapter::from_config(
            config,
            settings.moenv_api_key.clone(),
        )?)),
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Cell text with all whitespace runs removed, `&nbsp;` included.
pub(crate) fn compact_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(|chunk| chunk.chars())
        .filter(|c| !c.is_whitespace())
        .collect()
}

pub(crate) fn trimmed_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .replace('\u{a0}', " ")
        .trim()
        .to_string()
}

/// Digits-only amount; anything without digits is zero.
pub(crate) fn parse_amount(raw: &str) -> i64 {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// String view of a JSON scalar, `null`-ish placeholders dropped.
pub(crate) fn json_scalar_text(value: Option<&JsonValue>) -> Option<String> {
    let text = match value? {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || matches!(trimmed.to_ascii_lowercase().as_str(), "null" | "none") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_year_axis_runs_from_first_year_to_current_roc_year() {
        let now = DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let selection = UnitSelection::default();
        let years = selection.years(DEFAULT_FIRST_ROC_YEAR, now);
        assert_eq!(years.first(), Some(&107));
        assert_eq!(years.last(), Some(&115));

        let narrowed = UnitSelection {
            from_year: Some(100),
            to_year: Some(110),
            ..Default::default()
        };
        assert_eq!(narrowed.years(113, now), Vec::<i32>::new());
        assert_eq!(narrowed.years(108, now), vec![108, 109, 110]);
        assert_eq!(selection.markets(), vec![MarketSegment::Sii, MarketSegment::Otc]);
    }

    #[test]
    fn sources_yaml_entries_deserialize_with_defaults() {
        let yaml = r#"
kind: labor_violation
tag: labor
datasets:
  - tag: LaborStandards
  - tag: Union
    format: csv
    url: https://example.invalid/union.csv
"#;
        let config: SourceConfig = serde_yaml::from_str(yaml).expect("config");
        assert!(config.enabled);
        assert_eq!(config.kind, SourceKind::LaborViolation);
        assert_eq!(config.datasets[0].format, DataFormat::Json);
        assert_eq!(config.datasets[1].format, DataFormat::Csv);
        assert!(config.datasets[0].url.is_none());
    }

    #[test]
    fn amounts_keep_digits_only() {
        assert_eq!(parse_amount("NT$ 1,200,000 元"), 1_200_000);
        assert_eq!(parse_amount(""), 0);
        assert_eq!(parse_amount("無"), 0);
    }
}
