//! Labor-law violation datasets published as JSON arrays or CSV.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{
    parse_compact_date, NaturalKey, Payload, Provenance, RawDisclosureRecord, SourceKind,
};
use radar_storage::{sha256_hex, CacheKey, FetchRequest, HttpFetcher};
use serde_json::Value as JsonValue;
use tokio::fs;

use crate::{
    json_scalar_text, parse_amount, AdapterContext, AdapterError, DataFormat, DatasetConfig,
    DisclosureAdapter, FetchedPage, ParseError, SourceConfig, SyncUnit, UnitSelection,
};

pub const LABOR_DATASETS: [&str; 8] = [
    "LaborStandards",
    "GenderEquality",
    "Pension",
    "EmploymentService",
    "OccupationalSafety",
    "Insurance",
    "MiddleAged",
    "Union",
];

/// Publishers disagree on the company-name column; first non-empty wins.
const NAME_COLUMNS: [&str; 3] = ["事業單位名稱(公佈版)", "事業單位名稱", "事業單位名稱或負責人"];
const LAW_COLUMNS: [&str; 2] = ["違反法規條款", "違法法規法條"];

type Row = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct LaborViolationAdapter {
    tag: String,
    datasets: Vec<DatasetConfig>,
    data_dir: PathBuf,
}

impl LaborViolationAdapter {
    pub fn from_config(config: &SourceConfig, data_dir: PathBuf) -> Self {
        let datasets = if config.datasets.is_empty() {
            LABOR_DATASETS
                .iter()
                .map(|tag| DatasetConfig {
                    tag: tag.to_string(),
                    url: None,
                    format: DataFormat::Json,
                })
                .collect()
        } else {
            config.datasets.clone()
        };
        Self {
            tag: config.tag.clone(),
            datasets,
            data_dir,
        }
    }

    fn dataset(&self, tag: &str) -> Result<&DatasetConfig, AdapterError> {
        self.datasets
            .iter()
            .find(|d| d.tag == tag)
            .ok_or_else(|| AdapterError::Message(format!("unknown labor dataset {tag}")))
    }

    async fn read_local(&self, dataset: &DatasetConfig) -> Result<FetchedPage, AdapterError> {
        let path = self
            .data_dir
            .join(format!("{}.{}", dataset.tag, dataset.format.extension()));
        let body = fs::read(&path).await.map_err(|err| {
            AdapterError::Message(format!("reading {}: {err}", path.display()))
        })?;
        let fetched_at = fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(FetchedPage {
            url: format!("file://{}", path.display()),
            content_type: dataset.format.content_type().to_string(),
            sha256: sha256_hex(&body),
            body,
            fetched_at,
            from_cache: true,
        })
    }
}

fn json_rows(body: &[u8]) -> Result<Vec<Row>, ParseError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let JsonValue::Array(items) = value else {
        return Err(ParseError::Shape("expected a JSON array of violation rows".into()));
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(map) => Some(
                map.into_iter()
                    .filter_map(|(k, v)| json_scalar_text(Some(&v)).map(|text| (k, text)))
                    .collect(),
            ),
            _ => None,
        })
        .collect())
}

fn csv_rows(body: &[u8]) -> Result<Vec<Row>, ParseError> {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(body);
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

fn first_of<'a>(row: &'a Row, columns: &[&str]) -> Option<&'a str> {
    columns
        .iter()
        .filter_map(|column| row.get(*column))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

fn date_value(row: &Row, column: &str) -> JsonValue {
    row.get(column)
        .and_then(|raw| parse_compact_date(raw))
        .map_or(JsonValue::Null, |d| JsonValue::String(d.to_string()))
}

fn text_value(value: Option<&str>) -> JsonValue {
    value
        .and_then(crate::text_or_none)
        .map_or(JsonValue::Null, JsonValue::String)
}

/// Map one published row; rows without any company name are dropped.
pub fn violation_record(dataset: &str, row: &Row, provenance: &Provenance) -> Option<RawDisclosureRecord> {
    let name = first_of(row, &NAME_COLUMNS)?.to_string();
    let disposition = row.get("處分字號").map(String::as_str);

    let mut payload = Payload::new();
    payload.insert("authority".into(), text_value(row.get("主管機關").map(String::as_str)));
    payload.insert("penalty_date".into(), date_value(row, "處分日期"));
    payload.insert("announcement_date".into(), date_value(row, "公告日期"));
    payload.insert("disposition_no".into(), text_value(disposition));
    payload.insert("law_article".into(), text_value(first_of(row, &LAW_COLUMNS)));
    payload.insert(
        "violation_content".into(),
        text_value(row.get("違反法規內容").map(String::as_str)),
    );
    payload.insert(
        "fine_amount".into(),
        JsonValue::from(row.get("罰鍰金額").map_or(0, |raw| parse_amount(raw))),
    );

    Some(RawDisclosureRecord {
        source_kind: SourceKind::LaborViolation,
        source_tag: dataset.to_string(),
        raw_company_name: name,
        raw_company_code: None,
        raw_tax_id: None,
        natural_key: NaturalKey::disposition(disposition),
        roc_year: None,
        market: None,
        era: None,
        payload,
        provenance: provenance.clone(),
    })
}

#[async_trait]
impl DisclosureAdapter for LaborViolationAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::LaborViolation
    }

    fn source_tag(&self) -> &str {
        &self.tag
    }

    fn units(&self, selection: &UnitSelection, _now: DateTime<Utc>) -> Vec<SyncUnit> {
        self.datasets
            .iter()
            .filter(|d| selection.wants_dataset(&d.tag))
            .map(|d| SyncUnit::Dataset { tag: d.tag.clone() })
            .collect()
    }

    async fn fetch_unit(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        unit: &SyncUnit,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let SyncUnit::Dataset { tag } = unit else {
            return Err(AdapterError::Message(format!(
                "labor datasets expect dataset units, got {}",
                unit.label()
            )));
        };
        let dataset = self.dataset(tag)?;

        let page = match &dataset.url {
            Some(url) => {
                let key = CacheKey::dated(
                    ctx.started_at,
                    &self.tag,
                    &dataset.tag,
                    dataset.format.extension(),
                );
                let payload = http.fetch(&FetchRequest::get(url.clone(), Vec::new()), &key).await?;
                FetchedPage::from_payload(payload, dataset.format.content_type())
            }
            None => self.read_local(dataset).await?,
        };
        Ok(vec![page])
    }

    fn parse_unit(
        &self,
        unit: &SyncUnit,
        pages: &[FetchedPage],
    ) -> Result<Vec<RawDisclosureRecord>, AdapterError> {
        let SyncUnit::Dataset { tag } = unit else {
            return Ok(Vec::new());
        };
        let dataset = self.dataset(tag)?;

        let mut records = Vec::new();
        for page in pages {
            let rows = match dataset.format {
                DataFormat::Json => json_rows(&page.body)?,
                DataFormat::Csv => csv_rows(&page.body)?,
            };
            let provenance = page.provenance();
            let total = rows.len();
            records.extend(
                rows.iter()
                    .filter_map(|row| violation_record(&dataset.tag, row, &provenance)),
            );
            tracing::debug!(dataset = %dataset.tag, rows = total, kept = records.len(), "parsed labor dataset");
        }
        Ok(records)
    }
}
