//! Environmental penalty records (EMS_P_46) from the paginated open-data API.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use radar_core::{
    parse_compact_date, NaturalKey, Payload, Provenance, RawDisclosureRecord, SourceKind,
};
use radar_storage::{CacheKey, FetchRequest, HttpFetcher};
use serde_json::{Map, Value as JsonValue};

use crate::{
    json_scalar_text, parse_amount, AdapterContext, AdapterError, DisclosureAdapter, FetchedPage,
    ParseError, SourceConfig, SyncUnit, UnitSelection,
};

pub const MOENV_API_URL: &str = "https://data.moenv.gov.tw/api/v2/EMS_P_46";
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct EnvironmentalPenaltyAdapter {
    tag: String,
    url: String,
    api_key: Option<String>,
    page_size: usize,
    max_pages: usize,
}

impl EnvironmentalPenaltyAdapter {
    pub fn from_config(config: &SourceConfig, api_key: Option<String>) -> Result<Self, AdapterError> {
        let page_size = config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(AdapterError::Message(format!(
                "{}: page_size must be positive",
                config.tag
            )));
        }
        Ok(Self {
            tag: config.tag.clone(),
            url: config.url.clone().unwrap_or_else(|| MOENV_API_URL.to_string()),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            page_size,
            max_pages: config.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1),
        })
    }

    fn page_request(&self, api_key: &str, offset: usize) -> FetchRequest {
        FetchRequest::get(
            self.url.clone(),
            vec![
                ("format".to_string(), "json".to_string()),
                ("api_key".to_string(), api_key.to_string()),
                ("offset".to_string(), offset.to_string()),
                ("limit".to_string(), self.page_size.to_string()),
            ],
        )
    }
}

/// Rows of one API page; the API answers with a bare list or a `records` envelope.
pub fn page_records(body: &[u8]) -> Result<Vec<JsonValue>, ParseError> {
    match serde_json::from_slice::<JsonValue>(body)? {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => match map.remove("records") {
            Some(JsonValue::Array(items)) => Ok(items),
            Some(_) => Err(ParseError::Shape("`records` is not an array".into())),
            None => Ok(Vec::new()),
        },
        other => Err(ParseError::Shape(format!(
            "unexpected top-level JSON value: {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn clean(row: &Map<String, JsonValue>, key: &str) -> Option<String> {
    json_scalar_text(row.get(key)).filter(|s| !matches!(s.to_ascii_lowercase().as_str(), "n/a" | "-"))
}

/// Accepts `YYYY-MM-DD`, `YYYYMMDD` and ROC `YYYMMDD`.
pub fn parse_penalty_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.contains('-') {
        let day = s.get(..10).unwrap_or(s);
        return NaiveDate::parse_from_str(day, "%Y-%m-%d").ok();
    }
    match s.len() {
        7 | 8 => parse_compact_date(s),
        _ => None,
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "是" | "y" | "yes" | "true" | "1" => Some(true),
        "否" | "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn text(value: Option<String>) -> JsonValue {
    value.map_or(JsonValue::Null, JsonValue::String)
}

/// Map one API row; rows without a facility name are dropped.
pub fn penalty_record(
    tag: &str,
    row: &Map<String, JsonValue>,
    provenance: &Provenance,
) -> Option<RawDisclosureRecord> {
    let name = clean(row, "fac_name")?;
    let tax_id = clean(row, "ban");
    let disposition = clean(row, "document_no");
    let date = |key: &str| {
        clean(row, key)
            .and_then(|raw| parse_penalty_date(&raw))
            .map_or(JsonValue::Null, |d| JsonValue::String(d.to_string()))
    };
    let flag = |key: &str| {
        clean(row, key)
            .and_then(|raw| parse_flag(&raw))
            .map_or(JsonValue::Null, JsonValue::Bool)
    };
    let amount = |key: &str| JsonValue::from(clean(row, key).map_or(0, |raw| parse_amount(&raw)));

    let mut payload = Payload::new();
    payload.insert("tax_id".into(), text(tax_id.clone()));
    payload.insert("control_no".into(), text(clean(row, "ems_no")));
    payload.insert("disposition_no".into(), text(disposition.clone()));
    payload.insert("company_address".into(), text(clean(row, "fac_address")));
    payload.insert("violation_address".into(), text(clean(row, "transgress_address")));
    payload.insert("violation_type".into(), text(clean(row, "transgress_type")));
    payload.insert("violation_date".into(), date("transgress_date"));
    payload.insert("violation_reason".into(), text(clean(row, "openinfor")));
    payload.insert("law_article".into(), text(clean(row, "transgress_law")));
    payload.insert("authority".into(), text(clean(row, "county_name")));
    payload.insert("penalty_date".into(), date("penalty_date"));
    payload.insert("fine_amount".into(), amount("penalty_money"));
    payload.insert("penalty_reason".into(), text(clean(row, "gist_define")));
    payload.insert("limit_date".into(), date("improve_deadline"));
    payload.insert("is_improved".into(), flag("is_improve"));
    payload.insert("is_appeal".into(), flag("ispetition"));
    payload.insert("appeal_result".into(), text(clean(row, "petition_results")));
    payload.insert("is_paid".into(), flag("paymentstate"));
    payload.insert("illegal_profit".into(), amount("illegal_money"));
    payload.insert("other_penalty".into(), text(clean(row, "penaltykind")));
    payload.insert("is_serious".into(), flag("isimportant"));

    Some(RawDisclosureRecord {
        source_kind: SourceKind::EnvironmentalPenalty,
        source_tag: tag.to_string(),
        raw_company_name: name,
        raw_company_code: None,
        raw_tax_id: tax_id,
        natural_key: NaturalKey::disposition(disposition.as_deref()),
        roc_year: None,
        market: None,
        era: None,
        payload,
        provenance: provenance.clone(),
    })
}

#[async_trait]
impl DisclosureAdapter for EnvironmentalPenaltyAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::EnvironmentalPenalty
    }

    fn source_tag(&self) -> &str {
        &self.tag
    }

    fn preflight(&self) -> Result<(), AdapterError> {
        if self.api_key.is_none() {
            return Err(AdapterError::Message(
                "MOENV_API_KEY is not set; environmental penalties need an API key".into(),
            ));
        }
        Ok(())
    }

    fn units(&self, _selection: &UnitSelection, _now: DateTime<Utc>) -> Vec<SyncUnit> {
        vec![SyncUnit::Dataset {
            tag: self.tag.clone(),
        }]
    }

    async fn fetch_unit(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        _unit: &SyncUnit,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        self.preflight()?;
        let api_key = self.api_key.as_deref().unwrap_or_default();

        let mut pages = Vec::new();
        let mut offset = 0usize;
        loop {
            if pages.len() >= self.max_pages {
                tracing::warn!(
                    tag = %self.tag,
                    max_pages = self.max_pages,
                    offset,
                    "page cap reached; remaining penalty rows were not fetched"
                );
                break;
            }
            let key = CacheKey::dated(ctx.started_at, &self.tag, format!("offset_{offset}"), "json");
            let payload = http.fetch(&self.page_request(api_key, offset), &key).await?;
            let rows = page_records(&payload.body)?.len();
            tracing::info!(offset, rows, "fetched environmental penalty page");
            if rows == 0 {
                break;
            }
            pages.push(FetchedPage::from_payload(payload, "application/json"));
            if rows < self.page_size {
                break;
            }
            offset += self.page_size;
        }
        Ok(pages)
    }

    fn parse_unit(
        &self,
        _unit: &SyncUnit,
        pages: &[FetchedPage],
    ) -> Result<Vec<RawDisclosureRecord>, AdapterError> {
        let mut records = Vec::new();
        for page in pages {
            let provenance = page.provenance();
            for row in page_records(&page.body)? {
                if let JsonValue::Object(map) = row {
                    records.extend(penalty_record(&self.tag, &map, &provenance));
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radar_storage::{BackoffPolicy, DiskCache, HttpClientConfig};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    const ROW: &str = r#"{"ban": "22099131", "ems_no": "E5601234", "document_no": "30-113-080001",
        "fac_name": "台灣積體電路製造股份有限公司", "fac_address": "新竹科學園區力行六路8號",
        "transgress_type": "空氣", "transgress_date": "2024-08-01 10:00:00", "penalty_date": "1130815",
        "penalty_money": "100,000", "is_improve": "是", "ispetition": "N", "paymentstate": "",
        "illegal_money": null, "isimportant": "否", "county_name": "新竹市"}"#;

    fn adapter(api_key: Option<&str>, url: Option<String>, page_size: usize) -> EnvironmentalPenaltyAdapter {
        let mut config: SourceConfig =
            serde_yaml::from_str("kind: environmental_penalty\ntag: EMS_P_46\n").expect("config");
        config.url = url;
        config.page_size = Some(page_size);
        EnvironmentalPenaltyAdapter::from_config(&config, api_key.map(str::to_string)).expect("adapter")
    }

    #[test]
    fn both_response_envelopes_are_accepted() {
        let bare = format!("[{ROW}]");
        let wrapped = format!("{{\"records\": [{ROW}, {ROW}]}}");
        assert_eq!(page_records(bare.as_bytes()).expect("bare").len(), 1);
        assert_eq!(page_records(wrapped.as_bytes()).expect("wrapped").len(), 2);
        assert!(page_records(b"\"nope\"").is_err());
    }

    #[test]
    fn rows_map_with_tax_id_dates_and_flags() {
        let row: Map<String, JsonValue> = serde_json::from_str(ROW).expect("row");
        let provenance = Provenance {
            source_url: MOENV_API_URL.into(),
            payload_sha256: "0".into(),
            fetched_at: Utc::now(),
        };
        let record = penalty_record("EMS_P_46", &row, &provenance).expect("record");
        assert_eq!(record.raw_tax_id.as_deref(), Some("22099131"));
        assert_eq!(record.natural_key.storage_key().as_deref(), Some("30-113-080001"));
        assert_eq!(record.payload["violation_date"], serde_json::json!("2024-08-01"));
        assert_eq!(record.payload["penalty_date"], serde_json::json!("2024-08-15"));
        assert_eq!(record.payload["fine_amount"], serde_json::json!(100000));
        assert_eq!(record.payload["illegal_profit"], serde_json::json!(0));
        assert_eq!(record.payload["is_improved"], serde_json::json!(true));
        assert_eq!(record.payload["is_appeal"], serde_json::json!(false));
        assert_eq!(record.payload["is_paid"], JsonValue::Null);
        assert_eq!(record.payload["is_serious"], serde_json::json!(false));
    }

    #[test]
    fn date_formats_and_flags() {
        assert_eq!(parse_penalty_date("20240315"), NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(parse_penalty_date("1130315"), NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(parse_penalty_date("2024-13-01"), None);
        assert_eq!(parse_penalty_date("15"), None);
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("未知"), None);
    }

    #[test]
    fn missing_api_key_fails_preflight() {
        assert!(adapter(None, None, 10).preflight().is_err());
        assert!(adapter(Some("  "), None, 10).preflight().is_err());
        assert!(adapter(Some("key"), None, 10).preflight().is_ok());
    }

    /// Serves one JSON body per connection and returns the API url.
    async fn paged_server(bodies: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for body in bodies {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{addr}/api/v2/EMS_P_46")
    }

    fn http(dir: &std::path::Path) -> HttpFetcher {
        HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_retries: Some(0),
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                ..Default::default()
            },
            DiskCache::new(dir),
        )
        .expect("fetcher")
    }

    #[tokio::test]
    async fn paging_stops_on_a_short_page() {
        let url = paged_server(vec![format!("[{ROW}, {ROW}]"), format!("{{\"records\": [{ROW}]}}")]).await;
        let dir = tempdir().expect("tempdir");
        let adapter = adapter(Some("key"), Some(url), 2);
        let ctx = AdapterContext::new(Uuid::new_v4(), Utc::now());
        let unit = adapter.units(&UnitSelection::default(), Utc::now()).remove(0);

        let pages = adapter.fetch_unit(&http(dir.path()), &ctx, &unit).await.expect("pages");
        assert_eq!(pages.len(), 2);
        let records = adapter.parse_unit(&unit, &pages).expect("records");
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.source_kind == SourceKind::EnvironmentalPenalty));
    }

    #[tokio::test]
    async fn paging_stops_at_the_page_cap() {
        let full = format!("[{ROW}, {ROW}]");
        let url = paged_server(vec![full.clone(), full.clone(), full]).await;
        let dir = tempdir().expect("tempdir");
        let mut config: SourceConfig = serde_yaml::from_str(
            "kind: environmental_penalty\ntag: EMS_P_46\npage_size: 2\nmax_pages: 2\n",
        )
        .expect("config");
        config.url = Some(url);
        let adapter =
            EnvironmentalPenaltyAdapter::from_config(&config, Some("key".into())).expect("adapter");
        let ctx = AdapterContext::new(Uuid::new_v4(), Utc::now());
        let unit = adapter.units(&UnitSelection::default(), Utc::now()).remove(0);

        let pages = adapter.fetch_unit(&http(dir.path()), &ctx, &unit).await.expect("pages");
        assert_eq!(pages.len(), 2);
        assert_eq!(adapter.parse_unit(&unit, &pages).expect("records").len(), 4);
    }
}
