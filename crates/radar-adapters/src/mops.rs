//! Exchange compensation disclosure tables (t100sb14, t100sb15, t100sb13, t222sb01).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{MarketSegment, RawDisclosureRecord, SourceKind};
use radar_storage::{CacheKey, FetchRequest, HttpFetcher};

use crate::tables::{parse_table, TableSchemaRegistry};
use crate::{
    AdapterContext, AdapterError, DisclosureAdapter, FetchedPage, SourceConfig, SyncUnit,
    UnitSelection, DEFAULT_FIRST_ROC_YEAR,
};

pub const MOPS_BASE_URL: &str = "https://mopsov.twse.com.tw/mops/web";

/// Body texts the exchange site serves with a 200 when it is throttling us.
pub const MOPS_UNAVAILABLE_MARKERS: [&str; 2] = ["服務暫時無法提供", "請稍後再試"];

/// Headers the exchange site expects on its ajax endpoints.
pub fn default_mops_headers() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "Referer".to_string(),
            format!("{MOPS_BASE_URL}/index"),
        ),
        (
            "Origin".to_string(),
            "https://mopsov.twse.com.tw".to_string(),
        ),
    ])
}

#[derive(Debug, Clone)]
pub struct MopsTableAdapter {
    kind: SourceKind,
    tag: String,
    url: String,
    year_param: String,
    first_year: i32,
    params: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    schemas: Arc<TableSchemaRegistry>,
}

impl MopsTableAdapter {
    pub fn from_config(
        config: &SourceConfig,
        schemas: Arc<TableSchemaRegistry>,
    ) -> Result<Self, AdapterError> {
        let schema = schemas.get(&config.tag).ok_or_else(|| {
            AdapterError::Message(format!("no table layout declared for {}", config.tag))
        })?;
        if schema.kind != config.kind {
            return Err(AdapterError::Message(format!(
                "table layout {} is for {} but the source is configured as {}",
                config.tag, schema.kind, config.kind
            )));
        }

        let mut headers = default_mops_headers();
        headers.extend(config.headers.clone());

        Ok(Self {
            kind: config.kind,
            tag: config.tag.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| format!("{MOPS_BASE_URL}/ajax_{}", config.tag)),
            year_param: config
                .year_param
                .clone()
                .unwrap_or_else(|| "RYEAR".to_string()),
            first_year: config
                .first_year
                .or(schema.min_roc_year)
                .unwrap_or(DEFAULT_FIRST_ROC_YEAR),
            params: config.params.clone(),
            headers,
            schemas,
        })
    }

    /// Form body for one (period, market) unit.
    pub fn form_params(&self, roc_year: i32, market: MarketSegment) -> Vec<(String, String)> {
        let mut form: BTreeMap<String, String> = BTreeMap::from([
            ("encodeURIComponent".to_string(), "1".to_string()),
            ("step".to_string(), "1".to_string()),
            ("firstin".to_string(), "1".to_string()),
        ]);
        form.extend(self.params.clone());
        form.insert("TYPEK".to_string(), market.as_str().to_string());
        form.insert(self.year_param.clone(), roc_year.to_string());
        form.into_iter().collect()
    }

    pub fn request(&self, roc_year: i32, market: MarketSegment) -> FetchRequest {
        FetchRequest::post_form(self.url.clone(), self.form_params(roc_year, market))
            .with_headers(self.headers.clone())
            .with_unavailable_markers(MOPS_UNAVAILABLE_MARKERS)
    }

    pub fn cache_key(&self, ctx: &AdapterContext, roc_year: i32, market: MarketSegment) -> CacheKey {
        CacheKey::dated(ctx.started_at, &self.tag, format!("{market}_{roc_year}"), "html")
    }
}

#[async_trait]
impl DisclosureAdapter for MopsTableAdapter {
    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    fn source_tag(&self) -> &str {
        &self.tag
    }

    fn units(&self, selection: &UnitSelection, now: DateTime<Utc>) -> Vec<SyncUnit> {
        let markets = selection.markets();
        selection
            .years(self.first_year, now)
            .into_iter()
            .flat_map(|roc_year| {
                markets
                    .iter()
                    .map(move |market| SyncUnit::Period {
                        roc_year,
                        market: *market,
                    })
            })
            .collect()
    }

    async fn fetch_unit(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        unit: &SyncUnit,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let SyncUnit::Period { roc_year, market } = unit else {
            return Err(AdapterError::Message(format!(
                "{} expects period units, got {}",
                self.tag,
                unit.label()
            )));
        };

        let payload = http
            .fetch(
                &self.request(*roc_year, *market),
                &self.cache_key(ctx, *roc_year, *market),
            )
            .await?;
        Ok(vec![FetchedPage::from_payload(payload, "text/html")])
    }

    fn parse_unit(
        &self,
        unit: &SyncUnit,
        pages: &[FetchedPage],
    ) -> Result<Vec<RawDisclosureRecord>, AdapterError> {
        let SyncUnit::Period { roc_year, market } = unit else {
            return Ok(Vec::new());
        };
        let schema = self.schemas.get(&self.tag).ok_or_else(|| {
            AdapterError::Message(format!("no table layout declared for {}", self.tag))
        })?;

        let mut records = Vec::new();
        for page in pages {
            records.extend(parse_table(
                &page.text(),
                schema,
                *roc_year,
                *market,
                &page.provenance(),
            )?);
        }
        Ok(records)
    }
}
