//! Per-company basic information page (t05st03): stakeholder and governance links.

use std::collections::BTreeMap;
use std::time::Duration;

use radar_storage::{CacheKey, FetchRequest, HttpFetcher};
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};

use crate::mops::{default_mops_headers, MOPS_BASE_URL, MOPS_UNAVAILABLE_MARKERS};
use crate::{compact_text, selector, trimmed_text, FetchedPage, ParseError};

pub const STAKEHOLDER_LABEL: &str = "公司網站內利害關係人專區網址";
pub const GOVERNANCE_LABEL: &str = "公司網站內公司治理資訊專區網址";

/// Placeholder the exchange shows for companies without such a page.
const NOT_APPLICABLE: &str = "不適用";

pub const DEFAULT_DETAIL_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDetail {
    pub code: String,
    pub stakeholder_url: Option<String>,
    pub governance_url: Option<String>,
}

impl CompanyDetail {
    pub fn is_empty(&self) -> bool {
        self.stakeholder_url.is_none() && self.governance_url.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct DetailScraper {
    url: String,
    headers: BTreeMap<String, String>,
    /// Pause the caller should take between consecutive companies.
    pub delay: Duration,
}

impl Default for DetailScraper {
    fn default() -> Self {
        Self {
            url: format!("{MOPS_BASE_URL}/t05st03"),
            headers: default_mops_headers(),
            delay: DEFAULT_DETAIL_DELAY,
        }
    }
}

impl DetailScraper {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn request(&self, code: &str) -> FetchRequest {
        FetchRequest::get(
            self.url.clone(),
            vec![
                ("step".to_string(), "1".to_string()),
                ("firstin".to_string(), "1".to_string()),
                ("off".to_string(), "1".to_string()),
                ("queryName".to_string(), "co_id".to_string()),
                ("t05st03_ck".to_string(), "1".to_string()),
                ("co_id".to_string(), code.to_string()),
            ],
        )
        .with_headers(self.headers.clone())
        .with_unavailable_markers(MOPS_UNAVAILABLE_MARKERS)
    }

    /// Keyed per company, outside the daily namespaces.
    pub fn cache_key(&self, code: &str) -> CacheKey {
        CacheKey::new("company_details", "t05st03", code, "html")
    }

    pub async fn fetch(&self, http: &HttpFetcher, code: &str) -> Result<FetchedPage, radar_storage::FetchError> {
        let payload = http.fetch(&self.request(code), &self.cache_key(code)).await?;
        Ok(FetchedPage::from_payload(payload, "text/html"))
    }
}

fn value_after_label(document: &Html, label: &str) -> Result<Option<String>, ParseError> {
    let cells = selector("th, td")?;
    let link = selector("a[href]")?;

    for cell in document.select(&cells) {
        if !compact_text(&cell).contains(label) {
            continue;
        }
        let Some(value_cell) = cell
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "td")
        else {
            continue;
        };

        let value = value_cell
            .select(&link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| href.trim().to_string())
            .unwrap_or_else(|| trimmed_text(&value_cell).replace(' ', ""));
        if value.is_empty() || value == NOT_APPLICABLE {
            return Ok(None);
        }
        return Ok(Some(value));
    }
    Ok(None)
}

pub fn parse_company_detail(html: &str, code: &str) -> Result<CompanyDetail, ParseError> {
    let document = Html::parse_document(html);
    Ok(CompanyDetail {
        code: code.to_string(),
        stakeholder_url: value_after_label(&document, STAKEHOLDER_LABEL)?,
        governance_url: value_after_label(&document, GOVERNANCE_LABEL)?,
    })
}
