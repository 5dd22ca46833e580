//! Core domain model and provenance types for disclosure ingestion.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod identity;

pub use identity::{CompanyIndex, MatchOutcome, MatchTier};

pub const CRATE_NAME: &str = "radar-core";

/// Offset between the Gregorian calendar and the ROC (Minguo) calendar.
pub const ROC_YEAR_OFFSET: i32 = 1911;

/// Authoritative, deduplicated company entry from the canonical registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalCompany {
    pub code: String,
    pub name: String,
    pub abbreviation: Option<String>,
    pub tax_id: Option<String>,
    pub chairman: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// MOPS t100sb14: employee benefit and salary expense notes.
    EmployeeBenefit,
    /// MOPS t100sb15: full-time non-manager salary statistics.
    NonManagerSalary,
    /// MOPS t100sb13: welfare policy and salary adjustment summary.
    WelfarePolicy,
    /// MOPS t222sb01: base-level employee salary adjustment or remuneration.
    SalaryAdjustment,
    LaborViolation,
    EnvironmentalPenalty,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::EmployeeBenefit,
        SourceKind::NonManagerSalary,
        SourceKind::WelfarePolicy,
        SourceKind::SalaryAdjustment,
        SourceKind::LaborViolation,
        SourceKind::EnvironmentalPenalty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::EmployeeBenefit => "employee_benefit",
            SourceKind::NonManagerSalary => "non_manager_salary",
            SourceKind::WelfarePolicy => "welfare_policy",
            SourceKind::SalaryAdjustment => "salary_adjustment",
            SourceKind::LaborViolation => "labor_violation",
            SourceKind::EnvironmentalPenalty => "environmental_penalty",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown source kind: {s}"))
    }
}

/// Listing segment selector used by the exchange disclosure forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketSegment {
    /// Main board (TYPEK=sii).
    Sii,
    /// Over-the-counter (TYPEK=otc).
    Otc,
}

impl MarketSegment {
    pub const ALL: [MarketSegment; 2] = [MarketSegment::Sii, MarketSegment::Otc];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketSegment::Sii => "sii",
            MarketSegment::Otc => "otc",
        }
    }
}

impl fmt::Display for MarketSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketSegment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sii" => Ok(MarketSegment::Sii),
            "otc" => Ok(MarketSegment::Otc),
            other => Err(format!("unknown market segment: {other}")),
        }
    }
}

pub fn current_roc_year(now: DateTime<Utc>) -> i32 {
    now.year() - ROC_YEAR_OFFSET
}

/// Parse compact ROC or AD dates such as `1150126`, `990101` or `20240315`.
///
/// The last four digits are month and day; the leading digits are the year,
/// treated as ROC when below 1000.
pub fn parse_compact_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.len() < 6 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year_len = s.len() - 4;
    let year: i32 = s[..year_len].parse().ok()?;
    let month: u32 = s[year_len..year_len + 2].parse().ok()?;
    let day: u32 = s[year_len + 2..].parse().ok()?;
    let year = if year < 1000 { year + ROC_YEAR_OFFSET } else { year };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Source-defined identity of a record, used for upsert deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NaturalKey {
    Disposition {
        number: String,
    },
    Periodic {
        raw_code: String,
        roc_year: i32,
        market: MarketSegment,
    },
    /// The source row carries no stable identifier.
    Absent,
}

impl NaturalKey {
    pub fn disposition(number: Option<&str>) -> Self {
        match number.map(str::trim) {
            Some(n) if !n.is_empty() => NaturalKey::Disposition {
                number: n.to_string(),
            },
            _ => NaturalKey::Absent,
        }
    }

    /// Flattened key stored alongside the row; `None` means always insert.
    pub fn storage_key(&self) -> Option<String> {
        match self {
            NaturalKey::Disposition { number } => Some(number.clone()),
            NaturalKey::Periodic {
                raw_code,
                roc_year,
                market,
            } => Some(format!("{raw_code}:{roc_year}:{market}")),
            NaturalKey::Absent => None,
        }
    }
}

/// Where a record's bytes came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_url: String,
    pub payload_sha256: String,
    pub fetched_at: DateTime<Utc>,
}

pub type Payload = BTreeMap<String, JsonValue>;

/// One parsed row, not yet resolved to a company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDisclosureRecord {
    pub source_kind: SourceKind,
    /// Upstream dataset tag, e.g. `t100sb15` or `LaborStandards`.
    pub source_tag: String,
    pub raw_company_name: String,
    pub raw_company_code: Option<String>,
    pub raw_tax_id: Option<String>,
    pub natural_key: NaturalKey,
    pub roc_year: Option<i32>,
    pub market: Option<MarketSegment>,
    /// Table-shape era the row was mapped with, for scraped sources.
    pub era: Option<u8>,
    pub payload: Payload,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    Linked,
    Orphan,
}

impl StoreRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Linked => "linked",
            StoreRole::Orphan => "orphan",
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub record: RawDisclosureRecord,
    pub company_code: Option<String>,
    pub tier: Option<MatchTier>,
}

impl ResolvedRecord {
    pub fn unresolved(record: RawDisclosureRecord) -> Self {
        Self {
            record,
            company_code: None,
            tier: None,
        }
    }

    /// The resolved code is the only thing deciding the destination store.
    pub fn destination(&self) -> StoreRole {
        if self.company_code.is_some() {
            StoreRole::Linked
        } else {
            StoreRole::Orphan
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_dates_accept_roc_and_gregorian_years() {
        assert_eq!(
            parse_compact_date("1150126"),
            NaiveDate::from_ymd_opt(2026, 1, 26)
        );
        assert_eq!(
            parse_compact_date("990101"),
            NaiveDate::from_ymd_opt(2010, 1, 1)
        );
        assert_eq!(
            parse_compact_date("20240315"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(parse_compact_date("0"), None);
        assert_eq!(parse_compact_date("1131340"), None);
    }

    #[test]
    fn natural_keys_flatten_for_storage() {
        assert_eq!(NaturalKey::disposition(Some("  ")), NaturalKey::Absent);
        assert_eq!(NaturalKey::Absent.storage_key(), None);
        assert_eq!(
            NaturalKey::disposition(Some(" 勞動字第1130001號 ")).storage_key(),
            Some("勞動字第1130001號".to_string())
        );
        let periodic = NaturalKey::Periodic {
            raw_code: "2330".into(),
            roc_year: 112,
            market: MarketSegment::Sii,
        };
        assert_eq!(periodic.storage_key().as_deref(), Some("2330:112:sii"));
    }

    #[test]
    fn source_kinds_round_trip_through_their_names() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>(), Ok(kind));
        }
        assert!("t100sb15".parse::<SourceKind>().is_err());
    }
}
