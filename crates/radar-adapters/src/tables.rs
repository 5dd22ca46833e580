//! Column-count versioned parsing of the exchange's scraped HTML tables.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context};
use radar_core::{
    MarketSegment, NaturalKey, Payload, Provenance, RawDisclosureRecord, SourceKind,
};
use scraper::{ElementRef, Html};
use serde::Deserialize;
use serde_json::{Number, Value as JsonValue};

use crate::{selector, trimmed_text, ParseError};

const EMBEDDED_TABLES_YAML: &str = include_str!("../../../schemas/tables.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Exchange company code; identifies data rows.
    Code,
    Name,
    Text,
    Integer,
    Decimal,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    fn value_of(&self, cell: &str) -> JsonValue {
        match self.kind {
            FieldKind::Code | FieldKind::Name | FieldKind::Text | FieldKind::Flag => {
                crate::text_or_none(cell).map_or(JsonValue::Null, JsonValue::String)
            }
            FieldKind::Integer => parse_integer(cell).map_or(JsonValue::Null, JsonValue::from),
            FieldKind::Decimal => parse_decimal(cell)
                .and_then(Number::from_f64)
                .map_or(JsonValue::Null, JsonValue::Number),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EraSpec {
    pub era: u8,
    pub columns: usize,
    pub trailing: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSchema {
    pub tag: String,
    pub kind: SourceKind,
    /// Periods before this ROC year are not published and parse to nothing.
    #[serde(default)]
    pub min_roc_year: Option<i32>,
    pub common: Vec<FieldSpec>,
    pub eras: Vec<EraSpec>,
}

impl TableSchema {
    fn validate(&self) -> anyhow::Result<()> {
        let count_of = |kind: FieldKind| self.common.iter().filter(|f| f.kind == kind).count();
        if count_of(FieldKind::Code) != 1 || count_of(FieldKind::Name) != 1 {
            bail!(
                "table {} must declare exactly one code and one name column in `common`",
                self.tag
            );
        }
        if self.eras.is_empty() {
            bail!("table {} declares no eras", self.tag);
        }
        let mut seen = BTreeSet::new();
        for era in &self.eras {
            let declared = self.common.len() + era.trailing.len();
            if declared != era.columns {
                bail!(
                    "table {} era {} declares {} columns but maps {}",
                    self.tag,
                    era.era,
                    era.columns,
                    declared
                );
            }
            if era.trailing.iter().any(|f| matches!(f.kind, FieldKind::Code | FieldKind::Name)) {
                bail!("table {} era {} repeats an identity column", self.tag, era.era);
            }
            if !seen.insert(era.columns) {
                bail!("table {} has two eras with {} columns", self.tag, era.columns);
            }
        }
        Ok(())
    }

    pub fn era_for_columns(&self, columns: usize) -> Option<&EraSpec> {
        self.eras.iter().find(|era| era.columns == columns)
    }

    fn index_of(&self, kind: FieldKind) -> usize {
        self.common
            .iter()
            .position(|f| f.kind == kind)
            .unwrap_or_default()
    }

    fn fields<'a>(&'a self, era: &'a EraSpec) -> impl Iterator<Item = &'a FieldSpec> + 'a {
        self.common.iter().chain(era.trailing.iter())
    }
}

#[derive(Debug, Deserialize)]
struct TablesFile {
    tables: Vec<TableSchema>,
}

/// Era layouts keyed by endpoint tag.
#[derive(Debug, Clone, Default)]
pub struct TableSchemaRegistry {
    schemas: BTreeMap<String, TableSchema>,
}

impl TableSchemaRegistry {
    /// Layouts compiled into the binary.
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_yaml_str(EMBEDDED_TABLES_YAML).context("parsing embedded schemas/tables.yaml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: TablesFile = serde_yaml::from_str(text)?;
        let mut schemas = BTreeMap::new();
        for schema in file.tables {
            schema.validate()?;
            if schemas.insert(schema.tag.clone(), schema).is_some() {
                bail!("duplicate table tag in table layouts");
            }
        }
        Ok(Self { schemas })
    }

    pub fn get(&self, tag: &str) -> Option<&TableSchema> {
        self.schemas.get(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

/// Digits and minus sign only; `-`, `N/A` and blanks are absent.
pub fn parse_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed.eq_ignore_ascii_case("n/a") {
        return None;
    }
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    cleaned.parse().ok()
}

/// Thousands separators and percent signs are dropped.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed.eq_ignore_ascii_case("n/a") {
        return None;
    }
    let cleaned = trimmed.replace([',', '%'], "");
    cleaned.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn is_company_code(text: &str) -> bool {
    (4..=6).contains(&text.len()) && text.chars().all(|c| c.is_ascii_digit())
}

struct DataRow {
    cells: Vec<String>,
}

fn row_cells(row: &ElementRef<'_>) -> Vec<String> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "td")
        .map(|td| trimmed_text(&td))
        .collect()
}

fn is_header_row(row: &ElementRef<'_>) -> bool {
    row.value().classes().any(|c| c == "tblHead")
        || row
            .children()
            .filter_map(ElementRef::wrap)
            .any(|el| el.value().name() == "th")
}

fn data_rows(table: &ElementRef<'_>, code_idx: usize) -> Result<Vec<DataRow>, ParseError> {
    let tr = selector("tr")?;
    Ok(table
        .select(&tr)
        .filter(|row| !is_header_row(row))
        .map(|row| row_cells(&row))
        .filter(|cells| cells.get(code_idx).is_some_and(|c| is_company_code(c)))
        .map(|cells| DataRow { cells })
        .collect())
}

fn locate_table<'a>(document: &'a Html, code_idx: usize) -> Result<Option<ElementRef<'a>>, ParseError> {
    let table_sel = selector("table")?;
    let markers = [
        selector("tr.tblHead")?,
        selector("th.tblHead")?,
        selector("td[style*=\"text-align\"]")?,
    ];

    let mut first_marked = None;
    for table in document.select(&table_sel) {
        if !markers.iter().any(|m| table.select(m).next().is_some()) {
            continue;
        }
        if !data_rows(&table, code_idx)?.is_empty() {
            return Ok(Some(table));
        }
        first_marked.get_or_insert(table);
    }

    for table in document.select(&table_sel) {
        if !data_rows(&table, code_idx)?.is_empty() {
            return Ok(Some(table));
        }
    }
    // A marked table without rows is an empty period, not a missing table.
    Ok(first_marked)
}

/// The column count most data rows share; ties go to the wider layout.
fn observed_columns(rows: &[DataRow]) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for row in rows {
        *counts.entry(row.cells.len()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(columns, hits)| (*hits, *columns))
        .map(|(columns, _)| columns)
}

/// Parse one scraped period/segment payload into raw records.
///
/// Rows whose code cell does not look like a company code are treated as
/// headers, subtotals or notes and skipped. An unknown column count yields no
/// records and a warning.
pub fn parse_table(
    html: &str,
    schema: &TableSchema,
    roc_year: i32,
    market: MarketSegment,
    provenance: &Provenance,
) -> Result<Vec<RawDisclosureRecord>, ParseError> {
    if schema.min_roc_year.is_some_and(|min| roc_year < min) {
        tracing::debug!(tag = %schema.tag, roc_year, "period predates the table; nothing to parse");
        return Ok(Vec::new());
    }

    let code_idx = schema.index_of(FieldKind::Code);
    let name_idx = schema.index_of(FieldKind::Name);
    let document = Html::parse_document(html);

    let Some(table) = locate_table(&document, code_idx)? else {
        tracing::warn!(tag = %schema.tag, roc_year, %market, "no data table found in payload");
        return Ok(Vec::new());
    };

    let rows = data_rows(&table, code_idx)?;
    let Some(columns) = observed_columns(&rows) else {
        tracing::warn!(tag = %schema.tag, roc_year, %market, "table has no data rows");
        return Ok(Vec::new());
    };
    let Some(era) = schema.era_for_columns(columns) else {
        tracing::warn!(
            tag = %schema.tag,
            roc_year,
            %market,
            columns,
            "unrecognized table shape; no era maps this column count"
        );
        return Ok(Vec::new());
    };

    let mut records = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in rows {
        if row.cells.len() != era.columns {
            skipped += 1;
            continue;
        }
        let Some(name) = crate::text_or_none(&row.cells[name_idx]) else {
            skipped += 1;
            continue;
        };
        let raw_code = row.cells[code_idx].clone();

        let payload: Payload = schema
            .fields(era)
            .zip(row.cells.iter())
            .filter(|(field, _)| !matches!(field.kind, FieldKind::Code | FieldKind::Name))
            .map(|(field, cell)| (field.name.clone(), field.value_of(cell)))
            .collect();

        records.push(RawDisclosureRecord {
            source_kind: schema.kind,
            source_tag: schema.tag.clone(),
            raw_company_name: name,
            raw_company_code: Some(raw_code.clone()),
            raw_tax_id: None,
            natural_key: NaturalKey::Periodic {
                raw_code,
                roc_year,
                market,
            },
            roc_year: Some(roc_year),
            market: Some(market),
            era: Some(era.era),
            payload,
            provenance: provenance.clone(),
        });
    }

    if skipped > 0 {
        tracing::debug!(tag = %schema.tag, skipped, "skipped rows that do not fit the detected era");
    }
    tracing::debug!(tag = %schema.tag, era = era.era, columns, records = records.len(), "parsed table");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn provenance() -> Provenance {
        Provenance {
            source_url: "https://mopsov.twse.com.tw/mops/web/ajax_t100sb15".into(),
            payload_sha256: "abc123".into(),
            fetched_at: Utc.with_ymd_and_hms(2026, 2, 24, 8, 0, 0).single().expect("ts"),
        }
    }

    fn registry() -> TableSchemaRegistry {
        TableSchemaRegistry::embedded().expect("embedded layouts")
    }

    /// A data row with the code and name at the given positions and numbers elsewhere.
    fn row(width: usize, code_idx: usize, code: &str, name: &str) -> String {
        let cells: String = (0..width)
            .map(|i| {
                let text = if i == code_idx {
                    code.to_string()
                } else if i == code_idx + 1 {
                    name.to_string()
                } else if i == 0 {
                    "半導體業".to_string()
                } else {
                    format!("{},{:03}", i, i * 7)
                };
                format!("<td style=\"text-align:right\">{text}</td>")
            })
            .collect();
        format!("<tr class=\"even\">{cells}</tr>")
    }

    fn page(width: usize, code_idx: usize) -> String {
        let header: String = (0..width).map(|i| format!("<th>欄{i}</th>")).collect();
        format!(
            "<html><body><table><tr><td>查詢條件</td></tr></table>\
             <table class=\"hasBorder\"><tr class=\"tblHead\">{header}</tr>{}{}\
             <tr><td colspan=\"3\">合計</td></tr></table></body></html>",
            row(width, code_idx, "2330", "台積電"),
            row(width, code_idx, "2303", "聯電"),
        )
    }

    fn parse(tag: &str, width: usize, code_idx: usize, roc_year: i32) -> Vec<RawDisclosureRecord> {
        let registry = registry();
        let schema = registry.get(tag).expect("schema");
        parse_table(&page(width, code_idx), schema, roc_year, MarketSegment::Sii, &provenance())
            .expect("parse")
    }

    #[test]
    fn embedded_layouts_cover_all_compensation_tables() {
        let registry = registry();
        let tags: Vec<_> = registry.tags().collect();
        assert_eq!(tags, vec!["t100sb13", "t100sb14", "t100sb15", "t222sb01"]);
    }

    #[test]
    fn column_count_selects_the_era() {
        let era1 = parse("t100sb15", 13, 1, 109);
        assert_eq!(era1.len(), 2);
        assert!(era1.iter().all(|r| r.era == Some(1)));
        assert_eq!(era1[0].payload["eps"], serde_json::json!(6042.0));
        assert!(!era1[0].payload.contains_key("median_salary"));

        let era2 = parse("t100sb15", 16, 1, 111);
        assert!(era2.iter().all(|r| r.era == Some(2)));
        assert_eq!(era2[0].payload["median_salary"], serde_json::json!(7049));
        assert!(!era2[0].payload.contains_key("median_salary_change"));

        let era3 = parse("t100sb15", 19, 1, 113);
        assert!(era3.iter().all(|r| r.era == Some(3)));
        assert!(era3[0].payload.contains_key("median_salary_change"));
        assert_eq!(
            era3[0].payload["improvement_measures_note"],
            serde_json::json!("18,126")
        );
    }

    #[test]
    fn unknown_column_count_yields_no_records() {
        assert!(parse("t100sb15", 11, 1, 113).is_empty());
        assert!(parse("t100sb14", 14, 1, 110).is_empty());
    }

    #[test]
    fn header_and_summary_rows_are_skipped() {
        let records = parse("t100sb14", 15, 1, 110);
        let names: Vec<_> = records.iter().map(|r| r.raw_company_name.as_str()).collect();
        assert_eq!(names, vec!["台積電", "聯電"]);
        let first = &records[0];
        assert_eq!(first.raw_company_code.as_deref(), Some("2330"));
        assert_eq!(first.source_kind, SourceKind::EmployeeBenefit);
        assert_eq!(first.payload["industry"], serde_json::json!("半導體業"));
        assert_eq!(first.payload["employee_count"], serde_json::json!(6042));
        assert!(!first.payload.contains_key("raw_company_code"));
        assert_eq!(
            first.natural_key.storage_key().as_deref(),
            Some("2330:110:sii")
        );
    }

    #[test]
    fn styled_banner_before_the_data_table_is_passed_over() {
        let registry = registry();
        let schema = registry.get("t100sb14").expect("schema");
        let header: String = (0..15).map(|i| format!("<th>欄{i}</th>")).collect();
        let html = format!(
            "<html><body><table><tr><td style=\"text-align:left\">查詢條件：113年度</td></tr></table>\
             <table class=\"hasBorder\"><tr class=\"tblHead\">{header}</tr>{}</table></body></html>",
            row(15, 1, "2330", "台積電"),
        );
        let records =
            parse_table(&html, schema, 113, MarketSegment::Sii, &provenance()).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw_company_code.as_deref(), Some("2330"));
    }

    #[test]
    fn marked_table_without_rows_is_an_empty_period() {
        let registry = registry();
        let schema = registry.get("t100sb14").expect("schema");
        let html = "<table><tr class=\"tblHead\"><th>公司代號</th></tr>\
                    <tr><td>查無資料</td></tr></table>";
        let records =
            parse_table(html, schema, 113, MarketSegment::Sii, &provenance()).expect("parse");
        assert!(records.is_empty());
    }

    #[test]
    fn parsing_is_deterministic() {
        let registry = registry();
        let schema = registry.get("t100sb13").expect("schema");
        let html = page(14, 0);
        let first = parse_table(&html, schema, 112, MarketSegment::Otc, &provenance()).expect("parse");
        let second = parse_table(&html, schema, 112, MarketSegment::Otc, &provenance()).expect("parse");
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn salary_adjustment_table_starts_in_year_113() {
        assert!(parse("t222sb01", 16, 0, 112).is_empty());
        let records = parse("t222sb01", 16, 0, 113);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload["pretax_net_profit"], serde_json::json!(3021));
    }

    #[test]
    fn numeric_cells_follow_the_cleaning_rules() {
        assert_eq!(parse_integer(" 1,234,567 "), Some(1_234_567));
        assert_eq!(parse_integer("-12,000"), Some(-12_000));
        assert_eq!(parse_integer("-"), None);
        assert_eq!(parse_integer("N/A"), None);
        assert_eq!(parse_integer(""), None);
        assert_eq!(parse_decimal("12.5%"), Some(12.5));
        assert_eq!(parse_decimal("1,024.75"), Some(1024.75));
        assert_eq!(parse_decimal("-"), None);
    }

    #[test]
    fn inconsistent_layouts_are_rejected_at_load() {
        let yaml = r#"
tables:
  - tag: broken
    kind: welfare_policy
    common:
      - { name: raw_company_code, kind: code }
      - { name: company_name, kind: name }
    eras:
      - era: 1
        columns: 4
        trailing:
          - { name: only_one, kind: text }
"#;
        assert!(TableSchemaRegistry::from_yaml_str(yaml).is_err());
    }
}
