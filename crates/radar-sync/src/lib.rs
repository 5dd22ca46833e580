//! Sync orchestration: per-source unit loop, identity resolution and store writes.

pub mod companies;
pub mod store;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use radar_adapters::{
    adapter_for_source, parse_company_detail, AdapterContext, AdapterError, AdapterSettings,
    DetailScraper, DisclosureAdapter, SourceConfig, SyncUnit, TableSchemaRegistry, UnitSelection,
};
use radar_core::{CompanyIndex, RawDisclosureRecord, StoreRole};
use radar_storage::{BackoffPolicy, DiskCache, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use companies::{CompanyRegistry, SqlCompanyRegistry};
pub use store::{migrate, open_pool, DisclosureStore, SqlxStore, StoreError};
pub use writer::{ReconciliationWriter, UpsertSummary, DEFAULT_COMMIT_EVERY};

pub const CRATE_NAME: &str = "radar-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// `all` picks every enabled source; otherwise a tag or a source kind, case-insensitive.
    pub fn select(&self, selector: &str) -> Result<Vec<&SourceConfig>> {
        let selector = selector.trim();
        let selected: Vec<_> = if selector.eq_ignore_ascii_case("all") {
            self.sources.iter().filter(|s| s.enabled).collect()
        } else {
            self.sources
                .iter()
                .filter(|s| {
                    s.tag.eq_ignore_ascii_case(selector)
                        || s.kind.as_str().eq_ignore_ascii_case(selector)
                })
                .collect()
        };
        if selected.is_empty() {
            bail!("no source matches {selector:?}");
        }
        Ok(selected)
    }
}

#[derive(Debug, Clone)]
pub struct RadarConfig {
    pub database_url: String,
    pub archive_database_url: String,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub backoff: BackoffPolicy,
    pub commit_every: usize,
    pub moenv_api_key: Option<String>,
    pub workspace_root: PathBuf,
    /// Override for the embedded table era definitions.
    pub tables_path: Option<PathBuf>,
    pub detail_delay: Duration,
}

impl RadarConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |name: &str| var(name).and_then(|v| v.trim().parse::<i64>().ok());
        let defaults = BackoffPolicy::default();

        let max_retries = match parsed("RADAR_MAX_RETRIES") {
            Some(n) if n < 0 => None,
            Some(n) => Some(n as usize),
            None => defaults.max_retries,
        };
        let millis = |name: &str, fallback: Duration| {
            parsed(name)
                .filter(|ms| *ms >= 0)
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(fallback)
        };

        let config = Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://radar.db".to_string()),
            archive_database_url: var("ARCHIVE_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://archive.db".to_string()),
            cache_dir: var("RADAR_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./cache")),
            data_dir: var("RADAR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            user_agent: var("RADAR_USER_AGENT")
                .unwrap_or_else(|| "disclosure-radar/0.1".to_string()),
            http_timeout_secs: parsed("RADAR_HTTP_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(|secs| secs as u64)
                .unwrap_or(60),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: millis("RADAR_RETRY_BASE_MS", defaults.base_delay),
                max_delay: millis("RADAR_RETRY_MAX_MS", defaults.max_delay),
            },
            commit_every: parsed("RADAR_COMMIT_EVERY")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_COMMIT_EVERY),
            moenv_api_key: var("MOENV_API_KEY").filter(|key| !key.trim().is_empty()),
            workspace_root: var("RADAR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            tables_path: var("RADAR_TABLES_PATH").map(PathBuf::from),
            detail_delay: millis(
                "RADAR_DETAIL_DELAY_MS",
                radar_adapters::detail::DEFAULT_DETAIL_DELAY,
            ),
        };

        if config.database_url == config.archive_database_url {
            bail!(
                "DATABASE_URL and ARCHIVE_DATABASE_URL must point at different databases ({})",
                config.database_url
            );
        }
        Ok(config)
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    fn http_config(&self, backoff: BackoffPolicy) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_tag: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: usize,
    pub processed: usize,
    pub linked: usize,
    pub orphaned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed_units: usize,
    pub failed_writes: usize,
}

impl SyncRunSummary {
    fn begin(ctx: &AdapterContext, source_tag: &str) -> Self {
        Self {
            run_id: ctx.run_id,
            source_tag: source_tag.to_string(),
            started_at: ctx.started_at,
            finished_at: ctx.started_at,
            units: 0,
            processed: 0,
            linked: 0,
            orphaned: 0,
            inserted: 0,
            updated: 0,
            failed_units: 0,
            failed_writes: 0,
        }
    }

    fn absorb(&mut self, written: &UpsertSummary) {
        self.linked += written.linked;
        self.orphaned += written.orphaned;
        self.inserted += written.inserted;
        self.updated += written.updated;
        self.failed_writes += written.failed;
    }
}

/// Outcome of `SyncPipeline::sync`: per-source summaries plus sources that could not run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub runs: Vec<SyncRunSummary>,
    pub failed_sources: Vec<FailedSource>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSource {
    pub source_tag: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichOptions {
    /// Refetch companies whose details are already complete.
    pub force: bool,
    pub limit: Option<usize>,
    pub company: Option<String>,
    pub retry_forever: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub enriched: usize,
    /// Pages fetched that carried neither link.
    pub empty: usize,
    pub failed: usize,
}

pub struct SyncPipeline {
    config: RadarConfig,
    http: HttpFetcher,
    schemas: Arc<TableSchemaRegistry>,
}

impl SyncPipeline {
    pub fn new(config: RadarConfig) -> Result<Self> {
        let cache = DiskCache::new(config.cache_dir.clone());
        let http = HttpFetcher::new(config.http_config(config.backoff), cache)?;
        let schemas = match &config.tables_path {
            Some(path) => TableSchemaRegistry::from_path(path)?,
            None => TableSchemaRegistry::embedded()?,
        };
        Ok(Self {
            config,
            http,
            schemas: Arc::new(schemas),
        })
    }

    pub fn config(&self) -> &RadarConfig {
        &self.config
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.sources_path()).await
    }

    /// Create both databases if needed and bring their schemas up to date.
    pub async fn migrate(&self) -> Result<()> {
        for (role, url) in [
            (StoreRole::Linked, &self.config.database_url),
            (StoreRole::Orphan, &self.config.archive_database_url),
        ] {
            let pool = open_pool(url)
                .await
                .with_context(|| format!("opening {role} database {url}"))?;
            migrate(role, &pool)
                .await
                .with_context(|| format!("migrating {role} database {url}"))?;
            pool.close().await;
        }
        Ok(())
    }

    /// Run every source matched by `selector`; one source failing does not stop the rest.
    pub async fn sync(&self, selector: &str, selection: &UnitSelection) -> Result<SyncReport> {
        let registry = self.load_source_registry().await?;
        let mut report = SyncReport::default();

        for source in registry.select(selector)? {
            match self.run_source(source, selection).await {
                Ok(summary) => report.runs.push(summary),
                Err(err) => {
                    warn!(source = %source.tag, error = %format!("{err:#}"), "source sync failed");
                    report.failed_sources.push(FailedSource {
                        source_tag: source.tag.clone(),
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        Ok(report)
    }

    pub async fn run_source(
        &self,
        source: &SourceConfig,
        selection: &UnitSelection,
    ) -> Result<SyncRunSummary> {
        let settings = AdapterSettings {
            schemas: self.schemas.clone(),
            moenv_api_key: self.config.moenv_api_key.clone(),
            data_dir: self.config.data_dir.clone(),
        };
        let adapter = adapter_for_source(source, &settings)
            .with_context(|| format!("configuring adapter for {}", source.tag))?;
        adapter
            .preflight()
            .with_context(|| format!("preflight for {}", source.tag))?;

        let linked = SqlxStore::connect(StoreRole::Linked, &self.config.database_url)
            .await
            .with_context(|| format!("opening linked store {}", self.config.database_url))?;
        let orphan = SqlxStore::connect(StoreRole::Orphan, &self.config.archive_database_url)
            .await
            .with_context(|| format!("opening orphan store {}", self.config.archive_database_url))?;

        let companies = SqlCompanyRegistry::new(linked.pool().clone())
            .load_companies()
            .await
            .context("loading company registry")?;
        if companies.is_empty() {
            warn!("company registry is empty; every record will be orphaned");
        }
        let index = CompanyIndex::build(&companies);

        let mut writer = ReconciliationWriter::new(Box::new(linked), Box::new(orphan))
            .with_commit_every(self.config.commit_every);
        let ctx = AdapterContext::new(Uuid::new_v4(), Utc::now());

        let summary = run_units(adapter.as_ref(), &self.http, &ctx, &index, &mut writer, selection)
            .await
            .with_context(|| format!("writing {}", source.tag))?;
        Ok(summary)
    }

    /// Fetch the per-company basic information page and store its disclosure links.
    pub async fn enrich_details(&self, options: &EnrichOptions) -> Result<DetailRunSummary> {
        let started_at = Utc::now();
        let pool = open_pool(&self.config.database_url)
            .await
            .with_context(|| format!("opening linked store {}", self.config.database_url))?;
        migrate(StoreRole::Linked, &pool).await?;
        let registry = SqlCompanyRegistry::new(pool);
        let codes = registry
            .detail_candidates(options.force, options.company.as_deref(), options.limit)
            .await
            .context("selecting companies for detail enrichment")?;

        let patient;
        let http = if options.retry_forever {
            let backoff = BackoffPolicy {
                max_retries: None,
                ..self.config.backoff
            };
            patient = HttpFetcher::new(
                self.config.http_config(backoff),
                DiskCache::new(self.config.cache_dir.clone()),
            )?;
            &patient
        } else {
            &self.http
        };

        let scraper = DetailScraper::default().with_delay(self.config.detail_delay);
        let mut summary = DetailRunSummary {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            candidates: codes.len(),
            enriched: 0,
            empty: 0,
            failed: 0,
        };
        info!(candidates = codes.len(), "starting company detail enrichment");

        let mut previous_hit_network = false;
        for code in &codes {
            if previous_hit_network {
                tokio::time::sleep(scraper.delay).await;
            }
            let page = match scraper.fetch(http, code).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(company = %code, error = %err, "detail fetch failed");
                    summary.failed += 1;
                    previous_hit_network = true;
                    continue;
                }
            };
            previous_hit_network = !page.from_cache;

            let detail = match parse_company_detail(&page.text(), code) {
                Ok(detail) => detail,
                Err(err) => {
                    warn!(company = %code, error = %err, "detail page parse failed");
                    summary.failed += 1;
                    continue;
                }
            };
            match registry.upsert_detail(&detail, &page).await {
                Ok(()) if detail.is_empty() => summary.empty += 1,
                Ok(()) => summary.enriched += 1,
                Err(err) => {
                    warn!(company = %code, error = %err, "detail write failed");
                    summary.failed += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }
}

async fn fetch_and_parse(
    adapter: &dyn DisclosureAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
    unit: &SyncUnit,
) -> Result<Vec<RawDisclosureRecord>, AdapterError> {
    let pages = adapter.fetch_unit(http, ctx, unit).await?;
    adapter.parse_unit(unit, &pages)
}

/// Drive every unit of one adapter through fetch, parse, resolve and write.
/// A failing unit is logged and skipped; only a failed commit aborts the run.
pub async fn run_units(
    adapter: &dyn DisclosureAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
    index: &CompanyIndex,
    writer: &mut ReconciliationWriter,
    selection: &UnitSelection,
) -> Result<SyncRunSummary, StoreError> {
    let mut summary = SyncRunSummary::begin(ctx, adapter.source_tag());
    let units = adapter.units(selection, ctx.started_at);
    info!(source = adapter.source_tag(), units = units.len(), run_id = %ctx.run_id, "starting source sync");

    for unit in units {
        summary.units += 1;
        let span = info_span!("sync_unit", source = adapter.source_tag(), unit = %unit.label());

        let records = match fetch_and_parse(adapter, http, ctx, &unit)
            .instrument(span.clone())
            .await
        {
            Ok(records) => records,
            Err(err) => {
                span.in_scope(|| warn!(error = %err, "unit failed; continuing with next unit"));
                summary.failed_units += 1;
                continue;
            }
        };

        summary.processed += records.len();
        let resolved: Vec<_> = records.into_iter().map(|r| index.resolve(r)).collect();
        let written = writer.upsert(resolved).instrument(span.clone()).await?;
        span.in_scope(|| {
            info!(
                linked = written.linked,
                orphaned = written.orphaned,
                failed = written.failed,
                "unit written"
            )
        });
        summary.absorb(&written);
    }

    summary.finished_at = Utc::now();
    info!(
        source = adapter.source_tag(),
        processed = summary.processed,
        linked = summary.linked,
        orphaned = summary.orphaned,
        failed_units = summary.failed_units,
        failed_writes = summary.failed_writes,
        "source sync finished"
    );
    Ok(summary)
}
