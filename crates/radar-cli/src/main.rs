use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use radar_adapters::UnitSelection;
use radar_core::MarketSegment;
use radar_sync::{EnrichOptions, RadarConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "radar-cli")]
#[command(about = "Disclosure Radar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, resolve and store disclosures for one source, a source kind, or `all`.
    Sync {
        #[arg(default_value = "all")]
        source: String,
        /// First ROC year to fetch (periodic table sources).
        #[arg(long)]
        from_year: Option<i32>,
        #[arg(long)]
        to_year: Option<i32>,
        /// Market segments, e.g. `sii,otc`.
        #[arg(long, value_delimiter = ',')]
        market: Vec<MarketSegment>,
        /// Restrict multi-dataset sources to these dataset tags.
        #[arg(long, value_delimiter = ',')]
        dataset: Vec<String>,
    },
    /// Scrape stakeholder and governance links for registry companies.
    EnrichDetails {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        retry_forever: bool,
    },
    /// Create or upgrade both databases.
    Migrate,
    /// List configured sources.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let pipeline = SyncPipeline::new(RadarConfig::from_env()?)?;

    match cli.command {
        Commands::Sync {
            source,
            from_year,
            to_year,
            market,
            dataset,
        } => {
            let selection = UnitSelection {
                from_year,
                to_year,
                markets: market,
                datasets: dataset,
            };
            let report = pipeline.sync(&source, &selection).await?;
            for run in &report.runs {
                println!(
                    "sync complete: source={} run_id={} units={} processed={} linked={} orphaned={} inserted={} updated={} failed_units={} failed_writes={}",
                    run.source_tag,
                    run.run_id,
                    run.units,
                    run.processed,
                    run.linked,
                    run.orphaned,
                    run.inserted,
                    run.updated,
                    run.failed_units,
                    run.failed_writes
                );
            }
            if !report.failed_sources.is_empty() {
                for failed in &report.failed_sources {
                    eprintln!("sync failed: source={} error={}", failed.source_tag, failed.error);
                }
                bail!("{} source(s) failed", report.failed_sources.len());
            }
        }
        Commands::EnrichDetails {
            force,
            limit,
            company,
            retry_forever,
        } => {
            let summary = pipeline
                .enrich_details(&EnrichOptions {
                    force,
                    limit,
                    company,
                    retry_forever,
                })
                .await?;
            println!(
                "detail enrichment complete: run_id={} candidates={} enriched={} empty={} failed={}",
                summary.run_id, summary.candidates, summary.enriched, summary.empty, summary.failed
            );
        }
        Commands::Migrate => {
            pipeline.migrate().await?;
            println!("migrations applied");
        }
        Commands::Sources => {
            let registry = pipeline.load_source_registry().await?;
            for source in &registry.sources {
                println!(
                    "{:<10} {:<22} enabled={} {}",
                    source.tag,
                    source.kind.as_str(),
                    source.enabled,
                    source.display_name.as_deref().unwrap_or("")
                );
            }
        }
    }

    Ok(())
}
