use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use plotpulse_staging::{StagingConfig, StagingLoader};
use plotpulse_sync::{RunLimits, SourceRegistry, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "plotpulse")]
#[command(about = "PlotPulse listing and circle-rate collection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect from the named sources, or every enabled source.
    Collect {
        #[arg(long = "source")]
        sources: Vec<String>,
        #[arg(long)]
        max_targets: Option<usize>,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// List the configured sources.
    Sources,
    /// Geocode one address through the cache.
    Geocode {
        address: String,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        state: Option<String>,
    },
    /// Rebuild a source's city-code table from the portal's autosuggest endpoint.
    DiscoverCityCodes {
        #[arg(long, default_value = "magicbricks_api")]
        source: String,
        /// Search term to query; repeatable. Defaults to the built-in list.
        #[arg(long = "term")]
        terms: Vec<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Create or update the staging schema.
    Migrate,
    /// Load JSON-Lines output into the staging table.
    Load {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        mark_duplicates: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Collect {
        sources: Vec::new(),
        max_targets: None,
        max_pages: None,
    });

    match command {
        Commands::Collect {
            sources,
            max_targets,
            max_pages,
        } => {
            let limits = RunLimits {
                max_targets,
                max_pages,
            };
            let report = plotpulse_sync::run_collection_from_env(&sources, limits).await?;
            for summary in &report.summaries {
                println!(
                    "{}: {:?} collected={} rejected={} skipped_rows={} skipped_targets={} files={}",
                    summary.source,
                    summary.status,
                    summary.records_collected,
                    summary.records_rejected,
                    summary.rows_skipped,
                    summary.targets_skipped.len(),
                    summary.output_files.join(",")
                );
                if let Some(err) = &summary.error {
                    println!("  error: {err}");
                }
            }
            println!("run_id={} reports={}", report.run_id, report.reports_dir);
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = SourceRegistry::load(&config.sources_file)?;
            for source in &registry.sources {
                println!(
                    "{:<20} {:<8} {:<12?} targets={:<3} {}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.crawlability,
                    source.targets.len(),
                    source.display_name
                );
            }
        }
        Commands::Geocode {
            address,
            city,
            state,
        } => {
            let config = SyncConfig::from_env();
            let mut geocoder = plotpulse_sync::build_geocoder(&config).await?;
            match geocoder
                .geocode(&address, city.as_deref(), state.as_deref())
                .await
            {
                Some(c) => println!("{:.6},{:.6}", c.latitude, c.longitude),
                None => {
                    warn!(%address, "no coordinates found");
                    println!("not found");
                }
            }
        }
        Commands::DiscoverCityCodes {
            source,
            terms,
            output,
        } => {
            let (discovery, path) =
                plotpulse_sync::discover_city_codes_from_env(&source, &terms, output).await?;
            for city in discovery.table.cities() {
                println!(
                    "{:<24} {:<8} {}",
                    city.city,
                    city.code,
                    city.state.as_deref().unwrap_or("-")
                );
            }
            println!(
                "cities={} terms={} failed={} written={}",
                discovery.table.len(),
                discovery.terms_queried,
                discovery.terms_failed,
                path.display()
            );
        }
        Commands::Migrate => {
            let loader = StagingLoader::connect(&StagingConfig::from_env()).await?;
            loader.migrate().await?;
            println!("staging schema ready");
        }
        Commands::Load {
            dir,
            mark_duplicates,
        } => {
            let dir = dir.unwrap_or_else(|| SyncConfig::from_env().output_dir);
            let loader = StagingLoader::connect(&StagingConfig::from_env()).await?;
            let reports = loader.load_directory(&dir).await?;
            let mut total = 0;
            for report in &reports {
                println!(
                    "{}: loaded={} malformed={} failed={}",
                    report.file, report.loaded, report.malformed, report.failed
                );
                total += report.loaded;
            }
            info!(files = reports.len(), total, "load finished");
            println!("total: {total} records");
            if mark_duplicates {
                let marked = loader.mark_duplicates().await?;
                println!("marked {marked} duplicates");
            }
        }
    }

    Ok(())
}
