use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use plotpulse_adapters::{adapter_for_source, CollectionTarget, FetchedPage, SourceAdapter};
use plotpulse_core::{normalize_candidate, NormalizeContext};
use plotpulse_storage::{
    Geocoder, HttpSession, HttpTransport, JsonlSink, ReqwestTransport, Sleeper, TokioSleeper,
};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::city_codes::CityCodeTable;
use crate::registry::{SourceConfig, SourceRegistry};
use crate::targets::{expand_targets, SkippedTarget};
use crate::{build_geocoder, SyncConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub source: String,
    pub status: RunStatus,
    pub records_collected: usize,
    pub records_rejected: usize,
    pub rows_skipped: usize,
    pub duplicates_dropped: usize,
    pub targets_skipped: Vec<SkippedTarget>,
    pub output_files: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub error: Option<String>,
}

impl RunSummary {
    fn start(source: &str) -> Self {
        let now = Utc::now();
        Self {
            source: source.to_string(),
            status: RunStatus::Success,
            records_collected: 0,
            records_rejected: 0,
            rows_skipped: 0,
            duplicates_dropped: 0,
            targets_skipped: Vec::new(),
            output_files: Vec::new(),
            started_at: now,
            finished_at: now,
            duration_secs: 0.0,
            error: None,
        }
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_secs = (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summaries: Vec<RunSummary>,
    pub reports_dir: String,
}

/// Caps applied on top of each source's registry settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunLimits {
    pub max_targets: Option<usize>,
    pub max_pages: Option<u32>,
}

pub struct CollectionPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    geocoder: Option<Geocoder>,
    limits: RunLimits,
}

impl CollectionPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        transport: Arc<dyn HttpTransport>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            sleeper,
            geocoder: None,
            limits: RunLimits::default(),
        }
    }

    /// Production wiring: registry from disk, `reqwest` transport, real sleeps,
    /// and a geocoder when any enabled source asks for one.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file)?;
        let transport = ReqwestTransport::new(config.http_timeout)?;
        let wants_geocoder = registry.enabled().any(|s| s.geocode);
        let geocoder = if wants_geocoder {
            Some(build_geocoder(&config).await?)
        } else {
            None
        };

        let mut pipeline = Self::new(config, registry, Arc::new(transport), Arc::new(TokioSleeper));
        pipeline.geocoder = geocoder;
        Ok(pipeline)
    }

    pub fn with_geocoder(mut self, geocoder: Geocoder) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn geocoder(&self) -> Option<&Geocoder> {
        self.geocoder.as_ref()
    }

    /// Runs one source. Failures end up in the summary, never as an `Err`.
    pub async fn run_source(&mut self, source_id: &str) -> RunSummary {
        let mut summary = RunSummary::start(source_id);
        let span = info_span!("collect_source", source_id = %source_id);
        let result = async {
            let source = self
                .registry
                .get(source_id)
                .cloned()
                .with_context(|| format!("unknown source {source_id}"))?;
            self.collect(&source, &mut summary).await
        }
        .instrument(span)
        .await;

        if let Err(err) = result {
            warn!(source_id, error = %format!("{err:#}"), "collection run failed");
            summary.status = RunStatus::Failed;
            summary.error = Some(format!("{err:#}"));
        }
        summary.finish();
        info!(
            source_id,
            status = ?summary.status,
            collected = summary.records_collected,
            rejected = summary.records_rejected,
            skipped_rows = summary.rows_skipped,
            skipped_targets = summary.targets_skipped.len(),
            "collection run finished"
        );
        summary
    }

    /// Runs every enabled source in registry order and writes the run report.
    pub async fn run_all(&mut self) -> Result<CollectionReport> {
        let source_ids: Vec<String> = self
            .registry
            .enabled()
            .map(|s| s.source_id.clone())
            .collect();
        self.run_sources(&source_ids).await
    }

    /// Runs the given sources, enabled or not, and writes the run report.
    pub async fn run_sources(&mut self, source_ids: &[String]) -> Result<CollectionReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = source_ids.len(), "collection run started");

        let mut summaries = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            summaries.push(self.run_source(source_id).await);
        }

        let finished_at = Utc::now();
        let reports_dir = self.config.output_dir.join("reports").join(run_id.to_string());
        let report = CollectionReport {
            run_id,
            started_at,
            finished_at,
            summaries,
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &report).await?;
        Ok(report)
    }

    fn city_codes_for(&self, source: &SourceConfig) -> Result<Option<CityCodeTable>> {
        source
            .city_codes
            .as_ref()
            .map(|rel| CityCodeTable::load(&self.config.workspace_root.join(rel)))
            .transpose()
    }

    async fn collect(&mut self, source: &SourceConfig, summary: &mut RunSummary) -> Result<()> {
        let adapter = adapter_for_source(&source.adapter_spec())
            .with_context(|| format!("building adapter for {}", source.source_id))?;
        let city_codes = self.city_codes_for(source)?;
        let plan = expand_targets(source, city_codes.as_ref(), self.limits.max_targets);
        summary.targets_skipped = plan.skipped;
        info!(targets = plan.targets.len(), "expanded targets");

        let mut session = HttpSession::new(
            source.source_id.clone(),
            &source.http_config(self.config.http_timeout, self.config.rng_seed),
            self.transport.clone(),
            self.sleeper.clone(),
        );
        let ctx = NormalizeContext::now(source.source_id.clone());
        let date = ctx.collection_date.date_naive();
        let max_pages = self
            .limits
            .max_pages
            .map_or(source.max_pages, |cap| cap.min(source.max_pages))
            .max(1);

        let mut sinks = StreamSinks::new(self.config.output_dir.clone(), date);
        let outcome = async {
            for (index, target) in plan.targets.iter().enumerate() {
                if index > 0 && source.break_between_targets {
                    session.target_break().await;
                }
                self.collect_target(
                    source,
                    adapter.as_ref(),
                    &mut session,
                    target,
                    max_pages,
                    &ctx,
                    &mut sinks,
                    summary,
                )
                .await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        summary.output_files = sinks.finish().await?;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect_target(
        &mut self,
        source: &SourceConfig,
        adapter: &dyn SourceAdapter,
        session: &mut HttpSession,
        target: &CollectionTarget,
        max_pages: u32,
        ctx: &NormalizeContext,
        sinks: &mut StreamSinks,
        summary: &mut RunSummary,
    ) -> Result<()> {
        info!(label = %target.label(), "collecting target");
        let stream = source.stream_for(target);
        let mut seen_ids: HashSet<String> = HashSet::new();

        for page_no in 1..=max_pages {
            let request = match adapter.build_request(target, page_no) {
                Ok(request) => request,
                Err(err) => {
                    warn!(label = %target.label(), error = %err, "cannot build request");
                    break;
                }
            };
            let response = match session.request(&request, source.max_retries).await {
                Ok(response) => response,
                Err(err) if err.is_rate_limited() => {
                    return Err(err).with_context(|| format!("collecting {}", target.label()));
                }
                Err(err) => {
                    warn!(label = %target.label(), page = page_no, error = %err, "fetch failed");
                    break;
                }
            };

            let page = FetchedPage::from_response(&response, Utc::now());
            let parsed = match adapter.parse_page(target, &page) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(label = %target.label(), page = page_no, error = %err, "unparsable page");
                    break;
                }
            };
            summary.rows_skipped += parsed.skipped;
            if parsed.records.is_empty() {
                debug!(label = %target.label(), page = page_no, "empty page");
                break;
            }

            let mut page_collected = 0usize;
            for raw in parsed.records {
                if let Some(id) = raw.listing_id() {
                    if !seen_ids.insert(id.to_string()) {
                        summary.duplicates_dropped += 1;
                        continue;
                    }
                }

                let mut candidate = raw.into_candidate();
                if source.geocode && candidate.coordinates.is_none() {
                    if let (Some(geocoder), Some(address)) =
                        (self.geocoder.as_mut(), candidate.geocode_address())
                    {
                        candidate.coordinates = geocoder
                            .geocode(&address, Some(&target.name), target.state.as_deref())
                            .await;
                    }
                }

                match normalize_candidate(candidate, ctx) {
                    Ok(record) => {
                        sinks.append(&stream, &record).await?;
                        summary.records_collected += 1;
                        page_collected += 1;
                    }
                    Err(issues) => {
                        let reasons: Vec<String> = issues.iter().map(ToString::to_string).collect();
                        debug!(label = %target.label(), ?reasons, "record rejected");
                        summary.records_rejected += 1;
                    }
                }
            }
            info!(label = %target.label(), page = page_no, collected = page_collected, "page done");

            if !parsed.has_more {
                break;
            }
        }
        Ok(())
    }
}

/// Output files of one source run, opened on their first record so a stream
/// that yields nothing leaves no file behind.
struct StreamSinks {
    output_dir: PathBuf,
    date: NaiveDate,
    open: BTreeMap<String, JsonlSink>,
}

impl StreamSinks {
    fn new(output_dir: PathBuf, date: NaiveDate) -> Self {
        Self {
            output_dir,
            date,
            open: BTreeMap::new(),
        }
    }

    async fn append<T: Serialize>(&mut self, stream: &str, record: &T) -> Result<()> {
        let sink = match self.open.entry(stream.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let sink = JsonlSink::open(&self.output_dir, entry.key(), self.date).await?;
                entry.insert(sink)
            }
        };
        sink.append(record).await
    }

    /// Flushes every opened stream and returns the file paths.
    async fn finish(mut self) -> Result<Vec<String>> {
        let mut files = Vec::with_capacity(self.open.len());
        for sink in self.open.values_mut() {
            sink.flush().await?;
            files.push(sink.path().display().to_string());
        }
        Ok(files)
    }
}

async fn write_reports(reports_dir: &Path, report: &CollectionReport) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing collection report")?;
    fs::write(reports_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    let rows = report
        .summaries
        .iter()
        .map(|s| {
            format!(
                "| {} | {:?} | {} | {} | {} | {} | {:.1} |",
                s.source,
                s.status,
                s.records_collected,
                s.records_rejected,
                s.rows_skipped,
                s.targets_skipped.len(),
                s.duration_secs
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let brief = format!(
        "# PlotPulse collection run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n\n| Source | Status | Collected | Rejected | Skipped rows | Skipped targets | Seconds |\n|---|---|---|---|---|---|---|\n{}\n",
        report.run_id, report.started_at, report.finished_at, rows
    );
    fs::write(reports_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;
    Ok(())
}
