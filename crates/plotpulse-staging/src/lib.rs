//! Offline loader from JSON-Lines output into the PostgreSQL staging table.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plotpulse_core::NormalizedRecord;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

mod extract;

pub use extract::{dedup_key, extract_fields, StagingRow};

pub const CRATE_NAME: &str = "plotpulse-staging";

pub const DEFAULT_BATCH_SIZE: usize = 100;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Takes precedence over the individual fields when set.
    pub database_url: Option<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "plotpulse_staging".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            database_url: None,
        }
    }
}

impl StagingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database: std::env::var("STAGING_DB_NAME").unwrap_or(defaults.database),
            user: std::env::var("DB_USER").unwrap_or(defaults.user),
            password: std::env::var("DB_PASSWORD").unwrap_or(defaults.password),
            database_url: std::env::var("STAGING_DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return url.parse().context("parsing STAGING_DATABASE_URL");
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user);
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileLoadReport {
    pub file: String,
    pub loaded: usize,
    /// Lines that were not valid records.
    pub malformed: usize,
    /// Rows lost to rolled-back batches.
    pub failed: usize,
}

/// A line that parsed into a staging row, or why it did not.
pub fn parse_line(line: &str) -> Result<StagingRow> {
    let record: NormalizedRecord =
        serde_json::from_str(line.trim()).context("decoding record")?;
    Ok(extract_fields(&record))
}

/// `*.jsonl` files directly under `dir`, sorted by name.
pub fn jsonl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub struct StagingLoader {
    pool: PgPool,
    batch_size: usize,
}

impl StagingLoader {
    pub async fn connect(config: &StagingConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(config.connect_options()?)
            .await
            .context("connecting to staging database")?;
        info!(database = %config.database, "connected to staging database");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running staging migrations")?;
        info!("staging schema is up to date");
        Ok(())
    }

    pub async fn load_file(&self, path: &Path) -> Result<FileLoadReport> {
        let file = File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        info!(file = %path.display(), "loading records");

        let mut report = FileLoadReport {
            file: path.display().to_string(),
            ..FileLoadReport::default()
        };
        let mut lines = BufReader::new(file).lines();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut line_no = 0usize;
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("reading {}", path.display()))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(row) => batch.push(row),
                Err(err) => {
                    warn!(line = line_no, error = %format!("{err:#}"), "skipping malformed line");
                    report.malformed += 1;
                }
            }
            if batch.len() >= self.batch_size {
                self.flush_batch(&mut batch, &mut report, line_no).await;
            }
        }
        if !batch.is_empty() {
            self.flush_batch(&mut batch, &mut report, line_no).await;
        }

        info!(
            file = %report.file,
            loaded = report.loaded,
            malformed = report.malformed,
            failed = report.failed,
            "file loaded"
        );
        Ok(report)
    }

    async fn flush_batch(&self, batch: &mut Vec<StagingRow>, report: &mut FileLoadReport, line_no: usize) {
        match self.insert_batch(batch).await {
            Ok(()) => {
                report.loaded += batch.len();
                info!(loaded = report.loaded, "batch committed");
            }
            Err(err) => {
                error!(line = line_no, error = %format!("{err:#}"), "batch rolled back");
                report.failed += batch.len();
            }
        }
        batch.clear();
    }

    async fn insert_batch(&self, rows: &[StagingRow]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO staging_plot_data (
                    source, collection_date, raw_data,
                    state, district, taluka, village, property_type, zone,
                    rate_per_sqft, rate_per_sqm, effective_date, location,
                    data_quality_score, dedup_key, source_url, scraped_at
                ) VALUES (
                    $1, $2, $3,
                    $4, $5, $6, $7, $8, $9,
                    $10, $11, $12, ST_GeomFromText($13, 4326),
                    $14, $15, $16, $17
                )
                "#,
            )
            .bind(&row.source)
            .bind(row.collection_date)
            .bind(&row.raw_data)
            .bind(&row.state)
            .bind(&row.district)
            .bind(&row.taluka)
            .bind(&row.village)
            .bind(&row.property_type)
            .bind(&row.zone)
            .bind(row.rate_per_sqft)
            .bind(row.rate_per_sqm)
            .bind(row.effective_date)
            .bind(&row.location)
            .bind(row.data_quality_score)
            .bind(&row.dedup_key)
            .bind(&row.source_url)
            .bind(row.scraped_at)
            .execute(&mut *tx)
            .await
            .context("inserting staging row")?;
        }
        tx.commit().await.context("committing batch")?;
        Ok(())
    }

    /// Loads every `*.jsonl` file in `dir`. A file that cannot be opened is
    /// logged and skipped.
    pub async fn load_directory(&self, dir: &Path) -> Result<Vec<FileLoadReport>> {
        let files = jsonl_files(dir)?;
        info!(dir = %dir.display(), files = files.len(), "loading directory");
        let mut reports = Vec::with_capacity(files.len());
        for path in files {
            match self.load_file(&path).await {
                Ok(report) => reports.push(report),
                Err(err) => error!(file = %path.display(), error = %format!("{err:#}"), "file skipped"),
            }
        }
        Ok(reports)
    }

    /// Flags every row whose dedup key was already seen on an earlier row.
    pub async fn mark_duplicates(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT id, MIN(id) OVER (PARTITION BY dedup_key) AS first_id
                  FROM staging_plot_data
            )
            UPDATE staging_plot_data s
               SET is_duplicate = TRUE,
                   duplicate_of = ranked.first_id,
                   updated_at = NOW()
              FROM ranked
             WHERE s.id = ranked.id
               AND ranked.id <> ranked.first_id
               AND NOT s.is_duplicate
            "#,
        )
        .execute(&self.pool)
        .await
        .context("marking duplicates")?;
        info!(marked = result.rows_affected(), "duplicates marked");
        Ok(result.rows_affected())
    }
}
