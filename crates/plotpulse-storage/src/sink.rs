use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};

/// `{stream}_{YYYY-MM-DD}.jsonl`
pub fn output_file_name(stream: &str, date: NaiveDate) -> String {
    format!("{stream}_{}.jsonl", date.format("%Y-%m-%d"))
}

/// Append-only JSON-Lines writer for one output stream.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<fs::File>,
    written: usize,
}

impl JsonlSink {
    pub async fn open(output_dir: &Path, stream: &str, date: NaiveDate) -> anyhow::Result<Self> {
        fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("creating output directory {}", output_dir.display()))?;

        let path = output_dir.join(output_file_name(stream, date));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening output file {}", path.display()))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub async fn append<T: Serialize>(&mut self, record: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record).context("serializing record")?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("writing to {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines appended through this handle.
    pub fn written(&self) -> usize {
        self.written
    }
}
