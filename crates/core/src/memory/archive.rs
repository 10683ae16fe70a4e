use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;

use super::backend::MemoryError;

/// Append-only gzip JSON-lines archive for rotated summaries.
///
/// Each append writes one gzip member; readers use a multi-member decoder.
#[derive(Debug, Clone)]
pub struct WarmArchive {
    path: PathBuf,
}

impl WarmArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append lines off the async runtime. Returns the number written.
    pub async fn append(&self, lines: Vec<Value>) -> Result<usize, MemoryError> {
        if lines.is_empty() {
            return Ok(0);
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_blocking(&path, &lines)).await?
    }

    pub async fn read_all(&self) -> Result<Vec<Value>, MemoryError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_blocking(&path)).await?
    }

    pub fn size_bytes(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

fn append_blocking(path: &Path, lines: &[Value]) -> Result<usize, MemoryError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut gz = GzEncoder::new(file, Compression::default());
    for line in lines {
        serde_json::to_writer(&mut gz, line)?;
        gz.write_all(b"\n")?;
    }
    gz.finish()?.sync_data()?;
    Ok(lines.len())
}

fn read_blocking(path: &Path) -> Result<Vec<Value>, MemoryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(MultiGzDecoder::new(fs::File::open(path)?));
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            out.push(serde_json::from_str(&line)?);
        }
    }
    Ok(out)
}
