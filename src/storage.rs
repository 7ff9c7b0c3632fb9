//! Trace archives
//!
//! A batch is persisted as one CSV file: the shared independent axis in the
//! first column and every captured dependent trace in the following columns.
//! Acquisition metadata is written ahead of the CSV header as `# ` prefixed
//! pretty JSON lines, so the file stays readable by spreadsheet tools that
//! skip comment lines while [`read_archive`] can still recover it.

use crate::acquisition::{InstrumentFamily, TraceBatch};
use crate::error::{AcqError, AcqResult};
use crate::scaling::AxisUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata stored in the archive header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// `*IDN?` answer of the instrument.
    pub instrument: String,
    /// Resource string the session was opened on.
    pub resource: String,
    /// Instrument family.
    pub family: InstrumentFamily,
    /// Time the archive was assembled.
    pub created: DateTime<Utc>,
    /// Unit of the first column.
    pub x_unit: AxisUnit,
    /// Unit of the trace columns.
    pub y_unit: AxisUnit,
    /// Points per trace.
    pub points: usize,
    /// Traces requested for the batch.
    pub requested: usize,
    /// Why the batch ended early, if it did.
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Shared axis plus every captured trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceArchive {
    /// Header metadata.
    pub metadata: ArchiveMetadata,
    /// Independent axis (Hz or s).
    pub x: Vec<f64>,
    /// Dependent traces, each `x.len()` long.
    pub traces: Vec<Vec<f64>>,
}

impl TraceArchive {
    /// Assemble an archive from a captured batch.
    ///
    /// Fails when nothing was captured or the traces do not share one axis length.
    pub fn from_batch(
        batch: &TraceBatch,
        family: InstrumentFamily,
        instrument: &str,
        resource: &str,
    ) -> AcqResult<Self> {
        let first = batch
            .traces
            .first()
            .ok_or_else(|| AcqError::Storage("No traces captured".into()))?;

        let mut traces = Vec::with_capacity(batch.traces.len());
        for trace in &batch.traces {
            if trace.len() != first.len() {
                return Err(AcqError::LengthMismatch {
                    declared: first.len(),
                    actual: trace.len(),
                });
            }
            traces.push(trace.y().to_vec());
        }

        Ok(Self {
            metadata: ArchiveMetadata {
                instrument: instrument.to_string(),
                resource: resource.to_string(),
                family,
                created: Utc::now(),
                x_unit: first.x_unit(),
                y_unit: first.y_unit(),
                points: first.len(),
                requested: batch.requested,
                stop_reason: batch.stop_reason.as_ref().map(ToString::to_string),
            },
            x: first.x().to_vec(),
            traces,
        })
    }
}

/// Timestamped archive path inside `dir`, e.g. `oscilloscope_20250101_120000.csv`.
pub fn archive_path(dir: &Path, family: InstrumentFamily) -> PathBuf {
    dir.join(format!(
        "{}_{}.csv",
        family,
        Utc::now().format("%Y%m%d_%H%M%S")
    ))
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tracing::info;

    fn storage_err(context: &str, e: impl std::fmt::Display) -> AcqError {
        AcqError::Storage(format!("{}: {}", context, e))
    }

    /// Write `archive` to `path`, creating parent directories.
    pub fn write_archive(archive: &TraceArchive, path: &Path) -> AcqResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| storage_err(&format!("Failed to create {}", parent.display()), e))?;
        }

        let mut file = File::create(path)
            .map_err(|e| storage_err(&format!("Failed to create {}", path.display()), e))?;

        let json_string = serde_json::to_string_pretty(&archive.metadata)
            .map_err(|e| storage_err("Failed to serialize metadata", e))?;
        for line in json_string.lines() {
            file.write_all(b"# ")
                .and_then(|_| file.write_all(line.as_bytes()))
                .and_then(|_| file.write_all(b"\n"))?;
        }

        let mut writer = csv::Writer::from_writer(file);
        let mut header = vec!["x".to_string()];
        header.extend((1..=archive.traces.len()).map(|i| format!("trace_{}", i)));
        writer.write_record(&header)?;

        for (i, x) in archive.x.iter().enumerate() {
            let mut record = Vec::with_capacity(archive.traces.len() + 1);
            record.push(x.to_string());
            for trace in &archive.traces {
                let y = trace.get(i).ok_or(AcqError::LengthMismatch {
                    declared: archive.x.len(),
                    actual: trace.len(),
                })?;
                record.push(y.to_string());
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;

        info!(
            "Saved {} traces x {} points to '{}'",
            archive.traces.len(),
            archive.x.len(),
            path.display()
        );
        Ok(())
    }

    /// Load an archive written by [`write_archive`].
    pub fn read_archive(path: &Path) -> AcqResult<TraceArchive> {
        let contents = fs::read_to_string(path)
            .map_err(|e| storage_err(&format!("Failed to read {}", path.display()), e))?;

        let mut json = String::new();
        let mut body_start = 0;
        for line in contents.split_inclusive('\n') {
            match line.strip_prefix('#') {
                Some(meta) => {
                    json.push_str(meta.strip_prefix(' ').unwrap_or(meta));
                    body_start += line.len();
                }
                None => break,
            }
        }
        let metadata: ArchiveMetadata = serde_json::from_str(&json)
            .map_err(|e| storage_err("Failed to parse archive metadata", e))?;

        let mut reader = csv::Reader::from_reader(contents[body_start..].as_bytes());
        let columns = reader.headers()?.len();
        if columns < 2 {
            return Err(AcqError::Storage(format!(
                "Archive {} has no trace columns",
                path.display()
            )));
        }

        let mut x = Vec::new();
        let mut traces = vec![Vec::new(); columns - 1];
        for record in reader.records() {
            let record = record?;
            for (col, field) in record.iter().enumerate() {
                let value = field.trim().parse::<f64>().map_err(|_| AcqError::NumericParseError {
                    token: field.trim().to_string(),
                })?;
                match col {
                    0 => x.push(value),
                    n => traces[n - 1].push(value),
                }
            }
        }

        Ok(TraceArchive {
            metadata,
            x,
            traces,
        })
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    fn disabled() -> AcqError {
        AcqError::Storage("CSV storage not enabled. Rebuild with --features storage_csv".into())
    }

    /// Write `archive` to `path` (unavailable without `storage_csv`).
    pub fn write_archive(_archive: &TraceArchive, _path: &Path) -> AcqResult<()> {
        Err(disabled())
    }

    /// Load an archive (unavailable without `storage_csv`).
    pub fn read_archive(_path: &Path) -> AcqResult<TraceArchive> {
        Err(disabled())
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{read_archive, write_archive};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{read_archive, write_archive};
