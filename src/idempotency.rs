use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, MandiResult};

/// Sidecar record proving that the write for `(output_path, key)`
/// completed successfully.
///
/// Markers live next to the output partition and survive restarts; their
/// existence is the at-most-once guarantee for every irreversible step.
/// A zero-row marker with a `skipped` metadata entry records dates that
/// legitimately have no data (e.g. a 404 holiday) so they are not
/// re-fetched forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub output_path: PathBuf,
    pub key: String,
    pub rows: u64,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Filesystem-backed marker store.
///
/// Stateless: every operation addresses the sidecar derived from
/// `(output_path, key)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerStore;

impl MarkerStore {
    pub fn new() -> Self {
        Self
    }

    /// Sidecar file for an output file and key:
    /// `.{file_stem}.{key}.marker.json` in the output's directory.
    pub fn marker_path(&self, output_path: &Path, key: &str) -> PathBuf {
        let stem = output_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let dir = output_path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!(".{stem}.{}.marker.json", sanitize_key(key)))
    }

    /// Whether the write for `(output_path, key)` already completed.
    pub fn is_complete(&self, output_path: &Path, key: &str) -> bool {
        self.read(output_path, key).is_some()
    }

    /// Read a marker. A missing or corrupt sidecar yields `None`; the
    /// step re-runs and the idempotent write overwrites the output.
    pub fn read(&self, output_path: &Path, key: &str) -> Option<Marker> {
        let path = self.marker_path(output_path, key);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Marker>(&raw) {
            Ok(marker) => Some(marker),
            Err(e) => {
                tracing::warn!(
                    marker = %path.display(),
                    error = %e,
                    "marker_corrupt_treating_as_incomplete"
                );
                None
            }
        }
    }

    /// Record completion. Called only after the output is durable; the
    /// sidecar is written to a temp name and renamed so readers never
    /// observe a partial marker.
    pub fn record_complete(
        &self,
        output_path: &Path,
        key: &str,
        rows: u64,
        metadata: BTreeMap<String, String>,
    ) -> MandiResult<Marker> {
        let marker = Marker {
            output_path: output_path.to_path_buf(),
            key: key.to_string(),
            rows,
            metadata,
            created_at: Utc::now(),
        };

        let path = self.marker_path(output_path, key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(DataError::Io)?;
        }

        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(&marker).map_err(DataError::Json)?;
        fs::write(&tmp, raw).map_err(DataError::Io)?;
        fs::rename(&tmp, &path).map_err(DataError::Io)?;

        tracing::info!(
            marker = %path.display(),
            key,
            rows,
            "idempotency_marker_recorded"
        );
        Ok(marker)
    }
}

/// Keys embed dates and sub-partitions ("2024-01-15:BULK"); keep the
/// sidecar name filesystem-safe.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
