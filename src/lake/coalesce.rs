use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use polars::prelude::{DataFrame, ParquetReader, ParquetWriter, SerReader, StatisticsOptions};
use uuid::Uuid;

use crate::{
    error::{DataError, MandiResult},
    lake::Compression,
};

/// Tunables for the small-file coalescer.
#[derive(Debug, Clone, Copy)]
pub struct CoalesceOptions {
    pub target_file_size_mb: u64,
    /// Files at or below this size are candidates.
    pub min_file_size_mb: u64,
    /// Report without mutating.
    pub dry_run: bool,
}

impl Default for CoalesceOptions {
    fn default() -> Self {
        Self {
            target_file_size_mb: 128,
            min_file_size_mb: 10,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoalesceReport {
    /// Small files consumed (deleted after rewrite).
    pub files_coalesced: usize,
    /// Partition directories rewritten.
    pub directories: usize,
    pub dry_run: bool,
}

/// Merge small Parquet files within each partition directory into one
/// file, preserving row order per directory and deleting the originals.
///
/// Many tiny files accumulate from per-date writes; query engines pay
/// per-file planning costs, so ingestion periodically compacts them.
#[tracing::instrument(skip_all, fields(path = %dataset_path.as_ref().display()))]
pub fn coalesce_small_files(
    dataset_path: impl AsRef<Path>,
    options: CoalesceOptions,
) -> MandiResult<CoalesceReport> {
    let dataset_path = dataset_path.as_ref();
    if !dataset_path.exists() {
        tracing::warn!("dataset_path_missing");
        return Ok(CoalesceReport::default());
    }

    let mut files = Vec::new();
    collect_parquet_files(dataset_path, &mut files)?;

    let min_bytes = options.min_file_size_mb * 1024 * 1024;
    let mut by_dir: BTreeMap<PathBuf, Vec<(PathBuf, u64)>> = BTreeMap::new();
    for path in files {
        let size = fs::metadata(&path).map_err(DataError::Io)?.len();
        if size <= min_bytes
            && let Some(parent) = path.parent()
        {
            by_dir
                .entry(parent.to_path_buf())
                .or_default()
                .push((path, size));
        }
    }

    let groups: Vec<(&PathBuf, &Vec<(PathBuf, u64)>)> =
        by_dir.iter().filter(|(_, files)| files.len() >= 2).collect();

    if groups.is_empty() {
        tracing::info!("no_small_files_to_coalesce");
        return Ok(CoalesceReport {
            dry_run: options.dry_run,
            ..CoalesceReport::default()
        });
    }

    let candidate_count: usize = groups.iter().map(|(_, f)| f.len()).sum();
    tracing::info!(
        directories = groups.len(),
        files = candidate_count,
        dry_run = options.dry_run,
        "coalescing_small_files"
    );

    if options.dry_run {
        return Ok(CoalesceReport {
            files_coalesced: candidate_count,
            directories: groups.len(),
            dry_run: true,
        });
    }

    let mut report = CoalesceReport::default();
    for (dir, group) in groups {
        let mut combined: Option<DataFrame> = None;
        for (path, _) in group {
            let file = fs::File::open(path).map_err(DataError::Io)?;
            let frame = ParquetReader::new(file)
                .finish()
                .map_err(|e| DataError::Frame(e.to_string()))?;
            combined = Some(match combined {
                None => frame,
                Some(mut acc) => {
                    acc.vstack_mut(&frame)
                        .map_err(|e| DataError::Frame(e.to_string()))?;
                    acc
                }
            });
        }
        let Some(mut combined) = combined else { continue };

        let dir_name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("partition");
        let tmp = dir.join(format!(".tmp.{}", Uuid::new_v4()));
        let file = fs::File::create(&tmp).map_err(DataError::Io)?;
        ParquetWriter::new(file)
            .with_compression(Compression::Snappy.to_parquet())
            .with_statistics(StatisticsOptions::full())
            .finish(&mut combined)
            .map_err(|e| DataError::Frame(e.to_string()))?;

        let final_path = dir.join(format!("coalesced_{dir_name}.parquet"));
        fs::rename(&tmp, &final_path).map_err(DataError::Io)?;

        for (path, _) in group {
            fs::remove_file(path).map_err(DataError::Io)?;
            report.files_coalesced += 1;
        }
        report.directories += 1;

        tracing::info!(
            partition = %dir.display(),
            input_files = group.len(),
            output = %final_path.display(),
            rows = combined.height(),
            "coalesced_partition"
        );
    }

    Ok(report)
}

/// Data files only: metadata sidecars (`_metadata`) and in-flight temp
/// files (`.tmp.*`) are invisible to the coalescer.
fn collect_parquet_files(dir: &Path, out: &mut Vec<PathBuf>) -> MandiResult<()> {
    for entry in fs::read_dir(dir).map_err(DataError::Io)? {
        let entry = entry.map_err(DataError::Io)?;
        let path = entry.path();
        if path.is_dir() {
            collect_parquet_files(&path, out)?;
        } else {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".parquet") && !name.starts_with('_') && !name.starts_with('.') {
                out.push(path);
            }
        }
    }
    Ok(())
}
