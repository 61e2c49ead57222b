use std::{
    fs,
    path::{Path, PathBuf},
};

use polars::prelude::{ParquetReader, SerReader};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, MandiResult};

/// Dataset-level schema description shared by both sidecars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub columns: Vec<ColumnDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub dtype: String,
}

/// Per-file statistics recorded in `_metadata` so planners can prune
/// without opening every file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Path relative to the dataset root.
    pub path: String,
    pub rows: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub schema: DatasetSchema,
    pub files: Vec<FileDescriptor>,
}

/// Generate `_metadata` and `_common_metadata` sidecars for a dataset.
///
/// `_common_metadata` carries the schema alone; `_metadata` adds
/// per-file row counts and sizes. Existing sidecars are left untouched
/// unless `force_regenerate` is set.
#[tracing::instrument(skip_all, fields(path = %dataset_path.as_ref().display()))]
pub fn generate_dataset_metadata(
    dataset_path: impl AsRef<Path>,
    force_regenerate: bool,
) -> MandiResult<(PathBuf, PathBuf)> {
    let dataset_path = dataset_path.as_ref();
    if !dataset_path.exists() {
        return Err(DataError::FileSystem(format!(
            "dataset path does not exist: {}",
            dataset_path.display()
        ))
        .into());
    }

    let metadata_file = dataset_path.join("_metadata");
    let common_metadata_file = dataset_path.join("_common_metadata");

    if !force_regenerate && metadata_file.exists() && common_metadata_file.exists() {
        tracing::info!("metadata_sidecars_exist");
        return Ok((metadata_file, common_metadata_file));
    }

    let mut files = Vec::new();
    collect_parquet_files(dataset_path, &mut files)?;
    if files.is_empty() {
        return Err(DataError::FileSystem(format!(
            "no Parquet files found in {}",
            dataset_path.display()
        ))
        .into());
    }
    files.sort();

    let mut schema: Option<DatasetSchema> = None;
    let mut descriptors = Vec::with_capacity(files.len());
    for path in &files {
        let size_bytes = fs::metadata(path).map_err(DataError::Io)?.len();
        let file = fs::File::open(path).map_err(DataError::Io)?;
        let frame = ParquetReader::new(file)
            .finish()
            .map_err(|e| DataError::Frame(e.to_string()))?;

        if schema.is_none() {
            schema = Some(DatasetSchema {
                columns: frame
                    .schema()
                    .iter()
                    .map(|(name, dtype)| ColumnDescriptor {
                        name: name.to_string(),
                        dtype: dtype.to_string(),
                    })
                    .collect(),
            });
        }

        let relative = path
            .strip_prefix(dataset_path)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        descriptors.push(FileDescriptor {
            path: relative,
            rows: frame.height(),
            size_bytes,
        });
    }

    let schema = schema.ok_or_else(|| DataError::FileSystem("no readable files".to_string()))?;

    let common = serde_json::to_string_pretty(&schema).map_err(DataError::Json)?;
    fs::write(&common_metadata_file, common).map_err(DataError::Io)?;

    let full = DatasetMetadata {
        schema,
        files: descriptors,
    };
    let raw = serde_json::to_string_pretty(&full).map_err(DataError::Json)?;
    fs::write(&metadata_file, raw).map_err(DataError::Io)?;

    tracing::info!(files = full.files.len(), "metadata_sidecars_generated");
    Ok((metadata_file, common_metadata_file))
}

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

#[cfg(test)]
mod tests {
    use polars::prelude::{ParquetWriter, df};

    use super::*;

    #[test]
    fn sidecars_describe_schema_and_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let partition = root.path().join("year=2024/month=01/day=15");
        fs::create_dir_all(&partition).expect("dirs");

        let mut frame = df! {
            "symbol" => &["RELIANCE", "TCS"],
            "close" => &[2940.0, 3830.0],
        }
        .expect("frame");
        let file = fs::File::create(partition.join("part_0.parquet")).expect("file");
        ParquetWriter::new(file).finish(&mut frame).expect("write");

        let (metadata, common) =
            generate_dataset_metadata(root.path(), false).expect("metadata generated");
        assert!(metadata.exists());
        assert!(common.exists());

        let parsed: DatasetMetadata =
            serde_json::from_str(&fs::read_to_string(&metadata).expect("read"))
                .expect("valid metadata json");
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].rows, 2);
        assert!(parsed.schema.columns.iter().any(|c| c.name == "close"));

        // Second call is a no-op while the sidecars exist.
        let (again, _) = generate_dataset_metadata(root.path(), false).expect("noop");
        assert_eq!(again, metadata);
    }

    #[test]
    fn empty_dataset_is_an_error() {
        let root = tempfile::tempdir().expect("tempdir");
        assert!(generate_dataset_metadata(root.path(), false).is_err());
    }
}
