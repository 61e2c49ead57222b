use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

pub mod coalesce;
pub mod metadata;
pub mod writer;

pub use coalesce::{CoalesceOptions, CoalesceReport, coalesce_small_files};
pub use metadata::generate_dataset_metadata;
pub use writer::{LakeWriter, WriteReport, WriteRequest};

/// Parquet codec for lake files. Snappy is the default tradeoff for
/// scan-heavy readers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    #[default]
    Snappy,
    Gzip,
    Zstd,
    None,
}

impl Compression {
    pub(crate) fn to_parquet(self) -> polars::prelude::ParquetCompression {
        use polars::prelude::ParquetCompression;
        match self {
            Self::Snappy => ParquetCompression::Snappy,
            Self::Gzip => ParquetCompression::Gzip(None),
            Self::Zstd => ParquetCompression::Zstd(None),
            Self::None => ParquetCompression::Uncompressed,
        }
    }
}
