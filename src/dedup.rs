use std::collections::HashSet;

use polars::prelude::{BooleanChunked, DataFrame};

use crate::{
    error::{DataError, MandiResult},
    schema::CanonicalCol,
};

/// Combine frames from multiple sources covering overlapping
/// instruments, keyed by business identity (typically ISIN).
///
/// Frames arrive in preference order. Every row of the most-preferred
/// available frame is retained; lower-preference frames contribute only
/// rows whose key is null or absent upstream. The step is
/// source-fault-tolerant: a `None` frame (that source failed) is
/// skipped, and only all-sources-missing is fatal.
#[tracing::instrument(skip_all)]
pub fn deduplicate(
    frames_by_preference: Vec<Option<DataFrame>>,
    key: CanonicalCol,
) -> MandiResult<DataFrame> {
    let available: Vec<DataFrame> = frames_by_preference.into_iter().flatten().collect();
    if available.is_empty() {
        return Err(DataError::EmptyFrame(
            "no source frames available to deduplicate".to_string(),
        )
        .into());
    }

    let mut iter = available.into_iter();
    let mut combined = iter.next().expect("checked non-empty");
    let mut seen = key_set(&combined, key)?;

    for frame in iter {
        let keys = frame
            .column(key.as_str())
            .and_then(|c| c.str().cloned())
            .map_err(|e| DataError::Frame(e.to_string()))?;

        // Null keys cannot collide; they always pass through.
        let mask: BooleanChunked = keys
            .iter()
            .map(|k| match k {
                Some(k) => !seen.contains(k),
                None => true,
            })
            .collect();

        let fresh = frame
            .filter(&mask)
            .map_err(|e| DataError::Frame(e.to_string()))?;

        tracing::info!(
            candidate_rows = frame.height(),
            appended_rows = fresh.height(),
            "dedup_appended_source"
        );

        seen.extend(key_set(&fresh, key)?);
        combined
            .vstack_mut(&fresh)
            .map_err(|e| DataError::Frame(e.to_string()))?;
    }

    tracing::info!(total_rows = combined.height(), "dedup_complete");
    Ok(combined)
}

fn key_set(df: &DataFrame, key: CanonicalCol) -> MandiResult<HashSet<String>> {
    Ok(df
        .column(key.as_str())
        .and_then(|c| c.str().cloned())
        .map_err(|e| DataError::Frame(e.to_string()))?
        .iter()
        .flatten()
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use polars::prelude::df;

    use super::*;

    fn frame(rows: Vec<(&str, Option<&str>, f64)>) -> DataFrame {
        df! {
            "symbol" => rows.iter().map(|r| r.0).collect::<Vec<_>>(),
            "isin" => rows.iter().map(|r| r.1).collect::<Vec<_>>(),
            "close" => rows.iter().map(|r| r.2).collect::<Vec<_>>(),
        }
        .expect("frame")
    }

    #[test]
    fn preferred_source_wins_on_overlap() {
        let nse = frame(vec![
            ("RELIANCE", Some("INE002A01018"), 2940.0),
            ("TCS", Some("INE467B01029"), 3830.0),
        ]);
        let bse = frame(vec![
            ("RELIANCE", Some("INE002A01018"), 2938.0), // overlap, dropped
            ("BSEONLY", Some("INE111X01010"), 55.0),
        ]);

        let combined =
            deduplicate(vec![Some(nse), Some(bse)], CanonicalCol::Isin).expect("dedup runs");
        assert_eq!(combined.height(), 3);

        // The overlapping ISIN carries the preferred source's close.
        let closes = combined
            .column("close")
            .and_then(|c| c.f64().cloned())
            .expect("close column");
        assert_eq!(closes.get(0), Some(2940.0));
    }

    #[test]
    fn null_keys_always_pass_through() {
        let nse = frame(vec![("RELIANCE", Some("INE002A01018"), 2940.0)]);
        let bse = frame(vec![
            ("NOISIN1", None, 10.0),
            ("NOISIN2", None, 11.0),
        ]);

        let combined =
            deduplicate(vec![Some(nse), Some(bse)], CanonicalCol::Isin).expect("dedup runs");
        assert_eq!(combined.height(), 3);
    }

    #[test]
    fn single_available_source_is_returned_unchanged() {
        let bse = frame(vec![("RELIANCE", Some("INE002A01018"), 2938.0)]);
        let combined =
            deduplicate(vec![None, Some(bse.clone())], CanonicalCol::Isin).expect("dedup runs");
        assert_eq!(combined.height(), bse.height());
    }

    #[test]
    fn all_sources_missing_is_fatal() {
        let err = deduplicate(vec![None, None], CanonicalCol::Isin).expect_err("must fail");
        assert!(!err.is_retryable());
    }

    #[test]
    fn overlap_arithmetic_matches_the_contract() {
        // 5 preferred rows, 4 secondary rows, 3 overlapping keys:
        // 5 + (4 - 3) = 6 rows.
        let nse = frame(vec![
            ("N0", Some("ISIN0"), 0.0),
            ("N1", Some("ISIN1"), 1.0),
            ("N2", Some("ISIN2"), 2.0),
            ("N3", Some("ISIN3"), 3.0),
            ("N4", Some("ISIN4"), 4.0),
        ]);
        let bse = frame(vec![
            ("B0", Some("ISIN0"), 0.0),
            ("B1", Some("ISIN1"), 1.0),
            ("B2", Some("ISIN2"), 2.0),
            ("B3", Some("ISIN-NEW"), 3.0),
        ]);

        let combined =
            deduplicate(vec![Some(nse), Some(bse)], CanonicalCol::Isin).expect("dedup runs");
        assert_eq!(combined.height(), 6);
    }
}
