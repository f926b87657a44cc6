//! # Frame Helpers
//!
//! Shared Polars plumbing for every stage of the prediction pipeline: name and
//! cell normalization, pandas-style inner joins, and projections that tolerate
//! absent columns. Recipe tables, requests and combined feature rows are all
//! plain `DataFrame`s.
//!
//! - Column names are unique within a frame. Normalization that would create a
//!   duplicate fails with [`FrameError::DuplicateColumn`].
//! - Joins follow pandas `merge(how = "inner")`: both key columns are kept and
//!   colliding non-key names get `_x` / `_y` suffixes.

use polars::prelude::*;
use std::collections::HashSet;
use thiserror::Error;

/// Suffix applied to a left-hand column whose name also appears on the right.
pub const LEFT_SUFFIX: &str = "_x";
/// Suffix applied to a right-hand column whose name also appears on the left.
pub const RIGHT_SUFFIX: &str = "_y";

const JOIN_KEY: &str = "__join_key";
const LEFT_ROW: &str = "__left_row";
const RIGHT_ROW: &str = "__right_row";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Column '{0}' appears more than once after name normalization.")]
    DuplicateColumn(String),
    #[error("The join column '{column}' was not found in the {side} table.")]
    JoinColumnNotFound { column: String, side: &'static str },
}

/// Trim surrounding whitespace and lowercase.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn column_names(frame: &DataFrame) -> Vec<String> {
    frame
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn has_column(frame: &DataFrame, name: &str) -> bool {
    frame.get_column_names().iter().any(|c| c.as_str() == name)
}

/// Returns a copy with every header and string cell trimmed and lowercased.
/// Strings that end up empty become null, so "missing" always means null.
pub fn normalize(frame: &DataFrame) -> Result<DataFrame, FrameError> {
    let names: Vec<String> = column_names(frame)
        .iter()
        .map(|n| normalize_name(n))
        .collect();
    let mut seen = HashSet::with_capacity(names.len());
    for name in &names {
        if !seen.insert(name.as_str()) {
            return Err(FrameError::DuplicateColumn(name.clone()));
        }
    }

    let mut columns: Vec<Column> = Vec::with_capacity(frame.width());
    for (column, name) in frame.get_columns().iter().zip(&names) {
        let series = column.as_materialized_series();
        let series = if series.dtype() == &DataType::String {
            let text: StringChunked = series
                .str()?
                .into_iter()
                .map(|v| v.map(normalize_name).filter(|s| !s.is_empty()))
                .collect();
            text.into_series()
        } else {
            series.clone()
        };
        columns.push(series.with_name(name.as_str().into()).into());
    }
    Ok(DataFrame::new(columns)?)
}

/// The column cast to text, top to bottom. Nulls stay `None`.
pub fn text_values(frame: &DataFrame, name: &str) -> Result<Vec<Option<String>>, FrameError> {
    let casted = frame.column(name)?.cast(&DataType::String)?;
    Ok(casted
        .as_materialized_series()
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

/// Keeps the rows whose `keep` flag is set.
pub fn retain_rows(frame: &DataFrame, keep: &[bool]) -> Result<DataFrame, FrameError> {
    let mask: BooleanChunked = keep.iter().copied().collect();
    Ok(frame.filter(&mask)?)
}

/// Removes the named columns. Names that are not present are skipped.
pub fn drop_columns<S: AsRef<str>>(frame: &DataFrame, names: &[S]) -> Result<DataFrame, FrameError> {
    let keep: Vec<String> = column_names(frame)
        .into_iter()
        .filter(|column| !names.iter().any(|name| name.as_ref() == column))
        .collect();
    Ok(frame.select(keep)?)
}

/// Inner join of `left` with `right`, matching `left_on` against `right_on`.
///
/// Keys are compared as text, so an integer version `1` matches the string
/// `"1"`. Null keys never match. Output rows keep left order, then right order
/// within a key.
pub fn inner_join(
    left: &DataFrame,
    right: &DataFrame,
    left_on: &str,
    right_on: &str,
) -> Result<DataFrame, FrameError> {
    if !has_column(left, left_on) {
        return Err(FrameError::JoinColumnNotFound {
            column: left_on.to_string(),
            side: "left",
        });
    }
    if !has_column(right, right_on) {
        return Err(FrameError::JoinColumnNotFound {
            column: right_on.to_string(),
            side: "right",
        });
    }

    // A shared key name is written once, from the left side.
    let merged_key = left_on == right_on;
    let left_names = column_names(left);
    let right_names: Vec<String> = column_names(right)
        .into_iter()
        .filter(|name| !(merged_key && name == right_on))
        .collect();

    let left_set: HashSet<&str> = left_names.iter().map(String::as_str).collect();
    let right_set: HashSet<&str> = right_names.iter().map(String::as_str).collect();
    let left_out = suffixed(&left_names, &right_set, LEFT_SUFFIX);
    let right_out = suffixed(&right_names, &left_set, RIGHT_SUFFIX);

    let output: Vec<Expr> = left_out
        .iter()
        .chain(&right_out)
        .map(|name| col(name.as_str()))
        .collect();

    let joined = keyed(left, &left_names, &left_out, left_on)
        .with_row_index(LEFT_ROW, None)
        .join(
            keyed(right, &right_names, &right_out, right_on).with_row_index(RIGHT_ROW, None),
            [col(JOIN_KEY)],
            [col(JOIN_KEY)],
            JoinArgs::new(JoinType::Inner),
        )
        .sort_by_exprs(
            [col(LEFT_ROW), col(RIGHT_ROW)],
            SortMultipleOptions::default(),
        )
        .select(output)
        .collect()?;
    Ok(joined)
}

fn suffixed(names: &[String], other: &HashSet<&str>, suffix: &str) -> Vec<String> {
    names
        .iter()
        .map(|name| {
            if other.contains(name.as_str()) {
                format!("{name}{suffix}")
            } else {
                name.clone()
            }
        })
        .collect()
}

/// Projects `names` under `aliases` and adds the text join key.
fn keyed(frame: &DataFrame, names: &[String], aliases: &[String], key: &str) -> LazyFrame {
    let mut exprs: Vec<Expr> = names
        .iter()
        .zip(aliases)
        .map(|(name, alias)| col(name.as_str()).alias(alias.as_str()))
        .collect();
    exprs.push(col(key).cast(DataType::String).alias(JOIN_KEY));
    frame.clone().lazy().select(exprs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{number, text};

    #[test]
    fn normalize_trims_lowercases_and_nulls_empty_strings() {
        let frame = df!(
            " Target_Name " => [" Influenza A ", "  "],
            "CQ" => [31.2, 30.0],
        )
        .unwrap();
        let normalized = normalize(&frame).unwrap();
        assert_eq!(column_names(&normalized), vec!["target_name", "cq"]);
        assert_eq!(
            text_values(&normalized, "target_name").unwrap(),
            vec![Some("influenza a".to_string()), None]
        );
        assert_eq!(number(&normalized, "cq", 0), Some(31.2));
    }

    #[test]
    fn normalize_rejects_headers_that_collide() {
        let frame = df!("Beads" => ["a"], "beads " => ["b"]).unwrap();
        match normalize(&frame) {
            Err(FrameError::DuplicateColumn(name)) => assert_eq!(name, "beads"),
            other => panic!("expected DuplicateColumn, got {other:?}"),
        }
    }

    #[test]
    fn join_keeps_both_keys_and_suffixes_collisions() {
        let left = df!(
            "lysis" => ["l1", "l2", "l9"],
            "version" => ["a", "b", "c"],
            "cq" => [30.0, 31.0, 32.0],
        )
        .unwrap();
        let right = df!(
            "version" => ["l2", "l1"],
            "temp_c" => [65i64, 95],
        )
        .unwrap();

        let joined = inner_join(&left, &right, "lysis", "version").unwrap();
        assert_eq!(
            column_names(&joined),
            vec!["lysis", "version_x", "cq", "version_y", "temp_c"]
        );
        assert_eq!(joined.height(), 2);
        assert_eq!(text(&joined, "lysis", 0).as_deref(), Some("l1"));
        assert_eq!(number(&joined, "temp_c", 0), Some(95.0));
        assert_eq!(text(&joined, "version_y", 1).as_deref(), Some("l2"));
    }

    #[test]
    fn join_matches_numbers_against_text() {
        let left = df!("lysis" => ["1", "2"]).unwrap();
        let right = df!("version" => [1i64, 3], "temp_c" => [95i64, 65]).unwrap();
        let joined = inner_join(&left, &right, "lysis", "version").unwrap();
        assert_eq!(joined.height(), 1);
        assert_eq!(number(&joined, "temp_c", 0), Some(95.0));
    }

    #[test]
    fn join_duplicates_left_rows_in_order() {
        let left = df!("wash1" => ["w1", "w2", "w1"], "row" => [0i64, 1, 2]).unwrap();
        let right = df!("version" => ["w1", "w1"], "ethanol_pct" => [70.0, 80.0]).unwrap();
        let joined = inner_join(&left, &right, "wash1", "version").unwrap();
        let rows: Vec<_> = (0..joined.height())
            .map(|i| (number(&joined, "row", i), number(&joined, "ethanol_pct", i)))
            .collect();
        assert_eq!(
            rows,
            vec![
                (Some(0.0), Some(70.0)),
                (Some(0.0), Some(80.0)),
                (Some(2.0), Some(70.0)),
                (Some(2.0), Some(80.0)),
            ]
        );
    }

    #[test]
    fn null_keys_never_match() {
        let left = df!("lysis" => [None::<&str>, Some("l1")]).unwrap();
        let right = df!("version" => [None::<&str>, Some("l1")], "t" => [1i64, 2]).unwrap();
        let joined = inner_join(&left, &right, "lysis", "version").unwrap();
        assert_eq!(joined.height(), 1);
        assert_eq!(number(&joined, "t", 0), Some(2.0));
    }

    #[test]
    fn join_reports_missing_key_column() {
        let left = df!("cq" => [30.0]).unwrap();
        let right = df!("version" => ["l1"]).unwrap();
        assert!(matches!(
            inner_join(&left, &right, "lysis", "version"),
            Err(FrameError::JoinColumnNotFound { side: "left", .. })
        ));
    }

    #[test]
    fn drop_columns_skips_absent_names() {
        let frame = df!("a" => [1i64], "b" => [2i64]).unwrap();
        let dropped = drop_columns(&frame, &["b", "zzz"]).unwrap();
        assert_eq!(column_names(&dropped), vec!["a"]);
    }

    #[test]
    fn retain_rows_filters_by_flag() {
        let frame = df!("a" => [1i64, 2, 3]).unwrap();
        let kept = retain_rows(&frame, &[true, false, true]).unwrap();
        assert_eq!(kept.height(), 2);
        assert_eq!(number(&kept, "a", 1), Some(3.0));
    }
}
