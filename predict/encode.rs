//! One-hot expansion of categorical columns.
//!
//! Each listed field is removed and replaced, at the right edge of the frame,
//! by one `Int64` indicator column per observed level, named `{field}_{level}`
//! with levels in lexicographic order. Missing cells become the level `nan`, so
//! every row carries exactly one `1` within each field's group.

use crate::frame::{FrameError, column_names, has_column, text_values};
use polars::prelude::*;
use std::collections::BTreeSet;
use thiserror::Error;

/// Level name assigned to missing categorical cells.
pub const MISSING_LEVEL: &str = "nan";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Categorical field '{0}' is not present after preprocessing.")]
    FieldNotFound(String),
    #[error("One-hot encoding failed: {0}")]
    Frame(#[from] FrameError),
    #[error("One-hot encoding failed: {0}")]
    Polars(#[from] PolarsError),
}

/// Name of the indicator column for `level` of `field`.
pub fn indicator_name(field: &str, level: &str) -> String {
    format!("{field}_{level}")
}

pub fn one_hot_encode<S: AsRef<str>>(
    frame: &DataFrame,
    fields: &[S],
) -> Result<DataFrame, EncodeError> {
    let mut encoded = frame.clone();
    for field in fields {
        let field = field.as_ref();
        if !has_column(&encoded, field) {
            return Err(EncodeError::FieldNotFound(field.to_string()));
        }
        let levels: BTreeSet<String> = text_values(&encoded, field)?
            .into_iter()
            .map(|v| v.unwrap_or_else(|| MISSING_LEVEL.to_string()))
            .collect();
        log::debug!("Encoding '{field}' into {} indicator columns", levels.len());

        let mut exprs: Vec<Expr> = column_names(&encoded)
            .into_iter()
            .filter(|name| name != field)
            .map(col)
            .collect();
        exprs.extend(levels.iter().map(|level| indicator(field, level)));
        encoded = encoded.lazy().select(exprs).collect()?;
    }
    Ok(encoded)
}

fn indicator(field: &str, level: &str) -> Expr {
    let value = col(field).cast(DataType::String);
    let hot = if level == MISSING_LEVEL {
        value.clone().is_null().or(value.eq(lit(MISSING_LEVEL)))
    } else {
        value.eq(lit(level))
    };
    hot.fill_null(lit(false))
        .cast(DataType::Int64)
        .alias(indicator_name(field, level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::number;

    fn samples() -> DataFrame {
        df!(
            "cq" => [30.1, 28.4, 33.0],
            "sample_type" => ["stool", "swab", "stool"],
            "beads" => [Some("magnetic"), None, Some("silica")],
        )
        .unwrap()
    }

    #[test]
    fn one_indicator_per_observed_level() {
        let encoded = one_hot_encode(&samples(), &["sample_type", "beads"]).unwrap();
        assert_eq!(
            column_names(&encoded),
            vec![
                "cq",
                "sample_type_stool",
                "sample_type_swab",
                "beads_magnetic",
                "beads_nan",
                "beads_silica",
            ]
        );
        assert_eq!(
            encoded.column("beads_nan").unwrap().dtype(),
            &DataType::Int64
        );
    }

    #[test]
    fn exactly_one_hot_per_row_per_group() {
        let encoded = one_hot_encode(&samples(), &["sample_type", "beads"]).unwrap();

        for group in ["sample_type_", "beads_"] {
            let members: Vec<String> = column_names(&encoded)
                .into_iter()
                .filter(|name| name.starts_with(group))
                .collect();
            for row in 0..encoded.height() {
                let hot: f64 = members
                    .iter()
                    .map(|name| number(&encoded, name, row).unwrap())
                    .sum();
                assert_eq!(hot, 1.0, "group {group} in row {row}");
            }
        }
    }

    #[test]
    fn numeric_levels_use_display_text() {
        let frame = df!("replicate" => [2i64, 10]).unwrap();
        let encoded = one_hot_encode(&frame, &["replicate"]).unwrap();
        assert_eq!(column_names(&encoded), vec!["replicate_10", "replicate_2"]);
        assert_eq!(number(&encoded, "replicate_10", 0), Some(0.0));
        assert_eq!(number(&encoded, "replicate_2", 0), Some(1.0));
    }

    #[test]
    fn missing_field_is_an_error() {
        match one_hot_encode(&samples(), &["target_type"]) {
            Err(EncodeError::FieldNotFound(field)) => assert_eq!(field, "target_type"),
            other => panic!("expected FieldNotFound, got {other:?}"),
        }
    }
}
