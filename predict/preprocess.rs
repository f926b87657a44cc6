//! # Feature Row Construction
//!
//! Turns a request frame into the combined feature row by joining it against
//! the three recipe tables. Two variants exist:
//!
//! - [`PreprocessMode::Direct`]: normalize, join, drop join artifacts.
//! - [`PreprocessMode::Curated`]: additionally drop rows with unknown versions or
//!   missing required fields before the join, impute optional fields, and
//!   one-hot encode the categorical fields afterwards.
//!
//! A row that cannot be joined simply disappears; the caller decides whether an
//! empty result is an error.

use crate::config::{DefaultValue, PipelineConfig, PreprocessMode};
use crate::encode::{EncodeError, one_hot_encode};
use crate::frame::{FrameError, drop_columns, has_column, inner_join, normalize, retain_rows, text_values};
use crate::recipes::{RecipeBook, RecipeStep, VERSION_COLUMN};
use itertools::Itertools;
use polars::prelude::*;
use std::collections::BTreeMap;
use thiserror::Error;

/// Columns left behind by the three joins: the selectors on the request side
/// and the `version` keys of the recipe tables, as suffixed by the joins.
pub const JOIN_ARTIFACTS: [&str; 6] = [
    "wash1",
    "wash2",
    "lysis",
    "version_x",
    "version_y",
    "version",
];

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to assemble the feature row: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Runs the variant selected by `config.mode`.
pub fn preprocess(
    input: &DataFrame,
    recipes: &RecipeBook,
    config: &PipelineConfig,
) -> Result<DataFrame, PreprocessError> {
    match config.mode {
        PreprocessMode::Direct => preprocess_direct(input, recipes),
        PreprocessMode::Curated => preprocess_curated(input, recipes, config),
    }
}

pub fn preprocess_direct(input: &DataFrame, recipes: &RecipeBook) -> Result<DataFrame, PreprocessError> {
    let input = normalize(input)?;
    join_recipes(&input, recipes)
}

pub fn preprocess_curated(
    input: &DataFrame,
    recipes: &RecipeBook,
    config: &PipelineConfig,
) -> Result<DataFrame, PreprocessError> {
    let frame = normalize(input)?;

    let (frame, unknown) = filter_unknown_versions(&frame, recipes)?;
    if unknown > 0 {
        log::info!("Dropped {unknown} row(s) selecting a version absent from the recipe tables");
    }

    let (frame, incomplete) = drop_incomplete_rows(&frame, &config.required_fields)?;
    if incomplete > 0 {
        log::info!(
            "Dropped {incomplete} row(s) missing one of the required fields: {}",
            config.required_fields.iter().join(", ")
        );
    }

    // Selectors may be absent entirely, so an empty frame cannot be joined.
    if frame.height() == 0 {
        log::warn!("No rows left to join after filtering");
        return Ok(frame);
    }

    let frame = fill_defaults(&frame, &config.defaults)?;
    let combined = join_recipes(&frame, recipes)?;
    Ok(one_hot_encode(&combined, &config.categorical_fields)?)
}

/// Inner-joins `input` with the lysis, wash 1 and wash 2 tables in that order
/// and removes [`JOIN_ARTIFACTS`].
pub fn join_recipes(input: &DataFrame, recipes: &RecipeBook) -> Result<DataFrame, PreprocessError> {
    let mut combined = input.clone();
    for step in RecipeStep::ALL {
        combined = inner_join(&combined, recipes.frame(step), step.selector(), VERSION_COLUMN)?;
        log::debug!(
            "After joining {step:?} recipes: {} row(s), {} column(s)",
            combined.height(),
            combined.width()
        );
    }
    Ok(drop_columns(&combined, &JOIN_ARTIFACTS)?)
}

/// Removes rows whose lysis, wash 1 or wash 2 selector is absent or names an
/// unknown version. Returns the kept rows and the number removed.
pub fn filter_unknown_versions(
    frame: &DataFrame,
    recipes: &RecipeBook,
) -> Result<(DataFrame, usize), FrameError> {
    let mut keep = vec![true; frame.height()];
    for step in RecipeStep::ALL {
        if !has_column(frame, step.selector()) {
            keep.fill(false);
            break;
        }
        let keys = text_values(frame, step.selector())?;
        for (flag, key) in keep.iter_mut().zip(&keys) {
            if !key.as_deref().is_some_and(|key| recipes.contains_version(step, key)) {
                *flag = false;
            }
        }
    }
    let kept = retain_rows(frame, &keep)?;
    let removed = frame.height() - kept.height();
    Ok((kept, removed))
}

/// Removes rows missing any of `required`. An absent column counts as missing.
pub fn drop_incomplete_rows(
    frame: &DataFrame,
    required: &[String],
) -> Result<(DataFrame, usize), FrameError> {
    let mut keep = vec![true; frame.height()];
    for field in required {
        if !has_column(frame, field) {
            keep.fill(false);
            break;
        }
        let nulls = frame.column(field)?.as_materialized_series().is_null();
        for (flag, null) in keep.iter_mut().zip(&nulls) {
            if null.unwrap_or(true) {
                *flag = false;
            }
        }
    }
    let kept = retain_rows(frame, &keep)?;
    let removed = frame.height() - kept.height();
    Ok((kept, removed))
}

/// Writes configured defaults into null cells, creating absent columns.
/// Present values are left alone.
pub fn fill_defaults(
    frame: &DataFrame,
    defaults: &BTreeMap<String, DefaultValue>,
) -> Result<DataFrame, FrameError> {
    let mut filled = frame.clone().lazy();
    for (field, value) in defaults {
        let expr = if has_column(frame, field) {
            let missing = frame.column(field)?.null_count();
            if missing > 0 {
                log::debug!("Filling {missing} missing '{field}' value(s) with {value}");
            }
            col(field.as_str()).fill_null(value.to_lit())
        } else {
            log::debug!("Adding absent field '{field}' as {value}");
            value.to_lit()
        };
        filled = filled.with_column(expr.alias(field.as_str()));
    }
    Ok(filled.collect()?)
}
