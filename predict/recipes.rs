//! # Recipe Reference Tables
//!
//! Loads the static lysis, wash 1 and wash 2 recipe tables from the data
//! directory. Each table is keyed by a `version` identifier; every other
//! column is a protocol parameter that becomes a model feature after the join.
//!
//! Column types are inferred by Polars, so a temperature column arrives as a
//! number and a buffer name arrives as text. Headers and string cells are
//! normalized once here, at load time, and the tables are read-only afterwards.

use crate::frame::{FrameError, column_names, has_column, normalize, text_values};
use polars::prelude::{CsvReadOptions, DataFrame, PolarsError, SerReader};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Key column shared by all recipe tables.
pub const VERSION_COLUMN: &str = "version";

/// One lab step with a recipe table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeStep {
    Lysis,
    Wash1,
    Wash2,
}

impl RecipeStep {
    /// Join order used by the preprocessor.
    pub const ALL: [RecipeStep; 3] = [RecipeStep::Lysis, RecipeStep::Wash1, RecipeStep::Wash2];

    pub fn file_name(self) -> &'static str {
        match self {
            RecipeStep::Lysis => "lysis_recipes.csv",
            RecipeStep::Wash1 => "wash1_recipes.csv",
            RecipeStep::Wash2 => "wash2_recipes.csv",
        }
    }

    /// The request field that selects a version of this step.
    pub fn selector(self) -> &'static str {
        match self {
            RecipeStep::Lysis => "lysis",
            RecipeStep::Wash1 => "wash1",
            RecipeStep::Wash2 => "wash2",
        }
    }
}

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Failed to open recipe table '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("The {step:?} recipe table has no 'version' column.")]
    MissingVersionColumn { step: RecipeStep },
    #[error("Invalid {step:?} recipe table: {source}")]
    Frame {
        step: RecipeStep,
        source: FrameError,
    },
}

/// The three normalized recipe tables and their version keys.
#[derive(Debug, Clone)]
pub struct RecipeBook {
    lysis: DataFrame,
    wash1: DataFrame,
    wash2: DataFrame,
    versions: BTreeMap<RecipeStep, BTreeSet<String>>,
}

impl RecipeBook {
    /// Reads `lysis_recipes.csv`, `wash1_recipes.csv` and `wash2_recipes.csv` from `dir`.
    pub fn load(dir: &Path) -> Result<Self, RecipeError> {
        let lysis = read_recipe_csv(dir, RecipeStep::Lysis)?;
        let wash1 = read_recipe_csv(dir, RecipeStep::Wash1)?;
        let wash2 = read_recipe_csv(dir, RecipeStep::Wash2)?;
        Self::from_frames(lysis, wash1, wash2)
    }

    /// Builds a book from raw frames, normalizing each one.
    pub fn from_frames(
        lysis: DataFrame,
        wash1: DataFrame,
        wash2: DataFrame,
    ) -> Result<Self, RecipeError> {
        let mut versions = BTreeMap::new();
        let mut prepare = |step: RecipeStep, frame: DataFrame| -> Result<DataFrame, RecipeError> {
            let frame_err = |source| RecipeError::Frame { step, source };
            let frame = normalize(&frame).map_err(frame_err)?;
            if !has_column(&frame, VERSION_COLUMN) {
                return Err(RecipeError::MissingVersionColumn { step });
            }
            let keys: BTreeSet<String> = text_values(&frame, VERSION_COLUMN)
                .map_err(frame_err)?
                .into_iter()
                .flatten()
                .collect();
            log::debug!(
                "{step:?} recipes: {} row(s), {} version(s), columns {:?}",
                frame.height(),
                keys.len(),
                column_names(&frame)
            );
            versions.insert(step, keys);
            Ok(frame)
        };

        let lysis = prepare(RecipeStep::Lysis, lysis)?;
        let wash1 = prepare(RecipeStep::Wash1, wash1)?;
        let wash2 = prepare(RecipeStep::Wash2, wash2)?;
        Ok(Self {
            lysis,
            wash1,
            wash2,
            versions,
        })
    }

    pub fn frame(&self, step: RecipeStep) -> &DataFrame {
        match step {
            RecipeStep::Lysis => &self.lysis,
            RecipeStep::Wash1 => &self.wash1,
            RecipeStep::Wash2 => &self.wash2,
        }
    }

    /// Distinct version keys of one step as text, sorted.
    pub fn versions(&self, step: RecipeStep) -> impl Iterator<Item = &str> {
        self.versions
            .get(&step)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Whether `key` names a version present in the step's table.
    pub fn contains_version(&self, step: RecipeStep, key: &str) -> bool {
        self.versions
            .get(&step)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Version keys of every step, for populating selector options.
    pub fn catalog(&self) -> BTreeMap<RecipeStep, Vec<String>> {
        RecipeStep::ALL
            .iter()
            .map(|&step| (step, self.versions(step).map(str::to_string).collect()))
            .collect()
    }
}

fn read_recipe_csv(dir: &Path, step: RecipeStep) -> Result<DataFrame, RecipeError> {
    let path = dir.join(step.file_name());
    log::info!("Loading recipe table from '{}'", path.display());
    let file = File::open(&path).map_err(|source| RecipeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .into_reader_with_file_handle(file)
        .finish()?;
    Ok(df)
}
