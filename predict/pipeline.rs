//! End-to-end prediction: request JSON in, one prediction out.
//!
//! [`Predictor`] owns everything loaded from the data directory (the recipe
//! tables, the trained model and the preprocessing config). Each call runs
//! parse, preprocess, align and predict against those read-only resources.

use crate::config::{ConfigError, PipelineConfig};
use crate::frame::column_names;
use crate::input::{InputError, parse_input};
use crate::model::{ModelError, Prediction, TrainedModel};
use crate::preprocess::{PreprocessError, preprocess};
use crate::recipes::{RecipeBook, RecipeError};
use polars::prelude::DataFrame;
use std::path::Path;
use thiserror::Error;

/// Environment variable naming the data directory.
pub const DATA_PATH_ENV: &str = "PREDICTORS_DATA_PATH";
/// Model artifact file name inside the data directory.
pub const MODEL_FILE_NAME: &str = "trained_model.toml";

#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(
        "No feature rows remain after preprocessing. Check that the lysis, wash1 and wash2 versions exist and that all required fields are filled in."
    )]
    EmptyFeatureRows,
}

#[derive(Debug)]
pub struct Predictor {
    recipes: RecipeBook,
    model: TrainedModel,
    config: PipelineConfig,
}

impl Predictor {
    pub fn new(recipes: RecipeBook, model: TrainedModel, config: PipelineConfig) -> Self {
        Self {
            recipes,
            model,
            config,
        }
    }

    /// Loads the recipe tables and `trained_model.toml` from `data_dir`.
    pub fn load(data_dir: &Path, config: PipelineConfig) -> Result<Self, PredictError> {
        let recipes = RecipeBook::load(data_dir)?;
        let model = TrainedModel::load(&data_dir.join(MODEL_FILE_NAME))?;
        Ok(Self::new(recipes, model, config))
    }

    /// The combined feature frame for a request, before model alignment.
    /// A request that joins no recipe rows is [`PredictError::EmptyFeatureRows`].
    pub fn features(&self, request: &str) -> Result<DataFrame, PredictError> {
        let input = parse_input(request)?;
        let combined = preprocess(&input, &self.recipes, &self.config)?;
        if combined.height() == 0 {
            return Err(PredictError::EmptyFeatureRows);
        }
        log::debug!(
            "Feature frame: {} row(s), columns {:?}",
            combined.height(),
            column_names(&combined)
        );
        Ok(combined)
    }

    /// One prediction per combined row.
    pub fn predict_all(&self, request: &str) -> Result<Vec<Prediction>, PredictError> {
        let combined = self.features(request)?;
        let x = self.model.align(&combined, &self.config.ignore_columns)?;
        Ok(self.model.predict(x.view())?)
    }

    /// The prediction for the first combined row.
    pub fn predict(&self, request: &str) -> Result<Prediction, PredictError> {
        let predictions = self.predict_all(request)?;
        if predictions.len() > 1 {
            log::warn!(
                "Request matched {} recipe combinations; reporting the first",
                predictions.len()
            );
        }
        predictions
            .into_iter()
            .next()
            .ok_or(PredictError::EmptyFeatureRows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::has_column;
    use crate::model::{Estimator, LinearModel, LinkFunction};
    use crate::test_fixtures::number;
    use approx::assert_abs_diff_eq;
    use polars::prelude::*;

    fn book(wash2_versions: &[&str], wash2_ethanol: &[f64]) -> RecipeBook {
        let lysis = df!("version" => ["L1"], "lysis_temp_c" => [95i64]).unwrap();
        let wash1 = df!("version" => ["W1"], "wash1_ethanol_pct" => [70.0]).unwrap();
        let wash2 = df!(
            "version" => wash2_versions,
            "wash2_ethanol_pct" => wash2_ethanol,
        )
        .unwrap();
        RecipeBook::from_frames(lysis, wash1, wash2).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            required_fields: vec!["cq".to_string(), "sample_type".to_string()],
            defaults: Default::default(),
            categorical_fields: vec!["sample_type".to_string()],
            ignore_columns: vec!["date".to_string()],
            ..PipelineConfig::default()
        }
    }

    fn model() -> TrainedModel {
        TrainedModel {
            features: [
                "cq",
                "lysis_temp_c",
                "wash1_ethanol_pct",
                "wash2_ethanol_pct",
                "sample_type_stool",
                "sample_type_swab",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            classes: None,
            categories: [(
                "sample_type".to_string(),
                vec!["stool".to_string(), "swab".to_string()],
            )]
            .into_iter()
            .collect(),
            estimator: Estimator::Linear(LinearModel {
                link: LinkFunction::Identity,
                intercept: 0.0,
                coefficients: vec![1.0, 0.0, 0.0, 1.0, 10.0, 100.0],
            }),
        }
    }

    const REQUEST: &str = r#"{"cq": 30, "date": "2024-05-02", "sample_type": "Stool", "lysis": "L1", "wash1": "W1", "wash2": "W1"}"#;

    fn value(prediction: Prediction) -> f64 {
        match prediction {
            Prediction::Value(v) => v,
            other => panic!("expected a value, got {other:?}"),
        }
    }

    #[test]
    fn predicts_from_joined_and_encoded_row() {
        let predictor = Predictor::new(book(&["W1"], &[80.0]), model(), config());
        let prediction = predictor.predict(REQUEST).unwrap();
        assert_abs_diff_eq!(value(prediction), 30.0 + 80.0 + 10.0, epsilon = 1e-9);
    }

    #[test]
    fn unknown_version_is_an_explicit_error() {
        let predictor = Predictor::new(book(&["W2"], &[80.0]), model(), config());
        assert!(matches!(
            predictor.predict(REQUEST),
            Err(PredictError::EmptyFeatureRows)
        ));
    }

    #[test]
    fn features_of_unknown_version_are_an_error_too() {
        let predictor = Predictor::new(book(&["W2"], &[80.0]), model(), config());
        assert!(matches!(
            predictor.features(REQUEST),
            Err(PredictError::EmptyFeatureRows)
        ));
    }

    #[test]
    fn duplicate_recipe_versions_report_the_first_match() {
        let predictor = Predictor::new(book(&["W1", "W1"], &[80.0, 60.0]), model(), config());
        assert_eq!(predictor.predict_all(REQUEST).unwrap().len(), 2);
        let first = predictor.predict(REQUEST).unwrap();
        assert_abs_diff_eq!(value(first), 120.0, epsilon = 1e-9);
    }

    #[test]
    fn features_expose_the_combined_frame() {
        let predictor = Predictor::new(book(&["W1"], &[80.0]), model(), config());
        let frame = predictor.features(REQUEST).unwrap();
        assert_eq!(frame.height(), 1);
        assert_eq!(number(&frame, "sample_type_stool", 0), Some(1.0));
        assert!(!has_column(&frame, "wash2"));
    }
}
