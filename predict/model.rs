use crate::encode::indicator_name;
use crate::frame::has_column;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ShapeBuilder};
use polars::prelude::*;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML format of the trained model
// artifact. The feature list is the contract between preprocessing and the
// estimator: the model matrix is always built in exactly this column order.

/// Node marker for "no child" in the flat tree arrays.
pub const LEAF: i64 = -1;

/// Defines the link function, connecting the linear predictor to the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFunction {
    /// Logistic regression over two classes; predicts `classes[1]` when the
    /// probability reaches 0.5.
    Logit,
    /// Plain linear regression (e.g. delta Cq).
    Identity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    pub link: LinkFunction,
    pub intercept: f64,
    /// One coefficient per entry of `TrainedModel::features`, in the same order.
    pub coefficients: Vec<f64>,
}

/// How the per-tree outputs of an ensemble are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Average of leaf values (regression forest).
    Mean,
    /// Majority vote over leaf class indices; ties go to the lowest index.
    Vote,
}

/// One fitted tree in flat node-array form, the layout of scikit-learn's `tree_`.
/// A sample goes left when `x[feature] <= threshold`.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    /// Leaf output: a regression value, or a class index when voting.
    pub value: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeEnsemble {
    pub aggregation: Aggregation,
    pub trees: Vec<DecisionTree>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Estimator {
    Linear(LinearModel),
    TreeEnsemble(TreeEnsemble),
}

/// The top-level, self-contained, trained model artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainedModel {
    /// Ordered feature schema expected by the estimator.
    pub features: Vec<String>,
    /// Class labels for classifiers, indexed by class id.
    #[serde(default)]
    pub classes: Option<Vec<String>>,
    /// Levels each categorical field had at training time. Every level owns
    /// the `{field}_{level}` indicator feature.
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
    pub estimator: Estimator,
}

/// One model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Label(String),
    Value(f64),
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prediction::Label(label) => f.write_str(label),
            Prediction::Value(value) => write!(f, "{value}"),
        }
    }
}

/// Custom error type for model loading, alignment and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Feature '{0}' appears more than once in the model schema.")]
    DuplicateFeature(String),
    #[error("Level '{level}' of field '{field}' is declared, but its indicator is not a model feature.")]
    UndeclaredIndicator { field: String, level: String },
    #[error("The linear model has {found} coefficients, but the schema lists {expected} features.")]
    CoefficientCount { found: usize, expected: usize },
    #[error("The tree ensemble contains no trees.")]
    EmptyEnsemble,
    #[error("Tree {tree} is malformed: {reason}")]
    MalformedTree { tree: usize, reason: String },
    #[error("This model classifies, but the artifact has no 'classes' list.")]
    MissingClasses,
    #[error("A logit model needs exactly 2 classes, found {0}.")]
    LogitClassCount(usize),
    #[error("The model expects feature '{0}', but preprocessing did not produce it.")]
    MissingFeature(String),
    #[error("Category '{level}' of field '{field}' was not seen when the model was trained.")]
    UnseenCategory { field: String, level: String },
    #[error("Column '{0}' is not part of the model's feature schema.")]
    UnexpectedColumn(String),
    #[error("Feature '{feature}' has no value in row {row}.")]
    MissingFeatureValue { feature: String, row: usize },
    #[error("Feature '{feature}' in row {row} is not numeric (found '{value}').")]
    NonNumericFeature {
        feature: String,
        row: usize,
        value: String,
    },
    #[error("Feature '{feature}' in row {row} is not finite.")]
    NonFiniteFeature { feature: String, row: usize },
    #[error("The model matrix has {found} columns, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("Error reading feature columns: {0}")]
    Polars(#[from] PolarsError),
    #[error("Failed to shape the model matrix: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl TrainedModel {
    /// Builds the model matrix for `frame`, one row per frame row and one column
    /// per schema feature.
    ///
    /// Declared indicators that the frame never produced are zero-filled, since
    /// a single request only shows one level per field. Columns listed in
    /// `ignore_columns` are skipped. Anything else outside the schema is an
    /// error, as is a missing feature that is not a declared indicator.
    pub fn align(
        &self,
        frame: &DataFrame,
        ignore_columns: &[String],
    ) -> Result<Array2<f64>, ModelError> {
        let schema: HashSet<&str> = self.features.iter().map(String::as_str).collect();

        for column in frame.get_column_names() {
            let column = column.as_str();
            if schema.contains(column) || ignore_columns.iter().any(|c| c == column) {
                continue;
            }
            return Err(match self.categorical_field_of(column) {
                Some(field) => ModelError::UnseenCategory {
                    field: field.to_string(),
                    level: column[field.len() + 1..].to_string(),
                },
                None => ModelError::UnexpectedColumn(column.to_string()),
            });
        }

        let indicators = self.indicator_columns();
        let n_rows = frame.height();
        let mut buffer = Vec::with_capacity(n_rows * self.features.len());
        for feature in &self.features {
            if !has_column(frame, feature) {
                if !indicators.contains(feature) {
                    return Err(ModelError::MissingFeature(feature.clone()));
                }
                log::debug!("Indicator '{feature}' absent from the request; using 0");
                buffer.resize(buffer.len() + n_rows, 0.0);
                continue;
            }
            buffer.extend(extract_feature(frame.column(feature)?, feature)?);
        }

        // Column-major: the buffer holds one feature after another.
        Ok(Array2::from_shape_vec(
            (n_rows, self.features.len()).f(),
            buffer,
        )?)
    }

    /// Names of every `{field}_{level}` indicator declared in `categories`.
    pub fn indicator_columns(&self) -> HashSet<String> {
        self.categories
            .iter()
            .flat_map(|(field, levels)| levels.iter().map(|level| indicator_name(field, level)))
            .collect()
    }

    /// The declared categorical field whose indicator prefix `column` carries.
    /// The longest field name wins when several prefixes match.
    fn categorical_field_of(&self, column: &str) -> Option<&str> {
        self.categories
            .keys()
            .map(String::as_str)
            .filter(|field| {
                column.len() > field.len() + 1 && column.starts_with(&indicator_name(field, ""))
            })
            .max_by_key(|field| field.len())
    }

    /// Predicts one output per row of `x`, whose columns follow `self.features`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<Prediction>, ModelError> {
        if x.ncols() != self.features.len() {
            return Err(ModelError::MismatchedFeatureCount {
                found: x.ncols(),
                expected: self.features.len(),
            });
        }

        match &self.estimator {
            Estimator::Linear(linear) => {
                let coefficients = ArrayView1::from(linear.coefficients.as_slice());
                let eta: Array1<f64> = x.dot(&coefficients) + linear.intercept;
                match linear.link {
                    LinkFunction::Identity => {
                        Ok(eta.iter().map(|&v| Prediction::Value(v)).collect())
                    }
                    LinkFunction::Logit => {
                        let classes = self.class_labels()?;
                        Ok(eta
                            .iter()
                            .map(|&e| {
                                // Clamp eta to prevent numerical overflow in exp().
                                let p = 1.0 / (1.0 + f64::exp(-e.clamp(-700.0, 700.0)));
                                Prediction::Label(classes[usize::from(p >= 0.5)].clone())
                            })
                            .collect())
                    }
                }
            }
            Estimator::TreeEnsemble(ensemble) => {
                let mut predictions = Vec::with_capacity(x.nrows());
                for sample in x.rows() {
                    let leaves = ensemble.trees.iter().map(|tree| tree.leaf_value(sample));
                    let prediction = match ensemble.aggregation {
                        Aggregation::Mean => {
                            Prediction::Value(leaves.sum::<f64>() / ensemble.trees.len() as f64)
                        }
                        Aggregation::Vote => {
                            let classes = self.class_labels()?;
                            let mut votes = vec![0usize; classes.len()];
                            for leaf in leaves {
                                votes[leaf as usize] += 1;
                            }
                            let mut winner = 0;
                            for (idx, &count) in votes.iter().enumerate() {
                                if count > votes[winner] {
                                    winner = idx;
                                }
                            }
                            Prediction::Label(classes[winner].clone())
                        }
                    };
                    predictions.push(prediction);
                }
                Ok(predictions)
            }
        }
    }

    /// Checks the structural invariants `predict` relies on.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen = HashSet::with_capacity(self.features.len());
        for feature in &self.features {
            if !seen.insert(feature.as_str()) {
                return Err(ModelError::DuplicateFeature(feature.clone()));
            }
        }
        for (field, levels) in &self.categories {
            for level in levels {
                if !seen.contains(indicator_name(field, level).as_str()) {
                    return Err(ModelError::UndeclaredIndicator {
                        field: field.clone(),
                        level: level.clone(),
                    });
                }
            }
        }

        match &self.estimator {
            Estimator::Linear(linear) => {
                if linear.coefficients.len() != self.features.len() {
                    return Err(ModelError::CoefficientCount {
                        found: linear.coefficients.len(),
                        expected: self.features.len(),
                    });
                }
                if linear.link == LinkFunction::Logit {
                    let classes = self.class_labels()?;
                    if classes.len() != 2 {
                        return Err(ModelError::LogitClassCount(classes.len()));
                    }
                }
            }
            Estimator::TreeEnsemble(ensemble) => {
                if ensemble.trees.is_empty() {
                    return Err(ModelError::EmptyEnsemble);
                }
                let n_classes = match ensemble.aggregation {
                    Aggregation::Vote => Some(self.class_labels()?.len()),
                    Aggregation::Mean => None,
                };
                for (idx, tree) in ensemble.trees.iter().enumerate() {
                    tree.validate(self.features.len(), n_classes)
                        .map_err(|reason| ModelError::MalformedTree { tree: idx, reason })?;
                }
            }
        }
        Ok(())
    }

    fn class_labels(&self) -> Result<&[String], ModelError> {
        self.classes.as_deref().ok_or(ModelError::MissingClasses)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
        let model: TrainedModel = toml::from_str(text)?;
        model.validate()?;
        Ok(model)
    }

    /// Loads and validates a trained model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        log::info!("Loading model from '{}'", path.display());
        let toml_string = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let model = Self::from_toml_str(&toml_string)?;
        log::debug!("Model expects {} features", model.features.len());
        Ok(model)
    }
}

/// Reads one feature column as finite `f64` values. Numeric strings are parsed
/// and booleans map to 1 and 0.
fn extract_feature(column: &Column, feature: &str) -> Result<Vec<f64>, ModelError> {
    let series = column.as_materialized_series();
    if series.null_count() > 0 {
        return Err(ModelError::MissingFeatureValue {
            feature: feature.to_string(),
            row: first_null(series).unwrap_or(0),
        });
    }

    let casted = series.cast(&DataType::Float64)?;
    // Values that fail to parse become null under the cast.
    if casted.null_count() > 0 {
        let row = first_null(&casted).unwrap_or(0);
        let text = series.cast(&DataType::String)?;
        let value = text.str()?.get(row).unwrap_or_default().to_string();
        return Err(ModelError::NonNumericFeature {
            feature: feature.to_string(),
            row,
            value,
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if let Some(row) = values.iter().position(|x| !x.is_finite()) {
        return Err(ModelError::NonFiniteFeature {
            feature: feature.to_string(),
            row,
        });
    }
    Ok(values)
}

fn first_null(series: &Series) -> Option<usize> {
    series.is_null().into_iter().position(|null| null == Some(true))
}

impl DecisionTree {
    fn leaf_value(&self, sample: ArrayView1<f64>) -> f64 {
        let mut node = 0usize;
        loop {
            let left = self.children_left[node];
            if left == LEAF {
                return self.value[node];
            }
            let feature = self.feature[node] as usize;
            node = if sample[feature] <= self.threshold[node] {
                left as usize
            } else {
                self.children_right[node] as usize
            };
        }
    }

    /// Children must point strictly forward, which also rules out cycles.
    fn validate(&self, n_features: usize, n_classes: Option<usize>) -> Result<(), String> {
        let n = self.children_left.len();
        if n == 0 {
            return Err("no nodes".to_string());
        }
        if [
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
            self.value.len(),
        ]
        .iter()
        .any(|&len| len != n)
        {
            return Err("node arrays have different lengths".to_string());
        }

        for node in 0..n {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == LEAF || right == LEAF {
                if left != right {
                    return Err(format!("node {node} has exactly one child"));
                }
                if let Some(n_classes) = n_classes {
                    let class = self.value[node];
                    if class.fract() != 0.0 || class < 0.0 || class >= n_classes as f64 {
                        return Err(format!("leaf {node} votes for unknown class {class}"));
                    }
                }
                continue;
            }
            for child in [left, right] {
                if child <= node as i64 || child >= n as i64 {
                    return Err(format!("node {node} points to invalid child {child}"));
                }
            }
            let feature = self.feature[node];
            if feature < 0 || feature >= n_features as i64 {
                return Err(format!("node {node} splits on unknown feature {feature}"));
            }
        }
        Ok(())
    }
}
