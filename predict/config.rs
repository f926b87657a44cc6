use crate::frame::normalize_name;
use polars::prelude::{Expr, lit};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name looked up in the data directory when no explicit config is given.
pub const CONFIG_FILE_NAME: &str = "pipeline.toml";

/// How a request is turned into a feature row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessMode {
    /// Join on the version selectors and drop the join artifacts; nothing else.
    Direct,
    /// Filter unknown versions and incomplete rows, impute optional fields,
    /// join, then one-hot encode the categorical fields.
    #[default]
    Curated,
}

/// Literal written into a missing optional field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl DefaultValue {
    pub fn to_lit(&self) -> Expr {
        match self {
            DefaultValue::Bool(b) => lit(*b),
            DefaultValue::Int(i) => lit(*i),
            DefaultValue::Float(f) => lit(*f),
            DefaultValue::Str(s) => lit(s.clone()),
        }
    }

    fn normalized(&self) -> Self {
        match self {
            DefaultValue::Str(s) => DefaultValue::Str(normalize_name(s)),
            other => other.clone(),
        }
    }
}

impl fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Bool(b) => write!(f, "{b}"),
            DefaultValue::Int(i) => write!(f, "{i}"),
            DefaultValue::Float(x) => write!(f, "{x}"),
            DefaultValue::Str(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<&str> for DefaultValue {
    fn from(value: &str) -> Self {
        DefaultValue::Str(value.to_string())
    }
}

/// Preprocessing settings shared by the feature builder and the model aligner.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub mode: PreprocessMode,
    /// Rows missing any of these fields are dropped before the join.
    pub required_fields: Vec<String>,
    /// Literal values written into missing optional fields.
    pub defaults: BTreeMap<String, DefaultValue>,
    /// Fields expanded into `{field}_{level}` indicator columns.
    pub categorical_fields: Vec<String>,
    /// Columns carried through preprocessing that the model never sees.
    pub ignore_columns: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let defaults = [
            ("pretreatment_buffer", DefaultValue::from("none")),
            ("pretreatment_heating", DefaultValue::from("none")),
            ("beads", DefaultValue::from("none")),
            ("bead_conc_mg_ml", DefaultValue::Float(0.0)),
            ("bead_beating", DefaultValue::from("none")),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        Self {
            mode: PreprocessMode::default(),
            required_fields: to_strings(&["cq", "date", "target_name", "sample_type", "target_type"]),
            defaults,
            categorical_fields: to_strings(&[
                "target_name",
                "sample_type",
                "target_type",
                "pretreatment_buffer",
                "pretreatment_heating",
                "beads",
                "bead_beating",
            ]),
            ignore_columns: to_strings(&["date", "sample_name"]),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read pipeline config '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse pipeline config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Field '{0}' is listed as categorical but also ignored.")]
    CategoricalIgnored(String),
    #[error("Field '{0}' is listed more than once in categorical_fields.")]
    DuplicateCategorical(String),
}

impl PipelineConfig {
    /// Parses a TOML document. Names and string defaults are normalized the same
    /// way request fields are, so lookups line up after normalization.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.normalized().validated()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Picks the explicit path when given, then `pipeline.toml` in the data
    /// directory, then the built-in defaults.
    pub fn resolve(data_dir: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate: Option<PathBuf> = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default_path = data_dir.join(CONFIG_FILE_NAME);
                default_path.is_file().then_some(default_path)
            }
        };

        match candidate {
            Some(path) => {
                log::info!("Loading pipeline config from '{}'", path.display());
                Self::load(&path)
            }
            None => {
                log::debug!("No {CONFIG_FILE_NAME} found; using built-in pipeline defaults");
                Ok(Self::default())
            }
        }
    }

    fn normalized(self) -> Self {
        let norm_all = |names: Vec<String>| -> Vec<String> {
            names.iter().map(|n| normalize_name(n)).collect()
        };
        Self {
            mode: self.mode,
            required_fields: norm_all(self.required_fields),
            defaults: self
                .defaults
                .iter()
                .map(|(name, value)| (normalize_name(name), value.normalized()))
                .collect(),
            categorical_fields: norm_all(self.categorical_fields),
            ignore_columns: norm_all(self.ignore_columns),
        }
    }

    fn validated(self) -> Result<Self, ConfigError> {
        for (idx, field) in self.categorical_fields.iter().enumerate() {
            if self.categorical_fields[..idx].contains(field) {
                return Err(ConfigError::DuplicateCategorical(field.clone()));
            }
            if self.ignore_columns.contains(field) {
                return Err(ConfigError::CategoricalIgnored(field.clone()));
            }
        }
        Ok(self)
    }
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn partial_config_keeps_defaults_for_missing_keys() {
        let config = PipelineConfig::from_toml_str("mode = \"direct\"\n").unwrap();
        assert_eq!(config.mode, PreprocessMode::Direct);
        assert_eq!(config.required_fields, PipelineConfig::default().required_fields);
    }

    #[test]
    fn names_and_string_defaults_are_normalized() {
        let text = r#"
            required_fields = [" CQ "]
            categorical_fields = ["Beads"]
            ignore_columns = []

            [defaults]
            " Beads" = "  None "
            elution_temp = 70
        "#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.required_fields, vec!["cq"]);
        assert_eq!(config.categorical_fields, vec!["beads"]);
        assert_eq!(config.defaults["beads"], DefaultValue::from("none"));
        assert_eq!(config.defaults["elution_temp"], DefaultValue::Int(70));
        assert_eq!(config.defaults["elution_temp"].to_string(), "70");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml_str("categoricals = []"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn categorical_field_cannot_be_ignored() {
        let text = "categorical_fields = [\"date\"]\nignore_columns = [\"date\"]\n";
        match PipelineConfig::from_toml_str(text) {
            Err(ConfigError::CategoricalIgnored(field)) => assert_eq!(field, "date"),
            other => panic!("expected CategoricalIgnored, got {other:?}"),
        }
    }

    #[test]
    fn resolve_prefers_file_in_data_dir_over_defaults() {
        let dir = tempdir().unwrap();
        assert_eq!(
            PipelineConfig::resolve(dir.path(), None).unwrap(),
            PipelineConfig::default()
        );

        fs::write(dir.path().join(CONFIG_FILE_NAME), "mode = \"direct\"\n").unwrap();
        let config = PipelineConfig::resolve(dir.path(), None).unwrap();
        assert_eq!(config.mode, PreprocessMode::Direct);
    }

    #[test]
    fn resolve_reports_missing_explicit_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            PipelineConfig::resolve(dir.path(), Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }
}
