//! Parsing of the prediction request: one flat JSON object of scalar fields.

use polars::prelude::{Column, DataFrame, DataType, NamedFrom, PlSmallStr, PolarsError, Series};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("The prediction request is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("The prediction request must be a JSON object, found {0}.")]
    NotAnObject(&'static str),
    #[error("Field '{0}' must be a scalar (string, number, boolean or null).")]
    NonScalarField(String),
    #[error("Failed to build the request frame: {0}")]
    Polars(#[from] PolarsError),
}

/// Parses the raw request into a one-row frame, one column per field in the
/// order the fields appear.
pub fn parse_input(json: &str) -> Result<DataFrame, InputError> {
    let parsed: serde_json::Value = serde_json::from_str(json)?;
    let object = match parsed {
        serde_json::Value::Object(map) => map,
        other => return Err(InputError::NotAnObject(json_kind(&other))),
    };

    let mut columns = Vec::with_capacity(object.len());
    for (name, value) in &object {
        let column =
            scalar_column(name, value).ok_or_else(|| InputError::NonScalarField(name.clone()))?;
        columns.push(column);
    }
    Ok(DataFrame::new(columns)?)
}

fn scalar_column(name: &str, value: &serde_json::Value) -> Option<Column> {
    let name: PlSmallStr = name.into();
    let series = match value {
        serde_json::Value::Null => Series::full_null(name, 1, &DataType::Null),
        serde_json::Value::Bool(b) => Series::new(name, &[*b]),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Series::new(name, &[i]),
            None => Series::new(name, &[n.as_f64()?]),
        },
        serde_json::Value::String(s) => Series::new(name, &[s.as_str()]),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => return None,
    };
    Some(series.into())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
