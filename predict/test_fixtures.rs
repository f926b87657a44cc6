//! Cell readers shared by the unit tests.

use polars::prelude::*;

/// Cell `row` of `name` read as a number, if present and numeric.
pub fn number(frame: &DataFrame, name: &str, row: usize) -> Option<f64> {
    let casted = frame.column(name).ok()?.cast(&DataType::Float64).ok()?;
    casted.f64().ok()?.get(row)
}

/// Cell `row` of `name` read as text, if present and not null.
pub fn text(frame: &DataFrame, name: &str, row: usize) -> Option<String> {
    let casted = frame.column(name).ok()?.cast(&DataType::String).ok()?;
    casted.str().ok()?.get(row).map(str::to_string)
}
