//! Built-in Linode resource and data source kinds.

mod database_postgresql;
mod images;

pub use database_postgresql::PostgresDatabase;
pub use images::Images;

use crate::error::ProviderError;
use crate::value::Value;

/// A required string attribute of a planned object.
pub(crate) fn required_str(planned: &Value, name: &str) -> Result<String, ProviderError> {
    planned
        .attr(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Config(format!("{name} is not known")))
}

/// A string attribute that may be null.
pub(crate) fn optional_str(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::string(s),
        None => Value::null(crate::value::ValueType::String),
    }
}
