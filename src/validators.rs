//! Attribute validators.
//!
//! Validators inspect a value and report diagnostics; they never mutate it.
//! Null and unknown values are skipped, so a validator only ever sees
//! concrete input. Applied to a list or set of primitives, a validator checks
//! each element.

use crate::schema::Diagnostic;
use crate::value::{AttributePath, Value};
use regex::Regex;
use std::fmt;

/// A check applied to an attribute's value.
pub trait Validator: fmt::Debug + Send + Sync {
    /// A short description, used in documentation and diagnostics.
    fn description(&self) -> String;

    /// Validate a single known primitive value.
    fn validate_value(&self, path: &AttributePath, value: &Value) -> Vec<Diagnostic>;

    /// Validate `value`, skipping null and unknown and descending into
    /// collections of primitives.
    fn validate(&self, path: &AttributePath, value: &Value) -> Vec<Diagnostic> {
        if !value.is_known() {
            return Vec::new();
        }
        match value.elements() {
            Some(items) if items.iter().all(|i| i.ty().is_primitive()) => items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_known())
                .flat_map(|(i, item)| self.validate_value(&path.index(i), item))
                .collect(),
            _ => self.validate_value(path, value),
        }
    }

    /// Check the validator's own configuration at schema registration.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

fn invalid(path: &AttributePath, summary: &str, detail: String) -> Vec<Diagnostic> {
    vec![Diagnostic::error(summary).with_detail(detail).with_path(path)]
}

fn render(value: &Value) -> String {
    match (value.as_str(), value.as_i64(), value.as_bool()) {
        (Some(s), _, _) => s.to_string(),
        (_, Some(i), _) => i.to_string(),
        (_, _, Some(b)) => b.to_string(),
        _ => value.to_string(),
    }
}

/// Accepts only values from a fixed set.
#[derive(Debug, Clone)]
pub struct OneOf {
    allowed: Vec<String>,
}

/// Accept only the listed values (compared by their string form).
pub fn one_of<S: Into<String>>(allowed: impl IntoIterator<Item = S>) -> OneOf {
    OneOf {
        allowed: allowed.into_iter().map(Into::into).collect(),
    }
}

impl Validator for OneOf {
    fn description(&self) -> String {
        format!("value must be one of: {}", self.allowed.join(", "))
    }

    fn validate_value(&self, path: &AttributePath, value: &Value) -> Vec<Diagnostic> {
        let rendered = render(value);
        if self.allowed.contains(&rendered) {
            Vec::new()
        } else {
            invalid(
                path,
                "Invalid attribute value",
                format!("{}, got: {rendered}", self.description()),
            )
        }
    }
}

/// Accepts integers in an inclusive range.
#[derive(Debug, Clone, Copy)]
pub struct IntBetween {
    min: i64,
    max: i64,
}

/// Accept integers in `min..=max`.
pub fn int_between(min: i64, max: i64) -> IntBetween {
    IntBetween { min, max }
}

impl Validator for IntBetween {
    fn description(&self) -> String {
        format!("value must be between {} and {}", self.min, self.max)
    }

    fn validate_value(&self, path: &AttributePath, value: &Value) -> Vec<Diagnostic> {
        match value.as_i64() {
            Some(i) if (self.min..=self.max).contains(&i) => Vec::new(),
            Some(i) => invalid(
                path,
                "Invalid attribute value",
                format!("{}, got: {i}", self.description()),
            ),
            None => invalid(
                path,
                "Invalid attribute type",
                format!("expected int64, got {}", value.ty()),
            ),
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.min > self.max {
            return Err(format!("int_between({}, {}) is empty", self.min, self.max));
        }
        Ok(())
    }
}

/// Accepts strings whose length (in characters) is in an inclusive range.
#[derive(Debug, Clone, Copy)]
pub struct StringLen {
    min: usize,
    max: usize,
}

/// Accept strings of `min..=max` characters.
pub fn string_len(min: usize, max: usize) -> StringLen {
    StringLen { min, max }
}

impl Validator for StringLen {
    fn description(&self) -> String {
        format!(
            "string length must be between {} and {}",
            self.min, self.max
        )
    }

    fn validate_value(&self, path: &AttributePath, value: &Value) -> Vec<Diagnostic> {
        match value.as_str() {
            Some(s) => {
                let len = s.chars().count();
                if (self.min..=self.max).contains(&len) {
                    Vec::new()
                } else {
                    invalid(
                        path,
                        "Invalid attribute value length",
                        format!("{}, got: {len}", self.description()),
                    )
                }
            },
            None => invalid(
                path,
                "Invalid attribute type",
                format!("expected string, got {}", value.ty()),
            ),
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.min > self.max {
            return Err(format!("string_len({}, {}) is empty", self.min, self.max));
        }
        Ok(())
    }
}

/// Accepts strings matching a regular expression.
#[derive(Debug, Clone)]
pub struct MatchesRegex {
    pattern: String,
    regex: Result<Regex, regex::Error>,
    message: String,
}

/// Accept strings matching `pattern`. An invalid pattern is reported when
/// the schema is registered.
pub fn matches_regex(pattern: &str, message: impl Into<String>) -> MatchesRegex {
    MatchesRegex {
        pattern: pattern.to_string(),
        regex: Regex::new(pattern),
        message: message.into(),
    }
}

impl Validator for MatchesRegex {
    fn description(&self) -> String {
        if self.message.is_empty() {
            format!("value must match regular expression '{}'", self.pattern)
        } else {
            self.message.clone()
        }
    }

    fn validate_value(&self, path: &AttributePath, value: &Value) -> Vec<Diagnostic> {
        let regex = match &self.regex {
            Ok(regex) => regex,
            Err(err) => return invalid(path, "Invalid validator pattern", err.to_string()),
        };
        match value.as_str() {
            Some(s) if regex.is_match(s) => Vec::new(),
            Some(s) => invalid(
                path,
                "Invalid attribute value match",
                format!("{}, got: {s}", self.description()),
            ),
            None => invalid(
                path,
                "Invalid attribute type",
                format!("expected string, got {}", value.ty()),
            ),
        }
    }

    fn check(&self) -> Result<(), String> {
        self.regex
            .as_ref()
            .map(|_| ())
            .map_err(|err| format!("invalid pattern '{}': {err}", self.pattern))
    }
}

/// Accepts human-readable durations such as `60m` or `1h 30m`.
#[derive(Debug, Clone, Copy)]
pub struct DurationString;

/// Accept strings parseable as a duration.
pub fn duration() -> DurationString {
    DurationString
}

impl Validator for DurationString {
    fn description(&self) -> String {
        "value must be a duration such as \"30s\", \"5m\" or \"1h\"".to_string()
    }

    fn validate_value(&self, path: &AttributePath, value: &Value) -> Vec<Diagnostic> {
        match value.as_str().map(humantime::parse_duration) {
            Some(Ok(_)) => Vec::new(),
            Some(Err(err)) => invalid(path, "Invalid duration", err.to_string()),
            None => invalid(
                path,
                "Invalid attribute type",
                format!("expected string, got {}", value.ty()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    fn path() -> AttributePath {
        AttributePath::parse("replication_type")
    }

    #[test]
    fn test_one_of() {
        let v = one_of(["none", "semi_synch", "asynch"]);
        assert!(v.validate(&path(), &Value::string("none")).is_empty());

        let diags = v.validate(&path(), &Value::string("sync"));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].attribute.as_deref(), Some("replication_type"));
        assert!(diags[0].detail.as_ref().unwrap().contains("got: sync"));
    }

    #[test]
    fn test_null_and_unknown_are_skipped() {
        let v = one_of(["a"]);
        assert!(v.validate(&path(), &Value::null(ValueType::String)).is_empty());
        assert!(v
            .validate(&path(), &Value::unknown(ValueType::String))
            .is_empty());
    }

    #[test]
    fn test_int_between() {
        let v = int_between(1, 3);
        assert!(v.validate(&path(), &Value::int64(3)).is_empty());
        assert_eq!(v.validate(&path(), &Value::int64(4)).len(), 1);
        assert!(int_between(5, 1).check().is_err());
    }

    #[test]
    fn test_string_len_counts_characters() {
        let v = string_len(1, 3);
        assert!(v.validate(&path(), &Value::string("äöü")).is_empty());
        assert_eq!(v.validate(&path(), &Value::string("")).len(), 1);
        assert_eq!(v.validate(&path(), &Value::int64(1)).len(), 1);
    }

    #[test]
    fn test_matches_regex() {
        let v = matches_regex(r"^[a-z]+/[0-9.]+$", "must be an engine/version slug");
        assert!(v.check().is_ok());
        assert!(v.validate(&path(), &Value::string("postgresql/16")).is_empty());

        let diags = v.validate(&path(), &Value::string("postgresql"));
        assert_eq!(diags.len(), 1);
        assert!(diags[0]
            .detail
            .as_ref()
            .unwrap()
            .starts_with("must be an engine/version slug"));

        assert!(matches_regex("(", "").check().is_err());
    }

    #[test]
    fn test_collection_elements_are_validated() {
        let v = string_len(1, 5);
        let value = Value::set(
            ValueType::String,
            vec![Value::string("ok"), Value::string("too long")],
        );
        let diags = v.validate(&AttributePath::parse("allow_list"), &value);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].attribute.as_deref(), Some("allow_list.1"));
    }

    #[test]
    fn test_duration() {
        assert!(duration().validate(&path(), &Value::string("60m")).is_empty());
        assert_eq!(
            duration().validate(&path(), &Value::string("soon")).len(),
            1
        );
    }
}
