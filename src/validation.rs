//! Schema validation of typed values.
//!
//! Validation runs twice per resource: once on the decoded configuration
//! (before refresh) and once on the planned object. It checks presence of
//! required attributes, nested block cardinality, each attribute's
//! validators, and the cross-field relations declared on the containing
//! block.
//!
//! # Example
//!
//! ```
//! use linode_provider_core::schema::{Attribute, Schema};
//! use linode_provider_core::validation::{validate, Phase};
//! use linode_provider_core::value::{Value, ValueType};
//!
//! let schema = Schema::v0()
//!     .with_attribute("label", Attribute::required_string())
//!     .with_attribute("cluster_size", Attribute::optional_int64());
//!
//! let config = Value::object([
//!     ("label", Value::null(ValueType::String)),
//!     ("cluster_size", Value::int64(3)),
//! ]);
//! let diagnostics = validate(&schema, &config, Phase::Config);
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("label".to_string()));
//! ```

use crate::schema::{Attribute, Block, Diagnostic, NestedBlock, Schema};
use crate::value::{AttributePath, Value};
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// When validation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Raw configuration, before refresh.
    Config,
    /// The planned object.
    Plan,
    /// Immediately before apply, when every required value must be known.
    /// Earlier phases only warn about unknown required values.
    Apply,
}

/// Validate an object value against a schema.
///
/// An empty list means the value is valid.
pub fn validate(schema: &Schema, value: &Value, phase: Phase) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(
        &schema.block,
        value,
        &AttributePath::root(),
        phase,
        &mut diagnostics,
    );
    diagnostics
}

/// Validate, returning `Err` with the error diagnostics if any.
pub fn validate_result(schema: &Schema, value: &Value, phase: Phase) -> Result<(), Vec<Diagnostic>> {
    let errors: Vec<Diagnostic> = validate(schema, value, phase)
        .into_iter()
        .filter(Diagnostic::is_error)
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_block(
    block: &Block,
    value: &Value,
    path: &AttributePath,
    phase: Phase,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if !value.is_known() {
        return;
    }
    if value.attributes().is_none() {
        diagnostics.push(
            Diagnostic::error("Expected object")
                .with_detail(format!("Got {}", value.ty()))
                .with_path(path),
        );
        return;
    }

    for (name, attr) in &block.attributes {
        let attr_path = path.attr(name.clone());
        let attr_value = value.attr_or_null(name);
        validate_attribute(attr, &attr_value, &attr_path, phase, diagnostics);
    }

    // Relations apply to configuration only.
    if phase == Phase::Config {
        validate_relations(&block.attributes, value, path, diagnostics);
    }

    for (name, nested) in &block.blocks {
        let block_path = path.attr(name.clone());
        let block_value = value.attr_or_null(name);
        validate_nested_block(nested, &block_value, &block_path, phase, diagnostics);
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: &Value,
    path: &AttributePath,
    phase: Phase,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.flags.required {
        if value.is_null() {
            diagnostics.push(
                Diagnostic::error(format!("Missing required attribute '{path}'"))
                    .with_detail("This attribute is required and must be provided")
                    .with_path(path),
            );
            return;
        }
        if value.is_unknown() {
            if phase == Phase::Apply {
                diagnostics.push(
                    Diagnostic::error(format!("Required attribute '{path}' is not known"))
                        .with_detail("The value depends on a resource that has not been applied")
                        .with_path(path),
                );
                return;
            }
            diagnostics.push(
                Diagnostic::warning(format!("Required attribute '{path}' is known only after apply"))
                    .with_detail("It must be known by the time this resource is applied")
                    .with_path(path),
            );
        }
    }

    for validator in &attr.validators {
        diagnostics.extend(validator.validate(path, value));
    }
}

fn is_set(value: &Value) -> bool {
    !value.is_null()
}

fn validate_relations(
    attributes: &IndexMap<String, Attribute>,
    value: &Value,
    path: &AttributePath,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let mut reported_groups = BTreeSet::new();

    for (name, attr) in attributes {
        let attr_path = path.attr(name.clone());
        let this = value.attr_or_null(name);

        if is_set(&this) {
            for other in &attr.conflicts_with {
                if is_set(&value.attr_or_null(other)) {
                    diagnostics.push(
                        Diagnostic::error("Invalid attribute combination")
                            .with_detail(format!(
                                "Attribute '{}' cannot be specified when '{attr_path}' is specified",
                                path.attr(other.clone())
                            ))
                            .with_path(&attr_path),
                    );
                }
            }
            for other in &attr.also_requires {
                if !is_set(&value.attr_or_null(other)) {
                    diagnostics.push(
                        Diagnostic::error("Invalid attribute combination")
                            .with_detail(format!(
                                "Attribute '{}' must be specified when '{attr_path}' is specified",
                                path.attr(other.clone())
                            ))
                            .with_path(&attr_path),
                    );
                }
            }
        }

        if !attr.exactly_one_of.is_empty() {
            let group: BTreeSet<String> = attr
                .exactly_one_of
                .iter()
                .cloned()
                .chain(std::iter::once(name.clone()))
                .collect();
            if !reported_groups.insert(group.clone()) {
                continue;
            }
            let members: Vec<Value> = group.iter().map(|n| value.attr_or_null(n)).collect();
            if members.iter().any(Value::is_unknown) {
                continue;
            }
            let count = members.iter().filter(|v| is_set(v)).count();
            if count != 1 {
                let names = group
                    .iter()
                    .map(|n| path.attr(n.clone()).to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                diagnostics.push(
                    Diagnostic::error("Invalid attribute combination")
                        .with_detail(format!(
                            "Exactly one of these attributes must be configured: [{names}]"
                        ))
                        .with_path(&attr_path),
                );
            }
        }
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: &Value,
    path: &AttributePath,
    phase: Phase,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if value.is_unknown() {
        return;
    }

    let items: Vec<&Value> = if value.is_null() {
        Vec::new()
    } else {
        match value.elements() {
            Some(items) => items.iter().collect(),
            None => vec![value],
        }
    };

    let len = items.len() as u32;
    if len < nested.min_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Block '{path}' requires at least {} item(s), got {len}",
                nested.min_items
            ))
            .with_path(path),
        );
    }
    if nested.max_items > 0 && len > nested.max_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Block '{path}' allows at most {} item(s), got {len}",
                nested.max_items
            ))
            .with_path(path),
        );
    }

    let is_collection = value.elements().is_some();
    for (i, item) in items.into_iter().enumerate() {
        let item_path = if is_collection {
            path.index(i)
        } else {
            path.clone()
        };
        validate_block(&nested.block, item, &item_path, phase, diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators;
    use crate::value::ValueType;

    fn value(attrs: Vec<(&str, Value)>) -> Value {
        Value::object(attrs)
    }

    #[test]
    fn test_validate_required_string() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());

        assert!(validate(&schema, &value(vec![("name", Value::string("db"))]), Phase::Config).is_empty());

        let diagnostics = validate(
            &schema,
            &value(vec![("name", Value::null(ValueType::String))]),
            Phase::Config,
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("name".to_string()));

        // A missing attribute counts as null.
        assert_eq!(validate(&schema, &value(vec![]), Phase::Config).len(), 1);
    }

    #[test]
    fn test_unknown_required_allowed_until_apply() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());
        let config = value(vec![("name", Value::unknown(ValueType::String))]);

        for phase in [Phase::Config, Phase::Plan] {
            let diagnostics = validate(&schema, &config, phase);
            assert_eq!(diagnostics.len(), 1);
            assert!(!diagnostics[0].is_error());
            assert!(diagnostics[0].summary.contains("known only after apply"));
            assert!(validate_result(&schema, &config, phase).is_ok());
        }
        let diagnostics = validate(&schema, &config, Phase::Apply);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("is not known"));
    }

    #[test]
    fn test_validators_run() {
        let schema = Schema::v0().with_attribute(
            "cluster_size",
            Attribute::optional_int64().with_validator(validators::one_of(["1", "3"])),
        );

        assert!(validate(&schema, &value(vec![("cluster_size", Value::int64(3))]), Phase::Plan).is_empty());
        let diagnostics = validate(
            &schema,
            &value(vec![("cluster_size", Value::int64(2))]),
            Phase::Plan,
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("cluster_size"));
    }

    #[test]
    fn test_conflicts_with() {
        let schema = Schema::v0()
            .with_attribute(
                "image",
                Attribute::optional_string().conflicts_with(&["backup_id"]),
            )
            .with_attribute("backup_id", Attribute::optional_int64());

        let both = value(vec![
            ("image", Value::string("linode/debian12")),
            ("backup_id", Value::int64(7)),
        ]);
        let diagnostics = validate(&schema, &both, Phase::Config);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0]
            .detail
            .as_ref()
            .unwrap()
            .contains("'backup_id' cannot be specified when 'image' is specified"));

        let one = value(vec![
            ("image", Value::string("linode/debian12")),
            ("backup_id", Value::null(ValueType::Int64)),
        ]);
        assert!(validate(&schema, &one, Phase::Config).is_empty());
    }

    #[test]
    fn test_also_requires() {
        let schema = Schema::v0()
            .with_attribute(
                "root_pass",
                Attribute::optional_string().also_requires(&["image"]),
            )
            .with_attribute("image", Attribute::optional_string());

        let diagnostics = validate(
            &schema,
            &value(vec![
                ("root_pass", Value::string("s3cret")),
                ("image", Value::null(ValueType::String)),
            ]),
            Phase::Config,
        );
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_exactly_one_of_reported_once_per_group() {
        let schema = Schema::v0()
            .with_attribute("a", Attribute::optional_string().exactly_one_of(&["b"]))
            .with_attribute("b", Attribute::optional_string().exactly_one_of(&["a"]));

        let none = value(vec![
            ("a", Value::null(ValueType::String)),
            ("b", Value::null(ValueType::String)),
        ]);
        let diagnostics = validate(&schema, &none, Phase::Config);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].detail.as_ref().unwrap().contains("[a, b]"));

        let one = value(vec![
            ("a", Value::string("x")),
            ("b", Value::null(ValueType::String)),
        ]);
        assert!(validate(&schema, &one, Phase::Config).is_empty());

        let pending = value(vec![
            ("a", Value::unknown(ValueType::String)),
            ("b", Value::string("y")),
        ]);
        assert!(validate(&schema, &pending, Phase::Config).is_empty());
    }

    #[test]
    fn test_nested_block_cardinality_and_paths() {
        let schema = Schema::v0().with_block(
            "updates",
            NestedBlock::list(
                Block::new().with_attribute(
                    "hour_of_day",
                    Attribute::required_int64().with_validator(validators::int_between(0, 23)),
                ),
            )
            .with_min_items(1)
            .with_max_items(2),
        );
        let elem_ty = ValueType::object([("hour_of_day", ValueType::Int64)]);

        let empty = value(vec![("updates", Value::null(ValueType::list(elem_ty.clone())))]);
        let diagnostics = validate(&schema, &empty, Phase::Config);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("at least 1"));

        let bad_hour = value(vec![(
            "updates",
            Value::list(
                elem_ty.clone(),
                vec![value(vec![("hour_of_day", Value::int64(24))])],
            ),
        )]);
        let diagnostics = validate(&schema, &bad_hour, Phase::Config);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].attribute.as_deref(),
            Some("updates.0.hour_of_day")
        );

        let too_many = value(vec![(
            "updates",
            Value::list(
                elem_ty,
                (0..3)
                    .map(|h| value(vec![("hour_of_day", Value::int64(h))]))
                    .collect(),
            ),
        )]);
        let diagnostics = validate(&schema, &too_many, Phase::Config);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("at most 2"));
    }

    #[test]
    fn test_validate_result_filters_warnings() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());
        assert!(validate_result(&schema, &value(vec![("name", Value::string("x"))]), Phase::Plan).is_ok());
        let errs = validate_result(&schema, &value(vec![]), Phase::Plan).unwrap_err();
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn test_validate_root_not_object() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());
        let diagnostics = validate(&schema, &Value::string("nope"), Phase::Config);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Expected object"));
    }
}
