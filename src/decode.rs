//! Decoding configuration documents into typed values.
//!
//! Configuration arrives as loosely typed JSON. Decoding checks it against
//! the schema, resolves `${...}` references through a caller-supplied
//! resolver, and produces a typed object [`Value`] plus diagnostics for
//! anything that does not fit. Decoding never fails outright: a bad
//! attribute decodes as null and is reported.

use crate::config::Reference;
use crate::schema::{Block, BlockNestingMode, Diagnostic, NestedBlock, Schema};
use crate::value::{AttributePath, Known, Value, ValueType};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Resolves attribute references while decoding.
///
/// Returns `None` for a reference to an undeclared address or attribute, and
/// an unknown value for one whose target has not been applied yet.
pub trait ReferenceResolver {
    /// Resolve a reference to a value.
    fn resolve(&self, reference: &Reference) -> Option<Value>;
}

impl<F> ReferenceResolver for F
where
    F: Fn(&Reference) -> Option<Value>,
{
    fn resolve(&self, reference: &Reference) -> Option<Value> {
        self(reference)
    }
}

/// A resolver for documents without references.
pub fn no_references(_: &Reference) -> Option<Value> {
    None
}

/// Decode a resource's configured attributes against its schema.
pub fn decode_config(
    schema: &Schema,
    attributes: &serde_json::Map<String, Json>,
    resolver: &dyn ReferenceResolver,
) -> (Value, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let value = decode_block(
        &schema.block,
        attributes,
        &AttributePath::root(),
        resolver,
        &mut diagnostics,
    );
    (value, diagnostics)
}

fn decode_block(
    block: &Block,
    obj: &serde_json::Map<String, Json>,
    path: &AttributePath,
    resolver: &dyn ReferenceResolver,
    diagnostics: &mut Vec<Diagnostic>,
) -> Value {
    for key in obj.keys() {
        if !block.attributes.contains_key(key) && !block.blocks.contains_key(key) {
            diagnostics.push(
                Diagnostic::error(format!("Unsupported argument '{key}'"))
                    .with_detail("An argument with this name is not expected here")
                    .with_path(&path.attr(key.clone())),
            );
        }
    }

    let mut attrs = BTreeMap::new();

    for (name, attr) in &block.attributes {
        let attr_path = path.attr(name.clone());
        let value = match obj.get(name) {
            None | Some(Json::Null) => Value::null(attr.value_type.clone()),
            Some(_) if attr.flags.is_computed_only() => {
                diagnostics.push(
                    Diagnostic::error(format!("Value for unconfigurable attribute '{attr_path}'"))
                        .with_detail("This attribute is computed by the provider and cannot be set")
                        .with_path(&attr_path),
                );
                Value::null(attr.value_type.clone())
            },
            Some(json) => decode_value(&attr.value_type, json, &attr_path, resolver, diagnostics),
        };
        attrs.insert(name.clone(), value);
    }

    for (name, nested) in &block.blocks {
        let block_path = path.attr(name.clone());
        let value = decode_nested(nested, obj.get(name), &block_path, resolver, diagnostics);
        attrs.insert(name.clone(), value);
    }

    Value::object(attrs)
}

fn decode_nested(
    nested: &NestedBlock,
    json: Option<&Json>,
    path: &AttributePath,
    resolver: &dyn ReferenceResolver,
    diagnostics: &mut Vec<Diagnostic>,
) -> Value {
    let ty = nested.value_type();
    let json = match json {
        None | Some(Json::Null) => return Value::null(ty),
        Some(json) => json,
    };

    match nested.nesting_mode {
        BlockNestingMode::Single => match json.as_object() {
            Some(obj) => decode_block(&nested.block, obj, path, resolver, diagnostics),
            None => {
                diagnostics.push(type_error(path, "object", json));
                Value::null(ty)
            },
        },
        BlockNestingMode::List | BlockNestingMode::Set => match json.as_array() {
            Some(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let item_path = path.index(i);
                    match item.as_object() {
                        Some(obj) => elements.push(decode_block(
                            &nested.block,
                            obj,
                            &item_path,
                            resolver,
                            diagnostics,
                        )),
                        None => diagnostics.push(type_error(&item_path, "object", item)),
                    }
                }
                let payload = if nested.nesting_mode == BlockNestingMode::Set {
                    Known::Set(elements)
                } else {
                    Known::List(elements)
                };
                build(ty, payload, path, diagnostics)
            },
            None => {
                diagnostics.push(type_error(path, "list", json));
                Value::null(ty)
            },
        },
    }
}

fn decode_value(
    ty: &ValueType,
    json: &Json,
    path: &AttributePath,
    resolver: &dyn ReferenceResolver,
    diagnostics: &mut Vec<Diagnostic>,
) -> Value {
    if json.is_null() {
        return Value::null(ty.clone());
    }
    if let Some(reference) = json.as_str().and_then(Reference::parse) {
        return decode_reference(ty, &reference, path, resolver, diagnostics);
    }

    match ty {
        ValueType::String => match json {
            Json::String(s) => Value::string(s.clone()),
            Json::Number(n) => Value::string(n.to_string()),
            Json::Bool(b) => Value::string(b.to_string()),
            _ => invalid(ty, path, "string", json, diagnostics),
        },
        ValueType::Int64 => match json.as_i64() {
            Some(i) => Value::int64(i),
            None => match json.as_str().and_then(|s| s.parse::<i64>().ok()) {
                Some(i) => Value::int64(i),
                None => invalid(ty, path, "int64", json, diagnostics),
            },
        },
        ValueType::Float64 => match json.as_f64() {
            Some(f) => Value::float64(f),
            None => invalid(ty, path, "float64", json, diagnostics),
        },
        ValueType::Bool => match json {
            Json::Bool(b) => Value::bool(*b),
            Json::String(s) if s == "true" || s == "false" => Value::bool(s == "true"),
            _ => invalid(ty, path, "bool", json, diagnostics),
        },
        ValueType::List(element) | ValueType::Set(element) => match json.as_array() {
            Some(items) => {
                let elements = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        decode_value(element, item, &path.index(i), resolver, diagnostics)
                    })
                    .collect();
                let payload = if matches!(ty, ValueType::Set(_)) {
                    Known::Set(elements)
                } else {
                    Known::List(elements)
                };
                build(ty.clone(), payload, path, diagnostics)
            },
            None => invalid(ty, path, "list", json, diagnostics),
        },
        ValueType::Map(element) => match json.as_object() {
            Some(obj) => {
                let entries = obj
                    .iter()
                    .map(|(key, item)| {
                        let v = decode_value(
                            element,
                            item,
                            &path.key(key.clone()),
                            resolver,
                            diagnostics,
                        );
                        (key.clone(), v)
                    })
                    .collect();
                build(ty.clone(), Known::Map(entries), path, diagnostics)
            },
            None => invalid(ty, path, "map", json, diagnostics),
        },
        ValueType::Object(types) => match json.as_object() {
            Some(obj) => {
                let attrs = types
                    .iter()
                    .map(|(name, attr_ty)| {
                        let attr_path = path.attr(name.clone());
                        let v = match obj.get(name) {
                            Some(item) => {
                                decode_value(attr_ty, item, &attr_path, resolver, diagnostics)
                            },
                            None => Value::null(attr_ty.clone()),
                        };
                        (name.clone(), v)
                    })
                    .collect();
                build(ty.clone(), Known::Object(attrs), path, diagnostics)
            },
            None => invalid(ty, path, "object", json, diagnostics),
        },
    }
}

fn decode_reference(
    ty: &ValueType,
    reference: &Reference,
    path: &AttributePath,
    resolver: &dyn ReferenceResolver,
    diagnostics: &mut Vec<Diagnostic>,
) -> Value {
    let resolved = match resolver.resolve(reference) {
        Some(v) => v,
        None => {
            diagnostics.push(
                Diagnostic::error("Reference to undeclared resource")
                    .with_detail(format!(
                        "{}.{} does not refer to a declared attribute",
                        reference.address, reference.path
                    ))
                    .with_path(path),
            );
            return Value::null(ty.clone());
        },
    };

    if resolved.is_unknown() {
        return Value::unknown(ty.clone());
    }
    if resolved.is_null() {
        return Value::null(ty.clone());
    }
    if resolved.ty() == ty {
        return resolved;
    }
    // Primitive conversions mirror those accepted for literal values.
    let json = resolved.to_json();
    decode_value(ty, &json, path, &no_references, diagnostics)
}

fn build(ty: ValueType, payload: Known, path: &AttributePath, diagnostics: &mut Vec<Diagnostic>) -> Value {
    match Value::try_known(ty.clone(), payload) {
        Ok(v) => v,
        Err(err) => {
            diagnostics.push(
                Diagnostic::error("Incorrect attribute value type")
                    .with_detail(err.message)
                    .with_path(path),
            );
            Value::null(ty)
        },
    }
}

fn invalid(
    ty: &ValueType,
    path: &AttributePath,
    expected: &str,
    json: &Json,
    diagnostics: &mut Vec<Diagnostic>,
) -> Value {
    diagnostics.push(type_error(path, expected, json));
    Value::null(ty.clone())
}

fn type_error(path: &AttributePath, expected: &str, json: &Json) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for '{path}'"))
        .with_detail(format!("Expected {expected}, got {}", json_type_name(json)))
        .with_path(path)
}

fn json_type_name(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use crate::types::Address;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::v0()
            .with_attribute("label", Attribute::required_string())
            .with_attribute("cluster_size", Attribute::optional_int64())
            .with_attribute(
                "allow_list",
                Attribute::optional(ValueType::set(ValueType::String)),
            )
            .with_attribute("status", Attribute::computed_string())
            .with_block(
                "updates",
                NestedBlock::list(
                    Block::new()
                        .with_attribute("day_of_week", Attribute::optional_int64())
                        .with_attribute("frequency", Attribute::optional_string()),
                ),
            )
    }

    fn obj(v: Json) -> serde_json::Map<String, Json> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_decode_valid_config() {
        let (value, diags) = decode_config(
            &schema(),
            &obj(json!({
                "label": "db",
                "cluster_size": 3,
                "allow_list": ["10.0.0.2/32", "10.0.0.1/32"],
                "updates": [{"day_of_week": 1, "frequency": "weekly"}]
            })),
            &no_references,
        );

        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(value.ty(), &schema().value_type());
        assert_eq!(value.attr("label"), Some(&Value::string("db")));
        assert_eq!(value.attr("cluster_size"), Some(&Value::int64(3)));
        assert!(value.attr("status").unwrap().is_null());
        assert_eq!(
            value
                .at(&AttributePath::parse("updates.0.frequency"))
                .cloned(),
            Some(Value::string("weekly"))
        );
    }

    #[test]
    fn test_decode_reports_type_errors_with_path() {
        let (value, diags) = decode_config(
            &schema(),
            &obj(json!({"label": "db", "cluster_size": [1]})),
            &no_references,
        );
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].attribute.as_deref(), Some("cluster_size"));
        assert!(value.attr("cluster_size").unwrap().is_null());
    }

    #[test]
    fn test_decode_rejects_unknown_and_computed_arguments() {
        let (_, diags) = decode_config(
            &schema(),
            &obj(json!({"label": "db", "colour": "red", "status": "active"})),
            &no_references,
        );
        let summaries: Vec<_> = diags.iter().map(|d| d.summary.as_str()).collect();
        assert!(summaries.contains(&"Unsupported argument 'colour'"));
        assert!(summaries.contains(&"Value for unconfigurable attribute 'status'"));
    }

    #[test]
    fn test_decode_resolves_references() {
        let resolver = |r: &Reference| -> Option<Value> {
            if r.address == Address::managed("linode_database_postgresql", "primary") {
                match r.path.to_string().as_str() {
                    "label" => Some(Value::string("primary")),
                    "port" => Some(Value::unknown(ValueType::Int64)),
                    _ => None,
                }
            } else {
                None
            }
        };

        let (value, diags) = decode_config(
            &schema(),
            &obj(json!({
                "label": "${linode_database_postgresql.primary.label}",
                "cluster_size": "${linode_database_postgresql.primary.port}",
                "allow_list": ["${linode_database_postgresql.other.host}"]
            })),
            &resolver,
        );

        assert_eq!(value.attr("label"), Some(&Value::string("primary")));
        assert!(value.attr("cluster_size").unwrap().is_unknown());
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].summary, "Reference to undeclared resource");
        assert_eq!(diags[0].attribute.as_deref(), Some("allow_list.0"));
    }

    #[test]
    fn test_reference_converts_primitive_types() {
        let resolver = |_: &Reference| Some(Value::int64(5432));
        let (value, diags) = decode_config(
            &schema(),
            &obj(json!({"label": "${linode_x.y.port}"})),
            &resolver,
        );
        assert!(diags.is_empty());
        assert_eq!(value.attr("label"), Some(&Value::string("5432")));
    }
}
