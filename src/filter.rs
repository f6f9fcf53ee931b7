//! Filter compilation for list data sources.
//!
//! A list data source declares which response fields can be filtered on and
//! whether the API can filter on them itself. A user query is a set of
//! `filter` blocks plus optional `order`, `order_by` and `latest`. Compiling
//! a query splits it into a server-side filter document (sent in the
//! `X-Filter` header) and a residual predicate evaluated over the decoded
//! records.

use crate::schema::{Attribute, Block, Diagnostic, NestedBlock, Schema};
use crate::value::{AttributePath, Value, ValueType};
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Name of the repeatable filter block.
pub const FILTER_BLOCK: &str = "filter";

// ── Filter configuration ─────────────────────────────────────────────

/// Scalar type of a filterable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// A string field.
    String,
    /// An integer field.
    Int,
    /// A boolean field.
    Bool,
}

/// How one response field can be filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterableField {
    /// The API accepts this field in `X-Filter`.
    pub api_filterable: bool,
    /// The field's scalar type.
    pub field_type: FieldType,
}

/// The filterable fields of a list data source, in declared order.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    fields: IndexMap<String, FilterableField>,
}

impl FilterConfig {
    /// An empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field the API can filter on.
    pub fn api_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FilterableField {
                api_filterable: true,
                field_type,
            },
        );
        self
    }

    /// Declare a field that is only filtered client-side.
    pub fn local_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FilterableField {
                api_filterable: false,
                field_type,
            },
        );
        self
    }

    /// Look up a field.
    pub fn get(&self, name: &str) -> Option<&FilterableField> {
        self.fields.get(name)
    }

    fn field_names(&self) -> String {
        self.fields.keys().cloned().collect::<Vec<_>>().join(", ")
    }

    /// Add the `filter` block and the `order`, `order_by` and `latest`
    /// attributes to a data source schema.
    pub fn extend_schema(&self, schema: Schema) -> Schema {
        let filter = Block::new()
            .with_description("Filter on a response field.")
            .with_attribute(
                "name",
                Attribute::required_string().with_description("The field to filter on."),
            )
            .with_attribute(
                "values",
                Attribute::required(ValueType::list(ValueType::String))
                    .with_description("Values to match; any one matching is enough."),
            )
            .with_attribute(
                "match_by",
                Attribute::optional_string()
                    .with_description("exact (default), substring, or regex."),
            );
        schema
            .with_block(FILTER_BLOCK, NestedBlock::list(filter))
            .with_attribute(
                "order",
                Attribute::optional_string()
                    .with_validator(crate::validators::one_of(["asc", "desc"])),
            )
            .with_attribute("order_by", Attribute::optional_string())
            .with_attribute("latest", Attribute::optional_bool())
    }
}

// ── Queries ──────────────────────────────────────────────────────────

/// How a filter term compares values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchBy {
    /// Equality on the normalized string form.
    #[default]
    Exact,
    /// The field contains the value.
    Substring,
    /// The field matches the value as a regular expression.
    Regex,
}

impl FromStr for MatchBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "exact" => Ok(Self::Exact),
            "substring" | "sub" => Ok(Self::Substring),
            "regex" | "re" => Ok(Self::Regex),
            other => Err(format!(
                "unsupported match_by {other:?}; expected exact, substring, or regex"
            )),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

/// One `filter` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterTerm {
    /// Field name.
    pub name: String,
    /// Candidate values; a record matches if any one matches.
    pub values: Vec<String>,
    /// Comparison mode.
    pub match_by: MatchBy,
}

/// A parsed list query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterQuery {
    /// Filter terms, all of which must match.
    pub terms: Vec<FilterTerm>,
    /// Sort direction.
    pub order: Order,
    /// Sort field.
    pub order_by: Option<String>,
    /// Keep only the most recently created record.
    pub latest: bool,
}

impl FilterQuery {
    /// Read a query out of a decoded data source configuration.
    pub fn from_config(config: &Value) -> (Self, Vec<Diagnostic>) {
        let mut query = Self::default();
        let mut diagnostics = Vec::new();

        let blocks = config
            .attr(FILTER_BLOCK)
            .and_then(|v| v.elements())
            .unwrap_or_default();
        for (i, block) in blocks.iter().enumerate() {
            let path = AttributePath::root().attr(FILTER_BLOCK).index(i);
            let name = block.attr("name").and_then(Value::as_str).unwrap_or_default();
            let values = block
                .attr("values")
                .and_then(Value::elements)
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let match_by = match block
                .attr("match_by")
                .and_then(Value::as_str)
                .map(MatchBy::from_str)
                .transpose()
            {
                Ok(m) => m.unwrap_or_default(),
                Err(e) => {
                    diagnostics.push(
                        Diagnostic::error("Invalid match_by")
                            .with_detail(e)
                            .with_path(&path.attr("match_by")),
                    );
                    MatchBy::Exact
                },
            };
            query.terms.push(FilterTerm {
                name: name.to_string(),
                values,
                match_by,
            });
        }

        match config.attr("order").and_then(Value::as_str) {
            None | Some("asc") => {},
            Some("desc") => query.order = Order::Desc,
            Some(other) => diagnostics.push(
                Diagnostic::error("Invalid order")
                    .with_detail(format!("expected asc or desc, got {other:?}"))
                    .with_attribute("order"),
            ),
        }
        query.order_by = config
            .attr("order_by")
            .and_then(Value::as_str)
            .map(str::to_string);
        query.latest = config
            .attr("latest")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        (query, diagnostics)
    }

    /// A stable identifier for this query.
    ///
    /// Canonical JSON of the sorted terms, the order and the sort field, so
    /// that reordering `filter` blocks or their values yields the same ID.
    pub fn id(&self) -> String {
        let mut terms: Vec<Json> = self
            .terms
            .iter()
            .map(|t| {
                let mut values = t.values.clone();
                values.sort();
                json!({"name": t.name, "values": values, "match_by": t.match_by})
            })
            .collect();
        terms.sort_by_key(|t| t.to_string());
        json!({
            "filter": terms,
            "order": self.order,
            "order_by": self.order_by,
        })
        .to_string()
    }
}

// ── Compilation ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Matcher {
    Exact(Vec<String>),
    Substring(Vec<String>),
    Regex(Vec<Regex>),
}

impl Matcher {
    fn matches_scalar(&self, actual: &str) -> bool {
        match self {
            Self::Exact(values) => values.iter().any(|v| v == actual),
            Self::Substring(values) => values.iter().any(|v| actual.contains(v.as_str())),
            Self::Regex(patterns) => patterns.iter().any(|r| r.is_match(actual)),
        }
    }

    fn matches(&self, field: &Json) -> bool {
        match field {
            Json::Array(items) => items.iter().any(|item| self.matches(item)),
            other => normalize(other).is_some_and(|s| self.matches_scalar(&s)),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledTerm {
    field: String,
    matcher: Matcher,
}

impl CompiledTerm {
    fn matches(&self, record: &Json) -> bool {
        record
            .get(&self.field)
            .is_some_and(|field| self.matcher.matches(field))
    }
}

/// The result of compiling a [`FilterQuery`] against a [`FilterConfig`].
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    server_filter: Option<Json>,
    server_terms: Vec<CompiledTerm>,
    residual: Vec<CompiledTerm>,
    order_params: Vec<(String, String)>,
    client_order: Option<(String, Order)>,
    latest: bool,
}

impl CompiledFilter {
    /// The server-side filter document, if any term is API-filterable.
    pub fn server_filter(&self) -> Option<&Json> {
        self.server_filter.as_ref()
    }

    /// The filter document serialized for the `X-Filter` header.
    pub fn header(&self) -> Option<String> {
        self.server_filter.as_ref().map(Json::to_string)
    }

    /// `order_by` / `order` query parameters, when the API sorts.
    pub fn order_params(&self) -> &[(String, String)] {
        &self.order_params
    }

    /// Returns `true` when some terms must be evaluated client-side.
    pub fn has_residual(&self) -> bool {
        !self.residual.is_empty()
    }

    /// Evaluate the residual predicate on one record.
    pub fn matches_residual(&self, record: &Json) -> bool {
        self.residual.iter().all(|t| t.matches(record))
    }

    /// Evaluate every term, server-side ones included, on one record.
    pub fn matches_all(&self, record: &Json) -> bool {
        self.server_terms
            .iter()
            .chain(&self.residual)
            .all(|t| t.matches(record))
    }

    /// Post-process server results: apply the residual predicate, then any
    /// client-side ordering, then `latest`.
    pub fn apply(&self, records: Vec<Json>) -> Vec<Json> {
        let mut out: Vec<Json> = records
            .into_iter()
            .filter(|r| self.matches_residual(r))
            .collect();

        if let Some((field, order)) = &self.client_order {
            out.sort_by(|a, b| {
                let ord = compare_json(a.get(field), b.get(field));
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }

        if self.latest {
            out = latest(out).into_iter().collect();
        }
        out
    }
}

/// Compile `query` against `config`.
///
/// Every term that is API-filterable and matches exactly is sent to the
/// server; the rest form the residual predicate. Returns `None` when the
/// query is invalid, with the reasons as error diagnostics.
pub fn compile(config: &FilterConfig, query: &FilterQuery) -> (Option<CompiledFilter>, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut server_docs = Vec::new();
    let mut server_terms = Vec::new();
    let mut residual = Vec::new();

    for (i, term) in query.terms.iter().enumerate() {
        let path = AttributePath::root().attr(FILTER_BLOCK).index(i);
        let Some(field) = config.get(&term.name) else {
            diagnostics.push(
                Diagnostic::error("Attempted to filter on non-filterable field")
                    .with_detail(format!(
                        "{:?} cannot be filtered on; valid fields: {}",
                        term.name,
                        config.field_names()
                    ))
                    .with_path(&path.attr("name")),
            );
            continue;
        };

        if term.match_by != MatchBy::Exact && field.field_type != FieldType::String {
            diagnostics.push(
                Diagnostic::error("Invalid match_by for field type")
                    .with_detail(format!(
                        "{:?} is not a string field and only supports exact matching",
                        term.name
                    ))
                    .with_path(&path.attr("match_by")),
            );
            continue;
        }

        let matcher = match term.match_by {
            MatchBy::Exact => Matcher::Exact(exact_values(field.field_type, &term.values)),
            MatchBy::Substring => Matcher::Substring(term.values.clone()),
            MatchBy::Regex => {
                let compiled: Result<Vec<Regex>, _> =
                    term.values.iter().map(|v| Regex::new(v)).collect();
                match compiled {
                    Ok(patterns) => Matcher::Regex(patterns),
                    Err(err) => {
                        diagnostics.push(
                            Diagnostic::error("Failed to compile regex")
                                .with_detail(err.to_string())
                                .with_path(&path.attr("values")),
                        );
                        continue;
                    },
                }
            },
        };
        let compiled = CompiledTerm {
            field: term.name.clone(),
            matcher,
        };

        if field.api_filterable && term.match_by == MatchBy::Exact {
            let mut alternatives = Vec::with_capacity(term.values.len());
            for value in &term.values {
                match typed_value(field.field_type, value) {
                    Ok(typed) => alternatives.push(field_doc(&term.name, typed)),
                    Err(e) => diagnostics.push(
                        Diagnostic::error("Invalid filter value")
                            .with_detail(e)
                            .with_path(&path.attr("values")),
                    ),
                }
            }
            let doc = match alternatives.len() {
                0 => continue,
                1 => alternatives.remove(0),
                _ => json!({ "+or": alternatives }),
            };
            server_docs.push(doc);
            server_terms.push(compiled);
        } else {
            residual.push(compiled);
        }
    }

    let (order_params, client_order) = match &query.order_by {
        None => (Vec::new(), None),
        Some(field) => match config.get(field) {
            None => {
                diagnostics.push(
                    Diagnostic::error("Invalid order_by")
                        .with_detail(format!(
                            "{field:?} cannot be ordered on; valid fields: {}",
                            config.field_names()
                        ))
                        .with_attribute("order_by"),
                );
                (Vec::new(), None)
            },
            Some(f) if f.api_filterable => (
                vec![
                    ("order_by".to_string(), field.clone()),
                    ("order".to_string(), query.order.to_string()),
                ],
                None,
            ),
            Some(_) => (Vec::new(), Some((field.clone(), query.order))),
        },
    };

    if crate::schema::has_errors(&diagnostics) {
        return (None, diagnostics);
    }

    let server_filter = match server_docs.len() {
        0 => None,
        1 => server_docs.pop(),
        _ => Some(json!({ "+and": server_docs })),
    };

    (
        Some(CompiledFilter {
            server_filter,
            server_terms,
            residual,
            order_params,
            client_order,
            latest: query.latest,
        }),
        diagnostics,
    )
}

fn field_doc(name: &str, value: Json) -> Json {
    let mut doc = serde_json::Map::new();
    doc.insert(name.to_string(), value);
    Json::Object(doc)
}

fn typed_value(field_type: FieldType, raw: &str) -> Result<Json, String> {
    match field_type {
        FieldType::String => Ok(Json::String(raw.to_string())),
        FieldType::Int => raw
            .parse::<i64>()
            .map(Json::from)
            .map_err(|_| format!("{raw:?} is not an integer")),
        FieldType::Bool => raw
            .to_ascii_lowercase()
            .parse::<bool>()
            .map(Json::Bool)
            .map_err(|_| format!("{raw:?} is not a boolean")),
    }
}

/// Term values in the form [`normalize`] gives record fields, so `"True"`
/// matches `true` and `"01"` matches `1` the way the server compares them.
fn exact_values(field_type: FieldType, raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|v| {
            typed_value(field_type, v)
                .ok()
                .and_then(|typed| normalize(&typed))
                .unwrap_or_else(|| v.clone())
        })
        .collect()
}

/// Normalized string form of a scalar record field.
fn normalize(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => format!("{:.0}", n.as_f64().unwrap_or_default()),
        }),
        Json::Bool(b) => Some(b.to_string()),
        Json::Null => Some(String::new()),
        _ => None,
    }
}

fn compare_json(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    match (a, b) {
        (Some(Json::Number(x)), Some(Json::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Json::String(x)), Some(Json::String(y))) => x.cmp(y),
        (Some(Json::Bool(x)), Some(Json::Bool(y))) => x.cmp(y),
        (None | Some(Json::Null), None | Some(Json::Null)) => Ordering::Equal,
        (None | Some(Json::Null), _) => Ordering::Greater,
        (_, None | Some(Json::Null)) => Ordering::Less,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Parse a `created` timestamp in RFC 3339 or the API's zone-less form.
pub fn parse_created(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|n| n.and_utc())
        })
}

/// The record with the newest `created`; ties go to the larger `id`.
/// Records without a parseable `created` are skipped.
pub fn latest(records: Vec<Json>) -> Option<Json> {
    records
        .into_iter()
        .filter_map(|r| {
            let created = r.get("created").and_then(Json::as_str).and_then(parse_created)?;
            Some((created, r))
        })
        .max_by(|(ca, a), (cb, b)| {
            ca.cmp(cb)
                .then_with(|| compare_json(a.get("id"), b.get("id")))
        })
        .map(|(_, r)| r)
}
