//! Typed attribute values.
//!
//! A [`Value`] pairs a [`ValueType`] with one of three states: known (carrying a
//! payload), null, or unknown ("known after apply"). Values are immutable once
//! built; every transform returns a new value.
//!
//! # Example
//!
//! ```
//! use linode_provider_core::value::{Value, ValueType};
//!
//! let region = Value::string("us-east");
//! assert!(region.equal(&Value::string("us-east")));
//!
//! // Unknown is never equal to anything, including another unknown.
//! let pending = Value::unknown(ValueType::String);
//! assert!(!pending.equal(&pending.clone()));
//!
//! // Set ordering is not significant.
//! let a = Value::set(ValueType::String, vec![Value::string("b"), Value::string("a")]);
//! let b = Value::set(ValueType::String, vec![Value::string("a"), Value::string("b")]);
//! assert!(a.equal(&b));
//! ```

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// The type of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A 64-bit floating point number.
    Float64,
    /// A boolean value.
    Bool,
    /// An ordered list of values of a single type.
    List(Box<ValueType>),
    /// An unordered collection of unique values of a single type.
    Set(Box<ValueType>),
    /// A map from string keys to values of a single type.
    Map(Box<ValueType>),
    /// An object with a fixed set of typed attributes.
    Object(BTreeMap<String, ValueType>),
}

impl ValueType {
    /// Create a list type.
    pub fn list(element_type: ValueType) -> Self {
        Self::List(Box::new(element_type))
    }

    /// Create a set type.
    pub fn set(element_type: ValueType) -> Self {
        Self::Set(Box::new(element_type))
    }

    /// Create a map type.
    pub fn map(element_type: ValueType) -> Self {
        Self::Map(Box::new(element_type))
    }

    /// Create an object type.
    pub fn object<K: Into<String>>(attributes: impl IntoIterator<Item = (K, ValueType)>) -> Self {
        Self::Object(
            attributes
                .into_iter()
                .map(|(name, ty)| (name.into(), ty))
                .collect(),
        )
    }

    /// The element type of a list, set or map.
    pub fn element_type(&self) -> Option<&ValueType> {
        match self {
            Self::List(e) | Self::Set(e) | Self::Map(e) => Some(e),
            _ => None,
        }
    }

    /// The attribute types of an object type.
    pub fn attribute_types(&self) -> Option<&BTreeMap<String, ValueType>> {
        match self {
            Self::Object(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// Returns `true` for string, int64, float64 and bool.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::String | Self::Int64 | Self::Float64 | Self::Bool)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Int64 => write!(f, "int64"),
            Self::Float64 => write!(f, "float64"),
            Self::Bool => write!(f, "bool"),
            Self::List(e) => write!(f, "list({e})"),
            Self::Set(e) => write!(f, "set({e})"),
            Self::Map(e) => write!(f, "map({e})"),
            Self::Object(_) => write!(f, "object"),
        }
    }
}

/// One step of an [`AttributePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathStep {
    /// An object attribute or block name.
    Attribute(String),
    /// A list or set element position.
    Index(usize),
    /// A map key.
    Key(String),
}

/// A path from the root of a resource object to a nested value.
///
/// Displayed as dot-separated steps, e.g. `updates.0.day_of_week`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AttributePath(Vec<PathStep>);

impl AttributePath {
    /// The empty path (the resource object itself).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a dot-separated path. Numeric segments become list indices.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|s| !s.is_empty())
                .map(|segment| match segment.parse::<usize>() {
                    Ok(i) => PathStep::Index(i),
                    Err(_) => PathStep::Attribute(segment.to_string()),
                })
                .collect(),
        )
    }

    /// Append an attribute step.
    pub fn attr(&self, name: impl Into<String>) -> Self {
        self.with_step(PathStep::Attribute(name.into()))
    }

    /// Append an index step.
    pub fn index(&self, i: usize) -> Self {
        self.with_step(PathStep::Index(i))
    }

    /// Append a map key step.
    pub fn key(&self, key: impl Into<String>) -> Self {
        self.with_step(PathStep::Key(key.into()))
    }

    fn with_step(&self, step: PathStep) -> Self {
        let mut steps = self.0.clone();
        steps.push(step);
        Self(steps)
    }

    /// The steps of this path.
    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    /// Returns `true` for the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The path without its last step.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// The first step, when it names an attribute.
    pub fn root_attribute(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathStep::Attribute(name)) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match step {
                PathStep::Attribute(name) | PathStep::Key(name) => write!(f, "{name}")?,
                PathStep::Index(idx) => write!(f, "{idx}")?,
            }
        }
        Ok(())
    }
}

impl Serialize for AttributePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The payload of a known value.
#[derive(Debug, Clone, PartialEq)]
pub enum Known {
    /// A string.
    String(String),
    /// A 64-bit integer.
    Int64(i64),
    /// A 64-bit float.
    Float64(f64),
    /// A boolean.
    Bool(bool),
    /// List elements, in order.
    List(Vec<Value>),
    /// Set elements, in canonical order without duplicates.
    Set(Vec<Value>),
    /// Map entries.
    Map(BTreeMap<String, Value>),
    /// Object attributes.
    Object(BTreeMap<String, Value>),
}

impl Known {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::Bool(_) => "bool",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Known(Known),
    Null,
    Unknown,
}

/// A typed attribute value that is known, null, or unknown.
///
/// `PartialEq` is structural (two unknowns of the same type compare equal);
/// use [`Value::equal`] for plan semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    ty: ValueType,
    state: State,
}

/// A JSON document that could not be converted to the expected type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    /// Where the mismatch occurred.
    pub path: AttributePath,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_root() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

impl std::error::Error for ConversionError {}

impl Value {
    /// Create a null value of the given type.
    pub fn null(ty: ValueType) -> Self {
        Self {
            ty,
            state: State::Null,
        }
    }

    /// Create an unknown value of the given type.
    pub fn unknown(ty: ValueType) -> Self {
        Self {
            ty,
            state: State::Unknown,
        }
    }

    /// Create a known value, checking the payload against the type.
    ///
    /// # Panics
    ///
    /// Panics if the payload does not match `ty`. A mismatch here is a
    /// programming error; use [`Value::try_known`] for untrusted input.
    pub fn known(ty: ValueType, payload: Known) -> Self {
        match Self::try_known(ty, payload) {
            Ok(value) => value,
            Err(err) => panic!("invalid value construction: {err}"),
        }
    }

    /// Create a known value, returning an error if the payload does not match.
    pub fn try_known(ty: ValueType, payload: Known) -> Result<Self, ConversionError> {
        check_payload(&ty, &payload).map_err(|message| ConversionError {
            path: AttributePath::root(),
            message,
        })?;
        let payload = match payload {
            Known::Set(items) => Known::Set(canonical_set(items)),
            other => other,
        };
        Ok(Self {
            ty,
            state: State::Known(payload),
        })
    }

    /// Create a known string.
    pub fn string(s: impl Into<String>) -> Self {
        Self {
            ty: ValueType::String,
            state: State::Known(Known::String(s.into())),
        }
    }

    /// Create a known int64.
    pub fn int64(i: i64) -> Self {
        Self {
            ty: ValueType::Int64,
            state: State::Known(Known::Int64(i)),
        }
    }

    /// Create a known float64.
    pub fn float64(f: f64) -> Self {
        Self {
            ty: ValueType::Float64,
            state: State::Known(Known::Float64(f)),
        }
    }

    /// Create a known bool.
    pub fn bool(b: bool) -> Self {
        Self {
            ty: ValueType::Bool,
            state: State::Known(Known::Bool(b)),
        }
    }

    /// Create a known list.
    ///
    /// # Panics
    ///
    /// Panics if an element's type differs from `element_type`.
    pub fn list(element_type: ValueType, items: Vec<Value>) -> Self {
        Self::known(ValueType::list(element_type), Known::List(items))
    }

    /// Create a known set. Duplicates are removed.
    ///
    /// # Panics
    ///
    /// Panics if an element's type differs from `element_type`.
    pub fn set(element_type: ValueType, items: Vec<Value>) -> Self {
        Self::known(ValueType::set(element_type), Known::Set(items))
    }

    /// Create a known map.
    ///
    /// # Panics
    ///
    /// Panics if an entry's type differs from `element_type`.
    pub fn map(element_type: ValueType, entries: BTreeMap<String, Value>) -> Self {
        Self::known(ValueType::map(element_type), Known::Map(entries))
    }

    /// Create a known object. The object type is derived from the attributes.
    pub fn object<K: Into<String>>(attributes: impl IntoIterator<Item = (K, Value)>) -> Self {
        let attrs: BTreeMap<String, Value> = attributes
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect();
        let ty = ValueType::Object(
            attrs
                .iter()
                .map(|(name, value)| (name.clone(), value.ty.clone()))
                .collect(),
        );
        Self {
            ty,
            state: State::Known(Known::Object(attrs)),
        }
    }

    /// The type of this value.
    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    /// Returns `true` if the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self.state, State::Null)
    }

    /// Returns `true` if the value is unknown.
    pub fn is_unknown(&self) -> bool {
        matches!(self.state, State::Unknown)
    }

    /// Returns `true` if the value is known (possibly with unknown elements).
    pub fn is_known(&self) -> bool {
        matches!(self.state, State::Known(_))
    }

    /// Returns `true` if this value or any nested value is unknown.
    pub fn contains_unknown(&self) -> bool {
        let mut found = false;
        self.walk(&mut |_: &AttributePath, v: &Value| found |= v.is_unknown());
        found
    }

    /// The payload of a known value.
    pub fn payload(&self) -> Option<&Known> {
        match &self.state {
            State::Known(k) => Some(k),
            _ => None,
        }
    }

    /// The string payload.
    pub fn as_str(&self) -> Option<&str> {
        match self.payload() {
            Some(Known::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The int64 payload.
    pub fn as_i64(&self) -> Option<i64> {
        match self.payload() {
            Some(Known::Int64(i)) => Some(*i),
            _ => None,
        }
    }

    /// The float64 payload.
    pub fn as_f64(&self) -> Option<f64> {
        match self.payload() {
            Some(Known::Float64(f)) => Some(*f),
            Some(Known::Int64(i)) => Some(*i as f64),
            _ => None,
        }
    }

    /// The bool payload.
    pub fn as_bool(&self) -> Option<bool> {
        match self.payload() {
            Some(Known::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Elements of a list or set.
    pub fn elements(&self) -> Option<&[Value]> {
        match self.payload() {
            Some(Known::List(items)) | Some(Known::Set(items)) => Some(items),
            _ => None,
        }
    }

    /// Entries of a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self.payload() {
            Some(Known::Map(entries)) => Some(entries),
            _ => None,
        }
    }

    /// Attributes of an object.
    pub fn attributes(&self) -> Option<&BTreeMap<String, Value>> {
        match self.payload() {
            Some(Known::Object(attrs)) => Some(attrs),
            _ => None,
        }
    }

    /// A single attribute of an object.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes().and_then(|attrs| attrs.get(name))
    }

    /// An attribute of an object, or a null of the declared type if the
    /// object is null or lacks it.
    pub fn attr_or_null(&self, name: &str) -> Value {
        match self.attr(name) {
            Some(v) => v.clone(),
            None => {
                let ty = self
                    .ty
                    .attribute_types()
                    .and_then(|types| types.get(name))
                    .cloned()
                    .unwrap_or(ValueType::String);
                if self.is_unknown() {
                    Value::unknown(ty)
                } else {
                    Value::null(ty)
                }
            },
        }
    }

    /// The value at `path`, if every step resolves.
    pub fn at(&self, path: &AttributePath) -> Option<&Value> {
        let mut current = self;
        for step in path.steps() {
            current = match step {
                PathStep::Attribute(name) => current.attr(name)?,
                PathStep::Index(i) => current.elements()?.get(*i)?,
                PathStep::Key(key) => current.as_map()?.get(key)?,
            };
        }
        Some(current)
    }

    /// Return a copy of this object with `name` set to `value`.
    ///
    /// A non-object receiver yields an object holding only `name`.
    pub fn with_attr(&self, name: impl Into<String>, value: Value) -> Value {
        let mut attrs = self.attributes().cloned().unwrap_or_default();
        attrs.insert(name.into(), value);
        Value::object(attrs)
    }

    /// Return a copy of this object without `name`.
    pub fn without_attr(&self, name: &str) -> Value {
        let mut attrs = self.attributes().cloned().unwrap_or_default();
        attrs.remove(name);
        Value::object(attrs)
    }

    /// Semantic equality used for planning.
    ///
    /// Unknown is never equal to anything. Null equals null of the same type.
    /// Known values compare deeply; list order matters, set order does not.
    pub fn equal(&self, other: &Value) -> bool {
        match (&self.state, &other.state) {
            (State::Unknown, _) | (_, State::Unknown) => false,
            (State::Null, State::Null) => self.ty == other.ty,
            (State::Known(a), State::Known(b)) => self.ty == other.ty && known_equal(a, b),
            _ => false,
        }
    }

    /// Preserve `prior` values through unknown placeholders in `proposed`.
    ///
    /// When `keep_known_if_proposed_unknown` is set, every unknown in
    /// `proposed` (at any object depth) whose counterpart in `prior` is not
    /// unknown is replaced with the prior value.
    pub fn merge(prior: &Value, proposed: &Value, keep_known_if_proposed_unknown: bool) -> Value {
        if proposed.is_unknown() {
            if keep_known_if_proposed_unknown && !prior.is_unknown() && prior.ty == proposed.ty {
                return prior.clone();
            }
            return proposed.clone();
        }
        match (prior.attributes(), proposed.attributes()) {
            (Some(prior_attrs), Some(proposed_attrs)) => Value::object(
                proposed_attrs
                    .iter()
                    .map(|(name, value)| {
                        let merged = match prior_attrs.get(name) {
                            Some(p) => Value::merge(p, value, keep_known_if_proposed_unknown),
                            None => value.clone(),
                        };
                        (name.clone(), merged)
                    })
                    .collect::<Vec<_>>(),
            ),
            _ => proposed.clone(),
        }
    }

    /// Depth-first, pre-order traversal yielding `(path, value)` pairs.
    pub fn walk<F>(&self, visitor: &mut F)
    where
        F: FnMut(&AttributePath, &Value),
    {
        self.walk_at(&AttributePath::root(), visitor);
    }

    fn walk_at<F>(&self, path: &AttributePath, visitor: &mut F)
    where
        F: FnMut(&AttributePath, &Value),
    {
        visitor(path, self);
        match &self.state {
            State::Known(Known::List(items)) | State::Known(Known::Set(items)) => {
                for (i, item) in items.iter().enumerate() {
                    item.walk_at(&path.index(i), visitor);
                }
            },
            State::Known(Known::Map(entries)) => {
                for (key, item) in entries {
                    item.walk_at(&path.key(key.clone()), visitor);
                }
            },
            State::Known(Known::Object(attrs)) => {
                for (name, item) in attrs {
                    item.walk_at(&path.attr(name.clone()), visitor);
                }
            },
            _ => {},
        }
    }

    /// Coerce a list to a set of the same element type.
    pub fn to_set(&self) -> Result<Value, ConversionError> {
        self.coerce_collection(|e| ValueType::set(e), Known::Set)
    }

    /// Coerce a set to a list of the same element type.
    pub fn to_list(&self) -> Result<Value, ConversionError> {
        self.coerce_collection(|e| ValueType::list(e), Known::List)
    }

    fn coerce_collection(
        &self,
        make_type: impl Fn(ValueType) -> ValueType,
        make_payload: impl Fn(Vec<Value>) -> Known,
    ) -> Result<Value, ConversionError> {
        let element = match &self.ty {
            ValueType::List(e) | ValueType::Set(e) => (**e).clone(),
            other => {
                return Err(ConversionError {
                    path: AttributePath::root(),
                    message: format!("cannot coerce {other} to a collection"),
                })
            },
        };
        let ty = make_type(element);
        match &self.state {
            State::Null => Ok(Value::null(ty)),
            State::Unknown => Ok(Value::unknown(ty)),
            State::Known(_) => {
                let items = self.elements().unwrap_or_default().to_vec();
                Value::try_known(ty, make_payload(items))
            },
        }
    }

    /// Decode a JSON document as a value of type `ty`.
    ///
    /// JSON `null` becomes a null value; `{"$unknown": true}` becomes unknown.
    /// Object attributes missing from the document decode as null, and
    /// undeclared keys are ignored.
    pub fn from_json(ty: &ValueType, json: &serde_json::Value) -> Result<Value, ConversionError> {
        from_json_at(ty, json, &AttributePath::root())
    }

    /// Encode as JSON for persistence. Null and unknown both become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        self.encode(false)
    }

    /// Encode as JSON for plan output, rendering unknown as `{"$unknown": true}`.
    pub fn to_plan_json(&self) -> serde_json::Value {
        self.encode(true)
    }

    fn encode(&self, mark_unknown: bool) -> serde_json::Value {
        use serde_json::Value as Json;
        match &self.state {
            State::Null => Json::Null,
            State::Unknown if mark_unknown => {
                let mut marker = serde_json::Map::new();
                marker.insert(UNKNOWN_MARKER.to_string(), Json::Bool(true));
                Json::Object(marker)
            },
            State::Unknown => Json::Null,
            State::Known(k) => match k {
                Known::String(s) => Json::String(s.clone()),
                Known::Int64(i) => Json::from(*i),
                Known::Float64(f) => serde_json::Number::from_f64(*f)
                    .map(Json::Number)
                    .unwrap_or(Json::Null),
                Known::Bool(b) => Json::Bool(*b),
                Known::List(items) | Known::Set(items) => {
                    Json::Array(items.iter().map(|v| v.encode(mark_unknown)).collect())
                },
                Known::Map(entries) | Known::Object(entries) => Json::Object(
                    entries
                        .iter()
                        .map(|(k, v)| (k.clone(), v.encode(mark_unknown)))
                        .collect(),
                ),
            },
        }
    }

    fn canonical_key(&self) -> String {
        self.to_plan_json().to_string()
    }
}

const UNKNOWN_MARKER: &str = "$unknown";

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_plan_json().serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Null => write!(f, "null"),
            State::Unknown => write!(f, "(known after apply)"),
            State::Known(k) => match k {
                Known::String(s) => write!(f, "{s:?}"),
                Known::Int64(i) => write!(f, "{i}"),
                Known::Float64(x) => write!(f, "{x}"),
                Known::Bool(b) => write!(f, "{b}"),
                Known::List(items) | Known::Set(items) => {
                    write!(f, "[")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{item}")?;
                    }
                    write!(f, "]")
                },
                Known::Map(entries) | Known::Object(entries) => {
                    write!(f, "{{")?;
                    for (i, (key, item)) in entries.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{key} = {item}")?;
                    }
                    write!(f, "}}")
                },
            },
        }
    }
}

fn check_payload(ty: &ValueType, payload: &Known) -> Result<(), String> {
    match (ty, payload) {
        (ValueType::String, Known::String(_))
        | (ValueType::Int64, Known::Int64(_))
        | (ValueType::Float64, Known::Float64(_))
        | (ValueType::Bool, Known::Bool(_)) => Ok(()),
        (ValueType::List(element), Known::List(items))
        | (ValueType::Set(element), Known::Set(items)) => {
            match items.iter().position(|item| item.ty != **element) {
                Some(i) => Err(format!(
                    "element {i} has type {}, expected {element}",
                    items[i].ty
                )),
                None => Ok(()),
            }
        },
        (ValueType::Map(element), Known::Map(entries)) => {
            match entries.iter().find(|(_, item)| item.ty != **element) {
                Some((key, item)) => Err(format!(
                    "entry {key:?} has type {}, expected {element}",
                    item.ty
                )),
                None => Ok(()),
            }
        },
        (ValueType::Object(types), Known::Object(attrs)) => {
            if types.len() != attrs.len() || types.keys().ne(attrs.keys()) {
                return Err("object attributes do not match the object type".to_string());
            }
            match types
                .iter()
                .find(|(name, attr_ty)| attrs.get(*name).map(|v| &v.ty) != Some(*attr_ty))
            {
                Some((name, attr_ty)) => Err(format!("attribute {name:?} must be {attr_ty}")),
                None => Ok(()),
            }
        },
        (ty, payload) => Err(format!(
            "cannot use a {} payload as {ty}",
            payload.kind_name()
        )),
    }
}

fn canonical_set(items: Vec<Value>) -> Vec<Value> {
    let mut keyed: Vec<(String, Value)> = items
        .into_iter()
        .map(|item| (item.canonical_key(), item))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    keyed.into_iter().map(|(_, item)| item).collect()
}

fn known_equal(a: &Known, b: &Known) -> bool {
    match (a, b) {
        (Known::String(x), Known::String(y)) => x == y,
        (Known::Int64(x), Known::Int64(y)) => x == y,
        (Known::Float64(x), Known::Float64(y)) => x == y,
        (Known::Bool(x), Known::Bool(y)) => x == y,
        (Known::List(x), Known::List(y)) | (Known::Set(x), Known::Set(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| a.equal(b))
        },
        (Known::Map(x), Known::Map(y)) | (Known::Object(x), Known::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .zip(y)
                    .all(|((ka, va), (kb, vb))| ka == kb && va.equal(vb))
        },
        _ => false,
    }
}

fn json_type_name(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn is_unknown_marker(json: &serde_json::Value) -> bool {
    json.as_object().is_some_and(|obj| {
        obj.len() == 1 && obj.get(UNKNOWN_MARKER) == Some(&serde_json::Value::Bool(true))
    })
}

fn from_json_at(
    ty: &ValueType,
    json: &serde_json::Value,
    path: &AttributePath,
) -> Result<Value, ConversionError> {
    use serde_json::Value as Json;

    let mismatch = |expected: &str| ConversionError {
        path: path.clone(),
        message: format!("expected {expected}, got {}", json_type_name(json)),
    };

    if json.is_null() {
        return Ok(Value::null(ty.clone()));
    }
    if is_unknown_marker(json) {
        return Ok(Value::unknown(ty.clone()));
    }

    let payload = match ty {
        ValueType::String => match json {
            Json::String(s) => Known::String(s.clone()),
            _ => return Err(mismatch("string")),
        },
        ValueType::Int64 => match json {
            Json::Number(n) => match n.as_i64() {
                Some(i) => Known::Int64(i),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Known::Int64(f as i64)
                    },
                    _ => return Err(mismatch("int64")),
                },
            },
            _ => return Err(mismatch("int64")),
        },
        ValueType::Float64 => match json.as_f64() {
            Some(f) => Known::Float64(f),
            None => return Err(mismatch("float64")),
        },
        ValueType::Bool => match json {
            Json::Bool(b) => Known::Bool(*b),
            _ => return Err(mismatch("bool")),
        },
        ValueType::List(element) | ValueType::Set(element) => {
            let arr = json.as_array().ok_or_else(|| mismatch("array"))?;
            let items = arr
                .iter()
                .enumerate()
                .map(|(i, item)| from_json_at(element, item, &path.index(i)))
                .collect::<Result<Vec<_>, _>>()?;
            if matches!(ty, ValueType::Set(_)) {
                Known::Set(items)
            } else {
                Known::List(items)
            }
        },
        ValueType::Map(element) => {
            let obj = json.as_object().ok_or_else(|| mismatch("object"))?;
            let entries = obj
                .iter()
                .map(|(key, item)| {
                    from_json_at(element, item, &path.key(key.clone())).map(|v| (key.clone(), v))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Known::Map(entries)
        },
        ValueType::Object(types) => {
            let obj = json.as_object().ok_or_else(|| mismatch("object"))?;
            let attrs = types
                .iter()
                .map(|(name, attr_ty)| {
                    let attr_path = path.attr(name.clone());
                    let value = match obj.get(name) {
                        Some(item) => from_json_at(attr_ty, item, &attr_path)?,
                        None => Value::null(attr_ty.clone()),
                    };
                    Ok((name.clone(), value))
                })
                .collect::<Result<BTreeMap<_, _>, ConversionError>>()?;
            Known::Object(attrs)
        },
    };

    Value::try_known(ty.clone(), payload).map_err(|mut err| {
        err.path = path.clone();
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_type() -> ValueType {
        ValueType::object([
            ("label", ValueType::String),
            ("cluster_size", ValueType::Int64),
            ("allow_list", ValueType::set(ValueType::String)),
        ])
    }

    #[test]
    fn test_equal_semantics() {
        assert!(Value::string("a").equal(&Value::string("a")));
        assert!(!Value::string("a").equal(&Value::string("b")));
        assert!(Value::null(ValueType::String).equal(&Value::null(ValueType::String)));
        assert!(!Value::null(ValueType::String).equal(&Value::null(ValueType::Int64)));
        assert!(!Value::null(ValueType::String).equal(&Value::string("")));

        let unknown = Value::unknown(ValueType::String);
        assert!(!unknown.equal(&unknown));
        assert!(!unknown.equal(&Value::string("a")));
        // Structural equality still holds for bookkeeping.
        assert_eq!(unknown, Value::unknown(ValueType::String));
    }

    #[test]
    fn test_list_order_significant_set_order_not() {
        let l1 = Value::list(ValueType::Int64, vec![Value::int64(1), Value::int64(2)]);
        let l2 = Value::list(ValueType::Int64, vec![Value::int64(2), Value::int64(1)]);
        assert!(!l1.equal(&l2));

        let s1 = Value::set(ValueType::Int64, vec![Value::int64(1), Value::int64(2)]);
        let s2 = Value::set(
            ValueType::Int64,
            vec![Value::int64(2), Value::int64(1), Value::int64(2)],
        );
        assert!(s1.equal(&s2));
        assert_eq!(s2.elements().map(|e| e.len()), Some(2));
    }

    #[test]
    #[should_panic(expected = "invalid value construction")]
    fn test_type_mismatch_panics() {
        let _ = Value::list(ValueType::String, vec![Value::int64(1)]);
    }

    #[test]
    fn test_try_known_reports_mismatch() {
        let err = Value::try_known(ValueType::Bool, Known::String("yes".into())).unwrap_err();
        assert!(err.message.contains("string payload"));
    }

    #[test]
    fn test_list_set_coercion() {
        let list = Value::list(
            ValueType::String,
            vec![Value::string("b"), Value::string("a"), Value::string("b")],
        );
        let set = list.to_set().unwrap();
        assert_eq!(set.ty(), &ValueType::set(ValueType::String));
        assert_eq!(set.elements().unwrap().len(), 2);

        let back = set.to_list().unwrap();
        assert_eq!(back.ty(), &ValueType::list(ValueType::String));
        assert!(Value::string("x").to_set().is_err());
    }

    #[test]
    fn test_merge_keeps_prior_through_unknown() {
        let prior = Value::object([
            ("host", Value::string("db.example")),
            ("port", Value::int64(5432)),
        ]);
        let proposed = Value::object([
            ("host", Value::unknown(ValueType::String)),
            ("port", Value::int64(5433)),
        ]);

        let merged = Value::merge(&prior, &proposed, true);
        assert_eq!(merged.attr("host"), Some(&Value::string("db.example")));
        assert_eq!(merged.attr("port"), Some(&Value::int64(5433)));

        let untouched = Value::merge(&prior, &proposed, false);
        assert!(untouched.attr("host").unwrap().is_unknown());
    }

    #[test]
    fn test_walk_yields_paths_depth_first() {
        let value = Value::object([
            ("label", Value::string("db")),
            (
                "updates",
                Value::list(
                    ValueType::object([("hour", ValueType::Int64)]),
                    vec![Value::object([("hour", Value::int64(3))])],
                ),
            ),
        ]);

        let mut paths = Vec::new();
        value.walk(&mut |path: &AttributePath, _: &Value| paths.push(path.to_string()));
        assert_eq!(paths, vec!["", "label", "updates", "updates.0", "updates.0.hour"]);
    }

    #[test]
    fn test_at_and_with_attr() {
        let value = Value::object([("label", Value::string("db"))]);
        let updated = value.with_attr("port", Value::int64(5432));

        assert_eq!(value.attr("port"), None);
        assert_eq!(
            updated.at(&AttributePath::parse("port")),
            Some(&Value::int64(5432))
        );
        assert_eq!(
            updated.ty(),
            &ValueType::object([("label", ValueType::String), ("port", ValueType::Int64)])
        );
    }

    #[test]
    fn test_from_json_object() {
        let value = Value::from_json(
            &db_type(),
            &json!({"label": "db", "cluster_size": 3, "allow_list": ["10.0.0.1", "10.0.0.0"], "extra": 1}),
        )
        .unwrap();

        assert_eq!(value.attr("label"), Some(&Value::string("db")));
        assert_eq!(value.attr("cluster_size"), Some(&Value::int64(3)));
        assert_eq!(
            value.attr("allow_list").unwrap().elements().unwrap()[0],
            Value::string("10.0.0.0")
        );

        let sparse = Value::from_json(&db_type(), &json!({"label": "db"})).unwrap();
        assert!(sparse.attr("cluster_size").unwrap().is_null());
    }

    #[test]
    fn test_from_json_type_error_has_path() {
        let err = Value::from_json(&db_type(), &json!({"cluster_size": "three"})).unwrap_err();
        assert_eq!(err.path.to_string(), "cluster_size");
        assert_eq!(err.to_string(), "cluster_size: expected int64, got string");
    }

    #[test]
    fn test_json_encoding_of_unknown() {
        let value = Value::object([
            ("label", Value::string("db")),
            ("host", Value::unknown(ValueType::String)),
        ]);
        assert_eq!(value.to_json(), json!({"label": "db", "host": null}));
        assert_eq!(
            value.to_plan_json(),
            json!({"label": "db", "host": {"$unknown": true}})
        );

        let decoded = Value::from_json(value.ty(), &value.to_plan_json()).unwrap();
        assert!(decoded.attr("host").unwrap().is_unknown());
    }

    #[test]
    fn test_display() {
        let value = Value::object([
            ("label", Value::string("db")),
            ("port", Value::unknown(ValueType::Int64)),
        ]);
        assert_eq!(
            value.to_string(),
            "{label = \"db\", port = (known after apply)}"
        );
    }
}
