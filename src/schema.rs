//! Schema types for describing resource and data source structure.
//!
//! A [`Schema`] is the single source of truth for a resource kind: planning,
//! validation and state (de)serialization all consult it. Schemas are
//! registered in a [`SchemaRegistry`], which checks them for internal
//! consistency and exposes lookups by kind and attribute path.

use crate::error::ProviderError;
use crate::planmodifier::PlanModifier;
use crate::validators::{self, Validator};
use crate::value::{AttributePath, PathStep, Value, ValueType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Name of the reserved per-instance timeouts block.
pub const TIMEOUTS_BLOCK: &str = "timeouts";

/// Timeout applied when neither the instance nor the schema sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// The attribute is required in configuration.
    pub required: bool,
    /// The attribute is optional in configuration.
    pub optional: bool,
    /// The attribute is computed by the provider.
    pub computed: bool,
    /// The attribute is sensitive and should be hidden in logs and plan output.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Create flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Create flags for a computed attribute (read-only, set by provider).
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional+computed attribute.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    /// Mark the attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Computed and never settable from configuration.
    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }
}

/// Describes a single attribute in a schema.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// The type of the attribute.
    pub value_type: ValueType,
    /// Flags describing how the attribute can be used.
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    pub description: Option<String>,
    /// Changing this attribute forces resource replacement.
    pub requires_replace: bool,
    /// Value substituted when configuration leaves the attribute null.
    pub default: Option<Value>,
    /// Validators, in declared order.
    pub validators: Vec<Arc<dyn Validator>>,
    /// Plan modifiers, applied left to right.
    pub plan_modifiers: Vec<Arc<dyn PlanModifier>>,
    /// Sibling attributes that must be null when this one is set.
    pub conflicts_with: Vec<String>,
    /// Sibling attributes of which exactly one (including this) must be set.
    pub exactly_one_of: Vec<String>,
    /// Sibling attributes that must be set when this one is set.
    pub also_requires: Vec<String>,
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(value_type: ValueType, flags: AttributeFlags) -> Self {
        Self {
            value_type,
            flags,
            description: None,
            requires_replace: false,
            default: None,
            validators: Vec::new(),
            plan_modifiers: Vec::new(),
            conflicts_with: Vec::new(),
            exactly_one_of: Vec::new(),
            also_requires: Vec::new(),
        }
    }

    /// Create a required attribute of any type.
    pub fn required(value_type: ValueType) -> Self {
        Self::new(value_type, AttributeFlags::required())
    }

    /// Create an optional attribute of any type.
    pub fn optional(value_type: ValueType) -> Self {
        Self::new(value_type, AttributeFlags::optional())
    }

    /// Create a computed attribute of any type.
    pub fn computed(value_type: ValueType) -> Self {
        Self::new(value_type, AttributeFlags::computed())
    }

    /// Create an optional+computed attribute of any type.
    pub fn optional_computed(value_type: ValueType) -> Self {
        Self::new(value_type, AttributeFlags::optional_computed())
    }

    /// Create a required string attribute.
    pub fn required_string() -> Self {
        Self::required(ValueType::String)
    }

    /// Create an optional string attribute.
    pub fn optional_string() -> Self {
        Self::optional(ValueType::String)
    }

    /// Create a computed string attribute.
    pub fn computed_string() -> Self {
        Self::computed(ValueType::String)
    }

    /// Create a required int64 attribute.
    pub fn required_int64() -> Self {
        Self::required(ValueType::Int64)
    }

    /// Create an optional int64 attribute.
    pub fn optional_int64() -> Self {
        Self::optional(ValueType::Int64)
    }

    /// Create a computed int64 attribute.
    pub fn computed_int64() -> Self {
        Self::computed(ValueType::Int64)
    }

    /// Create an optional bool attribute.
    pub fn optional_bool() -> Self {
        Self::optional(ValueType::Bool)
    }

    /// Create a computed bool attribute.
    pub fn computed_bool() -> Self {
        Self::computed(ValueType::Bool)
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this attribute as forcing resource replacement when changed.
    pub fn with_requires_replace(mut self) -> Self {
        self.requires_replace = true;
        self
    }

    /// Set a default value for this attribute.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }

    /// Append a validator.
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Append a plan modifier to the end of the chain.
    pub fn with_plan_modifier(mut self, modifier: impl PlanModifier + 'static) -> Self {
        self.plan_modifiers.push(Arc::new(modifier));
        self
    }

    /// Declare sibling attributes that conflict with this one.
    pub fn conflicts_with(mut self, names: &[&str]) -> Self {
        self.conflicts_with = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declare a group of siblings of which exactly one must be set.
    pub fn exactly_one_of(mut self, names: &[&str]) -> Self {
        self.exactly_one_of = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declare sibling attributes required alongside this one.
    pub fn also_requires(mut self, names: &[&str]) -> Self {
        self.also_requires = names.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// The nesting mode for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockNestingMode {
    /// A single nested block (at most one).
    #[default]
    Single,
    /// A list of nested blocks (zero or more, ordered).
    List,
    /// A set of nested blocks (zero or more, unordered, unique).
    Set,
}

/// A block of attributes and nested blocks.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// The attributes within this block, in declared order.
    pub attributes: IndexMap<String, Attribute>,
    /// Nested blocks within this block, in declared order.
    pub blocks: IndexMap<String, NestedBlock>,
    /// Human-readable description of the block.
    pub description: Option<String>,
}

impl Block {
    /// Create a new empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute to this block.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Add a nested block to this block.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.blocks.insert(name.into(), block);
        self
    }

    /// Set the description for this block.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The object type of a value conforming to this block.
    pub fn value_type(&self) -> ValueType {
        let attrs = self
            .attributes
            .iter()
            .map(|(name, attr)| (name.clone(), attr.value_type.clone()));
        let blocks = self
            .blocks
            .iter()
            .map(|(name, nested)| (name.clone(), nested.value_type()));
        ValueType::object(attrs.chain(blocks))
    }
}

/// A nested block with its nesting mode and constraints.
#[derive(Debug, Clone)]
pub struct NestedBlock {
    /// The block definition.
    pub block: Block,
    /// How the block is nested.
    pub nesting_mode: BlockNestingMode,
    /// Minimum number of blocks required.
    pub min_items: u32,
    /// Maximum number of blocks allowed (0 = unlimited).
    pub max_items: u32,
    /// The remote fills the block in when configuration leaves it unset.
    pub computed: bool,
}

impl NestedBlock {
    /// Create a single nested block (0 or 1 allowed).
    pub fn single(block: Block) -> Self {
        Self {
            block,
            nesting_mode: BlockNestingMode::Single,
            min_items: 0,
            max_items: 1,
            computed: false,
        }
    }

    /// Create a list of nested blocks.
    pub fn list(block: Block) -> Self {
        Self {
            block,
            nesting_mode: BlockNestingMode::List,
            min_items: 0,
            max_items: 0,
            computed: false,
        }
    }

    /// Create a set of nested blocks.
    pub fn set(block: Block) -> Self {
        Self {
            block,
            nesting_mode: BlockNestingMode::Set,
            min_items: 0,
            max_items: 0,
            computed: false,
        }
    }

    /// Set the minimum number of blocks required.
    pub fn with_min_items(mut self, min: u32) -> Self {
        self.min_items = min;
        self
    }

    /// Set the maximum number of blocks allowed.
    pub fn with_max_items(mut self, max: u32) -> Self {
        self.max_items = max;
        self
    }

    /// Keep the remote's value when configuration leaves the block unset.
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// The value type of this block: an object, or a list/set of objects.
    pub fn value_type(&self) -> ValueType {
        let object = self.block.value_type();
        match self.nesting_mode {
            BlockNestingMode::Single => object,
            BlockNestingMode::List => ValueType::list(object),
            BlockNestingMode::Set => ValueType::set(object),
        }
    }
}

/// The operation a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Create plus its await.
    Create,
    /// Refresh.
    Read,
    /// Update plus its await.
    Update,
    /// Delete plus its await.
    Delete,
}

impl TimeoutKind {
    /// The key used in the `timeouts` block.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Default timeouts declared by a resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    /// Default create timeout.
    pub create: Option<Duration>,
    /// Default read timeout.
    pub read: Option<Duration>,
    /// Default update timeout.
    pub update: Option<Duration>,
    /// Default delete timeout.
    pub delete: Option<Duration>,
}

impl Timeouts {
    /// The default for `kind`, if declared.
    pub fn get(&self, kind: TimeoutKind) -> Option<Duration> {
        match kind {
            TimeoutKind::Create => self.create,
            TimeoutKind::Read => self.read,
            TimeoutKind::Update => self.update,
            TimeoutKind::Delete => self.delete,
        }
    }
}

/// Schema for a resource or data source.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// The version of this schema (for state upgrades).
    pub version: u64,
    /// The root block containing all attributes and nested blocks.
    pub block: Block,
    /// Timeout defaults, when the kind supports a `timeouts` block.
    pub timeouts: Option<Timeouts>,
}

impl Schema {
    /// Create a new schema with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            block: Block::new(),
            timeouts: None,
        }
    }

    /// Create a schema at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Add an attribute to the schema.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.block.attributes.insert(name.into(), attr);
        self
    }

    /// Add a nested block to the schema.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.block.blocks.insert(name.into(), block);
        self
    }

    /// Declare timeout defaults and add the reserved `timeouts` block.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        let mut block = Block::new();
        for kind in [
            TimeoutKind::Create,
            TimeoutKind::Read,
            TimeoutKind::Update,
            TimeoutKind::Delete,
        ] {
            block = block.with_attribute(
                kind.as_str(),
                Attribute::optional_string().with_validator(validators::duration()),
            );
        }
        self.block
            .blocks
            .insert(TIMEOUTS_BLOCK.to_string(), NestedBlock::single(block));
        self.timeouts = Some(timeouts);
        self
    }

    /// The object type of an instance of this schema.
    pub fn value_type(&self) -> ValueType {
        self.block.value_type()
    }

    /// Resolve the timeout for `kind` from an instance's `timeouts` block,
    /// falling back to the schema default and then [`DEFAULT_TIMEOUT`].
    pub fn timeout(&self, kind: TimeoutKind, instance: &Value) -> Duration {
        instance
            .attr(TIMEOUTS_BLOCK)
            .and_then(|block| block.attr(kind.as_str()))
            .and_then(|v| v.as_str())
            .and_then(|s| humantime::parse_duration(s).ok())
            .or_else(|| self.timeouts.and_then(|t| t.get(kind)))
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Look up the attribute at `path`. Index and key steps are skipped.
    pub fn attribute_at(&self, path: &AttributePath) -> Option<&Attribute> {
        let mut block = &self.block;
        let mut steps = path
            .steps()
            .iter()
            .filter_map(|step| match step {
                PathStep::Attribute(name) => Some(name.as_str()),
                _ => None,
            })
            .peekable();
        while let Some(name) = steps.next() {
            if steps.peek().is_none() {
                return block.attributes.get(name);
            }
            block = &block.blocks.get(name)?.block;
        }
        None
    }

    /// Returns `true` if the value at `path` is sensitive.
    pub fn is_sensitive(&self, path: &AttributePath) -> bool {
        self.attribute_at(path).is_some_and(|a| a.flags.sensitive)
    }
}

/// Registry of resource and data source schemas, keyed by kind.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    resources: IndexMap<String, Arc<Schema>>,
    data_sources: IndexMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource schema after checking its consistency.
    pub fn register_resource(
        &mut self,
        kind: impl Into<String>,
        schema: Schema,
    ) -> Result<(), ProviderError> {
        let kind = kind.into();
        check_schema(&kind, &schema)?;
        self.resources.insert(kind, Arc::new(schema));
        Ok(())
    }

    /// Register a data source schema after checking its consistency.
    pub fn register_data_source(
        &mut self,
        kind: impl Into<String>,
        schema: Schema,
    ) -> Result<(), ProviderError> {
        let kind = kind.into();
        check_schema(&kind, &schema)?;
        self.data_sources.insert(kind, Arc::new(schema));
        Ok(())
    }

    /// The schema for a resource kind.
    pub fn resource(&self, kind: &str) -> Result<Arc<Schema>, ProviderError> {
        self.resources
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(kind.to_string()))
    }

    /// The schema for a data source kind.
    pub fn data_source(&self, kind: &str) -> Result<Arc<Schema>, ProviderError> {
        self.data_sources
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(format!("data.{kind}")))
    }

    /// Registered resource kinds, in registration order.
    pub fn resource_kinds(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Look up an attribute of a resource kind by path.
    pub fn attribute(&self, kind: &str, path: &AttributePath) -> Option<&Attribute> {
        self.resources.get(kind)?.attribute_at(path)
    }

    /// Every validator of a resource kind with its attribute path, in
    /// declared order (attributes before nested blocks, depth first).
    pub fn validators(
        &self,
        kind: &str,
    ) -> Result<Vec<(AttributePath, Arc<dyn Validator>)>, ProviderError> {
        let schema = self.resource(kind)?;
        let mut out = Vec::new();
        visit_attributes(&schema.block, &AttributePath::root(), &mut |path, attr| {
            out.extend(attr.validators.iter().map(|v| (path.clone(), v.clone())));
        });
        Ok(out)
    }

    /// Every plan modifier of a resource kind with its attribute path, in
    /// declared order.
    pub fn plan_modifiers(
        &self,
        kind: &str,
    ) -> Result<Vec<(AttributePath, Arc<dyn PlanModifier>)>, ProviderError> {
        let schema = self.resource(kind)?;
        let mut out = Vec::new();
        visit_attributes(&schema.block, &AttributePath::root(), &mut |path, attr| {
            out.extend(attr.plan_modifiers.iter().map(|m| (path.clone(), m.clone())));
        });
        Ok(out)
    }
}

fn visit_attributes<F>(block: &Block, path: &AttributePath, visit: &mut F)
where
    F: FnMut(&AttributePath, &Attribute),
{
    for (name, attr) in &block.attributes {
        visit(&path.attr(name.clone()), attr);
    }
    for (name, nested) in &block.blocks {
        visit_attributes(&nested.block, &path.attr(name.clone()), visit);
    }
}

fn check_schema(kind: &str, schema: &Schema) -> Result<(), ProviderError> {
    let mut problems = Vec::new();
    check_block(&schema.block, &AttributePath::root(), &mut problems);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::Config(format!(
            "inconsistent schema for {kind}: {}",
            problems.join("; ")
        )))
    }
}

fn check_block(block: &Block, path: &AttributePath, problems: &mut Vec<String>) {
    for (name, attr) in &block.attributes {
        let attr_path = path.attr(name.clone());
        let flags = attr.flags;
        if !(flags.required || flags.optional || flags.computed) {
            problems.push(format!(
                "{attr_path} must be required, optional, or computed"
            ));
        }
        if flags.required && (flags.optional || flags.computed) {
            problems.push(format!(
                "{attr_path} cannot be required and optional/computed"
            ));
        }
        if let Some(default) = &attr.default {
            if !flags.optional {
                problems.push(format!("{attr_path} has a default but is not optional"));
            }
            if default.ty() != &attr.value_type {
                problems.push(format!(
                    "{attr_path} default has type {}, expected {}",
                    default.ty(),
                    attr.value_type
                ));
            }
        }
        if flags.is_computed_only() && attr.requires_replace {
            problems.push(format!("{attr_path} is computed-only and requires replace"));
        }
        for sibling in attr
            .conflicts_with
            .iter()
            .chain(&attr.exactly_one_of)
            .chain(&attr.also_requires)
        {
            if sibling != name && !block.attributes.contains_key(sibling) {
                problems.push(format!("{attr_path} references unknown sibling {sibling}"));
            }
        }
        for validator in &attr.validators {
            if let Err(err) = validator.check() {
                problems.push(format!("{attr_path}: {err}"));
            }
        }
    }
    for (name, nested) in &block.blocks {
        let block_path = path.attr(name.clone());
        if block.attributes.contains_key(name) {
            problems.push(format!("{block_path} is both an attribute and a block"));
        }
        if nested.max_items > 0 && nested.min_items > nested.max_items {
            problems.push(format!("{block_path} has min_items > max_items"));
        }
        check_block(&nested.block, &block_path, problems);
    }
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// An error that prevents the operation from completing.
    Error,
    /// A warning that doesn't prevent the operation but should be addressed.
    Warning,
}

/// A diagnostic message produced while planning or applying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Set the attribute path unless it is the root.
    pub fn with_path(self, path: &AttributePath) -> Self {
        if path.is_root() {
            self
        } else {
            self.with_attribute(path.to_string())
        }
    }

    /// Returns `true` for error-severity diagnostics.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            DiagnosticSeverity::Error => "Error",
            DiagnosticSeverity::Warning => "Warning",
        };
        write!(f, "{level}: {}", self.summary)?;
        if let Some(attribute) = &self.attribute {
            write!(f, " (at {attribute})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Returns `true` if any diagnostic is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planmodifier::use_state_for_unknown;

    #[test]
    fn test_attribute_flags() {
        let required = AttributeFlags::required();
        assert!(required.required);
        assert!(!required.optional);
        assert!(!required.computed);

        let computed = AttributeFlags::computed();
        assert!(computed.is_computed_only());

        let optional_computed = AttributeFlags::optional_computed();
        assert!(optional_computed.optional);
        assert!(optional_computed.computed);
        assert!(!optional_computed.is_computed_only());

        assert!(AttributeFlags::required().sensitive().sensitive);
    }

    #[test]
    fn test_attribute_builders() {
        let attr = Attribute::required_string()
            .with_description("The region to deploy in")
            .with_requires_replace()
            .with_validator(validators::string_len(1, 32))
            .with_plan_modifier(use_state_for_unknown());

        assert_eq!(attr.value_type, ValueType::String);
        assert!(attr.flags.required);
        assert!(attr.requires_replace);
        assert_eq!(attr.validators.len(), 1);
        assert_eq!(attr.plan_modifiers.len(), 1);
    }

    #[test]
    fn test_block_value_type_includes_nested_blocks() {
        let schema = Schema::v0()
            .with_attribute("label", Attribute::required_string())
            .with_block(
                "updates",
                NestedBlock::list(Block::new().with_attribute("hour", Attribute::optional_int64())),
            );

        assert_eq!(
            schema.value_type(),
            ValueType::object([
                ("label", ValueType::String),
                (
                    "updates",
                    ValueType::list(ValueType::object([("hour", ValueType::Int64)]))
                ),
            ])
        );
    }

    #[test]
    fn test_attributes_keep_declared_order() {
        let schema = Schema::v0()
            .with_attribute("zeta", Attribute::optional_string())
            .with_attribute("alpha", Attribute::optional_string());
        let names: Vec<_> = schema.block.attributes.keys().cloned().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_timeouts_resolution() {
        let schema = Schema::v0().with_timeouts(Timeouts {
            create: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        assert!(schema.block.blocks.contains_key(TIMEOUTS_BLOCK));

        let instance = Value::object([(
            TIMEOUTS_BLOCK,
            Value::object([
                ("create", Value::null(ValueType::String)),
                ("read", Value::null(ValueType::String)),
                ("update", Value::string("10m")),
                ("delete", Value::null(ValueType::String)),
            ]),
        )]);

        assert_eq!(
            schema.timeout(TimeoutKind::Create, &instance),
            Duration::from_secs(3600)
        );
        assert_eq!(
            schema.timeout(TimeoutKind::Update, &instance),
            Duration::from_secs(600)
        );
        assert_eq!(schema.timeout(TimeoutKind::Delete, &instance), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_attribute_at() {
        let schema = Schema::v0()
            .with_attribute("label", Attribute::required_string())
            .with_block(
                "updates",
                NestedBlock::list(
                    Block::new().with_attribute("hour", Attribute::optional_int64().sensitive()),
                ),
            );

        assert!(schema.attribute_at(&AttributePath::parse("label")).is_some());
        assert!(schema
            .attribute_at(&AttributePath::parse("updates.0.hour"))
            .is_some());
        assert!(schema.is_sensitive(&AttributePath::parse("updates.0.hour")));
        assert!(schema.attribute_at(&AttributePath::parse("updates")).is_none());
        assert!(schema.attribute_at(&AttributePath::parse("missing")).is_none());
    }

    #[test]
    fn test_registry_lookup_and_enumeration_order() {
        let mut registry = SchemaRegistry::new();
        registry
            .register_resource(
                "linode_thing",
                Schema::v0()
                    .with_attribute(
                        "b",
                        Attribute::optional_string().with_validator(validators::string_len(1, 3)),
                    )
                    .with_attribute(
                        "a",
                        Attribute::optional_int64().with_validator(validators::int_between(0, 9)),
                    ),
            )
            .unwrap();

        let paths: Vec<_> = registry
            .validators("linode_thing")
            .unwrap()
            .into_iter()
            .map(|(p, _)| p.to_string())
            .collect();
        assert_eq!(paths, vec!["b", "a"]);

        assert!(registry
            .attribute("linode_thing", &AttributePath::parse("a"))
            .is_some());
        assert!(matches!(
            registry.resource("linode_other"),
            Err(ProviderError::UnknownResource(_))
        ));
    }

    #[test]
    fn test_registry_rejects_inconsistent_schema() {
        let mut registry = SchemaRegistry::new();
        let err = registry
            .register_resource(
                "linode_bad",
                Schema::v0()
                    .with_attribute(
                        "size",
                        Attribute::required_int64().with_default(Value::int64(1)),
                    )
                    .with_attribute(
                        "label",
                        Attribute::optional_string().conflicts_with(&["nope"]),
                    ),
            )
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("size has a default but is not optional"));
        assert!(msg.contains("label references unknown sibling nope"));
    }

    #[test]
    fn test_diagnostic() {
        let err = Diagnostic::error("Invalid configuration")
            .with_detail("The value must be positive")
            .with_path(&AttributePath::parse("cluster_size"));

        assert_eq!(err.severity, DiagnosticSeverity::Error);
        assert_eq!(err.attribute, Some("cluster_size".to_string()));
        assert_eq!(
            err.to_string(),
            "Error: Invalid configuration (at cluster_size): The value must be positive"
        );
        assert!(has_errors(&[Diagnostic::warning("w"), err]));
        assert!(!has_errors(&[Diagnostic::warning("w")]));
    }
}
