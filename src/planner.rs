//! Diff and planning.
//!
//! [`plan_resource`] turns one resource's configuration and refreshed state
//! into a [`PlanEntry`]: it proposes a planned object, runs the schema's plan
//! modifiers, detects replacement, and records the attribute diff.
//! [`Planner`] walks a whole configuration in dependency order, resolving
//! references against the values planned so far.

use crate::config::{Configuration, Reference, ResourceConfig};
use crate::decode::decode_config;
use crate::graph::DependencyGraph;
use crate::planmodifier::{apply_chain, PlanModifierRequest};
use crate::provider::{Provider, ProviderContext};
use crate::schema::{Block, BlockNestingMode, Diagnostic, Schema, TIMEOUTS_BLOCK};
use crate::state::{ResourceState, StateDocument};
use crate::types::{Action, Address, AttributeDiff, Plan, PlanEntry};
use crate::validation::{validate, Phase};
use crate::value::{AttributePath, PathStep, Value, ValueType};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Input to [`plan_resource`].
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    /// The resource being planned.
    pub address: &'a Address,
    /// Its schema.
    pub schema: &'a Schema,
    /// The decoded configuration, or `None` if the resource is no longer
    /// declared.
    pub config: Option<&'a Value>,
    /// The prior state, if the resource was ever created.
    pub prior: Option<&'a Value>,
    /// The state after refresh. `None` with a prior state means the remote
    /// object disappeared.
    pub refreshed: Option<&'a Value>,
    /// The prior instance is tainted and must be replaced.
    pub tainted: bool,
}

/// Plan a single resource.
pub fn plan_resource(req: &PlanRequest<'_>) -> (PlanEntry, Vec<Diagnostic>) {
    let schema = req.schema;
    let null_object = Value::null(schema.value_type());

    let Some(config) = req.config else {
        let entry = match req.refreshed.or(req.prior) {
            Some(prior) => delete_entry(req.address, schema, prior),
            None => PlanEntry {
                address: req.address.clone(),
                action: Action::NoOp,
                prior: None,
                planned: null_object,
                diff: Vec::new(),
                replace_triggers: Vec::new(),
                dependencies: Vec::new(),
            },
        };
        return (entry, Vec::new());
    };

    let mut diagnostics = validate(schema, config, Phase::Config);

    let state = match (req.prior, req.refreshed) {
        (Some(_), Some(refreshed)) if !refreshed.is_null() => Some(refreshed),
        _ => None,
    };

    let Some(state) = state else {
        let (planned, diags) = propose(schema, config, None);
        diagnostics.extend(diags);
        let diff = diff_objects(schema, &null_object, &planned, &[], true);
        let entry = PlanEntry {
            address: req.address.clone(),
            action: Action::Create,
            prior: None,
            planned,
            diff,
            replace_triggers: Vec::new(),
            dependencies: Vec::new(),
        };
        return (entry, diagnostics);
    };

    let (planned, diags) = propose(schema, config, Some(state));
    diagnostics.extend(diags);

    let mut triggers = Vec::new();
    replace_triggers(&schema.block, state, &planned, &AttributePath::root(), &mut triggers);
    triggers.sort();

    let (action, planned) = if req.tainted || !triggers.is_empty() {
        let (fresh, diags) = propose(schema, config, None);
        diagnostics.extend(diags);
        (Action::Replace, fresh)
    } else {
        (Action::Update, planned)
    };

    let diff = diff_objects(schema, state, &planned, &triggers, false);
    let (action, planned) = if action == Action::Update && diff.is_empty() {
        (Action::NoOp, state.clone())
    } else {
        (action, planned)
    };

    debug!(address = %req.address, %action, changes = diff.len(), "Planned resource");
    let entry = PlanEntry {
        address: req.address.clone(),
        action,
        prior: Some(state.clone()),
        planned,
        diff,
        replace_triggers: triggers,
        dependencies: Vec::new(),
    };
    (entry, diagnostics)
}

fn delete_entry(address: &Address, schema: &Schema, prior: &Value) -> PlanEntry {
    let planned = Value::null(schema.value_type());
    let diff = schema
        .block
        .attributes
        .keys()
        .chain(schema.block.blocks.keys())
        .filter_map(|name| {
            let from = prior.attr_or_null(name);
            if from.is_null() {
                return None;
            }
            let path = AttributePath::root().attr(name.clone());
            Some(AttributeDiff {
                to: Value::null(from.ty().clone()),
                sensitive: schema.is_sensitive(&path),
                from,
                path,
                requires_replace: false,
            })
        })
        .collect();
    PlanEntry {
        address: address.clone(),
        action: Action::Delete,
        prior: Some(prior.clone()),
        planned,
        diff,
        replace_triggers: Vec::new(),
        dependencies: Vec::new(),
    }
}

/// Build the planned object for `config` against `state` (`None` when
/// creating), then run plan modifiers.
fn propose(schema: &Schema, config: &Value, state: Option<&Value>) -> (Value, Vec<Diagnostic>) {
    let creating = state.is_none();
    let null_state = Value::null(schema.value_type());
    let state = state.unwrap_or(&null_state);

    let mut planned = propose_block(&schema.block, config, state, creating);
    if !creating && configured_change(&schema.block, &planned, state) {
        planned = mark_computed_unknown(&schema.block, &planned, config);
    }

    let mut diagnostics = Vec::new();
    run_modifiers(
        &schema.block,
        &AttributePath::root(),
        config,
        state,
        &mut planned,
        creating,
        &mut diagnostics,
    );
    (planned, diagnostics)
}

fn propose_block(block: &Block, config: &Value, state: &Value, creating: bool) -> Value {
    let mut attrs = BTreeMap::new();
    for (name, attr) in &block.attributes {
        let ty = attr.value_type.clone();
        let configured = config.attr_or_null(name);
        let value = if attr.flags.is_computed_only() {
            if creating { Value::unknown(ty) } else { state.attr_or_null(name) }
        } else if !configured.is_null() {
            configured
        } else if let Some(default) = &attr.default {
            default.clone()
        } else if attr.flags.computed {
            if creating { Value::unknown(ty) } else { state.attr_or_null(name) }
        } else {
            Value::null(ty)
        };
        attrs.insert(name.clone(), value);
    }

    for (name, nested) in &block.blocks {
        let configured = config.attr_or_null(name);
        let prior = state.attr_or_null(name);
        let value = match (nested.nesting_mode, configured.elements()) {
            _ if nested.computed && configured.is_null() => {
                if creating || prior.is_null() {
                    Value::unknown(nested.value_type())
                } else {
                    prior
                }
            },
            (BlockNestingMode::Single, _) if configured.is_known() => {
                propose_block(&nested.block, &configured, &prior, creating || prior.is_null())
            },
            (BlockNestingMode::List, Some(items)) => {
                let items = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| match prior.elements().and_then(|p| p.get(i)) {
                        Some(p) => propose_block(&nested.block, item, p, creating),
                        None => propose_block(&nested.block, item, &Value::null(nested.block.value_type()), true),
                    })
                    .collect();
                Value::list(nested.block.value_type(), items)
            },
            (BlockNestingMode::Set, Some(items)) => {
                let items = items
                    .iter()
                    .map(|item| {
                        let matched = prior
                            .elements()
                            .and_then(|p| p.iter().find(|p| same_configured(&nested.block, item, p)));
                        match matched {
                            Some(p) => propose_block(&nested.block, item, p, creating),
                            None => propose_block(&nested.block, item, &Value::null(nested.block.value_type()), true),
                        }
                    })
                    .collect();
                Value::set(nested.block.value_type(), items)
            },
            _ => configured,
        };
        attrs.insert(name.clone(), value);
    }
    Value::object(attrs)
}

/// Two set elements describe the same block if every configurable attribute
/// matches.
fn same_configured(block: &Block, a: &Value, b: &Value) -> bool {
    block
        .attributes
        .iter()
        .filter(|(_, attr)| !attr.flags.computed)
        .all(|(name, _)| a.attr_or_null(name).equal(&b.attr_or_null(name)))
}

/// Null out computed-only attributes so two objects can be compared on what
/// configuration controls.
fn configurable_part(block: &Block, value: &Value) -> Value {
    if !value.is_known() {
        return value.clone();
    }
    let mut out = value.clone();
    for (name, attr) in &block.attributes {
        if attr.flags.is_computed_only() {
            out = out.with_attr(name.clone(), Value::null(attr.value_type.clone()));
        }
    }
    for (name, nested) in &block.blocks {
        let current = value.attr_or_null(name);
        let stripped = match (nested.nesting_mode, current.elements()) {
            (BlockNestingMode::Single, _) => configurable_part(&nested.block, &current),
            (BlockNestingMode::List, Some(items)) => Value::list(
                nested.block.value_type(),
                items.iter().map(|i| configurable_part(&nested.block, i)).collect(),
            ),
            (BlockNestingMode::Set, Some(items)) => Value::set(
                nested.block.value_type(),
                items.iter().map(|i| configurable_part(&nested.block, i)).collect(),
            ),
            _ => current,
        };
        out = out.with_attr(name.clone(), stripped);
    }
    out
}

fn configured_change(block: &Block, planned: &Value, state: &Value) -> bool {
    let planned = configurable_part(block, planned).without_attr(TIMEOUTS_BLOCK);
    let state = configurable_part(block, state).without_attr(TIMEOUTS_BLOCK);
    !planned.equal(&state)
}

/// Mark values the remote computes as unknown: computed-only attributes and
/// optional+computed attributes the configuration leaves unset.
fn mark_computed_unknown(block: &Block, planned: &Value, config: &Value) -> Value {
    if !planned.is_known() {
        return planned.clone();
    }
    let mut out = planned.clone();
    for (name, attr) in &block.attributes {
        let unset = config.attr_or_null(name).is_null() && attr.default.is_none();
        if attr.flags.is_computed_only() || (attr.flags.computed && unset) {
            out = out.with_attr(name.clone(), Value::unknown(attr.value_type.clone()));
        }
    }
    for (name, nested) in &block.blocks {
        let current = planned.attr_or_null(name);
        let configured = config.attr_or_null(name);
        let marked = match (nested.nesting_mode, current.elements()) {
            (BlockNestingMode::Single, _) => mark_computed_unknown(&nested.block, &current, &configured),
            (BlockNestingMode::List, Some(items)) => Value::list(
                nested.block.value_type(),
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        let cfg = configured
                            .elements()
                            .and_then(|c| c.get(i))
                            .cloned()
                            .unwrap_or_else(|| Value::null(nested.block.value_type()));
                        mark_computed_unknown(&nested.block, item, &cfg)
                    })
                    .collect(),
            ),
            _ => current,
        };
        out = out.with_attr(name.clone(), marked);
    }
    out
}

fn set_at(root: &Value, steps: &[String], value: Value) -> Value {
    match steps {
        [] => value,
        [name] => root.with_attr(name.clone(), value),
        [name, rest @ ..] => {
            let child = root.attr_or_null(name);
            if !child.is_known() {
                return root.clone();
            }
            root.with_attr(name.clone(), set_at(&child, rest, value))
        },
    }
}

/// Run each attribute's modifier chain. Single nested blocks are visited
/// recursively; list and set blocks are left as proposed.
fn run_modifiers(
    block: &Block,
    path: &AttributePath,
    config: &Value,
    state: &Value,
    planned: &mut Value,
    creating: bool,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let steps: Vec<String> = path
        .steps()
        .iter()
        .filter_map(|s| match s {
            PathStep::Attribute(name) => Some(name.clone()),
            _ => None,
        })
        .collect();

    for (name, attr) in &block.attributes {
        if attr.plan_modifiers.is_empty() {
            continue;
        }
        let attr_path = path.attr(name.clone());
        let null = Value::null(attr.value_type.clone());
        let snapshot = planned.clone();
        let Some(plan_value) = snapshot.at(&attr_path).cloned() else {
            continue;
        };
        let response = apply_chain(
            &attr.plan_modifiers,
            PlanModifierRequest {
                path: attr_path.clone(),
                state_value: state.at(&attr_path).cloned().unwrap_or_else(|| null.clone()),
                config_value: config.at(&attr_path).cloned().unwrap_or(null),
                plan_value,
                raw_state_is_null: creating,
                state,
                plan: &snapshot,
                config,
            },
        );
        diagnostics.extend(response.diagnostics);
        let mut full = steps.clone();
        full.push(name.clone());
        *planned = set_at(planned, &full, response.plan_value);
    }

    for (name, nested) in &block.blocks {
        if nested.nesting_mode == BlockNestingMode::Single {
            run_modifiers(
                &nested.block,
                &path.attr(name.clone()),
                config,
                state,
                planned,
                creating,
                diagnostics,
            );
        }
    }
}

fn block_requires_replace(block: &Block) -> bool {
    block.attributes.values().any(|a| a.requires_replace)
        || block.blocks.values().any(|b| block_requires_replace(&b.block))
}

/// Collect paths whose change forces replacement. Both sides must be free
/// of unknowns for a change to count.
fn replace_triggers(
    block: &Block,
    state: &Value,
    planned: &Value,
    path: &AttributePath,
    out: &mut Vec<AttributePath>,
) {
    for (name, attr) in &block.attributes {
        if !attr.requires_replace {
            continue;
        }
        let from = state.attr_or_null(name);
        let to = planned.attr_or_null(name);
        if !from.contains_unknown() && !to.contains_unknown() && !from.equal(&to) {
            out.push(path.attr(name.clone()));
        }
    }
    for (name, nested) in &block.blocks {
        let from = state.attr_or_null(name);
        let to = planned.attr_or_null(name);
        match nested.nesting_mode {
            BlockNestingMode::Single if from.is_known() && to.is_known() => {
                replace_triggers(&nested.block, &from, &to, &path.attr(name.clone()), out);
            },
            BlockNestingMode::List | BlockNestingMode::Set if block_requires_replace(&nested.block) => {
                let from = configurable_part(&nested.block, &from);
                let to = configurable_part(&nested.block, &to);
                if !from.contains_unknown() && !to.contains_unknown() && !from.equal(&to) {
                    out.push(path.attr(name.clone()));
                }
            },
            _ => {},
        }
    }
}

/// Top-level attribute and block differences, in declared order.
fn diff_objects(
    schema: &Schema,
    from: &Value,
    to: &Value,
    triggers: &[AttributePath],
    creating: bool,
) -> Vec<AttributeDiff> {
    schema
        .block
        .attributes
        .keys()
        .chain(schema.block.blocks.keys())
        .filter_map(|name| {
            let old = from.attr_or_null(name);
            let new = to.attr_or_null(name);
            if old.equal(&new) || (creating && new.is_null()) {
                return None;
            }
            let path = AttributePath::root().attr(name.clone());
            Some(AttributeDiff {
                requires_replace: triggers.iter().any(|t| t.root_attribute() == Some(name.as_str())),
                sensitive: schema.is_sensitive(&path),
                path,
                from: old,
                to: new,
            })
        })
        .collect()
}

// ── Whole-configuration planning ─────────────────────────────────────

/// The type reached by following `path` from `ty`.
fn type_at(ty: &ValueType, path: &AttributePath) -> Option<ValueType> {
    let mut current = ty.clone();
    for step in path.steps() {
        current = match (step, &current) {
            (PathStep::Attribute(name), _) => current.attribute_types()?.get(name)?.clone(),
            (PathStep::Index(_), ValueType::List(_) | ValueType::Set(_)) => current.element_type()?.clone(),
            (PathStep::Key(_), ValueType::Map(_)) => current.element_type()?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve `path` in `value`. A path that runs through an unknown yields
/// an unknown; one that runs through a null or a missing element yields a
/// null. `None` if the path does not fit the value's type.
pub fn resolve_path(value: &Value, path: &AttributePath) -> Option<Value> {
    let ty = type_at(value.ty(), path)?;
    let mut current = value;
    for step in path.steps() {
        if current.is_unknown() {
            return Some(Value::unknown(ty));
        }
        let next = match step {
            PathStep::Attribute(name) => current.attr(name),
            PathStep::Index(i) => current.elements().and_then(|e| e.get(*i)),
            PathStep::Key(key) => current.as_map().and_then(|m| m.get(key)),
        };
        current = match next {
            Some(v) => v,
            None => return Some(Value::null(ty)),
        };
    }
    if current.is_unknown() {
        Some(Value::unknown(ty))
    } else {
        Some(current.clone())
    }
}

/// Plans a whole configuration against a state document.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    provider: &'a Provider,
    configuration: &'a Configuration,
}

impl<'a> Planner<'a> {
    /// A planner for `configuration`.
    pub fn new(provider: &'a Provider, configuration: &'a Configuration) -> Self {
        Self {
            provider,
            configuration,
        }
    }

    /// The configuration being planned.
    pub fn configuration(&self) -> &'a Configuration {
        self.configuration
    }

    /// The dependency graph over declared addresses plus state-only
    /// instances, which keep the dependencies recorded in state.
    pub fn graph(&self, doc: &StateDocument) -> (DependencyGraph, Vec<Diagnostic>) {
        let (mut graph, diagnostics) = DependencyGraph::from_configuration(self.configuration);
        let orphans: Vec<&ResourceState> = doc
            .resources
            .iter()
            .filter(|r| self.configuration.get(&r.address).is_none())
            .collect();
        for resource in &orphans {
            graph.add_node(resource.address.clone());
        }
        for resource in &orphans {
            for dep in &resource.dependencies {
                if graph.contains(dep) {
                    graph.add_edge(dep, &resource.address);
                }
            }
        }
        (graph, diagnostics)
    }

    fn schema_type(&self, address: &Address) -> Option<ValueType> {
        let schemas = self.provider.schemas();
        let schema = if address.is_data() {
            schemas.data_source(&address.kind).ok()?
        } else {
            schemas.resource(&address.kind).ok()?
        };
        Some(schema.value_type())
    }

    /// Current values of every instance in `doc`, for reference resolution.
    pub fn state_values(&self, doc: &StateDocument) -> HashMap<Address, Value> {
        let mut values: HashMap<Address, Value> = doc
            .data
            .iter()
            .map(|(a, v)| (a.clone(), v.clone()))
            .collect();
        for resource in &doc.resources {
            let Ok(schema) = self.provider.schemas().resource(&resource.kind) else {
                continue;
            };
            if let Ok(value) = resource.value(&schema) {
                values.insert(resource.address.clone(), value);
            }
        }
        values
    }

    /// Resolve a reference against `values`. Declared addresses without a
    /// value resolve to unknown.
    pub fn resolve(&self, values: &HashMap<Address, Value>, reference: &Reference) -> Option<Value> {
        self.configuration.get(&reference.address)?;
        match values.get(&reference.address) {
            Some(value) => resolve_path(value, &reference.path),
            None => {
                let ty = self.schema_type(&reference.address)?;
                resolve_path(&Value::unknown(ty), &reference.path)
            },
        }
    }

    /// Decode a declaration against its schema with references resolved
    /// from `values`.
    pub fn decode(
        &self,
        decl: &ResourceConfig,
        schema: &Schema,
        values: &HashMap<Address, Value>,
    ) -> (Value, Vec<Diagnostic>) {
        let resolver = |r: &Reference| self.resolve(values, r);
        decode_config(schema, &decl.attributes, &resolver)
    }

    /// Plan one managed address. Returns `None` with error diagnostics when
    /// the kind is unknown or its state cannot be decoded.
    pub fn plan_address(
        &self,
        address: &Address,
        doc: &StateDocument,
        values: &HashMap<Address, Value>,
    ) -> (Option<PlanEntry>, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let schema = match self.provider.schemas().resource(&address.kind) {
            Ok(schema) => schema,
            Err(e) => return (None, vec![e.to_diagnostic().with_attribute(address.to_string())]),
        };

        let state = doc.get(address);
        let prior = match state.map(|rs| rs.value(&schema)).transpose() {
            Ok(prior) => prior,
            Err(e) => return (None, vec![e.to_diagnostic()]),
        };

        let decl = self.configuration.get(address);
        let config = decl.map(|decl| {
            let (value, diags) = self.decode(decl, &schema, values);
            diagnostics.extend(diags);
            value
        });

        let (mut entry, diags) = plan_resource(&PlanRequest {
            address,
            schema: &schema,
            config: config.as_ref(),
            prior: prior.as_ref(),
            refreshed: prior.as_ref(),
            tainted: state.is_some_and(|s| s.tainted),
        });
        diagnostics.extend(diags);

        entry.dependencies = match (decl, state) {
            (Some(decl), _) => decl.dependencies().unwrap_or_default(),
            (None, Some(state)) => state.dependencies.clone(),
            (None, None) => Vec::new(),
        };
        (Some(entry), diagnostics)
    }

    /// Plan every declared and state-only address in dependency order.
    ///
    /// Data sources whose configuration is fully known are read now and
    /// their results stored in `doc.data`; the rest are planned as reads.
    pub async fn plan(&self, ctx: &ProviderContext, doc: &mut StateDocument) -> Plan {
        let (graph, mut diagnostics) = self.graph(doc);
        let order = match graph.topological_order() {
            Ok(order) => order,
            Err(cycle) => {
                diagnostics.push(cycle);
                return Plan {
                    entries: Vec::new(),
                    diagnostics,
                };
            },
        };

        let mut values = self.state_values(doc);
        let mut entries = Vec::new();
        for address in order {
            if address.is_data() {
                let (entry, diags) = self.plan_data_source(ctx, &address, doc, &mut values).await;
                diagnostics.extend(diags);
                entries.extend(entry);
                continue;
            }

            let (entry, diags) = self.plan_address(&address, doc, &values);
            diagnostics.extend(diags);
            let Some(entry) = entry else {
                continue;
            };
            if entry.action == Action::Delete {
                values.remove(&address);
            } else {
                values.insert(address, entry.planned.clone());
            }
            entries.push(entry);
        }

        let plan = Plan {
            entries,
            diagnostics,
        };
        info!(summary = %plan.summary(), "Plan complete");
        plan
    }

    async fn plan_data_source(
        &self,
        ctx: &ProviderContext,
        address: &Address,
        doc: &mut StateDocument,
        values: &mut HashMap<Address, Value>,
    ) -> (Option<PlanEntry>, Vec<Diagnostic>) {
        let (Some(decl), Ok(source)) = (
            self.configuration.get(address),
            self.provider.data_source(&address.kind),
        ) else {
            let err = crate::error::ProviderError::UnknownResource(address.to_string());
            return (None, vec![err.to_diagnostic()]);
        };
        let schema = source.schema();
        let (config, mut diagnostics) = self.decode(decl, &schema, values);
        diagnostics.extend(validate(&schema, &config, Phase::Config));
        if crate::schema::has_errors(&diagnostics) {
            return (None, diagnostics);
        }

        if config.contains_unknown() {
            let planned = Value::unknown(schema.value_type());
            values.insert(address.clone(), planned.clone());
            let entry = PlanEntry {
                address: address.clone(),
                action: Action::Read,
                prior: None,
                planned,
                diff: Vec::new(),
                replace_triggers: Vec::new(),
                dependencies: decl.dependencies().unwrap_or_default(),
            };
            return (Some(entry), diagnostics);
        }

        let (value, diags) = source.read(ctx, &config).await;
        diagnostics.extend(diags);
        values.insert(address.clone(), value.clone());
        doc.data.insert(address.clone(), value);
        (None, diagnostics)
    }
}
