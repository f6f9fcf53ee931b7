//! Plan modifiers.
//!
//! A plan modifier refines an attribute's planned value after the planner
//! has proposed it. Modifiers on one attribute run left to right; each sees
//! the plan value left by the previous one, and none short-circuits the
//! chain.
//!
//! The workhorse is [`UseStateForUnknownIf`]: when an attribute would be
//! planned as unknown on an update, it copies the prior state value into the
//! plan if a condition holds. The condition closure is the only per-use
//! variation; the modifier itself is the same for every element type.
//!
//! ```
//! use linode_provider_core::planmodifier::{
//!     use_state_for_unknown_if_not_null, PlanModifier, PlanModifierRequest, PlanModifierResponse,
//! };
//! use linode_provider_core::value::{AttributePath, Value, ValueType};
//!
//! let state = Value::object([("host", Value::string("abc"))]);
//! let plan = Value::object([("host", Value::unknown(ValueType::String))]);
//! let config = Value::object([("host", Value::null(ValueType::String))]);
//! let req = PlanModifierRequest {
//!     path: AttributePath::parse("host"),
//!     state_value: Value::string("abc"),
//!     config_value: Value::null(ValueType::String),
//!     plan_value: Value::unknown(ValueType::String),
//!     raw_state_is_null: false,
//!     state: &state,
//!     plan: &plan,
//!     config: &config,
//! };
//! let mut resp = PlanModifierResponse::new(req.plan_value.clone());
//! use_state_for_unknown_if_not_null().modify(&req, &mut resp);
//! assert_eq!(resp.plan_value, Value::string("abc"));
//! ```

use crate::schema::Diagnostic;
use crate::value::{AttributePath, Value};
use std::fmt;
use std::sync::Arc;

/// Input to a plan modifier.
#[derive(Debug, Clone)]
pub struct PlanModifierRequest<'a> {
    /// Path of the attribute being planned.
    pub path: AttributePath,
    /// The attribute's prior state value.
    pub state_value: Value,
    /// The attribute's configuration value.
    pub config_value: Value,
    /// The attribute's planned value so far.
    pub plan_value: Value,
    /// The whole prior state is null (the resource is being created).
    pub raw_state_is_null: bool,
    /// The enclosing prior state object.
    pub state: &'a Value,
    /// The enclosing planned object.
    pub plan: &'a Value,
    /// The enclosing configuration object.
    pub config: &'a Value,
}

/// Output of a plan modifier.
#[derive(Debug, Clone)]
pub struct PlanModifierResponse {
    /// The planned value after this modifier.
    pub plan_value: Value,
    /// Diagnostics raised by the modifier.
    pub diagnostics: Vec<Diagnostic>,
}

impl PlanModifierResponse {
    /// Start a response carrying the current plan value.
    pub fn new(plan_value: Value) -> Self {
        Self {
            plan_value,
            diagnostics: Vec::new(),
        }
    }
}

/// Refines an attribute's planned value.
pub trait PlanModifier: fmt::Debug + Send + Sync {
    /// A short description.
    fn description(&self) -> String;

    /// Inspect `req` and optionally overwrite `resp.plan_value`.
    fn modify(&self, req: &PlanModifierRequest<'_>, resp: &mut PlanModifierResponse);
}

/// Run a modifier chain left to right, feeding each the previous plan value.
pub fn apply_chain(
    modifiers: &[Arc<dyn PlanModifier>],
    mut req: PlanModifierRequest<'_>,
) -> PlanModifierResponse {
    let mut resp = PlanModifierResponse::new(req.plan_value.clone());
    for modifier in modifiers {
        modifier.modify(&req, &mut resp);
        req.plan_value = resp.plan_value.clone();
    }
    resp
}

type Condition = dyn Fn(&PlanModifierRequest<'_>) -> bool + Send + Sync;

/// Use the prior state value for an unknown plan value when a condition holds.
///
/// Does nothing when the resource is being created, when the plan value is
/// already known or null, or when the configuration value is itself unknown
/// (the value depends on another resource and must stay unknown).
#[derive(Clone)]
pub struct UseStateForUnknownIf {
    description: String,
    condition: Arc<Condition>,
}

impl fmt::Debug for UseStateForUnknownIf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseStateForUnknownIf")
            .field("description", &self.description)
            .finish()
    }
}

impl PlanModifier for UseStateForUnknownIf {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn modify(&self, req: &PlanModifierRequest<'_>, resp: &mut PlanModifierResponse) {
        if req.raw_state_is_null {
            return;
        }
        if !req.plan_value.is_unknown() {
            return;
        }
        if req.config_value.is_unknown() {
            return;
        }
        if (self.condition)(req) {
            resp.plan_value = req.state_value.clone();
        }
    }
}

/// Use the prior state value when `condition` returns `true`.
pub fn use_state_for_unknown_if<F>(description: impl Into<String>, condition: F) -> UseStateForUnknownIf
where
    F: Fn(&PlanModifierRequest<'_>) -> bool + Send + Sync + 'static,
{
    UseStateForUnknownIf {
        description: description.into(),
        condition: Arc::new(condition),
    }
}

/// Always use the prior state value for an unknown plan value.
pub fn use_state_for_unknown() -> UseStateForUnknownIf {
    use_state_for_unknown_if(
        "Once set, the value of this attribute in state will not change.",
        |_| true,
    )
}

/// Use the prior state value unless it is null.
pub fn use_state_for_unknown_if_not_null() -> UseStateForUnknownIf {
    use_state_for_unknown_if(
        "Use the value in state if it is not null.",
        |req| !req.state_value.is_null(),
    )
}

/// Use the prior state value unless one of the named sibling attributes
/// changes between state and plan. Unknown planned siblings are ignored.
pub fn use_state_for_unknown_unless_these_changed(paths: &[&str]) -> UseStateForUnknownIf {
    let paths: Vec<AttributePath> = paths.iter().map(|p| AttributePath::parse(p)).collect();
    let names = paths
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    use_state_for_unknown_if(
        format!("Use the value in state unless any of [{names}] changed."),
        move |req| {
            !paths.iter().any(|path| {
                match (req.state.at(path), req.plan.at(path)) {
                    (_, Some(planned)) if planned.is_unknown() => false,
                    (Some(prior), Some(planned)) => !prior.equal(planned),
                    (None, None) => false,
                    _ => true,
                }
            })
        },
    )
}
