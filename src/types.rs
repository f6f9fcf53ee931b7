//! Plan types shared by the planner, executor and engine.

use crate::error::ProviderError;
use crate::schema::{has_errors, Diagnostic};
use crate::value::{AttributePath, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether an address names a managed resource or a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mode {
    /// A managed resource (`kind.name`).
    Managed,
    /// A data source (`data.kind.name`).
    Data,
}

/// The address of a declared resource or data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    /// Managed or data.
    pub mode: Mode,
    /// The resource kind, e.g. `linode_database_postgresql`.
    pub kind: String,
    /// The user-chosen instance name.
    pub name: String,
}

impl Address {
    /// Address of a managed resource.
    pub fn managed(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: Mode::Managed,
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Address of a data source.
    pub fn data(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: Mode::Data,
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Returns `true` for data source addresses.
    pub fn is_data(&self) -> bool {
        self.mode == Mode::Data
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Mode::Managed => write!(f, "{}.{}", self.kind, self.name),
            Mode::Data => write!(f, "data.{}.{}", self.kind, self.name),
        }
    }
}

impl FromStr for Address {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            ["data", kind, name] if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::data(*kind, *name))
            },
            [kind, name] if !kind.is_empty() && !name.is_empty() => Ok(Self::managed(*kind, *name)),
            _ => Err(ProviderError::Config(format!("invalid address: {s:?}"))),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = ProviderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// The action planned for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Nothing to do.
    NoOp,
    /// Create a new remote object.
    Create,
    /// Read a data source.
    Read,
    /// Update the remote object in place.
    Update,
    /// Delete then create.
    Replace,
    /// Delete the remote object.
    Delete,
}

impl Action {
    /// The symbol used in rendered plans.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Read => "<=",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
        }
    }

    /// Returns `true` for actions that mutate the remote.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::Replace | Self::Delete
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        write!(f, "{name}")
    }
}

/// A change to a single attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDiff {
    /// The path to the attribute.
    pub path: AttributePath,
    /// The prior value (null when creating).
    pub from: Value,
    /// The planned value (null when deleting, unknown if computed on apply).
    pub to: Value,
    /// The change forces replacement.
    pub requires_replace: bool,
    /// The attribute is sensitive and must be masked when rendered.
    pub sensitive: bool,
}

impl AttributeDiff {
    fn render_value(&self, value: &Value) -> String {
        if self.sensitive && !value.is_null() && !value.is_unknown() {
            "(sensitive value)".to_string()
        } else {
            value.to_string()
        }
    }

    fn json_value(&self, value: &Value) -> serde_json::Value {
        if self.sensitive && value.is_known() {
            serde_json::Value::String("(sensitive value)".to_string())
        } else {
            value.to_plan_json()
        }
    }
}

/// One entry of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    /// Address of the resource.
    pub address: Address,
    /// The planned action.
    pub action: Action,
    /// The refreshed prior object, if the resource exists.
    pub prior: Option<Value>,
    /// The planned object (null for Delete).
    pub planned: Value,
    /// Per-attribute changes, in path order.
    pub diff: Vec<AttributeDiff>,
    /// Attributes whose change forces replacement, sorted.
    pub replace_triggers: Vec<AttributePath>,
    /// Addresses this entry depends on.
    pub dependencies: Vec<Address>,
}

impl PlanEntry {
    /// Look up the diff for a path.
    pub fn diff_for(&self, path: &str) -> Option<&AttributeDiff> {
        self.diff.iter().find(|d| d.path.to_string() == path)
    }
}

/// Counts of planned changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanSummary {
    /// Resources to create (including replacements).
    pub add: usize,
    /// Resources to update in place.
    pub change: usize,
    /// Resources to delete (including replacements).
    pub destroy: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Plan: {} to add, {} to change, {} to destroy.",
            self.add, self.change, self.destroy
        )
    }
}

/// An ordered set of plan entries plus the diagnostics raised planning them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    /// Entries in dependency order.
    pub entries: Vec<PlanEntry>,
    /// Accumulated diagnostics.
    pub diagnostics: Vec<Diagnostic>,
}

impl Plan {
    /// Returns `true` if any entry mutates the remote.
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.action.is_change())
    }

    /// Returns `true` if planning raised an error.
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }

    /// Look up the entry for an address.
    pub fn entry(&self, address: &Address) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.address == address)
    }

    /// Count the planned changes.
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.action {
                Action::Create => summary.add += 1,
                Action::Update => summary.change += 1,
                Action::Delete => summary.destroy += 1,
                Action::Replace => {
                    summary.add += 1;
                    summary.destroy += 1;
                },
                Action::NoOp | Action::Read => {},
            }
        }
        summary
    }

    /// Process exit code: 1 on errors, 2 if `detailed` and the plan has
    /// changes, otherwise 0.
    pub fn exit_code(&self, detailed: bool) -> i32 {
        if self.has_errors() {
            1
        } else if detailed && self.has_changes() {
            2
        } else {
            0
        }
    }

    /// Render a human-readable plan. Sensitive values are masked.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.iter().filter(|e| e.action != Action::NoOp) {
            out.push_str(&format!("{} {}", entry.action.symbol(), entry.address));
            if !entry.replace_triggers.is_empty() {
                let triggers = entry
                    .replace_triggers
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!(" (forces replacement: {triggers})"));
            }
            out.push('\n');
            for diff in &entry.diff {
                out.push_str(&format!(
                    "    {}: {} -> {}",
                    diff.path,
                    diff.render_value(&diff.from),
                    diff.render_value(&diff.to)
                ));
                if diff.requires_replace {
                    out.push_str(" # forces replacement");
                }
                out.push('\n');
            }
        }
        for diagnostic in &self.diagnostics {
            out.push_str(&format!("{diagnostic}\n"));
        }
        out.push_str(&self.summary().to_string());
        out.push('\n');
        out
    }

    /// Machine-readable plan. Unknown renders as `{"$unknown": true}`.
    pub fn to_json(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "address": entry.address.to_string(),
                    "action": entry.action,
                    "replace_triggers": entry.replace_triggers,
                    "changes": entry.diff.iter().map(|d| serde_json::json!({
                        "path": d.path,
                        "before": d.json_value(&d.from),
                        "after": d.json_value(&d.to),
                        "requires_replace": d.requires_replace,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::json!({
            "entries": entries,
            "diagnostics": self.diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use serde_json::json;

    fn entry(action: Action) -> PlanEntry {
        PlanEntry {
            address: Address::managed("linode_database_postgresql", "db"),
            action,
            prior: None,
            planned: Value::object([("label", Value::string("db"))]),
            diff: Vec::new(),
            replace_triggers: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_address_parse_and_display() {
        let managed: Address = "linode_database_postgresql.db".parse().unwrap();
        assert_eq!(managed, Address::managed("linode_database_postgresql", "db"));
        assert_eq!(managed.to_string(), "linode_database_postgresql.db");

        let data: Address = "data.linode_images.all".parse().unwrap();
        assert!(data.is_data());
        assert_eq!(data.to_string(), "data.linode_images.all");

        assert!("nodots".parse::<Address>().is_err());
        assert!("a.b.c.d".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_serde_as_string() {
        let address = Address::managed("linode_x", "y");
        assert_eq!(serde_json::to_value(&address).unwrap(), json!("linode_x.y"));
        let back: Address = serde_json::from_value(json!("linode_x.y")).unwrap();
        assert_eq!(back, address);
    }

    #[test]
    fn test_summary_and_exit_codes() {
        let plan = Plan {
            entries: vec![
                entry(Action::Create),
                entry(Action::Replace),
                entry(Action::NoOp),
            ],
            diagnostics: Vec::new(),
        };
        let summary = plan.summary();
        assert_eq!((summary.add, summary.change, summary.destroy), (2, 0, 1));
        assert_eq!(summary.to_string(), "Plan: 2 to add, 0 to change, 1 to destroy.");
        assert_eq!(plan.exit_code(false), 0);
        assert_eq!(plan.exit_code(true), 2);

        let empty = Plan {
            entries: vec![entry(Action::NoOp)],
            diagnostics: Vec::new(),
        };
        assert!(!empty.has_changes());
        assert_eq!(empty.exit_code(true), 0);

        let failed = Plan {
            entries: Vec::new(),
            diagnostics: vec![Diagnostic::error("boom")],
        };
        assert_eq!(failed.exit_code(true), 1);
    }

    #[test]
    fn test_render_masks_sensitive_values() {
        let mut e = entry(Action::Replace);
        e.replace_triggers = vec![AttributePath::parse("region")];
        e.diff = vec![
            AttributeDiff {
                path: AttributePath::parse("region"),
                from: Value::string("us-east"),
                to: Value::string("us-west"),
                requires_replace: true,
                sensitive: false,
            },
            AttributeDiff {
                path: AttributePath::parse("root_password"),
                from: Value::string("hunter2"),
                to: Value::unknown(ValueType::String),
                requires_replace: false,
                sensitive: true,
            },
        ];
        let plan = Plan {
            entries: vec![e],
            diagnostics: Vec::new(),
        };

        let rendered = plan.render();
        assert!(rendered.contains("-/+ linode_database_postgresql.db (forces replacement: region)"));
        assert!(rendered.contains("region: \"us-east\" -> \"us-west\" # forces replacement"));
        assert!(rendered.contains("root_password: (sensitive value) -> (known after apply)"));
        assert!(!rendered.contains("hunter2"));

        let json = plan.to_json();
        let changes = &json["entries"][0]["changes"];
        assert_eq!(changes[1]["before"], json!("(sensitive value)"));
        assert_eq!(changes[1]["after"], json!({"$unknown": true}));
        assert_eq!(json["entries"][0]["action"], json!("replace"));
    }
}
