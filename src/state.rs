//! Persisted state.
//!
//! The state document records, for each managed resource, its last observed
//! attributes, its remote ID and the schema version they were written with.
//! [`StateStore`] persists it as pretty-printed JSON with a trailing newline,
//! keeping a `.backup` copy of the previous document. Writes go to a
//! temporary file in the same directory and are renamed into place.

use crate::error::ProviderError;
use crate::schema::Schema;
use crate::types::Address;
use crate::value::{AttributePath, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Version of the state document layout.
pub const STATE_FORMAT_VERSION: u64 = 1;

/// Placeholder shown instead of sensitive values.
pub const SENSITIVE_MASK: &str = "(sensitive value)";

/// One managed resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// The resource kind.
    pub kind: String,
    /// Address of the instance.
    pub address: Address,
    /// Schema version the attributes conform to.
    pub schema_version: u64,
    /// Remote ID, once the remote has assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// The remote state is uncertain; the next plan replaces the instance.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tainted: bool,
    /// Attribute object as JSON.
    pub attributes: Json,
    /// Addresses this instance depended on when last applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Address>,
}

impl ResourceState {
    /// Record an instance with the given attributes.
    pub fn new(
        address: Address,
        schema_version: u64,
        external_id: Option<String>,
        attributes: &Value,
    ) -> Self {
        Self {
            kind: address.kind.clone(),
            address,
            schema_version,
            external_id,
            tainted: false,
            attributes: attributes.to_json(),
            dependencies: Vec::new(),
        }
    }

    /// Decode the attributes against `schema`.
    pub fn value(&self, schema: &Schema) -> Result<Value, ProviderError> {
        Value::from_json(&schema.value_type(), &self.attributes).map_err(|e| {
            ProviderError::StateCorruption(format!("{}: {e}", self.address))
        })
    }

    /// Replace the attributes.
    pub fn set_value(&mut self, value: &Value) {
        self.attributes = value.to_json();
    }

    /// Render the instance for display, masking sensitive attributes.
    pub fn show(&self, schema: &Schema) -> Result<String, ProviderError> {
        let value = self.value(schema)?;
        let mut out = String::new();
        let _ = writeln!(out, "# {}:", self.address);
        if let Some(id) = &self.external_id {
            let _ = writeln!(out, "# id: {id}");
        }
        if self.tainted {
            let _ = writeln!(out, "# (tainted)");
        }
        let attrs = value.attributes().cloned().unwrap_or_default();
        let width = attrs.keys().map(String::len).max().unwrap_or(0);
        for (name, attr) in &attrs {
            let rendered = if schema.is_sensitive(&AttributePath::root().attr(name.clone()))
                && !attr.is_null()
            {
                SENSITIVE_MASK.to_string()
            } else {
                attr.to_string()
            };
            let _ = writeln!(out, "{name:<width$} = {rendered}");
        }
        Ok(out)
    }
}

/// The whole state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Layout version.
    pub version: u64,
    /// Incremented on every successful write.
    pub serial: u64,
    /// Identity of this state's history, assigned on first write.
    pub lineage: Option<Uuid>,
    /// Managed instances, in the order they were first recorded.
    pub resources: Vec<ResourceState>,
    /// Data source results from the current run. Never persisted.
    #[serde(skip)]
    pub data: BTreeMap<Address, Value>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            serial: 0,
            lineage: None,
            resources: Vec::new(),
            data: BTreeMap::new(),
        }
    }
}

impl StateDocument {
    /// An empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an instance.
    pub fn get(&self, address: &Address) -> Option<&ResourceState> {
        self.resources.iter().find(|r| &r.address == address)
    }

    /// Look up an instance mutably.
    pub fn get_mut(&mut self, address: &Address) -> Option<&mut ResourceState> {
        self.resources.iter_mut().find(|r| &r.address == address)
    }

    /// Insert or replace an instance, keeping its position if present.
    pub fn upsert(&mut self, resource: ResourceState) {
        match self.get_mut(&resource.address) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
    }

    /// Remove an instance.
    pub fn remove(&mut self, address: &Address) -> Option<ResourceState> {
        let pos = self.resources.iter().position(|r| &r.address == address)?;
        Some(self.resources.remove(pos))
    }

    /// Addresses of all managed instances.
    pub fn addresses(&self) -> Vec<Address> {
        self.resources.iter().map(|r| r.address.clone()).collect()
    }
}

// ── Upgrades ─────────────────────────────────────────────────────────

/// Migrates a kind's attributes from one schema version to the next.
#[derive(Debug, Clone, Copy)]
pub struct StateUpgrader {
    /// The version this step upgrades from; it produces `from_version + 1`.
    pub from_version: u64,
    /// A pure transform of the attribute object.
    pub upgrade: fn(&Json) -> Result<Json, String>,
}

/// Bring `resource` up to `target` by chaining upgraders.
///
/// Returns `true` if anything changed. A missing step or a resource written
/// by a newer schema is a [`ProviderError::StateCorruption`].
pub fn upgrade_resource(
    resource: &mut ResourceState,
    target: u64,
    upgraders: &[StateUpgrader],
) -> Result<bool, ProviderError> {
    if resource.schema_version > target {
        return Err(ProviderError::StateCorruption(format!(
            "{} has schema version {}, newer than supported version {target}",
            resource.address, resource.schema_version
        )));
    }
    let mut changed = false;
    while resource.schema_version < target {
        let from = resource.schema_version;
        let step = upgraders
            .iter()
            .find(|u| u.from_version == from)
            .ok_or_else(|| {
                ProviderError::StateCorruption(format!(
                    "{}: no upgrade from schema version {from}",
                    resource.address
                ))
            })?;
        resource.attributes = (step.upgrade)(&resource.attributes).map_err(|e| {
            ProviderError::StateCorruption(format!(
                "{}: upgrade from version {from} failed: {e}",
                resource.address
            ))
        })?;
        resource.schema_version = from + 1;
        debug!(address = %resource.address, from, to = from + 1, "Upgraded resource state");
        changed = true;
    }
    Ok(changed)
}

// ── Store ────────────────────────────────────────────────────────────

/// File-backed state persistence. Callers hold the external lock.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// A store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backup file, `<path>.backup`.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Load the document; a missing file yields an empty one.
    pub fn load(&self) -> Result<StateDocument, ProviderError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting empty");
                return Ok(StateDocument::new());
            },
            Err(e) => {
                return Err(ProviderError::StateCorruption(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            },
        };
        let doc: StateDocument = serde_json::from_str(&text).map_err(|e| {
            ProviderError::StateCorruption(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        if doc.version != STATE_FORMAT_VERSION {
            return Err(ProviderError::StateCorruption(format!(
                "{} has state format version {}, expected {STATE_FORMAT_VERSION}",
                self.path.display(),
                doc.version
            )));
        }
        Ok(doc)
    }

    /// Write the document atomically, bumping its serial and assigning a
    /// lineage on first write.
    pub fn persist(&self, doc: &mut StateDocument) -> Result<(), ProviderError> {
        let previous = (doc.serial, doc.lineage);
        doc.serial += 1;
        doc.lineage.get_or_insert_with(Uuid::new_v4);

        if let Err(e) = self.write(doc) {
            (doc.serial, doc.lineage) = previous;
            return Err(e);
        }
        info!(path = %self.path.display(), serial = doc.serial, "Persisted state");
        Ok(())
    }

    fn write(&self, doc: &StateDocument) -> Result<(), ProviderError> {
        let mut text = serde_json::to_string_pretty(doc)?;
        text.push('\n');

        if self.path.exists() {
            std::fs::copy(&self.path, self.backup_path())?;
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| ProviderError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::v0()
            .with_attribute("label", Attribute::required_string())
            .with_attribute("root_password", Attribute::computed_string().sensitive())
    }

    fn resource(name: &str) -> ResourceState {
        ResourceState::new(
            Address::managed("linode_x", name),
            0,
            Some("123".into()),
            &Value::object([
                ("label", Value::string(name)),
                ("root_password", Value::string("hunter2")),
            ]),
        )
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let doc = store.load().unwrap();
        assert_eq!(doc.serial, 0);
        assert!(doc.resources.is_empty());
    }

    #[test]
    fn test_persist_round_trip_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let mut doc = StateDocument::new();
        doc.upsert(resource("a"));
        doc.data
            .insert(Address::data("linode_images", "all"), Value::string("ephemeral"));
        store.persist(&mut doc).unwrap();
        assert_eq!(doc.serial, 1);
        let lineage = doc.lineage.unwrap();
        assert!(!store.backup_path().exists());

        doc.upsert(resource("b"));
        store.persist(&mut doc).unwrap();
        assert_eq!(doc.serial, 2);
        assert_eq!(doc.lineage, Some(lineage));

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.ends_with("}\n"));
        let raw: Json = serde_json::from_str(&text).unwrap();
        let mut keys: Vec<&String> = raw.as_object().unwrap().keys().collect();
        keys.sort();
        assert_eq!(keys, ["lineage", "resources", "serial", "version"]);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.resources.len(), 2);
        assert!(loaded.data.is_empty());

        let backup: StateDocument =
            serde_json::from_str(&std::fs::read_to_string(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup.serial, 1);
        assert_eq!(backup.resources.len(), 1);
    }

    #[test]
    fn test_corrupt_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, ProviderError::StateCorruption(_)));

        std::fs::write(
            &path,
            json!({"version": 99, "serial": 1, "lineage": null, "resources": []}).to_string(),
        )
        .unwrap();
        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, ProviderError::StateCorruption(_)));
    }

    #[test]
    fn test_upgrade_chain() {
        fn v0_to_v1(attrs: &Json) -> Result<Json, String> {
            let mut attrs = attrs.clone();
            let obj = attrs.as_object_mut().ok_or("not an object")?;
            let name = obj.remove("name").unwrap_or(Json::Null);
            obj.insert("label".into(), name);
            Ok(attrs)
        }
        fn v1_to_v2(attrs: &Json) -> Result<Json, String> {
            let mut attrs = attrs.clone();
            attrs["migrated"] = json!(true);
            Ok(attrs)
        }
        let upgraders = [
            StateUpgrader {
                from_version: 1,
                upgrade: v1_to_v2,
            },
            StateUpgrader {
                from_version: 0,
                upgrade: v0_to_v1,
            },
        ];

        let mut rs = ResourceState {
            attributes: json!({"name": "db"}),
            ..resource("a")
        };
        assert!(upgrade_resource(&mut rs, 2, &upgraders).unwrap());
        assert_eq!(rs.schema_version, 2);
        assert_eq!(rs.attributes, json!({"label": "db", "migrated": true}));

        assert!(!upgrade_resource(&mut rs, 2, &upgraders).unwrap());

        let err = upgrade_resource(&mut rs, 1, &upgraders).unwrap_err();
        assert!(matches!(err, ProviderError::StateCorruption(_)));

        let mut rs = resource("b");
        let err = upgrade_resource(&mut rs, 1, &[]).unwrap_err();
        assert!(err.to_string().contains("no upgrade from schema version 0"));
    }

    #[test]
    fn test_show_masks_sensitive_values() {
        let shown = resource("a").show(&schema()).unwrap();
        assert!(shown.contains("# linode_x.a:"));
        assert!(shown.contains("label         = \"a\""));
        assert!(shown.contains(SENSITIVE_MASK));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_remove_and_upsert_keep_order() {
        let mut doc = StateDocument::new();
        doc.upsert(resource("a"));
        doc.upsert(resource("b"));
        doc.upsert(ResourceState {
            tainted: true,
            ..resource("a")
        });
        assert_eq!(
            doc.addresses(),
            vec![Address::managed("linode_x", "a"), Address::managed("linode_x", "b")]
        );
        assert!(doc.get(&Address::managed("linode_x", "a")).unwrap().tainted);
        assert!(doc.remove(&Address::managed("linode_x", "a")).is_some());
        assert_eq!(doc.resources.len(), 1);
    }
}
