//! Testing utilities for resource kinds and the reconciliation engine.
//!
//! [`FakeResource`] is an in-memory resource kind with a call log and
//! injectable failures. [`ProviderTester`] drives plan and apply against a
//! throwaway state file, and the `assert_*` helpers check plans and
//! diagnostics.
//!
//! # Example
//!
//! ```ignore
//! use linode_provider_core::testing::{assert_plan_creates, FakeResource, ProviderTester};
//! use linode_provider_core::Provider;
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create() {
//!     let fake = FakeResource::new("linode_fake");
//!     let tester = ProviderTester::new(Provider::new().with_resource(fake.clone()).unwrap()).unwrap();
//!
//!     let config = json!({"resources": [
//!         {"kind": "linode_fake", "name": "a", "attributes": {"label": "a"}}
//!     ]});
//!     let plan = tester.plan(config.clone()).await.unwrap();
//!     assert_plan_creates(&plan, "linode_fake.a");
//!
//!     tester.apply(config).await.unwrap();
//!     assert_eq!(fake.remote().len(), 1);
//! }
//! ```

use crate::config::{Configuration, ProviderConfig};
use crate::engine::Engine;
use crate::error::ProviderError;
use crate::events::EventFilter;
use crate::executor::ApplyReport;
use crate::planmodifier::use_state_for_unknown;
use crate::provider::{Created, Provider, ProviderContext, ResourceType, UpdateRequest};
use crate::schema::{Attribute, Diagnostic, DiagnosticSeverity, Schema};
use crate::state::{StateDocument, StateStore};
use crate::types::{Action, Address, Plan, PlanEntry};
use crate::value::Value;
use async_trait::async_trait;
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

// =========================================================================
// Fake remote
// =========================================================================

/// The objects and call log behind a [`FakeResource`].
#[derive(Debug, Default)]
pub struct FakeRemote {
    objects: BTreeMap<String, Map<String, Json>>,
    next_id: u64,
    calls: Vec<String>,
    failures: VecDeque<(String, ProviderError)>,
}

/// Shared handle to a [`FakeRemote`].
#[derive(Debug, Clone, Default)]
pub struct FakeRemoteHandle(Arc<Mutex<FakeRemote>>);

impl FakeRemoteHandle {
    fn lock(&self) -> MutexGuard<'_, FakeRemote> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Calls made so far, as `"<op> <label or id>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Fail the next call of `operation` (`create`, `read`, `update` or
    /// `delete`) with `err`.
    pub fn fail_next(&self, operation: &str, err: ProviderError) {
        self.lock().failures.push_back((operation.to_string(), err));
    }

    /// Insert an object directly, bypassing the call log.
    pub fn insert(&self, id: &str, object: Json) {
        if let Json::Object(map) = object {
            self.lock().objects.insert(id.to_string(), map);
        }
    }

    /// Delete an object out of band.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().objects.remove(id).is_some()
    }

    /// Returns `true` if an object with `id` exists.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().objects.contains_key(id)
    }

    /// A stored object.
    pub fn get(&self, id: &str) -> Option<Json> {
        self.lock().objects.get(id).cloned().map(Json::Object)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }
}

impl FakeRemote {
    fn record(&mut self, operation: &str, subject: &str) -> Result<(), ProviderError> {
        self.calls.push(format!("{operation} {subject}"));
        match self.failures.iter().position(|(op, _)| op == operation) {
            Some(pos) => match self.failures.remove(pos) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn not_found(id: &str) -> ProviderError {
        ProviderError::NotFound(format!("fake object {id}"))
    }
}

// =========================================================================
// Fake resource
// =========================================================================

/// An in-memory resource kind.
///
/// The default schema has a computed `id`, a required `label`, a
/// replace-forcing `region`, a `size` defaulting to 1 and a computed
/// `host` derived from the label as `<label>.example`.
#[derive(Debug, Clone)]
pub struct FakeResource {
    kind: String,
    schema: Schema,
    remote: FakeRemoteHandle,
    await_event: Option<(String, String)>,
}

impl FakeResource {
    /// A fake kind with the default schema.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            schema: Self::default_schema(),
            remote: FakeRemoteHandle::default(),
            await_event: None,
        }
    }

    /// The schema used by [`FakeResource::new`].
    pub fn default_schema() -> Schema {
        Schema::v0()
            .with_attribute(
                "id",
                Attribute::computed_string().with_plan_modifier(use_state_for_unknown()),
            )
            .with_attribute("label", Attribute::required_string())
            .with_attribute("region", Attribute::optional_string().with_requires_replace())
            .with_attribute("size", Attribute::optional_int64().with_default(Value::int64(1)))
            .with_attribute("host", Attribute::computed_string())
    }

    /// Replace the schema.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Return an event to wait for from every create.
    pub fn with_await(mut self, entity_type: impl Into<String>, action: impl Into<String>) -> Self {
        self.await_event = Some((entity_type.into(), action.into()));
        self
    }

    /// The fake's backing store.
    pub fn remote(&self) -> FakeRemoteHandle {
        self.remote.clone()
    }

    fn to_value(&self, object: &Map<String, Json>) -> Result<Value, ProviderError> {
        let projected: Map<String, Json> = self
            .schema
            .block
            .attributes
            .keys()
            .map(|name| (name.clone(), object.get(name).cloned().unwrap_or(Json::Null)))
            .collect();
        Value::from_json(&self.schema.value_type(), &Json::Object(projected))
            .map_err(|e| ProviderError::Config(e.to_string()))
    }

    fn derive_host(object: &mut Map<String, Json>) {
        if let Some(label) = object.get("label").and_then(Json::as_str) {
            let host = format!("{label}.example");
            object.insert("host".to_string(), Json::String(host));
        }
    }
}

#[async_trait]
impl ResourceType for FakeResource {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn schema(&self) -> Schema {
        self.schema.clone()
    }

    async fn read(
        &self,
        _ctx: &ProviderContext,
        external_id: &str,
        _prior: &Value,
    ) -> Result<Value, ProviderError> {
        let mut remote = self.remote.lock();
        remote.record("read", external_id)?;
        let object = remote
            .objects
            .get(external_id)
            .ok_or_else(|| FakeRemote::not_found(external_id))?;
        self.to_value(object)
    }

    async fn create(&self, _ctx: &ProviderContext, planned: &Value) -> Result<Created, ProviderError> {
        let mut remote = self.remote.lock();
        let label = planned.attr("label").and_then(Value::as_str).unwrap_or_default();
        remote.record("create", label)?;

        remote.next_id += 1;
        let id = (1000 + remote.next_id).to_string();
        let mut object = match planned.to_json() {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        object.insert("id".to_string(), Json::String(id.clone()));
        Self::derive_host(&mut object);
        remote.objects.insert(id.clone(), object);

        let await_event = self
            .await_event
            .as_ref()
            .map(|(entity_type, action)| EventFilter::new(entity_type.clone(), &id, action.clone()));
        Ok(Created {
            external_id: id,
            await_event,
        })
    }

    async fn update(
        &self,
        _ctx: &ProviderContext,
        request: &UpdateRequest<'_>,
    ) -> Result<Option<EventFilter>, ProviderError> {
        let mut remote = self.remote.lock();
        remote.record("update", request.external_id)?;
        let object = remote
            .objects
            .get_mut(request.external_id)
            .ok_or_else(|| FakeRemote::not_found(request.external_id))?;
        object.extend(request.patch());
        Self::derive_host(object);
        Ok(None)
    }

    async fn delete(
        &self,
        _ctx: &ProviderContext,
        external_id: &str,
    ) -> Result<Option<EventFilter>, ProviderError> {
        let mut remote = self.remote.lock();
        remote.record("delete", external_id)?;
        remote
            .objects
            .remove(external_id)
            .map(|_| None)
            .ok_or_else(|| FakeRemote::not_found(external_id))
    }
}

// =========================================================================
// Tester
// =========================================================================

/// Drives plan and apply for a provider against a temporary state file.
pub struct ProviderTester {
    provider: Provider,
    ctx: ProviderContext,
    store: StateStore,
    _dir: TempDir,
}

impl ProviderTester {
    /// A tester whose API URL points nowhere and whose retries are fast.
    pub fn new(provider: Provider) -> Result<Self, TestError> {
        Self::with_config(
            provider,
            ProviderConfig {
                api_url: "http://127.0.0.1:9".to_string(),
                min_retry_delay_ms: 1,
                max_retry_delay_ms: 5,
                event_poll_ms: 10,
                event_poll_max_ms: 40,
                ..ProviderConfig::default()
            },
        )
    }

    /// A tester with explicit provider settings.
    pub fn with_config(provider: Provider, config: ProviderConfig) -> Result<Self, TestError> {
        let dir = TempDir::new().map_err(ProviderError::from)?;
        let store = StateStore::new(dir.path().join("state.json"));
        Ok(Self {
            provider,
            ctx: ProviderContext::new(config)?,
            store,
            _dir: dir,
        })
    }

    /// The provider under test.
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// The shared context.
    pub fn context(&self) -> &ProviderContext {
        &self.ctx
    }

    /// The state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// An engine for a configuration document.
    pub fn engine(&self, configuration: Json) -> Result<Engine, TestError> {
        let configuration = Configuration::from_json_str(&configuration.to_string())?;
        Ok(Engine::new(
            self.provider.clone(),
            configuration,
            self.store.clone(),
            self.ctx.clone(),
        ))
    }

    /// Refresh and plan. Plans with error diagnostics are returned as
    /// [`TestError::Diagnostics`].
    pub async fn plan(&self, configuration: Json) -> Result<Plan, TestError> {
        let (plan, _) = self.engine(configuration)?.plan().await?;
        if plan.has_errors() {
            return Err(TestError::Diagnostics(plan.diagnostics));
        }
        Ok(plan)
    }

    /// Refresh, plan and apply.
    pub async fn apply(&self, configuration: Json) -> Result<ApplyReport, TestError> {
        let report = self.engine(configuration)?.apply().await?;
        if report.has_errors() {
            return Err(TestError::Diagnostics(report.diagnostics));
        }
        Ok(report)
    }

    /// Delete everything in state.
    pub async fn destroy(&self) -> Result<ApplyReport, TestError> {
        let report = self.engine(serde_json::json!({}))?.destroy().await?;
        if report.has_errors() {
            return Err(TestError::Diagnostics(report.diagnostics));
        }
        Ok(report)
    }

    /// The persisted state.
    pub fn state(&self) -> Result<StateDocument, TestError> {
        Ok(self.store.load()?)
    }
}

/// Error type for test operations.
#[derive(Debug)]
pub enum TestError {
    /// The operation returned error diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The operation returned a provider error.
    Provider(ProviderError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  - {}", diag.summary)?;
                    if let Some(ref attr) = diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    if let Some(ref detail) = diag.detail {
                        write!(f, ": {}", detail)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            },
            TestError::Provider(err) => write!(f, "Provider error: {}", err),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(err: ProviderError) -> Self {
        TestError::Provider(err)
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

fn expect_entry<'a>(plan: &'a Plan, address: &str) -> &'a PlanEntry {
    let parsed: Option<Address> = address.parse().ok();
    match parsed.as_ref().and_then(|a| plan.entry(a)) {
        Some(entry) => entry,
        None => panic!("Expected plan entry for {}, plan has:\n{}", address, plan.render()),
    }
}

/// Assert that the plan creates `address`.
///
/// # Panics
///
/// Panics if the entry is missing or its action is not create.
pub fn assert_plan_creates(plan: &Plan, address: &str) {
    let entry = expect_entry(plan, address);
    assert_eq!(
        entry.action,
        Action::Create,
        "Expected {} to be created, got {}",
        address,
        entry.action
    );
}

/// Assert that the plan has no changes.
///
/// # Panics
///
/// Panics if any entry is not a no-op.
pub fn assert_plan_no_changes(plan: &Plan) {
    assert!(
        !plan.has_changes(),
        "Expected no changes, but plan has:\n{}",
        plan.render()
    );
}

/// Assert that the plan has changes.
///
/// # Panics
///
/// Panics if every entry is a no-op.
pub fn assert_plan_has_changes(plan: &Plan) {
    assert!(plan.has_changes(), "Expected changes, but plan has none");
}

/// Assert that the plan replaces `address` because of `trigger`.
///
/// # Panics
///
/// Panics if the entry is not a replace or `trigger` is not among its
/// replace triggers.
pub fn assert_plan_replaces(plan: &Plan, address: &str, trigger: &str) {
    let entry = expect_entry(plan, address);
    assert_eq!(
        entry.action,
        Action::Replace,
        "Expected {} to be replaced, got {}",
        address,
        entry.action
    );
    assert!(
        entry.replace_triggers.iter().any(|p| p.to_string() == trigger),
        "Expected {} to trigger replacement, triggers: {:?}",
        trigger,
        entry
            .replace_triggers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    );
}

/// Assert that the plan updates `address` in place.
///
/// # Panics
///
/// Panics if the entry's action is not update.
pub fn assert_plan_updates_in_place(plan: &Plan, address: &str) {
    let entry = expect_entry(plan, address);
    assert_eq!(
        entry.action,
        Action::Update,
        "Expected {} to be updated in place, got {}",
        address,
        entry.action
    );
}

/// Assert that the plan deletes `address`.
///
/// # Panics
///
/// Panics if the entry's action is not delete.
pub fn assert_plan_deletes(plan: &Plan, address: &str) {
    let entry = expect_entry(plan, address);
    assert_eq!(
        entry.action,
        Action::Delete,
        "Expected {} to be deleted, got {}",
        address,
        entry.action
    );
}

/// Assert that `path` changes in the entry for `address`.
///
/// # Panics
///
/// Panics if the entry has no diff at `path`.
pub fn assert_plan_changes_attribute(plan: &Plan, address: &str, path: &str) {
    let entry = expect_entry(plan, address);
    assert!(
        entry.diff_for(path).is_some(),
        "Expected attribute '{}' to change, but diff has: {:?}",
        path,
        entry.diff.iter().map(|d| d.path.to_string()).collect::<Vec<_>>()
    );
}

/// Assert that `path` does not change in the entry for `address`.
///
/// # Panics
///
/// Panics if the entry has a diff at `path`.
pub fn assert_plan_does_not_change_attribute(plan: &Plan, address: &str, path: &str) {
    let entry = expect_entry(plan, address);
    assert!(
        entry.diff_for(path).is_none(),
        "Expected attribute '{}' to not change, but it does",
        path
    );
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if any error diagnostics are present.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == DiagnosticSeverity::Error)
        .collect();

    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain at least one error.
///
/// # Panics
///
/// Panics if no error diagnostics are present.
pub fn assert_has_errors(diagnostics: &[Diagnostic]) {
    let has_errors = diagnostics
        .iter()
        .any(|d| d.severity == DiagnosticSeverity::Error);

    assert!(has_errors, "Expected errors, but got none");
}

/// Assert that an error diagnostic's summary or detail contains `text`.
///
/// # Panics
///
/// Panics if no error diagnostic contains the text.
pub fn assert_error_contains(diagnostics: &[Diagnostic], text: &str) {
    let found = diagnostics.iter().any(|d| {
        d.severity == DiagnosticSeverity::Error
            && (d.summary.contains(text)
                || d.detail.as_ref().is_some_and(|detail| detail.contains(text)))
    });

    assert!(
        found,
        "Expected error containing '{}', but got: {:?}",
        text,
        diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .map(|d| &d.summary)
            .collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tester() -> (FakeResource, ProviderTester) {
        let fake = FakeResource::new("linode_fake");
        let provider = Provider::new().with_resource(fake.clone()).unwrap();
        (fake, ProviderTester::new(provider).unwrap())
    }

    fn config(label: &str, region: &str) -> Json {
        json!({"resources": [
            {"kind": "linode_fake", "name": "a", "attributes": {"label": label, "region": region}}
        ]})
    }

    #[tokio::test]
    async fn test_tester_plan_create() {
        let (_, tester) = tester();
        let plan = tester.plan(config("a", "us-east")).await.unwrap();
        assert_plan_creates(&plan, "linode_fake.a");
        assert_plan_changes_attribute(&plan, "linode_fake.a", "label");
    }

    #[tokio::test]
    async fn test_tester_lifecycle() {
        let (fake, tester) = tester();
        tester.apply(config("a", "us-east")).await.unwrap();
        assert_eq!(fake.remote().len(), 1);
        assert_plan_no_changes(&tester.plan(config("a", "us-east")).await.unwrap());

        let plan = tester.plan(config("b", "us-east")).await.unwrap();
        assert_plan_updates_in_place(&plan, "linode_fake.a");
        assert_plan_does_not_change_attribute(&plan, "linode_fake.a", "region");

        let plan = tester.plan(config("a", "eu-west")).await.unwrap();
        assert_plan_replaces(&plan, "linode_fake.a", "region");

        tester.destroy().await.unwrap();
        assert!(fake.remote().is_empty());
        assert!(tester.state().unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_tester_plan_errors() {
        let (_, tester) = tester();
        let err = tester
            .plan(json!({"resources": [{"kind": "linode_fake", "name": "a", "attributes": {}}]}))
            .await
            .unwrap_err();
        match err {
            TestError::Diagnostics(diags) => assert_error_contains(&diags, "label"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fake_failure_injection() {
        let (fake, tester) = tester();
        fake.remote().fail_next(
            "create",
            ProviderError::RemotePermanent {
                status: 400,
                message: "region unavailable".to_string(),
            },
        );
        let err = tester.apply(config("a", "us-east")).await.unwrap_err();
        assert!(err.to_string().contains("region unavailable"));
        assert_eq!(fake.remote().calls(), vec!["create a".to_string()]);
    }

    #[test]
    fn test_assert_no_errors() {
        let diagnostics = vec![Diagnostic::warning("Just a warning")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    #[should_panic(expected = "Expected no errors")]
    fn test_assert_no_errors_fails() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    fn test_assert_has_errors() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_has_errors(&diagnostics);
    }

    #[test]
    fn test_assert_error_contains() {
        let diagnostics = vec![Diagnostic::error("Invalid configuration value")];
        assert_error_contains(&diagnostics, "Invalid");
        assert_error_contains(&diagnostics, "configuration");
    }

    #[test]
    fn test_test_error_display() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("First error").with_attribute("field1"),
            Diagnostic::error("Second error").with_detail("More info"),
        ]);

        let display = format!("{}", err);
        assert!(display.contains("First error"));
        assert!(display.contains("Second error"));
        assert!(display.contains("field1"));
        assert!(display.contains("More info"));
    }
}
