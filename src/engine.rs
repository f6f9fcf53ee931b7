//! Refresh, plan, apply and the state commands over one state file.

use crate::adapter::Adapter;
use crate::config::Configuration;
use crate::error::ProviderError;
use crate::executor::{ApplyReport, Executor};
use crate::planner::Planner;
use crate::provider::{Provider, ProviderContext};
use crate::schema::{Diagnostic, TimeoutKind};
use crate::state::{ResourceState, StateDocument, StateStore};
use crate::types::{Address, Plan};
use crate::value::Value;
use futures::stream::{self, StreamExt};
use tracing::{info, instrument, warn};

/// Ties a provider, a desired-state document and a state file together.
#[derive(Debug, Clone)]
pub struct Engine {
    provider: Provider,
    configuration: Configuration,
    store: StateStore,
    ctx: ProviderContext,
}

impl Engine {
    /// An engine for `configuration` over the state in `store`.
    pub fn new(
        provider: Provider,
        configuration: Configuration,
        store: StateStore,
        ctx: ProviderContext,
    ) -> Self {
        Self {
            provider,
            configuration,
            store,
            ctx,
        }
    }

    /// The provider.
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// The desired-state document.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    fn planner(&self) -> Planner<'_> {
        Planner::new(&self.provider, &self.configuration)
    }

    /// Load state and upgrade every instance to its current schema version.
    pub fn load_state(&self) -> Result<StateDocument, ProviderError> {
        let mut doc = self.store.load()?;
        if self.provider.upgrade_state(&mut doc)? {
            info!("Upgraded state to current schema versions");
        }
        Ok(doc)
    }

    async fn refresh_one(&self, resource: &ResourceState) -> Result<Value, ProviderError> {
        let kind = self.provider.resource(&resource.kind)?;
        let schema = self.provider.schemas().resource(&resource.kind)?;
        let prior = resource.value(&schema)?;
        let external_id = resource.external_id.as_deref().unwrap_or_default();
        Adapter::new(&self.ctx, kind.as_ref())
            .refresh(external_id, &prior, schema.timeout(TimeoutKind::Read, &prior))
            .await
    }

    /// Read every recorded instance back from the remote. Vanished
    /// instances are dropped with a warning. Returns the diagnostics and
    /// whether `doc` changed.
    async fn refresh_document(
        &self,
        doc: &mut StateDocument,
    ) -> Result<(Vec<Diagnostic>, bool), ProviderError> {
        let width = self.ctx.config.parallelism.max(1);
        let recorded: Vec<ResourceState> = doc
            .resources
            .iter()
            .filter(|r| r.external_id.is_some())
            .cloned()
            .collect();
        let results: Vec<(Address, Result<Value, ProviderError>)> = stream::iter(recorded)
            .map(|resource| async move {
                let result = self.refresh_one(&resource).await;
                (resource.address, result)
            })
            .buffered(width)
            .collect()
            .await;

        let mut diagnostics = Vec::new();
        let mut changed = false;
        for (address, result) in results {
            match result {
                Ok(value) => {
                    if let Some(resource) = doc.get_mut(&address) {
                        let before = resource.attributes.clone();
                        resource.set_value(&value);
                        changed |= resource.attributes != before;
                    }
                },
                Err(e) if e.is_not_found() => {
                    warn!(address = %address, "Resource no longer exists; removing from state");
                    doc.remove(&address);
                    changed = true;
                    diagnostics.push(
                        Diagnostic::warning("Resource no longer exists").with_detail(format!(
                            "{address} was deleted outside of apply and was removed from state"
                        )),
                    );
                },
                Err(e @ ProviderError::StateCorruption(_)) => return Err(e),
                Err(e) => diagnostics.push(e.to_diagnostic().with_attribute(address.to_string())),
            }
        }
        Ok((diagnostics, changed))
    }

    /// Refresh state from the remote and persist it.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(StateDocument, Vec<Diagnostic>), ProviderError> {
        let mut doc = self.load_state()?;
        let (diagnostics, changed) = self.refresh_document(&mut doc).await?;
        if changed {
            self.store.persist(&mut doc)?;
        }
        Ok((doc, diagnostics))
    }

    async fn refreshed_plan(
        &self,
        planner: Planner<'_>,
    ) -> Result<(Plan, StateDocument, bool), ProviderError> {
        let mut doc = self.load_state()?;
        let (refresh_diagnostics, changed) = self.refresh_document(&mut doc).await?;
        let mut plan = planner.plan(&self.ctx, &mut doc).await;
        plan.diagnostics.splice(0..0, refresh_diagnostics);
        Ok((plan, doc, changed))
    }

    /// Refresh in memory, then plan. State is not written.
    #[instrument(skip(self))]
    pub async fn plan(&self) -> Result<(Plan, StateDocument), ProviderError> {
        let (plan, doc, _) = self.refreshed_plan(self.planner()).await?;
        Ok((plan, doc))
    }

    /// Refresh, plan and apply. A plan with errors is returned as a report
    /// carrying the plan's diagnostics, with nothing applied.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> Result<ApplyReport, ProviderError> {
        self.run(self.planner()).await
    }

    /// Apply an existing plan to `doc`.
    pub async fn apply_plan(&self, plan: &Plan, doc: &mut StateDocument) -> ApplyReport {
        Executor::new(&self.provider, self.planner(), &self.ctx, &self.store)
            .apply(plan, doc)
            .await
    }

    /// Delete every recorded instance, dependents first.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> Result<ApplyReport, ProviderError> {
        let empty = Configuration::default();
        self.run(Planner::new(&self.provider, &empty)).await
    }

    async fn run(&self, planner: Planner<'_>) -> Result<ApplyReport, ProviderError> {
        let (plan, mut doc, refreshed) = self.refreshed_plan(planner).await?;
        if plan.has_errors() {
            return Ok(ApplyReport {
                outcomes: Vec::new(),
                diagnostics: plan.diagnostics,
            });
        }
        if refreshed {
            self.store.persist(&mut doc)?;
        }
        let mut report = Executor::new(&self.provider, planner, &self.ctx, &self.store)
            .apply(&plan, &mut doc)
            .await;
        report.diagnostics.splice(0..0, plan.diagnostics);
        Ok(report)
    }

    /// Read an existing remote object and record it at `address`.
    #[instrument(skip(self))]
    pub async fn import(
        &self,
        address: &Address,
        external_id: &str,
    ) -> Result<ResourceState, ProviderError> {
        if address.is_data() {
            return Err(ProviderError::Config(format!(
                "{address} is a data source and cannot be imported"
            )));
        }
        let mut doc = self.load_state()?;
        if doc.get(address).is_some() {
            return Err(ProviderError::Config(format!("{address} is already managed")));
        }

        let kind = self.provider.resource(&address.kind)?;
        let schema = self.provider.schemas().resource(&address.kind)?;
        let prior = Value::null(schema.value_type());
        let value = Adapter::new(&self.ctx, kind.as_ref())
            .refresh(external_id, &prior, schema.timeout(TimeoutKind::Read, &prior))
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::Config(format!(
                    "cannot import non-existent remote object {external_id}"
                )),
                other => other,
            })?;

        let mut resource = ResourceState::new(
            address.clone(),
            schema.version,
            Some(external_id.to_string()),
            &value,
        );
        if let Some(decl) = self.configuration.get(address) {
            resource.dependencies = decl.dependencies()?;
        }
        doc.upsert(resource.clone());
        self.store.persist(&mut doc)?;
        info!(address = %address, external_id, "Imported");
        Ok(resource)
    }

    /// Forget an instance without touching the remote. Returns `false` if
    /// it was not recorded.
    pub fn state_rm(&self, address: &Address) -> Result<bool, ProviderError> {
        let mut doc = self.store.load()?;
        if doc.remove(address).is_none() {
            return Ok(false);
        }
        self.store.persist(&mut doc)?;
        info!(address = %address, "Removed from state");
        Ok(true)
    }

    /// Render a recorded instance with sensitive attributes masked.
    pub fn state_show(&self, address: &Address) -> Result<String, ProviderError> {
        let doc = self.load_state()?;
        let resource = doc
            .get(address)
            .ok_or_else(|| ProviderError::Config(format!("{address} is not in state")))?;
        let schema = self.provider.schemas().resource(&resource.kind)?;
        resource.show(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::executor::ApplyOutcome;
    use crate::testing::{
        assert_plan_creates, assert_plan_no_changes, FakeResource, ProviderTester,
    };
    use crate::types::Action;
    use serde_json::{json, Value as Json};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tester() -> (FakeResource, ProviderTester) {
        let fake = FakeResource::new("linode_fake");
        let provider = Provider::new().with_resource(fake.clone()).unwrap();
        (fake, ProviderTester::new(provider).unwrap())
    }

    fn single(label: &str) -> Json {
        json!({"resources": [
            {"kind": "linode_fake", "name": "a", "attributes": {"label": label}}
        ]})
    }

    fn addr(name: &str) -> Address {
        Address::managed("linode_fake", name)
    }

    #[tokio::test]
    async fn test_refresh_drops_vanished_resource() {
        let (fake, tester) = tester();
        tester.apply(single("a")).await.unwrap();
        let id = tester.state().unwrap().resources[0].external_id.clone().unwrap();
        fake.remote().remove(&id);

        let engine = tester.engine(single("a")).unwrap();
        let (doc, diags) = engine.refresh().await.unwrap();
        assert!(doc.resources.is_empty());
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].summary, "Resource no longer exists");
        assert!(tester.state().unwrap().resources.is_empty());

        let plan = tester.plan(single("a")).await.unwrap();
        assert_plan_creates(&plan, "linode_fake.a");
    }

    #[tokio::test]
    async fn test_import_then_plan_is_clean() {
        let (fake, tester) = tester();
        fake.remote().insert(
            "42",
            json!({"id": "42", "label": "a", "region": null, "size": 1, "host": "a.example"}),
        );

        let engine = tester.engine(single("a")).unwrap();
        let imported = engine.import(&addr("a"), "42").await.unwrap();
        assert_eq!(imported.external_id.as_deref(), Some("42"));
        assert_plan_no_changes(&tester.plan(single("a")).await.unwrap());

        let err = engine.import(&addr("a"), "42").await.unwrap_err();
        assert!(err.to_string().contains("already managed"));
    }

    #[tokio::test]
    async fn test_import_missing_object_fails() {
        let (_, tester) = tester();
        let engine = tester.engine(single("a")).unwrap();
        let err = engine.import(&addr("a"), "404").await.unwrap_err();
        assert!(err.to_string().contains("non-existent"));
        assert!(tester.state().unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_state_rm_and_show() {
        let (fake, tester) = tester();
        tester.apply(single("a")).await.unwrap();
        let engine = tester.engine(single("a")).unwrap();

        let shown = engine.state_show(&addr("a")).unwrap();
        assert!(shown.contains("linode_fake.a"));
        assert!(shown.contains("a.example"));

        assert!(engine.state_rm(&addr("a")).unwrap());
        assert!(!engine.state_rm(&addr("a")).unwrap());
        assert_eq!(fake.remote().len(), 1);
        assert!(engine.state_show(&addr("a")).is_err());
    }

    #[tokio::test]
    async fn test_destroy_deletes_dependents_first() {
        let (fake, tester) = tester();
        let config = json!({"resources": [
            {"kind": "linode_fake", "name": "db", "attributes": {"label": "db"}},
            {"kind": "linode_fake", "name": "app", "attributes": {"label": "${linode_fake.db.host}"}}
        ]});
        tester.apply(config).await.unwrap();
        let state = tester.state().unwrap();
        let id = |name: &str| state.get(&addr(name)).unwrap().external_id.clone().unwrap();
        let (db, app) = (id("db"), id("app"));

        let report = tester.destroy().await.unwrap();
        assert_eq!(report.count(ApplyOutcome::Deleted), 2);

        let calls = fake.remote().calls();
        let app_deleted = calls.iter().position(|c| *c == format!("delete {app}")).unwrap();
        let db_deleted = calls.iter().position(|c| *c == format!("delete {db}")).unwrap();
        assert!(app_deleted < db_deleted, "{calls:?}");
        assert!(fake.remote().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_fatal() {
        let (_, tester) = tester();
        std::fs::write(tester.store().path(), "{not json").unwrap();
        let err = tester.engine(single("a")).unwrap().plan().await.unwrap_err();
        assert!(matches!(err, ProviderError::StateCorruption(_)));
    }

    #[tokio::test]
    async fn test_failed_create_event_taints_instance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/account/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": 7,
                    "action": "fake_create",
                    "status": "failed",
                    "entity": {"id": 1001, "type": "fake", "label": "a"},
                    "message": "insufficient capacity",
                    "created": "2024-01-01T00:00:00"
                }],
                "page": 1, "pages": 1, "results": 1
            })))
            .mount(&server)
            .await;

        let fake = FakeResource::new("linode_fake").with_await("fake", "fake_create");
        let provider = Provider::new().with_resource(fake.clone()).unwrap();
        let tester = ProviderTester::with_config(
            provider,
            ProviderConfig {
                api_url: server.uri(),
                event_poll_ms: 10,
                event_poll_max_ms: 40,
                min_retry_delay_ms: 1,
                max_retry_delay_ms: 5,
                ..ProviderConfig::default()
            },
        )
        .unwrap();

        let report = tester
            .engine(single("a"))
            .unwrap()
            .apply()
            .await
            .unwrap();
        assert_eq!(report.outcome(&addr("a")), Some(ApplyOutcome::Tainted));
        assert!(report.has_errors());

        let state = tester.state().unwrap();
        let recorded = state.get(&addr("a")).unwrap();
        assert!(recorded.tainted);
        assert_eq!(recorded.external_id.as_deref(), Some("1001"));

        let plan = tester.plan(single("a")).await.unwrap();
        assert_eq!(plan.entry(&addr("a")).unwrap().action, Action::Replace);
    }
}
