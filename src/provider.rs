//! Resource kinds and the provider that wires them together.
//!
//! A resource kind implements [`ResourceType`]: its schema plus the remote
//! CRUD calls. A list data source implements [`DataSourceType`]. The
//! [`Provider`] registers kinds and their schemas; a [`ProviderContext`]
//! carries the API client, event waiter, settings and cancellation token
//! into every call. There is no global provider state.

use crate::client::LinodeClient;
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::events::{EventFilter, EventWaiter};
use crate::schema::{Diagnostic, Schema, SchemaRegistry};
use crate::state::{upgrade_resource, StateDocument, StateUpgrader};
use crate::value::Value;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ── Context ──────────────────────────────────────────────────────────

/// Everything a remote operation needs.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    /// The API client.
    pub client: LinodeClient,
    /// The shared event waiter.
    pub waiter: EventWaiter,
    /// Provider settings.
    pub config: Arc<ProviderConfig>,
    /// Cancels in-flight waits and stops new work.
    pub cancel: CancellationToken,
}

impl ProviderContext {
    /// Build a context with a fresh cancellation token.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        Self::with_cancel(config, CancellationToken::new())
    }

    /// Build a context bound to `cancel`.
    pub fn with_cancel(config: ProviderConfig, cancel: CancellationToken) -> Result<Self, ProviderError> {
        let client = LinodeClient::new(&config)?;
        let waiter = EventWaiter::new(client.clone(), config.poll_config(), cancel.clone());
        Ok(Self {
            client,
            waiter,
            config: Arc::new(config),
            cancel,
        })
    }
}

// ── Resource kinds ───────────────────────────────────────────────────

/// The outcome of a successful create call.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// The ID the remote assigned.
    pub external_id: String,
    /// Event to wait for before the object is usable.
    pub await_event: Option<EventFilter>,
}

/// Input to an in-place update.
#[derive(Debug, Clone)]
pub struct UpdateRequest<'a> {
    /// Remote ID.
    pub external_id: &'a str,
    /// The refreshed prior object.
    pub prior: &'a Value,
    /// The planned object.
    pub planned: &'a Value,
    /// Top-level attributes that differ and can be updated in place.
    pub changed: &'a [String],
}

impl UpdateRequest<'_> {
    /// Returns `true` if `name` is among the changed attributes.
    pub fn has_change(&self, name: &str) -> bool {
        self.changed.iter().any(|c| c == name)
    }

    /// The changed attributes' planned values, as a JSON request body.
    pub fn patch(&self) -> serde_json::Map<String, serde_json::Value> {
        self.changed
            .iter()
            .map(|name| (name.clone(), self.planned.attr_or_null(name).to_json()))
            .collect()
    }
}

/// A managed resource kind.
#[async_trait]
pub trait ResourceType: Send + Sync {
    /// The kind name, e.g. `linode_database_postgresql`.
    fn kind(&self) -> &str;

    /// The kind's schema.
    fn schema(&self) -> Schema;

    /// Error messages that mark an otherwise permanent failure as retryable.
    fn transient_errors(&self) -> Vec<String> {
        Vec::new()
    }

    /// State upgraders, one per schema version step.
    fn upgraders(&self) -> Vec<StateUpgrader> {
        Vec::new()
    }

    /// Read the remote object. `prior` supplies attributes the remote does
    /// not report. A missing object is [`ProviderError::NotFound`].
    async fn read(
        &self,
        ctx: &ProviderContext,
        external_id: &str,
        prior: &Value,
    ) -> Result<Value, ProviderError>;

    /// Create the remote object.
    async fn create(&self, ctx: &ProviderContext, planned: &Value) -> Result<Created, ProviderError>;

    /// Apply settings the create call cannot carry. Runs once the create
    /// event has finished, returning an event to wait for.
    async fn configure_created(
        &self,
        _ctx: &ProviderContext,
        _external_id: &str,
        _planned: &Value,
    ) -> Result<Option<EventFilter>, ProviderError> {
        Ok(None)
    }

    /// Update the remote object in place, returning an event to wait for.
    async fn update(
        &self,
        ctx: &ProviderContext,
        request: &UpdateRequest<'_>,
    ) -> Result<Option<EventFilter>, ProviderError>;

    /// Delete the remote object, returning an event to wait for.
    async fn delete(
        &self,
        ctx: &ProviderContext,
        external_id: &str,
    ) -> Result<Option<EventFilter>, ProviderError>;
}

/// A data source kind.
#[async_trait]
pub trait DataSourceType: Send + Sync {
    /// The kind name, e.g. `linode_images`.
    fn kind(&self) -> &str;

    /// The kind's schema.
    fn schema(&self) -> Schema;

    /// Read the data source for a fully known configuration.
    async fn read(&self, ctx: &ProviderContext, config: &Value) -> (Value, Vec<Diagnostic>);
}

// ── Provider ─────────────────────────────────────────────────────────

/// The set of registered kinds and their schemas.
#[derive(Clone, Default)]
pub struct Provider {
    resources: IndexMap<String, Arc<dyn ResourceType>>,
    data_sources: IndexMap<String, Arc<dyn DataSourceType>>,
    schemas: SchemaRegistry,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("data_sources", &self.data_sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Provider {
    /// An empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// The Linode provider with every built-in kind registered.
    pub fn linode() -> Result<Self, ProviderError> {
        Self::new()
            .with_resource(crate::resources::PostgresDatabase)?
            .with_data_source(crate::resources::Images)
    }

    /// Register a resource kind, checking its schema.
    pub fn register_resource(&mut self, resource: impl ResourceType + 'static) -> Result<(), ProviderError> {
        let kind = resource.kind().to_string();
        self.schemas.register_resource(kind.clone(), resource.schema())?;
        self.resources.insert(kind, Arc::new(resource));
        Ok(())
    }

    /// Register a data source kind, checking its schema.
    pub fn register_data_source(
        &mut self,
        data_source: impl DataSourceType + 'static,
    ) -> Result<(), ProviderError> {
        let kind = data_source.kind().to_string();
        self.schemas
            .register_data_source(kind.clone(), data_source.schema())?;
        self.data_sources.insert(kind, Arc::new(data_source));
        Ok(())
    }

    /// Builder form of [`Provider::register_resource`].
    pub fn with_resource(mut self, resource: impl ResourceType + 'static) -> Result<Self, ProviderError> {
        self.register_resource(resource)?;
        Ok(self)
    }

    /// Builder form of [`Provider::register_data_source`].
    pub fn with_data_source(
        mut self,
        data_source: impl DataSourceType + 'static,
    ) -> Result<Self, ProviderError> {
        self.register_data_source(data_source)?;
        Ok(self)
    }

    /// The schema registry.
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Look up a resource kind.
    pub fn resource(&self, kind: &str) -> Result<Arc<dyn ResourceType>, ProviderError> {
        self.resources
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(kind.to_string()))
    }

    /// Look up a data source kind.
    pub fn data_source(&self, kind: &str) -> Result<Arc<dyn DataSourceType>, ProviderError> {
        self.data_sources
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(format!("data.{kind}")))
    }

    /// Upgrade every instance in `doc` to its kind's current schema version.
    /// Returns `true` if any instance changed.
    pub fn upgrade_state(&self, doc: &mut StateDocument) -> Result<bool, ProviderError> {
        let mut changed = false;
        for resource in &mut doc.resources {
            let kind = self.resource(&resource.kind)?;
            let target = self.schemas.resource(&resource.kind)?.version;
            changed |= upgrade_resource(resource, target, &kind.upgraders())?;
        }
        Ok(changed)
    }
}
