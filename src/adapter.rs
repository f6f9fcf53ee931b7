//! Retrying façade over resource CRUD, event waits and pagination.
//!
//! Resource kinds make single HTTP calls; the adapter wraps each in the
//! provider's retry policy, the kind's transient error strings and a
//! deadline taken from the resource's timeouts.

use crate::client::{ListRequest, Page};
use crate::error::ProviderError;
use crate::events::{Event, EventFilter};
use crate::provider::{Created, ProviderContext, ResourceType, UpdateRequest};
use crate::retry::{with_retry, RetryPolicy};
use crate::value::Value;
use futures::stream::{self, Stream};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Adapter for one resource kind.
pub struct Adapter<'a> {
    ctx: &'a ProviderContext,
    resource: &'a dyn ResourceType,
    policy: RetryPolicy,
    transient: Vec<String>,
}

impl<'a> Adapter<'a> {
    /// Wrap `resource` using the context's retry policy.
    pub fn new(ctx: &'a ProviderContext, resource: &'a dyn ResourceType) -> Self {
        Self {
            ctx,
            resource,
            policy: ctx.config.retry_policy(),
            transient: resource.transient_errors(),
        }
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Read the remote object. `NotFound` is returned unchanged.
    pub async fn refresh(
        &self,
        external_id: &str,
        prior: &Value,
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        let deadline = Instant::now() + timeout;
        with_retry(
            &self.policy,
            &self.transient,
            &self.ctx.cancel,
            Some(deadline),
            "read",
            || self.resource.read(self.ctx, external_id, prior),
        )
        .await
    }

    /// Create the remote object.
    pub async fn create(&self, planned: &Value, timeout: Duration) -> Result<Created, ProviderError> {
        let deadline = Instant::now() + timeout;
        with_retry(
            &self.policy,
            &self.transient,
            &self.ctx.cancel,
            Some(deadline),
            "create",
            || self.resource.create(self.ctx, planned),
        )
        .await
    }

    /// Apply post-create settings.
    pub async fn configure_created(
        &self,
        external_id: &str,
        planned: &Value,
        timeout: Duration,
    ) -> Result<Option<EventFilter>, ProviderError> {
        let deadline = Instant::now() + timeout;
        with_retry(
            &self.policy,
            &self.transient,
            &self.ctx.cancel,
            Some(deadline),
            "configure",
            || self.resource.configure_created(self.ctx, external_id, planned),
        )
        .await
    }

    /// Update the remote object in place.
    pub async fn update(
        &self,
        request: &UpdateRequest<'_>,
        timeout: Duration,
    ) -> Result<Option<EventFilter>, ProviderError> {
        let deadline = Instant::now() + timeout;
        with_retry(
            &self.policy,
            &self.transient,
            &self.ctx.cancel,
            Some(deadline),
            "update",
            || self.resource.update(self.ctx, request),
        )
        .await
    }

    /// Delete the remote object. An object that is already gone counts as
    /// deleted.
    pub async fn delete(
        &self,
        external_id: &str,
        timeout: Duration,
    ) -> Result<Option<EventFilter>, ProviderError> {
        let deadline = Instant::now() + timeout;
        let result = with_retry(
            &self.policy,
            &self.transient,
            &self.ctx.cancel,
            Some(deadline),
            "delete",
            || self.resource.delete(self.ctx, external_id),
        )
        .await;
        match result {
            Err(err) if err.is_not_found() => {
                debug!(kind = self.resource.kind(), external_id, "Already deleted");
                Ok(None)
            },
            other => other,
        }
    }

    /// Wait for an event until `timeout` elapses.
    pub async fn await_event(&self, filter: EventFilter, timeout: Duration) -> Result<Event, ProviderError> {
        self.ctx.waiter.wait(filter, timeout).await
    }
}

/// Stream every item of a paginated list endpoint, fetching pages lazily
/// until the server's page count is consumed. Each page is retried.
pub fn paginate<'a, T>(
    ctx: &'a ProviderContext,
    path: &'a str,
    request: ListRequest,
) -> impl Stream<Item = Result<T, ProviderError>> + 'a
where
    T: DeserializeOwned + Send + 'a,
{
    let policy = ctx.config.retry_policy();
    stream::try_unfold(Some(1u32), move |next| {
        let request = request.clone();
        let policy = policy.clone();
        async move {
            let Some(page_number) = next else {
                return Ok::<_, ProviderError>(None);
            };
            let page: Page<T> = with_retry(&policy, &[], &ctx.cancel, None, "list", || {
                ctx.client.list_page::<T>(path, page_number, &request)
            })
            .await?;
            debug!(path, page = page.page, pages = page.pages, "Fetched page");
            let next = (page_number < page.pages).then_some(page_number + 1);
            Ok(Some((stream::iter(page.data.into_iter().map(Ok::<T, ProviderError>)), next)))
        }
    })
    .try_flatten()
}

/// Collect every item of a paginated list endpoint.
pub async fn list_all<T>(
    ctx: &ProviderContext,
    path: &str,
    request: ListRequest,
) -> Result<Vec<T>, ProviderError>
where
    T: DeserializeOwned + Send,
{
    paginate(ctx, path, request).try_collect().await
}
