//! Waiting on the remote event feed.
//!
//! Long-running remote operations (database provisioning, disk resizes, ...)
//! finish asynchronously. The API reports their progress as events on
//! `account/events`; [`EventWaiter`] polls that feed until the event for a
//! given entity and action reaches `finished` or `failed`.
//!
//! Polling starts at [`PollConfig::min_interval`] and backs off, with jitter,
//! on every empty response up to [`PollConfig::max_interval`]. Concurrent
//! waits on the same event share a single underlying poll.

use crate::client::{ListRequest, LinodeClient};
use crate::error::ProviderError;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENTS_PATH: &str = "account/events";

/// Timestamp format the events filter accepts.
const FILTER_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Poll intervals for the event waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// First and minimum interval between polls.
    pub min_interval: Duration,
    /// Upper bound reached by backing off on empty responses.
    pub max_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(15),
        }
    }
}

impl PollConfig {
    /// Backoff schedule between polls, restarted whenever the event shows
    /// progress.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.min_interval,
            initial_interval: self.min_interval,
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// Status of a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Queued.
    Scheduled,
    /// In progress.
    Started,
    /// Completed successfully.
    Finished,
    /// Completed with an error.
    Failed,
    /// Informational, never terminal.
    Notification,
    /// A status this crate does not know.
    #[serde(other)]
    Other,
}

impl EventStatus {
    /// Returns `true` for `finished` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// The entity an event refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntity {
    /// Entity ID; numeric for most entity types.
    pub id: serde_json::Value,
    /// Entity type, e.g. `database` or `linode`.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Entity label at the time of the event.
    #[serde(default)]
    pub label: Option<String>,
}

/// One entry of the account event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic event ID.
    pub id: u64,
    /// What happened, e.g. `database_create`.
    pub action: String,
    /// Current status.
    pub status: EventStatus,
    /// The subject of the event.
    #[serde(default)]
    pub entity: Option<EventEntity>,
    /// Free-text detail, set on failures.
    #[serde(default)]
    pub message: Option<String>,
    /// Progress in percent, when reported.
    #[serde(default)]
    pub percent_complete: Option<u32>,
    /// Creation timestamp.
    #[serde(default)]
    pub created: Option<String>,
}

impl Event {
    fn entity_id(&self) -> Option<String> {
        self.entity.as_ref().map(|e| match &e.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Which event to wait for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventFilter {
    /// Entity type, e.g. `database`.
    pub entity_type: String,
    /// Entity ID.
    pub entity_id: String,
    /// Event action, e.g. `database_create`.
    pub action: String,
    /// Ignore events created before this instant.
    pub since: DateTime<Utc>,
    /// Ignore events with an ID at or below this floor.
    pub after_id: Option<u64>,
}

impl EventFilter {
    /// Wait for `action` on the given entity, starting now.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            action: action.into(),
            since: Utc::now(),
            after_id: None,
        }
    }

    /// Only consider events created at or after `since`.
    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = since;
        self
    }

    /// Only consider events newer than `id`.
    pub fn with_after_id(mut self, id: Option<u64>) -> Self {
        self.after_id = id;
        self
    }

    fn matches(&self, event: &Event) -> bool {
        event.action == self.action
            && event
                .entity
                .as_ref()
                .is_some_and(|e| e.entity_type == self.entity_type)
            && event.entity_id().as_deref() == Some(self.entity_id.as_str())
    }

    /// The `X-Filter` document for one poll with the given ID floor.
    pub fn to_filter_json(&self, floor: u64) -> serde_json::Value {
        let entity_id = match self.entity_id.parse::<i64>() {
            Ok(n) => json!(n),
            Err(_) => json!(self.entity_id),
        };
        let mut filter = json!({
            "entity.type": self.entity_type,
            "entity.id": entity_id,
            "action": self.action,
            "created": {"+gte": self.since.format(FILTER_TIME_FORMAT).to_string()},
            "+order_by": "id",
            "+order": "asc",
        });
        if floor > 0 {
            filter["id"] = json!({"+gt": floor});
        }
        filter
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} {}", self.action, self.entity_type, self.entity_id)
    }
}

// ── Errors ───────────────────────────────────────────────────────────

/// Why a wait ended without a finished event. Cloneable so that one poll
/// can serve several waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline elapsed.
    Timeout(String),
    /// The event reported `failed`.
    Failed(String),
    /// The waiter was cancelled.
    Cancelled,
    /// Polling the feed failed permanently.
    Remote {
        /// HTTP status, if any.
        status: Option<u16>,
        /// Error message.
        message: String,
    },
}

impl From<WaitError> for ProviderError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout(msg) => ProviderError::AwaitTimeout(msg),
            WaitError::Failed(msg) => ProviderError::AwaitFailed(msg),
            WaitError::Cancelled => ProviderError::Cancelled,
            WaitError::Remote {
                status: Some(404 | 410),
                message,
            } => ProviderError::NotFound(message),
            WaitError::Remote { status, message } => ProviderError::RemotePermanent {
                status: status.unwrap_or(0),
                message,
            },
        }
    }
}

// ── Waiter ───────────────────────────────────────────────────────────

type SharedWait = Shared<BoxFuture<'static, Result<Event, WaitError>>>;

/// Polls the account event feed. Cheap to clone; clones share in-flight
/// polls.
#[derive(Clone)]
pub struct EventWaiter {
    client: LinodeClient,
    poll: PollConfig,
    cancel: CancellationToken,
    inflight: Arc<Mutex<HashMap<EventFilter, SharedWait>>>,
}

impl fmt::Debug for EventWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWaiter")
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl EventWaiter {
    /// Create a waiter. Cancelling `cancel` ends every in-flight wait.
    pub fn new(client: LinodeClient, poll: PollConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            poll,
            cancel,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The newest event ID for an entity type and action, used as a floor
    /// before starting an operation whose entity ID is not yet known.
    pub async fn latest_event_id(
        &self,
        entity_type: &str,
        action: &str,
    ) -> Result<Option<u64>, ProviderError> {
        let filter = json!({
            "entity.type": entity_type,
            "action": action,
            "+order_by": "id",
            "+order": "desc",
        });
        let page = self
            .client
            .list_page::<Event>(
                EVENTS_PATH,
                1,
                &ListRequest {
                    filter: Some(filter.to_string()),
                    params: Vec::new(),
                    page_size: Some(25),
                },
            )
            .await?;
        Ok(page.data.iter().map(|e| e.id).max())
    }

    /// Wait until the event described by `filter` finishes.
    ///
    /// A second caller waiting on an identical filter joins the first
    /// caller's poll and shares its deadline.
    pub async fn wait(&self, filter: EventFilter, timeout: Duration) -> Result<Event, ProviderError> {
        let deadline = Instant::now() + timeout;
        let shared = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&filter) {
                Some(existing) => {
                    debug!(event = %filter, "Joining in-flight event wait");
                    existing.clone()
                },
                None => {
                    let fut = poll_until_terminal(
                        self.client.clone(),
                        self.poll,
                        self.cancel.clone(),
                        filter.clone(),
                        deadline,
                        self.inflight.clone(),
                    )
                    .boxed()
                    .shared();
                    inflight.insert(filter, fut.clone());
                    fut
                },
            }
        };
        shared.await.map_err(ProviderError::from)
    }
}

async fn poll_until_terminal(
    client: LinodeClient,
    poll: PollConfig,
    cancel: CancellationToken,
    filter: EventFilter,
    deadline: Instant,
    inflight: Arc<Mutex<HashMap<EventFilter, SharedWait>>>,
) -> Result<Event, WaitError> {
    let result = poll_loop(&client, poll, &cancel, &filter, deadline).await;
    inflight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&filter);
    result
}

async fn poll_loop(
    client: &LinodeClient,
    poll: PollConfig,
    cancel: &CancellationToken,
    filter: &EventFilter,
    deadline: Instant,
) -> Result<Event, WaitError> {
    let mut backoff = poll.backoff();
    let mut floor = filter.after_id.unwrap_or(0);

    debug!(event = %filter, "Waiting for event");
    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        let request = ListRequest {
            filter: Some(filter.to_filter_json(floor).to_string()),
            params: Vec::new(),
            page_size: Some(25),
        };
        let mut observed = false;
        match client.list_page::<Event>(EVENTS_PATH, 1, &request).await {
            Ok(page) => {
                if let Some(event) = page.data.into_iter().find(|e| filter.matches(e)) {
                    observed = true;
                    match event.status {
                        EventStatus::Finished => {
                            debug!(event = %filter, id = event.id, "Event finished");
                            return Ok(event);
                        },
                        EventStatus::Failed => {
                            return Err(WaitError::Failed(format!(
                                "{filter} failed: {}",
                                event.message.as_deref().unwrap_or("no message")
                            )));
                        },
                        status => {
                            debug!(
                                event = %filter,
                                id = event.id,
                                ?status,
                                percent = ?event.percent_complete,
                                "Event in progress"
                            );
                            floor = floor.max(event.id.saturating_sub(1));
                        },
                    }
                }
            },
            Err(err) if err.is_transient(&[]) => {
                warn!(event = %filter, error = %err, "Transient error polling events");
            },
            Err(err) => {
                return Err(WaitError::Remote {
                    status: err.status(),
                    message: err.message(),
                });
            },
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout(format!(
                "timed out waiting for {filter}"
            )));
        }

        if observed {
            backoff.reset();
        }
        let interval = backoff.next_backoff().unwrap_or(poll.max_interval);
        let sleep_for = interval.min(deadline - now);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}
