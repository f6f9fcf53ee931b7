//! Lifecycle execution.
//!
//! The executor runs a [`Plan`] against the remote. Entries run on a bounded
//! pool of tasks once everything they depend on has settled; deletions wait
//! for the dependents being deleted alongside them. Workers never touch the
//! state document: they send progress and results over channels, and the
//! executor loop is the only writer, persisting after every terminal result.
//!
//! An entry whose dependencies changed during this apply is re-planned
//! against post-apply state before it starts, so it sees real values where
//! the plan had unknowns.

use crate::adapter::Adapter;
use crate::error::ProviderError;
use crate::planner::Planner;
use crate::provider::{DataSourceType, Provider, ProviderContext, ResourceType, UpdateRequest};
use crate::schema::{has_errors, Diagnostic, Schema, TimeoutKind, TIMEOUTS_BLOCK};
use crate::state::{ResourceState, StateDocument, StateStore};
use crate::types::{Action, Address, Plan, PlanEntry};
use crate::validation::{validate, Phase};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Where one resource is in its apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Planned,
    Creating,
    AwaitingCreate,
    Configuring,
    Reading,
    Updating,
    AwaitingUpdate,
    Deleting,
    AwaitingDelete,
    Settled,
    Tainted,
    Deleted,
    Failed,
}

struct Lifecycle {
    address: Address,
    state: LifecycleState,
}

impl Lifecycle {
    fn new(address: Address) -> Self {
        Self {
            address,
            state: LifecycleState::Planned,
        }
    }

    fn enter(&mut self, next: LifecycleState) {
        debug!(address = %self.address, from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
    }
}

/// How one plan entry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Created and read back.
    Created,
    /// Updated in place and read back.
    Updated,
    /// Deleted, then created and read back.
    Replaced,
    /// Deleted.
    Deleted,
    /// Data source read.
    Read,
    /// Re-planning found nothing left to do.
    Unchanged,
    /// The remote state is unknown; the instance is marked tainted.
    Tainted,
    /// The operation failed before changing the remote.
    Failed,
    /// Never started, because of an earlier error, a failed dependency or
    /// cancellation.
    NotApplied,
}

impl ApplyOutcome {
    fn changed_values(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted | Self::Read
        )
    }

    fn succeeded(self) -> bool {
        self.changed_values() || self == Self::Unchanged
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Replaced => "replaced",
            Self::Deleted => "deleted",
            Self::Read => "read",
            Self::Unchanged => "unchanged",
            Self::Tainted => "tainted",
            Self::Failed => "failed",
            Self::NotApplied => "not applied",
        };
        write!(f, "{name}")
    }
}

/// The result of an apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Outcome per plan entry, in completion order.
    pub outcomes: Vec<(Address, ApplyOutcome)>,
    /// Every diagnostic raised while applying.
    pub diagnostics: Vec<Diagnostic>,
}

impl ApplyReport {
    /// Returns `true` if any error diagnostic was raised.
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }

    /// The outcome recorded for `address`.
    pub fn outcome(&self, address: &Address) -> Option<ApplyOutcome> {
        self.outcomes
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, o)| *o)
    }

    /// Number of entries that ended with `outcome`.
    pub fn count(&self, outcome: ApplyOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }
}

// ── Worker side ──────────────────────────────────────────────────────

enum Progress {
    /// The remote assigned an ID; record it before anything else happens.
    Created(ResourceState),
}

enum StateChange {
    Keep,
    Upsert(ResourceState),
    Remove,
    Data(Value),
}

struct JobResult {
    address: Address,
    outcome: ApplyOutcome,
    change: StateChange,
    diagnostics: Vec<Diagnostic>,
}

impl JobResult {
    fn new(address: Address, outcome: ApplyOutcome, change: StateChange) -> Self {
        Self {
            address,
            outcome,
            change,
            diagnostics: Vec::new(),
        }
    }

    fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }
}

enum JobKind {
    Managed {
        resource: Arc<dyn ResourceType>,
        schema: Arc<Schema>,
        prior: Option<ResourceState>,
    },
    Data {
        source: Arc<dyn DataSourceType>,
        config: Value,
    },
}

struct Job {
    entry: PlanEntry,
    kind: JobKind,
    ctx: ProviderContext,
    progress: mpsc::UnboundedSender<Progress>,
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn failure(address: &Address, operation: &str, err: &ProviderError) -> Diagnostic {
    error!(address = %address, operation, error = %err, "Operation failed");
    let mut diagnostic = err.to_diagnostic();
    diagnostic.summary = format!("{address}: {operation} failed: {}", diagnostic.summary);
    diagnostic
}

/// Top-level attributes an in-place update must send.
fn changed_attributes(schema: &Schema, entry: &PlanEntry) -> Vec<String> {
    entry
        .diff
        .iter()
        .filter_map(|d| d.path.root_attribute())
        .filter(|name| *name != TIMEOUTS_BLOCK)
        .filter(|name| {
            schema
                .block
                .attributes
                .get(*name)
                .map_or(true, |a| !a.flags.is_computed_only())
        })
        .map(str::to_string)
        .collect()
}

async fn run_job(job: Job) -> JobResult {
    match &job.kind {
        JobKind::Data { source, config } => {
            let (value, diagnostics) = source.read(&job.ctx, config).await;
            let failed = has_errors(&diagnostics);
            let (outcome, change) = if failed {
                (ApplyOutcome::Failed, StateChange::Keep)
            } else {
                (ApplyOutcome::Read, StateChange::Data(value))
            };
            JobResult {
                address: job.entry.address.clone(),
                outcome,
                change,
                diagnostics,
            }
        },
        JobKind::Managed {
            resource,
            schema,
            prior,
        } => {
            let worker = Worker {
                job: &job,
                adapter: Adapter::new(&job.ctx, resource.as_ref()),
                schema,
                prior: prior.as_ref(),
            };
            worker.run().await
        },
    }
}

struct Worker<'a> {
    job: &'a Job,
    adapter: Adapter<'a>,
    schema: &'a Schema,
    prior: Option<&'a ResourceState>,
}

impl Worker<'_> {
    fn address(&self) -> &Address {
        &self.job.entry.address
    }

    async fn run(&self) -> JobResult {
        let mut lifecycle = Lifecycle::new(self.address().clone());
        let result = match self.job.entry.action {
            Action::Create => self.create(&mut lifecycle).await,
            Action::Update => self.update(&mut lifecycle).await,
            Action::Delete => self.delete(&mut lifecycle).await,
            Action::Replace => match self.delete(&mut lifecycle).await {
                done if done.outcome != ApplyOutcome::Deleted => done,
                _ => {
                    let mut created = self.create(&mut lifecycle).await;
                    match created.outcome {
                        ApplyOutcome::Created => created.outcome = ApplyOutcome::Replaced,
                        // The old object is gone; forget it.
                        ApplyOutcome::Failed | ApplyOutcome::NotApplied => {
                            created.change = StateChange::Remove;
                        },
                        _ => {},
                    }
                    created
                },
            },
            Action::NoOp | Action::Read => {
                JobResult::new(self.address().clone(), ApplyOutcome::Unchanged, StateChange::Keep)
            },
        };
        info!(address = %self.address(), outcome = %result.outcome, "Apply finished");
        result
    }

    fn cancelled_before_start(&self, lifecycle: &mut Lifecycle, err: &ProviderError) -> Option<JobResult> {
        if matches!(err, ProviderError::Cancelled) {
            lifecycle.enter(LifecycleState::Failed);
            return Some(
                JobResult::new(self.address().clone(), ApplyOutcome::NotApplied, StateChange::Keep)
                    .with_diagnostic(
                        Diagnostic::warning("Apply cancelled").with_detail(format!("{} was not started", self.address())),
                    ),
            );
        }
        None
    }

    fn tainted(&self, lifecycle: &mut Lifecycle, mut state: ResourceState, operation: &str, err: &ProviderError) -> JobResult {
        lifecycle.enter(LifecycleState::Tainted);
        warn!(address = %self.address(), error = %err, "Remote state unknown; marking tainted");
        state.tainted = true;
        JobResult::new(self.address().clone(), ApplyOutcome::Tainted, StateChange::Upsert(state))
            .with_diagnostic(failure(self.address(), operation, err))
    }

    async fn create(&self, lifecycle: &mut Lifecycle) -> JobResult {
        let planned = &self.job.entry.planned;
        let timeout = self.schema.timeout(TimeoutKind::Create, planned);
        let deadline = Instant::now() + timeout;

        lifecycle.enter(LifecycleState::Creating);
        let created = match self.adapter.create(planned, timeout).await {
            Ok(created) => created,
            Err(err) => {
                if let Some(result) = self.cancelled_before_start(lifecycle, &err) {
                    return result;
                }
                lifecycle.enter(LifecycleState::Failed);
                return JobResult::new(self.address().clone(), ApplyOutcome::Failed, StateChange::Keep)
                    .with_diagnostic(failure(self.address(), "create", &err));
            },
        };

        let mut state = ResourceState::new(
            self.address().clone(),
            self.schema.version,
            Some(created.external_id.clone()),
            planned,
        );
        state.dependencies = self.job.entry.dependencies.clone();
        // A closed channel means the executor is gone; the result carries
        // the same state.
        let _ = self.job.progress.send(Progress::Created(state.clone()));

        if let Some(event) = created.await_event {
            lifecycle.enter(LifecycleState::AwaitingCreate);
            if let Err(err) = self.adapter.await_event(event, remaining(deadline)).await {
                return self.tainted(lifecycle, state, "create", &err);
            }
        }

        let update_timeout = self.schema.timeout(TimeoutKind::Update, planned);
        lifecycle.enter(LifecycleState::Configuring);
        match self
            .adapter
            .configure_created(&created.external_id, planned, update_timeout)
            .await
        {
            Ok(None) => {},
            Ok(Some(event)) => {
                lifecycle.enter(LifecycleState::AwaitingUpdate);
                if let Err(err) = self.adapter.await_event(event, update_timeout).await {
                    return self.tainted(lifecycle, state, "configure after create", &err);
                }
            },
            Err(err) => return self.tainted(lifecycle, state, "configure after create", &err),
        }

        lifecycle.enter(LifecycleState::Reading);
        let read_timeout = self.schema.timeout(TimeoutKind::Read, planned);
        match self
            .adapter
            .refresh(&created.external_id, planned, read_timeout)
            .await
        {
            Ok(value) => {
                lifecycle.enter(LifecycleState::Settled);
                state.set_value(&value);
                JobResult::new(self.address().clone(), ApplyOutcome::Created, StateChange::Upsert(state))
            },
            Err(err) => self.tainted(lifecycle, state, "read after create", &err),
        }
    }

    async fn update(&self, lifecycle: &mut Lifecycle) -> JobResult {
        let entry = &self.job.entry;
        let (Some(prior_state), Some(prior)) = (self.prior, entry.prior.as_ref()) else {
            return self.create(lifecycle).await;
        };
        let Some(external_id) = prior_state.external_id.as_deref() else {
            return self.create(lifecycle).await;
        };

        let timeout = self.schema.timeout(TimeoutKind::Update, &entry.planned);
        let deadline = Instant::now() + timeout;
        let changed = changed_attributes(self.schema, entry);
        let request = UpdateRequest {
            external_id,
            prior,
            planned: &entry.planned,
            changed: &changed,
        };

        lifecycle.enter(LifecycleState::Updating);
        let event = match self.adapter.update(&request, timeout).await {
            Ok(event) => event,
            Err(err) if err.is_not_found() => {
                warn!(address = %self.address(), "Remote object disappeared; creating it again");
                let mut result = self.create(lifecycle).await;
                result.diagnostics.insert(
                    0,
                    Diagnostic::warning("Resource no longer exists")
                        .with_detail(format!("{} was deleted outside of apply and was created again", self.address())),
                );
                return result;
            },
            Err(err) => {
                if let Some(result) = self.cancelled_before_start(lifecycle, &err) {
                    return result;
                }
                lifecycle.enter(LifecycleState::Failed);
                return JobResult::new(self.address().clone(), ApplyOutcome::Failed, StateChange::Keep)
                    .with_diagnostic(failure(self.address(), "update", &err));
            },
        };

        let mut state = prior_state.clone();
        state.dependencies = entry.dependencies.clone();
        if let Some(event) = event {
            lifecycle.enter(LifecycleState::AwaitingUpdate);
            if let Err(err) = self.adapter.await_event(event, remaining(deadline)).await {
                return self.tainted(lifecycle, state, "update", &err);
            }
        }

        lifecycle.enter(LifecycleState::Reading);
        let read_timeout = self.schema.timeout(TimeoutKind::Read, &entry.planned);
        match self
            .adapter
            .refresh(external_id, &entry.planned, read_timeout)
            .await
        {
            Ok(value) => {
                lifecycle.enter(LifecycleState::Settled);
                state.set_value(&value);
                state.tainted = false;
                JobResult::new(self.address().clone(), ApplyOutcome::Updated, StateChange::Upsert(state))
            },
            Err(err) => self.tainted(lifecycle, state, "read after update", &err),
        }
    }

    async fn delete(&self, lifecycle: &mut Lifecycle) -> JobResult {
        let deleted = || JobResult::new(self.address().clone(), ApplyOutcome::Deleted, StateChange::Remove);
        let Some(prior_state) = self.prior else {
            return deleted();
        };
        let Some(external_id) = prior_state.external_id.as_deref() else {
            return deleted();
        };

        let prior = self.job.entry.prior.clone().unwrap_or_else(|| Value::null(self.schema.value_type()));
        let timeout = self.schema.timeout(TimeoutKind::Delete, &prior);
        let deadline = Instant::now() + timeout;

        lifecycle.enter(LifecycleState::Deleting);
        let event = match self.adapter.delete(external_id, timeout).await {
            Ok(event) => event,
            Err(err) => {
                if let Some(result) = self.cancelled_before_start(lifecycle, &err) {
                    return result;
                }
                lifecycle.enter(LifecycleState::Failed);
                return JobResult::new(self.address().clone(), ApplyOutcome::Failed, StateChange::Keep)
                    .with_diagnostic(failure(self.address(), "delete", &err));
            },
        };

        if let Some(event) = event {
            lifecycle.enter(LifecycleState::AwaitingDelete);
            if let Err(err) = self.adapter.await_event(event, remaining(deadline)).await {
                return self.tainted(lifecycle, prior_state.clone(), "delete", &err);
            }
        }

        lifecycle.enter(LifecycleState::Deleted);
        deleted()
    }
}

// ── Executor side ────────────────────────────────────────────────────

enum Prepared {
    Run(Job),
    Skip(ApplyOutcome),
    Fail(Vec<Diagnostic>),
}

/// Applies plans and persists the results.
pub struct Executor<'a> {
    provider: &'a Provider,
    planner: Planner<'a>,
    ctx: &'a ProviderContext,
    store: &'a StateStore,
}

impl<'a> Executor<'a> {
    /// An executor writing to `store`.
    pub fn new(
        provider: &'a Provider,
        planner: Planner<'a>,
        ctx: &'a ProviderContext,
        store: &'a StateStore,
    ) -> Self {
        Self {
            provider,
            planner,
            ctx,
            store,
        }
    }

    /// Which plan entries must finish before each entry may start.
    fn prerequisites(pending: &[&PlanEntry]) -> HashMap<Address, Vec<Address>> {
        let in_plan: HashSet<&Address> = pending.iter().map(|e| &e.address).collect();
        pending
            .iter()
            .map(|entry| {
                let prereqs = if entry.action == Action::Delete {
                    pending
                        .iter()
                        .filter(|other| matches!(other.action, Action::Delete | Action::Replace))
                        .filter(|other| other.dependencies.contains(&entry.address))
                        .map(|other| other.address.clone())
                        .collect()
                } else {
                    entry
                        .dependencies
                        .iter()
                        .filter(|d| in_plan.contains(d))
                        .cloned()
                        .collect()
                };
                (entry.address.clone(), prereqs)
            })
            .collect()
    }

    fn prepare(
        &self,
        entry: &PlanEntry,
        doc: &StateDocument,
        changed: &HashSet<Address>,
        progress: &mpsc::UnboundedSender<Progress>,
    ) -> Prepared {
        let address = &entry.address;
        let stale = entry.dependencies.iter().any(|d| changed.contains(d));

        if address.is_data() {
            let source = match self.provider.data_source(&address.kind) {
                Ok(source) => source,
                Err(e) => return Prepared::Fail(vec![e.to_diagnostic()]),
            };
            let Some(decl) = self.planner.configuration().get(address) else {
                return Prepared::Skip(ApplyOutcome::Unchanged);
            };
            let values = self.planner.state_values(doc);
            let (config, diagnostics) = self.planner.decode(decl, &source.schema(), &values);
            if has_errors(&diagnostics) {
                return Prepared::Fail(diagnostics);
            }
            if config.contains_unknown() {
                return Prepared::Fail(vec![Diagnostic::error("Data source configuration is not known")
                    .with_detail(format!("{address} depends on values that were not applied"))]);
            }
            return Prepared::Run(Job {
                entry: entry.clone(),
                kind: JobKind::Data { source, config },
                ctx: self.ctx.clone(),
                progress: progress.clone(),
            });
        }

        let entry = if stale {
            let values = self.planner.state_values(doc);
            let (fresh, diagnostics) = self.planner.plan_address(address, doc, &values);
            if has_errors(&diagnostics) {
                return Prepared::Fail(diagnostics);
            }
            match fresh {
                Some(fresh) if fresh.action == Action::NoOp => return Prepared::Skip(ApplyOutcome::Unchanged),
                Some(fresh) => {
                    debug!(address = %address, action = %fresh.action, "Re-planned against applied dependencies");
                    fresh
                },
                None => return Prepared::Fail(diagnostics),
            }
        } else {
            entry.clone()
        };

        let (resource, schema) = match (
            self.provider.resource(&address.kind),
            self.provider.schemas().resource(&address.kind),
        ) {
            (Ok(resource), Ok(schema)) => (resource, schema),
            (Err(e), _) | (_, Err(e)) => return Prepared::Fail(vec![e.to_diagnostic()]),
        };

        if entry.action != Action::Delete {
            let diagnostics: Vec<Diagnostic> = validate(&schema, &entry.planned, Phase::Apply)
                .into_iter()
                .filter(Diagnostic::is_error)
                .collect();
            if !diagnostics.is_empty() {
                return Prepared::Fail(diagnostics);
            }
        }

        Prepared::Run(Job {
            kind: JobKind::Managed {
                resource,
                schema,
                prior: doc.get(address).cloned(),
            },
            entry,
            ctx: self.ctx.clone(),
            progress: progress.clone(),
        })
    }

    fn persist(&self, doc: &mut StateDocument, report: &mut ApplyReport) -> bool {
        match self.store.persist(doc) {
            Ok(()) => true,
            Err(e) => {
                report
                    .diagnostics
                    .push(Diagnostic::error("Failed to persist state").with_detail(e.to_string()));
                false
            },
        }
    }

    fn record_progress(&self, progress: Progress, doc: &mut StateDocument, report: &mut ApplyReport) -> bool {
        match progress {
            Progress::Created(state) => {
                debug!(address = %state.address, external_id = ?state.external_id, "Recording new remote ID");
                doc.upsert(state);
                self.persist(doc, report)
            },
        }
    }

    fn record_result(&self, result: JobResult, doc: &mut StateDocument, report: &mut ApplyReport) -> bool {
        let mut ok = result.outcome.succeeded() && !has_errors(&result.diagnostics);
        let persist = match result.change {
            StateChange::Keep => false,
            StateChange::Upsert(state) => {
                doc.upsert(state);
                true
            },
            StateChange::Remove => {
                doc.remove(&result.address);
                true
            },
            StateChange::Data(value) => {
                doc.data.insert(result.address.clone(), value);
                false
            },
        };
        if persist {
            ok &= self.persist(doc, report);
        }
        report.diagnostics.extend(result.diagnostics);
        report.outcomes.push((result.address, result.outcome));
        ok
    }

    /// Apply `plan`, mutating and persisting `doc` as resources settle.
    #[instrument(skip_all, fields(entries = plan.entries.len()))]
    pub async fn apply(&self, plan: &Plan, doc: &mut StateDocument) -> ApplyReport {
        let mut report = ApplyReport::default();
        if plan.has_errors() {
            report
                .diagnostics
                .push(Diagnostic::error("Plan has errors; nothing was applied"));
            return report;
        }

        let mut waiting: Vec<&PlanEntry> = plan
            .entries
            .iter()
            .filter(|e| e.action != Action::NoOp)
            .collect();
        let prerequisites = Self::prerequisites(&waiting);
        let width = self.ctx.config.parallelism.max(1);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut running: JoinSet<JobResult> = JoinSet::new();
        let mut settled: HashMap<Address, bool> = HashMap::new();
        let mut changed: HashSet<Address> = HashSet::new();
        let mut stopped = false;

        loop {
            if !stopped && self.ctx.cancel.is_cancelled() {
                warn!("Apply cancelled; no new work will start");
                report.diagnostics.push(Diagnostic::warning("Apply cancelled"));
                stopped = true;
            }

            if !stopped {
                let mut i = 0;
                while i < waiting.len() && running.len() < width && !stopped {
                    let entry = waiting[i];
                    let prereqs = prerequisites.get(&entry.address).map(Vec::as_slice).unwrap_or_default();
                    if prereqs.iter().any(|p| settled.get(p) == Some(&false)) {
                        waiting.remove(i);
                        settled.insert(entry.address.clone(), false);
                        report.outcomes.push((entry.address.clone(), ApplyOutcome::NotApplied));
                        continue;
                    }
                    if !prereqs.iter().all(|p| settled.contains_key(p)) {
                        i += 1;
                        continue;
                    }

                    waiting.remove(i);
                    match self.prepare(entry, doc, &changed, &progress_tx) {
                        Prepared::Run(job) => {
                            debug!(address = %entry.address, action = %job.entry.action, "Starting");
                            running.spawn(run_job(job));
                        },
                        Prepared::Skip(outcome) => {
                            settled.insert(entry.address.clone(), true);
                            report.outcomes.push((entry.address.clone(), outcome));
                        },
                        Prepared::Fail(diagnostics) => {
                            settled.insert(entry.address.clone(), false);
                            report.diagnostics.extend(diagnostics);
                            report.outcomes.push((entry.address.clone(), ApplyOutcome::Failed));
                            stopped = true;
                        },
                    }
                }
            }

            if running.is_empty() {
                let ready = waiting.iter().any(|e| {
                    prerequisites
                        .get(&e.address)
                        .map_or(true, |p| p.iter().all(|a| settled.contains_key(a)))
                });
                if !stopped && !waiting.is_empty() && !ready {
                    report.diagnostics.push(
                        Diagnostic::error("Plan entries wait on each other")
                            .with_detail(
                                waiting
                                    .iter()
                                    .map(|e| e.address.to_string())
                                    .collect::<Vec<_>>()
                                    .join(", "),
                            ),
                    );
                }
                if stopped || waiting.is_empty() || !ready {
                    break;
                }
                continue;
            }

            tokio::select! {
                biased;
                Some(progress) = progress_rx.recv() => {
                    if !self.record_progress(progress, doc, &mut report) {
                        stopped = true;
                    }
                },
                Some(joined) = running.join_next() => {
                    // Progress is always sent before the result; take it first.
                    while let Ok(progress) = progress_rx.try_recv() {
                        if !self.record_progress(progress, doc, &mut report) {
                            stopped = true;
                        }
                    }
                    match joined {
                        Ok(result) => {
                            let address = result.address.clone();
                            if result.outcome.changed_values() {
                                changed.insert(address.clone());
                            }
                            let ok = self.record_result(result, doc, &mut report);
                            settled.insert(address, ok);
                            if !ok {
                                stopped = true;
                            }
                        },
                        Err(e) => {
                            report.diagnostics.push(Diagnostic::error("Apply task failed").with_detail(e.to_string()));
                            stopped = true;
                        },
                    }
                },
            }
        }

        for entry in waiting {
            report.outcomes.push((entry.address.clone(), ApplyOutcome::NotApplied));
        }
        info!(
            created = report.count(ApplyOutcome::Created),
            updated = report.count(ApplyOutcome::Updated),
            replaced = report.count(ApplyOutcome::Replaced),
            deleted = report.count(ApplyOutcome::Deleted),
            errors = report.has_errors(),
            "Apply complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, ProviderConfig};
    use crate::testing::FakeResource;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        provider: Provider,
        fake: FakeResource,
        ctx: ProviderContext,
        store: StateStore,
        _dir: TempDir,
    }

    fn harness(parallelism: usize) -> Harness {
        harness_with(
            FakeResource::new("linode_fake"),
            ProviderConfig {
                api_url: "http://127.0.0.1:9".to_string(),
                parallelism,
                min_retry_delay_ms: 1,
                max_retry_delay_ms: 2,
                ..ProviderConfig::default()
            },
        )
    }

    /// A harness whose creates wait on `fake_create` events served by
    /// `server`.
    fn awaiting_harness(server: &MockServer) -> Harness {
        harness_with(
            FakeResource::new("linode_fake").with_await("fake", "fake_create"),
            ProviderConfig {
                api_url: server.uri(),
                event_poll_ms: 10,
                event_poll_max_ms: 20,
                min_retry_delay_ms: 1,
                max_retry_delay_ms: 2,
                ..ProviderConfig::default()
            },
        )
    }

    fn harness_with(fake: FakeResource, config: ProviderConfig) -> Harness {
        let provider = Provider::new().with_resource(fake.clone()).unwrap();
        let ctx = ProviderContext::new(config).unwrap();
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        Harness {
            provider,
            fake,
            ctx,
            store,
            _dir: dir,
        }
    }

    fn configuration(doc: serde_json::Value) -> Configuration {
        Configuration::from_json_str(&doc.to_string()).unwrap()
    }

    fn addr(name: &str) -> Address {
        Address::managed("linode_fake", name)
    }

    async fn serve_events(server: &MockServer, events: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/v4/account/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": events, "page": 1, "pages": 1, "results": 1
            })))
            .mount(server)
            .await;
    }

    /// Poll the state file until `address` has been written.
    async fn persisted(store: &StateStore, address: &Address) -> ResourceState {
        let poll = async {
            loop {
                if let Some(state) = store.load().ok().and_then(|doc| doc.get(address).cloned()) {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .expect("state was never persisted")
    }

    async fn plan_and_apply(h: &Harness, config: &Configuration, doc: &mut StateDocument) -> ApplyReport {
        let planner = Planner::new(&h.provider, config);
        let plan = planner.plan(&h.ctx, doc).await;
        assert!(!plan.has_errors(), "{:?}", plan.diagnostics);
        Executor::new(&h.provider, planner, &h.ctx, &h.store)
            .apply(&plan, doc)
            .await
    }

    #[tokio::test]
    async fn test_dependent_sees_applied_values() {
        let h = harness(4);
        let config = configuration(json!({
            "resources": [
                {"kind": "linode_fake", "name": "app", "attributes": {"label": "${linode_fake.db.host}"}},
                {"kind": "linode_fake", "name": "db", "attributes": {"label": "db"}}
            ]
        }));
        let mut doc = StateDocument::new();
        let report = plan_and_apply(&h, &config, &mut doc).await;
        assert!(!report.has_errors(), "{:?}", report.diagnostics);
        assert_eq!(report.outcome(&addr("db")), Some(ApplyOutcome::Created));
        assert_eq!(report.outcome(&addr("app")), Some(ApplyOutcome::Created));

        let calls = h.fake.remote().calls();
        let db = calls.iter().position(|c| c == "create db").unwrap();
        let app = calls.iter().position(|c| c == "create db.example").unwrap();
        assert!(db < app, "{calls:?}");

        let persisted = h.store.load().unwrap();
        assert_eq!(persisted.resources.len(), 2);
        assert!(persisted.serial >= 2);
    }

    #[tokio::test]
    async fn test_reapply_is_noop() {
        let h = harness(2);
        let config = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a", "size": 3}}]
        }));
        let mut doc = StateDocument::new();
        plan_and_apply(&h, &config, &mut doc).await;

        let planner = Planner::new(&h.provider, &config);
        let plan = planner.plan(&h.ctx, &mut doc).await;
        assert!(!plan.has_changes(), "{}", plan.render());
    }

    #[tokio::test]
    async fn test_update_not_found_recreates() {
        let h = harness(1);
        let mut doc = StateDocument::new();
        let v1 = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a"}}]
        }));
        plan_and_apply(&h, &v1, &mut doc).await;

        let id = doc.get(&addr("a")).unwrap().external_id.clone().unwrap();
        h.fake.remote().remove(&id);

        let v2 = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "b"}}]
        }));
        let report = plan_and_apply(&h, &v2, &mut doc).await;
        assert!(!report.has_errors(), "{:?}", report.diagnostics);
        assert_eq!(report.outcome(&addr("a")), Some(ApplyOutcome::Created));
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.summary == "Resource no longer exists"));
        assert_ne!(doc.get(&addr("a")).unwrap().external_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_failure_stops_dependents() {
        let h = harness(1);
        h.fake.remote().fail_next(
            "create",
            ProviderError::RemotePermanent {
                status: 400,
                message: "bad region".to_string(),
            },
        );
        let config = configuration(json!({
            "resources": [
                {"kind": "linode_fake", "name": "db", "attributes": {"label": "db"}},
                {"kind": "linode_fake", "name": "app", "attributes": {"label": "${linode_fake.db.host}"}}
            ]
        }));
        let mut doc = StateDocument::new();
        let report = plan_and_apply(&h, &config, &mut doc).await;
        assert!(report.has_errors());
        assert_eq!(report.outcome(&addr("db")), Some(ApplyOutcome::Failed));
        assert_eq!(report.outcome(&addr("app")), Some(ApplyOutcome::NotApplied));
        assert!(doc.get(&addr("db")).is_none());
    }

    #[tokio::test]
    async fn test_replace_deletes_before_creating() {
        let h = harness(1);
        let mut doc = StateDocument::new();
        let v1 = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a", "region": "us-east"}}]
        }));
        plan_and_apply(&h, &v1, &mut doc).await;
        let old = doc.get(&addr("a")).unwrap().external_id.clone().unwrap();

        let v2 = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a", "region": "eu-west"}}]
        }));
        let report = plan_and_apply(&h, &v2, &mut doc).await;
        assert_eq!(report.outcome(&addr("a")), Some(ApplyOutcome::Replaced));

        let calls = h.fake.remote().calls();
        let delete = calls.iter().position(|c| *c == format!("delete {old}")).unwrap();
        let create = calls.iter().rposition(|c| c == "create a").unwrap();
        assert!(delete < create, "{calls:?}");
        assert!(!h.fake.remote().contains(&old));
    }

    #[tokio::test]
    async fn test_orphan_is_deleted() {
        let h = harness(2);
        let mut doc = StateDocument::new();
        let v1 = configuration(json!({
            "resources": [
                {"kind": "linode_fake", "name": "a", "attributes": {"label": "a"}},
                {"kind": "linode_fake", "name": "b", "attributes": {"label": "b"}}
            ]
        }));
        plan_and_apply(&h, &v1, &mut doc).await;

        let v2 = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a"}}]
        }));
        let report = plan_and_apply(&h, &v2, &mut doc).await;
        assert_eq!(report.outcome(&addr("b")), Some(ApplyOutcome::Deleted));
        assert!(doc.get(&addr("b")).is_none());
        assert_eq!(h.store.load().unwrap().resources.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(1);
        h.ctx.cancel.cancel();
        let config = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a"}}]
        }));
        let mut doc = StateDocument::new();
        let report = plan_and_apply(&h, &config, &mut doc).await;
        assert_eq!(report.outcome(&addr("a")), Some(ApplyOutcome::NotApplied));
        assert!(h.fake.remote().calls().is_empty());
    }

    #[test]
    fn test_changed_attributes_skip_computed_and_timeouts() {
        let schema = FakeResource::new("linode_fake").schema();
        let entry = PlanEntry {
            address: addr("a"),
            action: Action::Update,
            prior: None,
            planned: Value::null(schema.value_type()),
            diff: ["label", "host", TIMEOUTS_BLOCK]
                .iter()
                .map(|name| crate::types::AttributeDiff {
                    path: crate::value::AttributePath::parse(name),
                    from: Value::string("x"),
                    to: Value::string("y"),
                    requires_replace: false,
                    sensitive: false,
                })
                .collect(),
            replace_triggers: Vec::new(),
            dependencies: Vec::new(),
        };
        assert_eq!(changed_attributes(&schema, &entry), vec!["label".to_string()]);
    }

    #[tokio::test]
    async fn test_create_persists_id_before_await_finishes() {
        let server = MockServer::start().await;
        serve_events(&server, json!([])).await;
        let h = awaiting_harness(&server);
        let config = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a"}}]
        }));
        let mut doc = StateDocument::new();
        let planner = Planner::new(&h.provider, &config);
        let plan = planner.plan(&h.ctx, &mut doc).await;
        let executor = Executor::new(&h.provider, planner, &h.ctx, &h.store);

        let observe = async {
            let recorded = persisted(&h.store, &addr("a")).await;
            assert_eq!(recorded.external_id.as_deref(), Some("1001"));
            assert!(!recorded.tainted);
            // Still waiting on the event: nothing has been read back.
            assert_eq!(h.fake.remote().calls(), vec!["create a"]);

            Mock::given(method("GET"))
                .and(path("/v4/account/events"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "data": [{
                        "id": 11,
                        "action": "fake_create",
                        "status": "finished",
                        "entity": {"id": 1001, "type": "fake", "label": "a"},
                        "created": "2024-01-01T00:00:00"
                    }],
                    "page": 1, "pages": 1, "results": 1
                })))
                .with_priority(1)
                .mount(&server)
                .await;
        };
        let (report, ()) = tokio::join!(executor.apply(&plan, &mut doc), observe);

        assert!(!report.has_errors(), "{:?}", report.diagnostics);
        assert_eq!(report.outcome(&addr("a")), Some(ApplyOutcome::Created));
        assert_eq!(h.fake.remote().calls(), vec!["create a", "read 1001"]);
        let stored = h.store.load().unwrap();
        let stored = stored.get(&addr("a")).unwrap();
        assert!(!stored.tainted);
        assert_eq!(stored.attributes["host"], "a.example");
    }

    #[tokio::test]
    async fn test_cancel_during_await_taints() {
        let server = MockServer::start().await;
        serve_events(&server, json!([])).await;
        let h = awaiting_harness(&server);
        let config = configuration(json!({
            "resources": [{"kind": "linode_fake", "name": "a", "attributes": {"label": "a"}}]
        }));
        let mut doc = StateDocument::new();
        let planner = Planner::new(&h.provider, &config);
        let plan = planner.plan(&h.ctx, &mut doc).await;
        let executor = Executor::new(&h.provider, planner, &h.ctx, &h.store);

        let cancel_once_created = async {
            persisted(&h.store, &addr("a")).await;
            h.ctx.cancel.cancel();
        };
        let (report, ()) = tokio::join!(executor.apply(&plan, &mut doc), cancel_once_created);

        assert_eq!(report.outcome(&addr("a")), Some(ApplyOutcome::Tainted));
        assert!(report.has_errors());
        let stored = h.store.load().unwrap();
        let stored = stored.get(&addr("a")).unwrap();
        assert!(stored.tainted);
        assert_eq!(stored.external_id.as_deref(), Some("1001"));
        assert!(h.fake.remote().contains("1001"));
    }
}
