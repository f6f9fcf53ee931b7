//! `linode_database_postgresql`: a managed PostgreSQL cluster.

use super::{optional_str, required_str};
use crate::error::ProviderError;
use crate::events::EventFilter;
use crate::planmodifier::{
    use_state_for_unknown, use_state_for_unknown_if_not_null,
    use_state_for_unknown_unless_these_changed,
};
use crate::provider::{Created, ProviderContext, ResourceType, UpdateRequest};
use crate::schema::{Attribute, Block, NestedBlock, Schema, Timeouts, TIMEOUTS_BLOCK};
use crate::state::StateUpgrader;
use crate::validators::{int_between, matches_regex, one_of};
use crate::value::{Value, ValueType};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::time::Duration;
use tracing::debug;

const PATH: &str = "databases/postgresql/instances";
const ENTITY_TYPE: &str = "database";

/// Maintenance days, numbered from 1 on the wire.
const DAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

#[derive(Debug, Deserialize)]
struct Hosts {
    primary: Option<String>,
    secondary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Database {
    id: u64,
    label: String,
    region: String,
    #[serde(rename = "type")]
    plan_type: String,
    engine: String,
    version: String,
    #[serde(default)]
    cluster_size: i64,
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    ssl_connection: bool,
    replication_type: Option<String>,
    replication_commit_type: Option<String>,
    #[serde(default)]
    allow_list: Vec<String>,
    status: Option<String>,
    created: Option<String>,
    updated: Option<String>,
    hosts: Option<Hosts>,
    port: Option<i64>,
    updates: Option<MaintenanceWindow>,
}

#[derive(Debug, Serialize)]
struct WindowUpdate<'a> {
    updates: &'a MaintenanceWindow,
}

/// The `updates` maintenance window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MaintenanceWindow {
    day_of_week: u8,
    duration: i64,
    frequency: String,
    hour_of_day: i64,
    #[serde(default)]
    week_of_month: Option<i64>,
}

impl MaintenanceWindow {
    fn block() -> Block {
        Block::new()
            .with_description("Automated patch update maintenance.")
            .with_attribute(
                "day_of_week",
                Attribute::required_string().with_validator(one_of(DAYS)),
            )
            .with_attribute(
                "duration",
                Attribute::required_int64()
                    .with_description("Maximum window length in hours.")
                    .with_validator(int_between(1, 3)),
            )
            .with_attribute(
                "frequency",
                Attribute::required_string().with_validator(one_of(["weekly", "monthly"])),
            )
            .with_attribute(
                "hour_of_day",
                Attribute::required_int64()
                    .with_description("Start hour, UTC.")
                    .with_validator(int_between(1, 23)),
            )
            .with_attribute(
                "week_of_month",
                Attribute::optional_int64()
                    .with_description("Required for monthly frequency.")
                    .with_validator(int_between(1, 4)),
            )
    }

    fn value_type() -> ValueType {
        ValueType::list(Self::block().value_type())
    }

    fn to_value(&self) -> Value {
        let day = DAYS.get(usize::from(self.day_of_week).wrapping_sub(1)).copied();
        Value::object([
            ("day_of_week", optional_str(day)),
            ("duration", Value::int64(self.duration)),
            ("frequency", Value::string(self.frequency.clone())),
            ("hour_of_day", Value::int64(self.hour_of_day)),
            (
                "week_of_month",
                self.week_of_month
                    .map(Value::int64)
                    .unwrap_or_else(|| Value::null(ValueType::Int64)),
            ),
        ])
    }

    /// The configured window, or `None` when the block is unset or left to
    /// the remote.
    fn from_planned(planned: &Value) -> Result<Option<Self>, ProviderError> {
        let Some(window) = planned
            .attr("updates")
            .and_then(Value::elements)
            .and_then(|items| items.first())
        else {
            return Ok(None);
        };

        let day = required_str(window, "day_of_week")?;
        let day_of_week = DAYS
            .iter()
            .position(|d| *d == day)
            .map(|i| i as u8 + 1)
            .ok_or_else(|| ProviderError::Config(format!("invalid day of week: {day}")))?;
        let int = |name: &str| {
            window
                .attr(name)
                .and_then(Value::as_i64)
                .ok_or_else(|| ProviderError::Config(format!("updates.{name} is not known")))
        };
        Ok(Some(Self {
            day_of_week,
            duration: int("duration")?,
            frequency: required_str(window, "frequency")?,
            hour_of_day: int("hour_of_day")?,
            week_of_month: window.attr("week_of_month").and_then(Value::as_i64),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct Ssl {
    ca_certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest {
    label: String,
    region: String,
    #[serde(rename = "type")]
    plan_type: String,
    engine: String,
    cluster_size: i64,
    encrypted: bool,
    ssl_connection: bool,
    replication_type: String,
    replication_commit_type: String,
    allow_list: Vec<String>,
}

/// The `engine/<major version>` slug.
fn engine_slug(engine: &str, version: &str) -> String {
    let major = version.split('.').next().unwrap_or(version);
    format!("{engine}/{major}")
}

/// Fold legacy `engine` + `version` attributes into `engine_id`.
fn upgrade_v0(attributes: &Json) -> Result<Json, String> {
    let mut obj = attributes
        .as_object()
        .cloned()
        .ok_or_else(|| "expected an object".to_string())?;
    if obj.get("engine_id").and_then(Json::as_str).is_none() {
        let engine = obj.get("engine").and_then(Json::as_str);
        let version = obj.get("version").and_then(Json::as_str);
        if let (Some(engine), Some(version)) = (engine, version) {
            obj.insert("engine_id".to_string(), Json::String(engine_slug(engine, version)));
        } else {
            return Err("cannot derive engine_id without engine and version".to_string());
        }
    }
    Ok(Json::Object(obj))
}

/// The `linode_database_postgresql` resource kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDatabase;

impl PostgresDatabase {
    fn to_value(db: Database, ssl: Ssl, creds: Credentials, prior: &Value) -> Value {
        let hosts = db.hosts.unwrap_or(Hosts {
            primary: None,
            secondary: None,
        });
        Value::object([
            ("id", Value::string(db.id.to_string())),
            ("label", Value::string(db.label)),
            ("region", Value::string(db.region)),
            ("engine_id", Value::string(engine_slug(&db.engine, &db.version))),
            ("type", Value::string(db.plan_type)),
            ("cluster_size", Value::int64(db.cluster_size)),
            ("encrypted", Value::bool(db.encrypted)),
            ("ssl_connection", Value::bool(db.ssl_connection)),
            ("replication_type", optional_str(db.replication_type.as_deref())),
            (
                "replication_commit_type",
                optional_str(db.replication_commit_type.as_deref()),
            ),
            (
                "allow_list",
                Value::set(
                    ValueType::String,
                    db.allow_list.into_iter().map(Value::string).collect(),
                ),
            ),
            ("engine", Value::string(db.engine)),
            ("version", Value::string(db.version)),
            ("ca_cert", optional_str(ssl.ca_certificate.as_deref())),
            ("root_username", Value::string(creds.username)),
            ("root_password", Value::string(creds.password)),
            ("created", optional_str(db.created.as_deref())),
            ("updated", optional_str(db.updated.as_deref())),
            ("status", optional_str(db.status.as_deref())),
            ("host_primary", optional_str(hosts.primary.as_deref())),
            ("host_secondary", optional_str(hosts.secondary.as_deref())),
            (
                "port",
                db.port
                    .map(Value::int64)
                    .unwrap_or_else(|| Value::null(ValueType::Int64)),
            ),
            (
                "updates",
                match db.updates {
                    Some(window) => Value::list(
                        MaintenanceWindow::block().value_type(),
                        vec![window.to_value()],
                    ),
                    None => Value::null(MaintenanceWindow::value_type()),
                },
            ),
            (TIMEOUTS_BLOCK, prior.attr_or_null(TIMEOUTS_BLOCK)),
        ])
    }
}

#[async_trait]
impl ResourceType for PostgresDatabase {
    fn kind(&self) -> &str {
        "linode_database_postgresql"
    }

    fn schema(&self) -> Schema {
        Schema::new(1)
            .with_attribute(
                "id",
                Attribute::computed_string().with_plan_modifier(use_state_for_unknown()),
            )
            .with_attribute(
                "label",
                Attribute::required_string()
                    .with_description("A unique, user-defined label for the database.")
                    .with_validator(crate::validators::string_len(3, 32)),
            )
            .with_attribute("region", Attribute::required_string().with_requires_replace())
            .with_attribute(
                "engine_id",
                Attribute::required_string()
                    .with_description("The engine and version, e.g. postgresql/16.")
                    .with_requires_replace()
                    .with_validator(matches_regex(
                        r"^[a-z]+/[0-9][0-9.]*$",
                        "must be in the form engine/version",
                    )),
            )
            .with_attribute("type", Attribute::required_string().with_requires_replace())
            .with_attribute(
                "cluster_size",
                Attribute::optional_int64()
                    .with_default(Value::int64(1))
                    .with_requires_replace()
                    .with_validator(int_between(1, 3)),
            )
            .with_attribute(
                "encrypted",
                Attribute::optional_bool()
                    .with_default(Value::bool(false))
                    .with_requires_replace(),
            )
            .with_attribute(
                "ssl_connection",
                Attribute::optional_bool().with_default(Value::bool(false)),
            )
            .with_attribute(
                "replication_type",
                Attribute::optional_string()
                    .with_default(Value::string("none"))
                    .with_validator(one_of(["none", "asynch", "semi_synch"])),
            )
            .with_attribute(
                "replication_commit_type",
                Attribute::optional_string()
                    .with_default(Value::string("off"))
                    .with_validator(one_of(["on", "off", "local", "remote_write", "remote_apply"])),
            )
            .with_attribute(
                "allow_list",
                Attribute::optional_computed(ValueType::set(ValueType::String))
                    .with_description("IP ranges allowed to connect.")
                    .with_plan_modifier(use_state_for_unknown()),
            )
            .with_attribute(
                "engine",
                Attribute::computed_string()
                    .with_plan_modifier(use_state_for_unknown_unless_these_changed(&["engine_id"])),
            )
            .with_attribute(
                "version",
                Attribute::computed_string()
                    .with_plan_modifier(use_state_for_unknown_unless_these_changed(&["engine_id"])),
            )
            .with_attribute(
                "ca_cert",
                Attribute::computed_string()
                    .sensitive()
                    .with_plan_modifier(use_state_for_unknown()),
            )
            .with_attribute(
                "root_username",
                Attribute::computed_string()
                    .sensitive()
                    .with_plan_modifier(use_state_for_unknown()),
            )
            .with_attribute(
                "root_password",
                Attribute::computed_string()
                    .sensitive()
                    .with_plan_modifier(use_state_for_unknown()),
            )
            .with_attribute(
                "created",
                Attribute::computed_string().with_plan_modifier(use_state_for_unknown()),
            )
            .with_attribute("updated", Attribute::computed_string())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute(
                "host_primary",
                Attribute::computed_string().with_plan_modifier(use_state_for_unknown_if_not_null()),
            )
            .with_attribute(
                "host_secondary",
                Attribute::computed_string().with_plan_modifier(use_state_for_unknown_if_not_null()),
            )
            .with_attribute(
                "port",
                Attribute::computed_int64().with_plan_modifier(use_state_for_unknown()),
            )
            .with_block(
                "updates",
                NestedBlock::list(MaintenanceWindow::block())
                    .with_max_items(1)
                    .computed(),
            )
            .with_timeouts(Timeouts {
                create: Some(Duration::from_secs(60 * 60)),
                read: None,
                update: Some(Duration::from_secs(5 * 60)),
                delete: Some(Duration::from_secs(5 * 60)),
            })
    }

    fn transient_errors(&self) -> Vec<String> {
        vec!["Unable to delete instance".to_string()]
    }

    fn upgraders(&self) -> Vec<StateUpgrader> {
        vec![StateUpgrader {
            from_version: 0,
            upgrade: upgrade_v0,
        }]
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        external_id: &str,
        prior: &Value,
    ) -> Result<Value, ProviderError> {
        let path = format!("{PATH}/{external_id}");
        let db: Database = ctx.client.get(&path).await?;
        let ssl: Ssl = ctx.client.get(&format!("{path}/ssl")).await?;
        let creds: Credentials = ctx.client.get(&format!("{path}/credentials")).await?;
        Ok(Self::to_value(db, ssl, creds, prior))
    }

    async fn create(&self, ctx: &ProviderContext, planned: &Value) -> Result<Created, ProviderError> {
        // The new ID is unknown until the POST returns, so take the event
        // floor first.
        let floor = ctx
            .waiter
            .latest_event_id(ENTITY_TYPE, "database_create")
            .await?;
        let started = Utc::now();

        let body = CreateRequest {
            label: required_str(planned, "label")?,
            region: required_str(planned, "region")?,
            plan_type: required_str(planned, "type")?,
            engine: required_str(planned, "engine_id")?,
            cluster_size: planned.attr("cluster_size").and_then(Value::as_i64).unwrap_or(1),
            encrypted: planned.attr("encrypted").and_then(Value::as_bool).unwrap_or(false),
            ssl_connection: planned
                .attr("ssl_connection")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            replication_type: required_str(planned, "replication_type")?,
            replication_commit_type: required_str(planned, "replication_commit_type")?,
            allow_list: planned
                .attr("allow_list")
                .and_then(Value::elements)
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        };
        let db: Database = ctx.client.post(PATH, &body).await?;
        debug!(id = db.id, "Created PostgreSQL database");

        Ok(Created {
            external_id: db.id.to_string(),
            await_event: Some(
                EventFilter::new(ENTITY_TYPE, db.id, "database_create")
                    .with_since(started)
                    .with_after_id(floor),
            ),
        })
    }

    async fn configure_created(
        &self,
        ctx: &ProviderContext,
        external_id: &str,
        planned: &Value,
    ) -> Result<Option<EventFilter>, ProviderError> {
        let Some(window) = MaintenanceWindow::from_planned(planned)? else {
            return Ok(None);
        };
        let started = Utc::now();
        let _: Json = ctx
            .client
            .put(&format!("{PATH}/{external_id}"), &WindowUpdate { updates: &window })
            .await?;
        debug!(id = external_id, "Set maintenance window");
        Ok(Some(
            EventFilter::new(ENTITY_TYPE, external_id, "database_update").with_since(started),
        ))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        request: &UpdateRequest<'_>,
    ) -> Result<Option<EventFilter>, ProviderError> {
        let mut body = request.patch();
        if request.has_change("updates") {
            let window = MaintenanceWindow::from_planned(request.planned)?;
            body.insert("updates".to_string(), serde_json::to_value(window)?);
        }
        if body.is_empty() {
            return Ok(None);
        }
        let started = Utc::now();
        let _: Json = ctx
            .client
            .put(&format!("{PATH}/{}", request.external_id), &body)
            .await?;
        Ok(Some(
            EventFilter::new(ENTITY_TYPE, request.external_id, "database_update").with_since(started),
        ))
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        external_id: &str,
    ) -> Result<Option<EventFilter>, ProviderError> {
        ctx.client.delete(&format!("{PATH}/{external_id}")).await?;
        Ok(None)
    }
}
