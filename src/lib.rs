//! Linode Provider Core
//!
//! A declarative reconciliation engine for Linode resources. It takes a
//! desired-state document, compares it with recorded state refreshed from the
//! Linode API, produces a plan of creates, updates, replacements and deletions,
//! and executes that plan with retries, event waits and crash-safe state
//! persistence.
//!
//! # Overview
//!
//! - **Values and schemas**: [`value::Value`] carries known, null and unknown
//!   values; [`schema::Schema`] describes each resource kind, with
//!   [`validators`] and [`planmodifier`]s attached to attributes
//! - **State**: [`state::StateStore`] persists a versioned JSON document
//!   atomically, with a backup of the previous write
//! - **Remote API**: [`client::LinodeClient`] speaks the v4 REST API;
//!   [`adapter::Adapter`] adds retries and deadlines; [`events::EventWaiter`]
//!   waits for asynchronous operations to finish
//! - **Filters**: [`filter`] splits a data source's filter block into a
//!   server-side header and a client-side predicate
//! - **Planning**: [`planner::Planner`] diffs configuration against state in
//!   dependency order
//! - **Execution**: [`executor::Executor`] applies a plan on a bounded worker
//!   pool; [`engine::Engine`] ties refresh, plan, apply and the state
//!   commands together
//!
//! # Quick Start
//!
//! ```ignore
//! use linode_provider_core::{
//!     init_logging, Configuration, Engine, Provider, ProviderConfig, ProviderContext, StateStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     let (config, warnings) = ProviderConfig::from_env();
//!     for w in &warnings {
//!         tracing::warn!("{}", w.summary);
//!     }
//!
//!     let engine = Engine::new(
//!         Provider::linode()?,
//!         Configuration::load("main.json")?,
//!         StateStore::new("state.json"),
//!         ProviderContext::new(config)?,
//!     );
//!
//!     let (plan, _) = engine.plan().await?;
//!     println!("{}", plan.render());
//!     if plan.has_changes() && !plan.has_errors() {
//!         let report = engine.apply().await?;
//!         std::process::exit(if report.has_errors() { 1 } else { 0 });
//!     }
//!     std::process::exit(plan.exit_code(true));
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod client;
pub mod config;
pub mod datasource;
pub mod decode;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod filter;
pub mod graph;
pub mod logging;
pub mod planmodifier;
pub mod planner;
pub mod provider;
pub mod resources;
pub mod retry;
pub mod schema;
pub mod state;
pub mod testing;
pub mod types;
pub mod validation;
pub mod validators;
pub mod value;

// Re-export main types at crate root
pub use config::{Configuration, ProviderConfig};
pub use engine::Engine;
pub use error::ProviderError;
pub use executor::{ApplyOutcome, ApplyReport};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::{DataSourceType, Provider, ProviderContext, ResourceType};
pub use schema::{Diagnostic, Schema, SchemaRegistry};
pub use state::{StateDocument, StateStore};
pub use types::{Action, Address, Plan};
pub use validation::{validate, validate_result, Phase};
pub use value::{AttributePath, Value, ValueType};
