//! Provider settings and desired-state documents.
//!
//! [`ProviderConfig`] carries the API endpoint, credentials and tuning knobs
//! and is threaded through every component via the provider context.
//! [`Configuration`] is the user-authored desired state: a list of resource
//! and data source declarations whose attributes may reference one another
//! with `${address.attribute}` strings.

use crate::error::ProviderError;
use crate::events::PollConfig;
use crate::retry::RetryPolicy;
use crate::schema::Diagnostic;
use crate::types::Address;
use crate::value::AttributePath;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default Linode API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.linode.com";

/// Default Linode API version.
pub const DEFAULT_API_VERSION: &str = "v4";

/// Settings for talking to the Linode API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Personal access token. Unauthenticated requests are allowed.
    pub token: Option<String>,
    /// Base URL of the API.
    pub api_url: String,
    /// API version path segment.
    pub api_version: String,
    /// Prefix prepended to the User-Agent header.
    pub ua_prefix: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Minimum event poll interval in milliseconds.
    pub event_poll_ms: u64,
    /// Maximum event poll interval in milliseconds.
    pub event_poll_max_ms: u64,
    /// Base retry delay in milliseconds.
    pub min_retry_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Attempts per remote operation, including the first.
    pub max_retry_attempts: u32,
    /// Worker pool width for apply.
    pub parallelism: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            ua_prefix: None,
            request_timeout_secs: 60,
            event_poll_ms: 2_000,
            event_poll_max_ms: 15_000,
            min_retry_delay_ms: 250,
            max_retry_delay_ms: 30_000,
            max_retry_attempts: 5,
            parallelism: 10,
        }
    }
}

impl ProviderConfig {
    /// Build settings from `LINODE_*` environment variables.
    ///
    /// A missing token produces a warning, not an error, so that
    /// unauthenticated data sources keep working.
    pub fn from_env() -> (Self, Vec<Diagnostic>) {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> (Self, Vec<Diagnostic>) {
        let mut config = Self::default();
        let mut diagnostics = Vec::new();

        config.token = lookup("LINODE_TOKEN").filter(|t| !t.is_empty());
        if config.token.is_none() {
            diagnostics.push(
                Diagnostic::warning("No API token configured").with_detail(
                    "LINODE_TOKEN is not set; only unauthenticated endpoints will work",
                ),
            );
        }
        if let Some(url) = lookup("LINODE_URL").filter(|u| !u.is_empty()) {
            config.api_url = url;
        }
        if let Some(version) = lookup("LINODE_API_VERSION").filter(|v| !v.is_empty()) {
            config.api_version = version;
        }
        config.ua_prefix = lookup("LINODE_UA_PREFIX").filter(|p| !p.is_empty());

        (config, diagnostics)
    }

    /// The versioned API root, always ending in `/`.
    pub fn base_url(&self) -> Result<Url, ProviderError> {
        let root = self.api_url.trim_end_matches('/');
        let version = self.api_version.trim_matches('/');
        Ok(Url::parse(&format!("{root}/{version}/"))?)
    }

    /// The User-Agent header value.
    pub fn user_agent(&self) -> String {
        let base = format!(
            "linode-provider-core/{}",
            env!("CARGO_PKG_VERSION")
        );
        match &self.ua_prefix {
            Some(prefix) => format!("{prefix} {base}"),
            None => base,
        }
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Retry policy for remote operations.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(self.min_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            jitter: true,
        }
    }

    /// Event waiter poll intervals.
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            min_interval: Duration::from_millis(self.event_poll_ms),
            max_interval: Duration::from_millis(self.event_poll_max_ms.max(self.event_poll_ms)),
        }
    }
}

/// One declared resource or data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// The resource kind.
    pub kind: String,
    /// The instance name, unique per kind.
    pub name: String,
    /// Attribute values, possibly containing references.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Explicit dependencies, as addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ResourceConfig {
    /// Every reference found in the attributes, in document order.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        for value in self.attributes.values() {
            collect_references(value, &mut out);
        }
        out
    }

    /// Addresses this declaration depends on, deduplicated, in first-seen
    /// order.
    pub fn dependencies(&self) -> Result<Vec<Address>, ProviderError> {
        let mut out: Vec<Address> = Vec::new();
        let explicit = self
            .depends_on
            .iter()
            .map(|s| s.parse::<Address>())
            .collect::<Result<Vec<_>, _>>()?;
        for address in explicit
            .into_iter()
            .chain(self.references().into_iter().map(|r| r.address))
        {
            if !out.contains(&address) {
                out.push(address);
            }
        }
        Ok(out)
    }
}

/// A desired-state document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Managed resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Data sources, in declaration order.
    #[serde(default)]
    pub data_sources: Vec<ResourceConfig>,
}

impl Configuration {
    /// Parse a configuration document from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ProviderError> {
        let config: Self = serde_json::from_str(s)?;
        config.check_unique()?;
        Ok(config)
    }

    /// Load a configuration document from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    fn check_unique(&self) -> Result<(), ProviderError> {
        let mut seen = std::collections::HashSet::new();
        for address in self.addresses() {
            if !seen.insert(address.clone()) {
                return Err(ProviderError::Config(format!(
                    "duplicate declaration of {address}"
                )));
            }
        }
        Ok(())
    }

    /// All declared addresses: data sources first, then resources.
    pub fn addresses(&self) -> Vec<Address> {
        self.data_sources
            .iter()
            .map(|d| Address::data(&d.kind, &d.name))
            .chain(
                self.resources
                    .iter()
                    .map(|r| Address::managed(&r.kind, &r.name)),
            )
            .collect()
    }

    /// Find the declaration for an address.
    pub fn get(&self, address: &Address) -> Option<&ResourceConfig> {
        let list = if address.is_data() {
            &self.data_sources
        } else {
            &self.resources
        };
        list.iter()
            .find(|r| r.kind == address.kind && r.name == address.name)
    }
}

/// A `${address.path}` attribute reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// The referenced resource or data source.
    pub address: Address,
    /// The attribute path within it.
    pub path: AttributePath,
}

impl Reference {
    /// Parse a string of the exact form `${<address>.<path>}`.
    pub fn parse(s: &str) -> Option<Self> {
        let inner = s.strip_prefix("${")?.strip_suffix('}')?;
        let parts: Vec<&str> = inner.split('.').collect();
        let (address, rest) = match parts.as_slice() {
            ["data", kind, name, rest @ ..] => (Address::data(*kind, *name), rest),
            [kind, name, rest @ ..] => (Address::managed(*kind, *name), rest),
            _ => return None,
        };
        if address.kind.is_empty() || address.name.is_empty() || rest.is_empty() {
            return None;
        }
        Some(Self {
            address,
            path: AttributePath::parse(&rest.join(".")),
        })
    }
}

fn collect_references(value: &serde_json::Value, out: &mut Vec<Reference>) {
    match value {
        serde_json::Value::String(s) => out.extend(Reference::parse(s)),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {},
    }
}
