//! HTTP client for the Linode REST API.
//!
//! A thin typed layer over `reqwest`: bearer authentication, the `X-Filter`
//! header for list endpoints, page-number pagination, and mapping of the
//! API's `{"errors": [{"reason", "field"}]}` bodies onto [`ProviderError`].

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// Header carrying a JSON filter document on list requests.
pub const FILTER_HEADER: &str = "X-Filter";

/// Largest page size the API accepts.
pub const MAX_PAGE_SIZE: u32 = 500;

// ── Wire shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    field: Option<String>,
}

/// One page of a list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub data: Vec<T>,
    /// This page's number (1-based).
    pub page: u32,
    /// Total number of pages.
    pub pages: u32,
    /// Total number of items across all pages.
    pub results: u32,
}

/// Parameters of a list request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Filter document sent in the `X-Filter` header.
    pub filter: Option<String>,
    /// Extra query parameters (e.g. `order_by`, `order`).
    pub params: Vec<(String, String)>,
    /// Items per page; the API default is used when `None`.
    pub page_size: Option<u32>,
}

// ── Client ───────────────────────────────────────────────────────────

/// Async client for the Linode API. Cheap to clone and safe to share.
#[derive(Debug, Clone)]
pub struct LinodeClient {
    http: reqwest::Client,
    base_url: Url,
}

impl LinodeClient {
    /// Build a client from provider settings.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProviderError::Config(format!("invalid API token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url()?,
        })
    }

    /// The versioned API root.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    // ── HTTP verbs ───────────────────────────────────────────────────

    /// `GET path`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = self.url(path)?;
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        handle_response(resp).await
    }

    /// `POST path` with a JSON body.
    pub async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = self.url(path)?;
        debug!("POST {url}");

        let resp = self.http.post(url).json(body).send().await?;
        handle_response(resp).await
    }

    /// `PUT path` with a JSON body.
    pub async fn put<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = self.url(path)?;
        debug!("PUT {url}");

        let resp = self.http.put(url).json(body).send().await?;
        handle_response(resp).await
    }

    /// `DELETE path`.
    pub async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let url = self.url(path)?;
        debug!("DELETE {url}");

        let resp = self.http.delete(url).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(parse_error(status, resp).await)
        }
    }

    /// Fetch one page of a list endpoint.
    pub async fn list_page<T: DeserializeOwned>(
        &self,
        path: &str,
        page: u32,
        request: &ListRequest,
    ) -> Result<Page<T>, ProviderError> {
        let url = self.url(path)?;
        let mut params: Vec<(String, String)> = vec![("page".to_string(), page.to_string())];
        if let Some(size) = request.page_size {
            params.push(("page_size".to_string(), size.min(MAX_PAGE_SIZE).to_string()));
        }
        params.extend(request.params.iter().cloned());
        debug!("GET {url} params={params:?} filter={:?}", request.filter);

        let mut builder = self.http.get(url).query(&params);
        if let Some(filter) = &request.filter {
            builder = builder.header(FILTER_HEADER, filter.as_str());
        }
        let resp = builder.send().await?;
        handle_response(resp).await
    }
}

// ── Response handling ────────────────────────────────────────────────

async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    } else {
        Err(parse_error(status, resp).await)
    }
}

async fn parse_error(status: StatusCode, resp: reqwest::Response) -> ProviderError {
    let url = resp.url().path().to_string();
    let raw = resp.text().await.unwrap_or_default();
    let entries = serde_json::from_str::<ErrorResponse>(&raw)
        .map(|r| r.errors)
        .unwrap_or_default();

    let message = if entries.is_empty() {
        if raw.is_empty() {
            status.to_string()
        } else {
            raw
        }
    } else {
        entries
            .iter()
            .filter_map(|e| e.reason.clone())
            .collect::<Vec<_>>()
            .join("; ")
    };

    match status.as_u16() {
        404 | 410 => ProviderError::NotFound(format!("{url}: {message}")),
        400 | 422 => {
            let fields: BTreeMap<String, String> = entries
                .iter()
                .filter_map(|e| match (&e.field, &e.reason) {
                    (Some(field), Some(reason)) => Some((field.clone(), reason.clone())),
                    _ => None,
                })
                .collect();
            ProviderError::Validation { message, fields }
        },
        code @ (429 | 500..=599) => ProviderError::RemoteTransient {
            status: code,
            message,
        },
        code => ProviderError::RemotePermanent {
            status: code,
            message,
        },
    }
}
