//! Filtered list data sources.
//!
//! A [`ListSource`] describes a paginated list endpoint: its path, the shape
//! of one record and which fields can be filtered. [`read_list`] runs the
//! whole pipeline: parse the query, compile it, page through the server
//! results with the filter header, apply the residual predicate and
//! ordering, and decode the surviving records.

use crate::adapter::list_all;
use crate::client::{ListRequest, MAX_PAGE_SIZE};
use crate::filter::{compile, FilterConfig, FilterQuery};
use crate::provider::ProviderContext;
use crate::schema::{Attribute, Block, Diagnostic, Schema};
use crate::value::{Value, ValueType};
use serde_json::Value as Json;
use tracing::debug;

/// A list endpoint exposed as a data source.
pub trait ListSource: Send + Sync {
    /// API path of the list endpoint, relative to the versioned root.
    fn path(&self) -> &str;

    /// Name of the attribute holding the result records.
    fn results_attribute(&self) -> &str;

    /// Attributes of one result record, all computed.
    fn record(&self) -> Block;

    /// Filterable fields.
    fn filter_config(&self) -> FilterConfig;

    /// The type of one result record.
    fn record_type(&self) -> ValueType {
        self.record().value_type()
    }
}

/// The data source schema for `source`: a computed `id`, the result list,
/// and the filter block with its ordering attributes.
pub fn list_schema(source: &dyn ListSource) -> Schema {
    let schema = Schema::v0()
        .with_attribute("id", Attribute::computed_string())
        .with_attribute(
            source.results_attribute(),
            Attribute::computed(ValueType::list(source.record_type())),
        );
    source.filter_config().extend_schema(schema)
}

/// Keep only the record's declared attributes so it decodes against the
/// record type.
fn project(record: &Json, block: &Block) -> Json {
    let obj = block
        .attributes
        .keys()
        .map(|name| {
            let value = record.get(name).cloned().unwrap_or(Json::Null);
            (name.clone(), value)
        })
        .collect();
    Json::Object(obj)
}

/// Read a list data source for a fully known configuration.
///
/// Filter, transport and decode failures are returned as error diagnostics
/// with a null value.
pub async fn read_list(
    ctx: &ProviderContext,
    source: &dyn ListSource,
    config: &Value,
) -> (Value, Vec<Diagnostic>) {
    let schema = list_schema(source);
    let null = Value::null(schema.value_type());

    let (query, mut diagnostics) = FilterQuery::from_config(config);
    let (compiled, diags) = compile(&source.filter_config(), &query);
    diagnostics.extend(diags);
    let Some(compiled) = compiled else {
        return (null, diagnostics);
    };

    let request = ListRequest {
        filter: compiled.header(),
        params: compiled.order_params().to_vec(),
        page_size: Some(MAX_PAGE_SIZE),
    };
    let records: Vec<Json> = match list_all(ctx, source.path(), request).await {
        Ok(records) => records,
        Err(e) => {
            diagnostics.push(
                Diagnostic::error(format!("Failed to list {}", source.path()))
                    .with_detail(e.to_string()),
            );
            return (null, diagnostics);
        },
    };
    let fetched = records.len();
    let records = compiled.apply(records);
    debug!(path = source.path(), fetched, kept = records.len(), "Filtered list results");

    let block = source.record();
    let record_type = block.value_type();
    let mut items = Vec::with_capacity(records.len());
    for record in &records {
        match Value::from_json(&record_type, &project(record, &block)) {
            Ok(value) => items.push(value),
            Err(e) => {
                diagnostics.push(
                    Diagnostic::error("Unexpected list record")
                        .with_detail(e.to_string())
                        .with_attribute(source.results_attribute()),
                );
                return (null, diagnostics);
            },
        }
    }

    let value = config
        .with_attr("id", Value::string(query.id()))
        .with_attr(source.results_attribute(), Value::list(record_type, items));
    (value, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::decode::{decode_config, no_references};
    use crate::filter::FieldType;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Widgets;

    impl ListSource for Widgets {
        fn path(&self) -> &str {
            "widgets"
        }

        fn results_attribute(&self) -> &str {
            "widgets"
        }

        fn record(&self) -> Block {
            Block::new()
                .with_attribute("id", Attribute::computed_string())
                .with_attribute("label", Attribute::computed_string())
                .with_attribute("status", Attribute::computed_string())
        }

        fn filter_config(&self) -> FilterConfig {
            FilterConfig::new()
                .api_field("label", FieldType::String)
                .local_field("status", FieldType::String)
        }
    }

    fn context(server: &MockServer) -> ProviderContext {
        ProviderContext::new(ProviderConfig {
            api_url: server.uri(),
            ..ProviderConfig::default()
        })
        .unwrap()
    }

    fn config(doc: Json) -> Value {
        let schema = list_schema(&Widgets);
        let (value, diags) = decode_config(&schema, doc.as_object().unwrap(), &no_references);
        assert!(diags.is_empty(), "{diags:?}");
        value
    }

    #[tokio::test]
    async fn test_read_list_splits_server_and_client_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/widgets"))
            .and(header("X-Filter", r#"{"label":"web"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "1", "label": "web", "status": "available", "extra": 1},
                    {"id": "2", "label": "web", "status": "pending"}
                ],
                "page": 1, "pages": 1, "results": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = config(json!({
            "filter": [
                {"name": "label", "values": ["web"]},
                {"name": "status", "values": ["available"]}
            ]
        }));
        let (value, diags) = read_list(&context(&server), &Widgets, &cfg).await;
        assert!(diags.is_empty(), "{diags:?}");
        let widgets = value.attr("widgets").unwrap().elements().unwrap();
        assert_eq!(widgets.len(), 1);
        assert_eq!(widgets[0].attr("id").unwrap().as_str(), Some("1"));
        assert!(value.attr("id").unwrap().as_str().is_some());
    }

    #[tokio::test]
    async fn test_read_list_rejects_unknown_field_without_calling_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cfg = config(json!({"filter": [{"name": "color", "values": ["red"]}]}));
        let (value, diags) = read_list(&context(&server), &Widgets, &cfg).await;
        assert!(value.is_null());
        assert_eq!(diags[0].summary, "Attempted to filter on non-filterable field");
    }

    #[tokio::test]
    async fn test_read_list_error_becomes_diagnostic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/widgets"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(json!({"errors": [{"reason": "Unauthorized"}]})),
            )
            .mount(&server)
            .await;

        let (value, diags) = read_list(&context(&server), &Widgets, &config(json!({}))).await;
        assert!(value.is_null());
        assert!(diags[0].is_error());
        assert!(diags[0].detail.as_deref().unwrap().contains("Unauthorized"));
    }
}
