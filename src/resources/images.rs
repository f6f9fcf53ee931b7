//! `linode_images`: the filtered image list.

use crate::datasource::{list_schema, read_list, ListSource};
use crate::filter::{FieldType, FilterConfig};
use crate::provider::{DataSourceType, ProviderContext};
use crate::schema::{Attribute, Block, Diagnostic, Schema};
use crate::value::{Value, ValueType};
use async_trait::async_trait;

/// The `linode_images` data source.
#[derive(Debug, Clone, Copy, Default)]
pub struct Images;

impl ListSource for Images {
    fn path(&self) -> &str {
        "images"
    }

    fn results_attribute(&self) -> &str {
        "images"
    }

    fn record(&self) -> Block {
        let strings = ValueType::list(ValueType::String);
        Block::new()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("label", Attribute::computed_string())
            .with_attribute("description", Attribute::computed_string())
            .with_attribute("created", Attribute::computed_string())
            .with_attribute("created_by", Attribute::computed_string())
            .with_attribute("deprecated", Attribute::computed_bool())
            .with_attribute("is_public", Attribute::computed_bool())
            .with_attribute("size", Attribute::computed_int64())
            .with_attribute("type", Attribute::computed_string())
            .with_attribute("vendor", Attribute::computed_string())
            .with_attribute("status", Attribute::computed_string())
            .with_attribute("expiry", Attribute::computed_string())
            .with_attribute("capabilities", Attribute::computed(strings.clone()))
            .with_attribute("tags", Attribute::computed(strings))
    }

    fn filter_config(&self) -> FilterConfig {
        FilterConfig::new()
            .api_field("deprecated", FieldType::Bool)
            .api_field("is_public", FieldType::Bool)
            .api_field("label", FieldType::String)
            .api_field("size", FieldType::Int)
            .api_field("type", FieldType::String)
            .api_field("vendor", FieldType::String)
            .api_field("created_by", FieldType::String)
            .local_field("id", FieldType::String)
            .local_field("status", FieldType::String)
            .local_field("capabilities", FieldType::String)
            .local_field("created", FieldType::String)
    }
}

#[async_trait]
impl DataSourceType for Images {
    fn kind(&self) -> &str {
        "linode_images"
    }

    fn schema(&self) -> Schema {
        list_schema(self)
    }

    async fn read(&self, ctx: &ProviderContext, config: &Value) -> (Value, Vec<Diagnostic>) {
        read_list(ctx, self, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::decode::{decode_config, no_references};
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn image(id: &str, label: &str, created: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id, "label": label, "description": null, "created": created,
            "created_by": "linode", "deprecated": false, "is_public": true,
            "size": 2500, "type": "manual", "vendor": "Debian", "status": status,
            "expiry": null, "capabilities": ["cloud-init"], "tags": []
        })
    }

    #[tokio::test]
    async fn test_public_available_latest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/images"))
            .and(header("X-Filter", r#"{"is_public":true}"#))
            .and(query_param("page_size", "500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    image("linode/debian11", "Debian 11", "2021-08-14T22:44:02", "available"),
                    image("linode/debian12", "Debian 12", "2023-06-12T16:39:16", "available"),
                    image("linode/debian13", "Debian 13", "2025-01-01T00:00:00", "pending_upload")
                ],
                "page": 1, "pages": 1, "results": 3
            })))
            .expect(1)
            .mount(&server)
            .await;

        let schema = Images.schema();
        let (config, diags) = decode_config(
            &schema,
            json!({
                "latest": true,
                "filter": [
                    {"name": "is_public", "values": ["true"]},
                    {"name": "status", "values": ["available"]}
                ]
            })
            .as_object()
            .unwrap(),
            &no_references,
        );
        assert!(diags.is_empty(), "{diags:?}");

        let ctx = ProviderContext::new(ProviderConfig {
            api_url: server.uri(),
            ..ProviderConfig::default()
        })
        .unwrap();
        let (value, diags) = Images.read(&ctx, &config).await;
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(value.ty(), &schema.value_type());

        let images = value.attr("images").unwrap().elements().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].attr("id").unwrap().as_str(), Some("linode/debian12"));
    }
}
