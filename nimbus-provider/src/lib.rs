//! Nimbus Cloud Provider
//!
//! Resource and data source handlers for the Nimbus cloud, built on the
//! signed API client in `nimbus-sdk` and the poller and retry wrapper in
//! `nimbus-core`.
//!
//! ## Module Structure
//!
//! - `context` - Client, timeouts and polling cadence shared by handlers
//! - `handler` - `ResourceHandler` / `DataSourceHandler` traits and helpers
//! - `resources` - One handler per managed resource type
//! - `data_sources` - Read-only lookups
//! - `provider` - NimbusProvider implementation

pub mod context;
pub mod data_sources;
pub mod handler;
pub mod provider;
pub mod resources;

// Re-export main types
pub use context::{ProviderContext, Timeouts};
pub use provider::NimbusProvider;

use std::collections::HashMap;

use nimbus_core::provider::{BoxFuture, Provider, ProviderResult, ResourceType};
use nimbus_core::resource::{Resource, ResourceId, State};
use nimbus_core::schema::ResourceSchema;

use handler::HandlerType;

/// Schemas of every managed resource type, keyed by type name
pub fn resource_schemas() -> HashMap<String, ResourceSchema> {
    resources::all()
        .iter()
        .map(|h| (h.resource_type().to_string(), h.schema()))
        .collect()
}

/// Schemas of every data source, keyed by type name
pub fn data_source_schemas() -> HashMap<String, ResourceSchema> {
    data_sources::all()
        .iter()
        .map(|h| (h.data_type().to_string(), h.schema()))
        .collect()
}

// =============================================================================
// Provider Trait Implementation
// =============================================================================

impl Provider for NimbusProvider {
    fn name(&self) -> &'static str {
        "nimbus"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        let mut types: Vec<Box<dyn ResourceType>> = Vec::new();
        for handler in self.handlers() {
            types.push(Box::new(HandlerType::resource(handler)));
        }
        for handler in self.data_source_handlers() {
            types.push(Box::new(HandlerType::data_source(handler)));
        }
        types.sort_by_key(|t| (t.is_data_source(), t.name()));
        types
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(|s| s.to_string());
        Box::pin(async move { self.read_resource(&id, identifier.as_deref()).await })
    }

    fn read_data_source(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.read_data(&resource).await })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.create_resource(&resource).await })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move { self.update_resource(&id, &identifier, &from, &to).await })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.delete_resource(&id, &identifier).await })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use nimbus_core::provider::ErrorKind;
    use nimbus_core::resource::Value;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn lists_resources_then_data_sources() {
        let server = MockServer::start().await;
        let provider = NimbusProvider::new(context(&server).await);
        let types: Vec<(bool, &str)> = provider
            .resource_types()
            .iter()
            .map(|t| (t.is_data_source(), t.name()))
            .collect();
        assert_eq!(
            types,
            vec![
                (false, "compute_instance"),
                (false, "kafka_instance"),
                (false, "rds_instance"),
                (false, "security_group"),
                (false, "security_group_rule"),
                (false, "vpc"),
                (false, "vpc_subnet"),
                (true, "availability_zones"),
                (true, "vpc"),
            ]
        );
    }

    #[test]
    fn schemas_cover_every_handler() {
        let resources = resource_schemas();
        assert_eq!(resources.len(), 7);
        assert!(resources["rds_instance"].is_sensitive("password"));
        assert!(
            resources["vpc_subnet"]
                .force_new_attributes()
                .contains(&"cidr")
        );
        assert_eq!(data_source_schemas().len(), 2);
    }

    #[tokio::test]
    async fn read_without_identifier_is_not_found() {
        let server = MockServer::start().await;
        let provider = NimbusProvider::new(context(&server).await);
        let state = provider
            .read(&ResourceId::new("vpc", "main"), None)
            .await
            .unwrap();
        assert!(!state.exists);
    }

    #[tokio::test]
    async fn unknown_type_is_unsupported() {
        let server = MockServer::start().await;
        let provider = NimbusProvider::new(context(&server).await);
        let err = provider
            .create(&Resource::new("dns_zone", "public"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
        assert_eq!(err.to_string(), "[dns_zone.public] unknown resource type 'dns_zone'");
    }

    #[tokio::test]
    async fn errors_carry_resource_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/proj-1/vpcs/vpc-1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error_code": "VPC.0010", "error_msg": "Forbidden"
            })))
            .mount(&server)
            .await;

        let provider = NimbusProvider::new(context(&server).await);
        let id = ResourceId::new("vpc", "main");
        let err = provider.read(&id, Some("vpc-1")).await.unwrap_err();
        assert_eq!(err.resource_id, Some(id));
    }

    #[tokio::test]
    async fn security_group_rule_cannot_be_updated() {
        let server = MockServer::start().await;
        let provider = NimbusProvider::new(context(&server).await);
        let id = ResourceId::new("security_group_rule", "ssh");
        let from = State::existing(id.clone(), Default::default()).with_identifier("rule-1");
        let to = Resource::new("security_group_rule", "ssh")
            .with_attribute("direction", Value::String("ingress".into()));
        let err = provider.update(&id, "rule-1", &from, &to).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }
}
