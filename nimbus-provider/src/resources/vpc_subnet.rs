//! vpc_subnet - Subnet inside a VPC
//!
//! Subnet updates and deletes are addressed through the owning VPC and are
//! rejected while another operation on the VPC is running, so both go
//! through `retry_with_wait`.

use std::collections::HashMap;

use async_trait::async_trait;
use nimbus_core::provider::ProviderResult;
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_from_json};
use nimbus_core::retry::{Operation, OperationKind, retry_with_wait};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use nimbus_core::wait::{STATUS_DELETED, WaitSpec, wait_for_state};
use serde::Deserialize;
use serde_json::json;

use crate::context::ProviderContext;
use crate::handler::{ResourceHandler, decode_config, deleted, found, observe};
use crate::resources::vpc::SERVICE;

const PENDING: &[&str] = &["UNKNOWN"];
const ACTIVE: &[&str] = &["ACTIVE"];

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubnetConfig {
    pub name: String,
    pub cidr: String,
    pub gateway_ip: String,
    pub vpc_id: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default = "default_true")]
    pub dhcp_enable: bool,
    #[serde(default)]
    pub primary_dns: Option<String>,
    #[serde(default)]
    pub secondary_dns: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubnetInfo {
    pub id: String,
    pub name: String,
    pub cidr: String,
    pub gateway_ip: String,
    pub vpc_id: String,
    pub status: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub dhcp_enable: bool,
    #[serde(default)]
    pub primary_dns: Option<String>,
    #[serde(default)]
    pub secondary_dns: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub neutron_subnet_id: Option<String>,
}

impl SubnetInfo {
    fn attributes(&self) -> HashMap<String, Value> {
        let mut attrs = attributes_from_json(&json!({
            "name": self.name,
            "cidr": self.cidr,
            "gateway_ip": self.gateway_ip,
            "vpc_id": self.vpc_id,
            "status": self.status,
            "availability_zone": self.availability_zone,
            "dhcp_enable": self.dhcp_enable,
            "primary_dns": self.primary_dns,
            "secondary_dns": self.secondary_dns,
            "subnet_id": self.neutron_subnet_id,
        }));
        if !self.description.is_empty() {
            attrs.insert(
                "description".to_string(),
                Value::String(self.description.clone()),
            );
        }
        attrs
    }
}

#[derive(Deserialize)]
struct SubnetEnvelope {
    subnet: SubnetInfo,
}

#[derive(Deserialize)]
struct SubnetIdEnvelope {
    subnet: SubnetId,
}

#[derive(Deserialize)]
struct SubnetId {
    id: String,
}

pub struct SubnetHandler;

impl SubnetHandler {
    async fn get(ctx: &ProviderContext, subnet_id: &str) -> ProviderResult<Option<SubnetInfo>> {
        let url = ctx.url(SERVICE, "v1", &format!("/subnets/{}", subnet_id));
        let envelope = found(ctx.client.get_json::<SubnetEnvelope>(&url).await)?;
        Ok(envelope.map(|e| e.subnet))
    }

    async fn wait(ctx: &ProviderContext, subnet_id: &str, spec: &WaitSpec) -> ProviderResult<()> {
        wait_for_state(spec, || async {
            Ok(observe(Self::get(ctx, subnet_id).await?, |s| s.status.clone()))
        })
        .await?;
        Ok(())
    }

    fn subnet_url(ctx: &ProviderContext, vpc_id: &str, subnet_id: &str) -> String {
        ctx.url(
            SERVICE,
            "v1",
            &format!("/vpcs/{}/subnets/{}", vpc_id, subnet_id),
        )
    }
}

#[async_trait]
impl ResourceHandler for SubnetHandler {
    fn resource_type(&self) -> &'static str {
        "vpc_subnet"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("vpc_subnet")
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(AttributeSchema::new("cidr", types::cidr()).required().force_new())
            .attribute(
                AttributeSchema::new("gateway_ip", types::ipv4_address())
                    .required()
                    .force_new(),
            )
            .attribute(
                AttributeSchema::new("vpc_id", AttributeType::String)
                    .required()
                    .force_new(),
            )
            .attribute(
                AttributeSchema::new("availability_zone", AttributeType::String)
                    .optional_computed()
                    .force_new(),
            )
            .attribute(
                AttributeSchema::new("dhcp_enable", AttributeType::Bool)
                    .with_default(Value::Bool(true)),
            )
            .attribute(AttributeSchema::new("primary_dns", types::ipv4_address()).optional_computed())
            .attribute(AttributeSchema::new("secondary_dns", types::ipv4_address()).optional_computed())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(
                AttributeSchema::new("subnet_id", AttributeType::String)
                    .computed()
                    .with_description("Network-layer subnet id used by compute NICs"),
            )
    }

    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let config: SubnetConfig = decode_config(resource)?;
        let url = ctx.url(SERVICE, "v1", "/subnets");
        let body = json!({
            "subnet": {
                "name": config.name,
                "cidr": config.cidr,
                "gateway_ip": config.gateway_ip,
                "vpc_id": config.vpc_id,
                "availability_zone": config.availability_zone,
                "dhcp_enable": config.dhcp_enable,
                "primary_dns": config.primary_dns,
                "secondary_dns": config.secondary_dns,
                "description": config.description,
            }
        });
        let created: SubnetIdEnvelope = ctx.client.post_json(&url, &body).await?;
        let subnet_id = created.subnet.id;

        let spec = ctx.wait_spec(PENDING, ACTIVE, ctx.timeouts.create);
        Self::wait(ctx, &subnet_id, &spec).await?;
        self.read(ctx, &resource.id, &subnet_id).await
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State> {
        Ok(match Self::get(ctx, identifier).await? {
            Some(subnet) => {
                State::existing(id.clone(), subnet.attributes()).with_identifier(subnet.id)
            }
            None => State::not_found(id.clone()),
        })
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
        _from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let config: SubnetConfig = decode_config(to)?;
        let url = Self::subnet_url(ctx, &config.vpc_id, identifier);
        let body = json!({
            "subnet": {
                "name": config.name,
                "dhcp_enable": config.dhcp_enable,
                "primary_dns": config.primary_dns,
                "secondary_dns": config.secondary_dns,
                "description": config.description.unwrap_or_default(),
            }
        });

        let stable = ctx.wait_spec(PENDING, ACTIVE, ctx.timeouts.update);
        retry_with_wait(
            &Operation::new(OperationKind::Update, id.clone()),
            &ctx.retry_policy(ctx.timeouts.update),
            &stable,
            || async {
                let _: serde_json::Value = ctx.client.put_json(&url, &body).await?;
                Ok(())
            },
            || async { Ok(observe(Self::get(ctx, identifier).await?, |s| s.status.clone())) },
        )
        .await?;

        Self::wait(ctx, identifier, &stable).await?;
        self.read(ctx, id, identifier).await
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        // The delete URL needs the owning VPC
        let Some(subnet) = Self::get(ctx, identifier).await? else {
            return Ok(());
        };
        let url = Self::subnet_url(ctx, &subnet.vpc_id, identifier);

        let stable = ctx.wait_spec(PENDING, ACTIVE, ctx.timeouts.delete);
        retry_with_wait(
            &Operation::new(OperationKind::Delete, id.clone()),
            &ctx.retry_policy(ctx.timeouts.delete),
            &stable,
            || async { deleted(ctx.client.delete(&url).await) },
            || async { Ok(observe(Self::get(ctx, identifier).await?, |s| s.status.clone())) },
        )
        .await
        .map_err(|e| {
            if e.is_timeout() {
                e.context("subnet is still in use")
            } else {
                e
            }
        })?;

        let spec = ctx.wait_spec(&["ACTIVE", "UNKNOWN", "ERROR"], &[STATUS_DELETED], ctx.timeouts.delete);
        Self::wait(ctx, identifier, &spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subnet_json(status: &str) -> serde_json::Value {
        json!({"subnet": {
            "id": "subnet-1",
            "name": "web",
            "cidr": "10.0.1.0/24",
            "gateway_ip": "10.0.1.1",
            "vpc_id": "vpc-1",
            "status": status,
            "dhcp_enable": true,
            "neutron_subnet_id": "net-1"
        }})
    }

    fn declared(name: &str) -> Resource {
        Resource::new("vpc_subnet", "web")
            .with_attribute("name", Value::String(name.into()))
            .with_attribute("cidr", Value::String("10.0.1.0/24".into()))
            .with_attribute("gateway_ip", Value::String("10.0.1.1".into()))
            .with_attribute("vpc_id", Value::String("vpc-1".into()))
    }

    #[tokio::test]
    async fn update_retries_after_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/proj-1/vpcs/vpc-1/subnets/subnet-1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error_code": "VPC.0409", "error_msg": "Another operation is in progress"
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/proj-1/vpcs/vpc-1/subnets/subnet-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "subnet": {"id": "subnet-1", "status": "ACTIVE"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/proj-1/subnets/subnet-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(subnet_json("ACTIVE")))
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let id = ResourceId::new("vpc_subnet", "web");
        let from = State::existing(id.clone(), HashMap::new()).with_identifier("subnet-1");
        let state = SubnetHandler
            .update(&ctx, &id, "subnet-1", &from, &declared("web-2"))
            .await
            .unwrap();

        assert_eq!(
            state.attributes.get("subnet_id"),
            Some(&Value::String("net-1".into()))
        );
    }

    #[tokio::test]
    async fn delete_looks_up_owning_vpc() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/proj-1/subnets/subnet-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(subnet_json("ACTIVE")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/proj-1/subnets/subnet-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/proj-1/vpcs/vpc-1/subnets/subnet-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        SubnetHandler
            .delete(&ctx, &ResourceId::new("vpc_subnet", "web"), "subnet-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_of_missing_subnet_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        SubnetHandler
            .delete(&ctx, &ResourceId::new("vpc_subnet", "web"), "subnet-1")
            .await
            .unwrap();
    }
}
