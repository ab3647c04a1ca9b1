//! vpc - Virtual Private Cloud

use std::collections::HashMap;

use async_trait::async_trait;
use log::info;
use nimbus_core::provider::ProviderResult;
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_from_json};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use nimbus_core::wait::{STATUS_DELETED, wait_for_state};
use serde::Deserialize;
use serde_json::json;

use crate::context::ProviderContext;
use crate::handler::{ResourceHandler, decode_config, deleted, found, observe};

pub(crate) const SERVICE: &str = "vpc";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VpcConfig {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enterprise_project_id: Option<String>,
}

/// VPC as returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct VpcInfo {
    pub id: String,
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    #[serde(default)]
    pub enterprise_project_id: Option<String>,
}

impl VpcInfo {
    pub fn attributes(&self) -> HashMap<String, Value> {
        let mut attrs = attributes_from_json(&json!({
            "name": self.name,
            "cidr": self.cidr,
            "status": self.status,
            "enterprise_project_id": self.enterprise_project_id,
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
struct VpcEnvelope {
    vpc: VpcInfo,
}

pub struct VpcHandler;

impl VpcHandler {
    async fn get(ctx: &ProviderContext, vpc_id: &str) -> ProviderResult<Option<VpcInfo>> {
        let url = ctx.url(SERVICE, "v1", &format!("/vpcs/{}", vpc_id));
        let envelope = found(ctx.client.get_json::<VpcEnvelope>(&url).await)?;
        Ok(envelope.map(|e| e.vpc))
    }

    async fn wait_active(ctx: &ProviderContext, vpc_id: &str) -> ProviderResult<()> {
        let spec = ctx.wait_spec(&["CREATING"], &["OK"], ctx.timeouts.create);
        wait_for_state(&spec, || async {
            Ok(observe(Self::get(ctx, vpc_id).await?, |v| v.status.clone()))
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for VpcHandler {
    fn resource_type(&self) -> &'static str {
        "vpc"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("vpc")
            .with_description("Virtual private cloud")
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(
                AttributeSchema::new("cidr", types::cidr())
                    .required()
                    .with_description("Address range, within 10.0.0.0/8, 172.16.0.0/12 or 192.168.0.0/16"),
            )
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("enterprise_project_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
    }

    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let config: VpcConfig = decode_config(resource)?;
        let url = ctx.url(SERVICE, "v1", "/vpcs");
        let body = json!({
            "vpc": {
                "name": config.name,
                "cidr": config.cidr,
                "description": config.description,
                "enterprise_project_id": config.enterprise_project_id,
            }
        });
        let created: VpcEnvelope = ctx.client.post_json(&url, &body).await?;
        let vpc_id = created.vpc.id;
        info!("created vpc {}, waiting for it to become available", vpc_id);

        Self::wait_active(ctx, &vpc_id).await?;
        self.read(ctx, &resource.id, &vpc_id).await
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State> {
        Ok(match Self::get(ctx, identifier).await? {
            Some(vpc) => State::existing(id.clone(), vpc.attributes()).with_identifier(vpc.id),
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
        let config: VpcConfig = decode_config(to)?;
        let url = ctx.url(SERVICE, "v1", &format!("/vpcs/{}", identifier));
        let body = json!({
            "vpc": {
                "name": config.name,
                "cidr": config.cidr,
                "description": config.description.unwrap_or_default(),
            }
        });
        let _: VpcEnvelope = ctx.client.put_json(&url, &body).await?;

        Self::wait_active(ctx, identifier).await?;
        self.read(ctx, id, identifier).await
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        _id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        let url = ctx.url(SERVICE, "v1", &format!("/vpcs/{}", identifier));
        deleted(ctx.client.delete(&url).await)?;

        let spec = ctx.wait_spec(&["OK"], &[STATUS_DELETED], ctx.timeouts.delete);
        wait_for_state(&spec, || async {
            Ok(observe(Self::get(ctx, identifier).await?, |v| v.status.clone()))
        })
        .await?;
        Ok(())
    }
}
