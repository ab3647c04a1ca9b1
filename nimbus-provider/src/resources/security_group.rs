//! security_group - Stateful firewall attached to ports and instances

use std::collections::HashMap;

use async_trait::async_trait;
use nimbus_core::provider::ProviderResult;
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_from_json};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use serde::Deserialize;
use serde_json::json;

use crate::context::ProviderContext;
use crate::handler::{ResourceHandler, decode_config, deleted, found};
use crate::resources::vpc::SERVICE;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityGroupConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enterprise_project_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroupInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enterprise_project_id: Option<String>,
    #[serde(default)]
    pub security_group_rules: Vec<RuleRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleRef {
    pub id: String,
}

impl SecurityGroupInfo {
    fn attributes(&self) -> HashMap<String, Value> {
        let mut attrs = attributes_from_json(&json!({
            "name": self.name,
            "enterprise_project_id": self.enterprise_project_id,
            "rule_ids": self.security_group_rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
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
struct SecurityGroupEnvelope {
    security_group: SecurityGroupInfo,
}

pub struct SecurityGroupHandler;

impl SecurityGroupHandler {
    fn group_url(ctx: &ProviderContext, group_id: &str) -> String {
        ctx.url(SERVICE, "v1", &format!("/security-groups/{}", group_id))
    }
}

#[async_trait]
impl ResourceHandler for SecurityGroupHandler {
    fn resource_type(&self) -> &'static str {
        "security_group"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("security_group")
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("enterprise_project_id", AttributeType::String).force_new())
            .attribute(
                AttributeSchema::new("rule_ids", AttributeType::List(Box::new(AttributeType::String)))
                    .computed()
                    .with_description("Rules in the group, including the defaults added on creation"),
            )
    }

    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let config: SecurityGroupConfig = decode_config(resource)?;
        let url = ctx.url(SERVICE, "v1", "/security-groups");
        let body = json!({
            "security_group": {
                "name": config.name,
                "description": config.description,
                "enterprise_project_id": config.enterprise_project_id,
            }
        });
        let created: SecurityGroupEnvelope = ctx.client.post_json(&url, &body).await?;
        let group = created.security_group;
        Ok(State::existing(resource.id.clone(), group.attributes()).with_identifier(group.id))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State> {
        let url = Self::group_url(ctx, identifier);
        Ok(
            match found(ctx.client.get_json::<SecurityGroupEnvelope>(&url).await)? {
                Some(e) => State::existing(id.clone(), e.security_group.attributes())
                    .with_identifier(e.security_group.id),
                None => State::not_found(id.clone()),
            },
        )
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
        _from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let config: SecurityGroupConfig = decode_config(to)?;
        let body = json!({
            "security_group": {
                "name": config.name,
                "description": config.description.unwrap_or_default(),
            }
        });
        let updated: SecurityGroupEnvelope = ctx
            .client
            .put_json(&Self::group_url(ctx, identifier), &body)
            .await?;
        let group = updated.security_group;
        Ok(State::existing(id.clone(), group.attributes()).with_identifier(group.id))
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        _id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        deleted(ctx.client.delete(&Self::group_url(ctx, identifier)).await)
    }
}
