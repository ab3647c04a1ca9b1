//! kafka_instance - Managed Kafka message queue instance

use std::collections::HashMap;

use async_trait::async_trait;
use log::info;
use nimbus_core::provider::ProviderResult;
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_from_json};
use nimbus_core::retry::{Operation, OperationKind, retry_with_wait};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use nimbus_core::wait::{STATUS_DELETED, wait_for_state};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::context::ProviderContext;
use crate::handler::{ResourceHandler, decode_config, deleted, found, observe};

const SERVICE: &str = "dms";

const BUSY: &[&str] = &["CREATING", "RESTARTING", "EXTENDING", "FREEZING"];
const RUNNING: &[&str] = &["RUNNING"];

fn default_engine_version() -> String {
    "2.7".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_engine_version")]
    pub engine_version: String,
    pub product_id: String,
    pub storage_space: u32,
    pub storage_spec_code: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub availability_zones: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaInfo {
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    pub engine_version: String,
    pub product_id: String,
    pub storage_space: u32,
    pub storage_spec_code: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
    #[serde(default)]
    pub available_zones: Vec<String>,
    #[serde(default)]
    pub connect_address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl KafkaInfo {
    fn attributes(&self) -> HashMap<String, Value> {
        let mut attrs = attributes_from_json(&json!({
            "name": self.name,
            "status": self.status,
            "engine_version": self.engine_version,
            "product_id": self.product_id,
            "storage_space": self.storage_space,
            "storage_spec_code": self.storage_spec_code,
            "vpc_id": self.vpc_id,
            "subnet_id": self.subnet_id,
            "security_group_id": self.security_group_id,
            "availability_zones": self.available_zones,
            "connect_address": self.connect_address,
            "port": self.port,
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
struct CreatedInstance {
    instance_id: String,
}

pub struct KafkaInstanceHandler;

impl KafkaInstanceHandler {
    fn instance_url(ctx: &ProviderContext, instance_id: &str) -> String {
        ctx.url(SERVICE, "v2", &format!("/instances/{}", instance_id))
    }

    async fn get(ctx: &ProviderContext, instance_id: &str) -> ProviderResult<Option<KafkaInfo>> {
        found(
            ctx.client
                .get_json::<KafkaInfo>(&Self::instance_url(ctx, instance_id))
                .await,
        )
    }
}

#[async_trait]
impl ResourceHandler for KafkaInstanceHandler {
    fn resource_type(&self) -> &'static str {
        "kafka_instance"
    }

    fn schema(&self) -> ResourceSchema {
        let fixed = |name: &str| {
            AttributeSchema::new(name, AttributeType::String)
                .required()
                .force_new()
        };
        ResourceSchema::new("kafka_instance")
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(
                AttributeSchema::new("engine_version", AttributeType::String)
                    .force_new()
                    .with_default(Value::String("2.7".into())),
            )
            .attribute(fixed("product_id"))
            .attribute(
                AttributeSchema::new("storage_space", types::positive_int())
                    .required()
                    .force_new(),
            )
            .attribute(fixed("storage_spec_code"))
            .attribute(fixed("vpc_id"))
            .attribute(fixed("subnet_id"))
            .attribute(fixed("security_group_id"))
            .attribute(
                AttributeSchema::new(
                    "availability_zones",
                    AttributeType::List(Box::new(AttributeType::String)),
                )
                .required()
                .force_new(),
            )
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(AttributeSchema::new("connect_address", AttributeType::String).computed())
            .attribute(AttributeSchema::new("port", AttributeType::Int).computed())
    }

    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let config: KafkaConfig = decode_config(resource)?;
        let url = ctx.url(SERVICE, "v2", "/instances");
        let body = json!({
            "name": config.name,
            "description": config.description,
            "engine": "kafka",
            "engine_version": config.engine_version,
            "product_id": config.product_id,
            "storage_space": config.storage_space,
            "storage_spec_code": config.storage_spec_code,
            "vpc_id": config.vpc_id,
            "subnet_id": config.subnet_id,
            "security_group_id": config.security_group_id,
            "available_zones": config.availability_zones,
        });
        let created: CreatedInstance = ctx.client.post_json(&url, &body).await?;
        let instance_id = created.instance_id;
        info!("creating {} as {}", resource.id, instance_id);

        let spec = ctx.wait_spec(&["CREATING"], RUNNING, ctx.timeouts.create);
        wait_for_state(&spec, || async {
            Ok(observe(Self::get(ctx, &instance_id).await?, |i| i.status.clone()))
        })
        .await?;
        self.read(ctx, &resource.id, &instance_id).await
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State> {
        Ok(match Self::get(ctx, identifier).await? {
            Some(instance) => State::existing(id.clone(), instance.attributes())
                .with_identifier(instance.instance_id),
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
        let config: KafkaConfig = decode_config(to)?;
        let url = Self::instance_url(ctx, identifier);
        let body = json!({
            "name": config.name,
            "description": config.description.unwrap_or_default(),
        });
        let stable = ctx.wait_spec(BUSY, RUNNING, ctx.timeouts.update);

        let _: JsonValue = retry_with_wait(
            &Operation::new(OperationKind::Update, id.clone()),
            &ctx.retry_policy(ctx.timeouts.update),
            &stable,
            || async { Ok(ctx.client.put_json(&url, &body).await?) },
            || async { Ok(observe(Self::get(ctx, identifier).await?, |i| i.status.clone())) },
        )
        .await?;

        self.read(ctx, id, identifier).await
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        _id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        deleted(ctx.client.delete(&Self::instance_url(ctx, identifier)).await)?;

        let mut pending: Vec<&str> = BUSY.to_vec();
        pending.extend_from_slice(RUNNING);
        pending.extend_from_slice(&["DELETING", "ERROR", "CREATEFAILED"]);
        let spec = ctx.wait_spec(&pending, &[STATUS_DELETED], ctx.timeouts.delete);
        wait_for_state(&spec, || async {
            Ok(observe(Self::get(ctx, identifier).await?, |i| i.status.clone()))
        })
        .await?;
        Ok(())
    }
}
