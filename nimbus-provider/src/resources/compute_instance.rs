//! compute_instance - Elastic cloud server
//!
//! Creation, resize and deletion are asynchronous jobs. After the job
//! finishes the server itself is polled until it settles.

use std::collections::HashMap;

use async_trait::async_trait;
use log::info;
use nimbus_core::provider::{ProviderError, ProviderResult};
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_from_json};
use nimbus_core::retry::{Operation, OperationKind, retry_with_wait};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use nimbus_core::wait::{STATUS_DELETED, WaitSpec, wait_for_state};
use nimbus_sdk::jobs::{JobResponse, wait_for_job};
use serde::Deserialize;
use serde_json::json;

use crate::context::ProviderContext;
use crate::handler::{ResourceHandler, carry_sensitive, decode_config, found, observe};

const SERVICE: &str = "ecs";
const VOLUME_SERVICE: &str = "evs";

/// Statuses a server passes through while an operation is running
const TRANSITIONAL: &[&str] = &[
    "BUILD",
    "REBOOT",
    "HARD_REBOOT",
    "REBUILD",
    "MIGRATING",
    "RESIZE",
    "VERIFY_RESIZE",
    "REVERT_RESIZE",
];
const STABLE: &[&str] = &["ACTIVE", "SHUTOFF"];

fn default_volume_type() -> String {
    "SSD".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    pub name: String,
    pub image_id: String,
    pub flavor_ref: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub availability_zone: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default = "default_volume_type")]
    pub root_volume_type: String,
    #[serde(default)]
    pub root_volume_size: Option<u32>,
    #[serde(default)]
    pub admin_pass: Option<String>,
    #[serde(default)]
    pub key_pair: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub flavor: IdRef,
    #[serde(default)]
    pub image: Option<IdRef>,
    #[serde(rename = "OS-EXT-AZ:availability_zone", default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub addresses: HashMap<String, Vec<Address>>,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupRef>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(rename = "os-extended-volumes:volumes_attached", default)]
    pub volumes_attached: Vec<AttachedVolume>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedVolume {
    pub id: String,
    #[serde(rename = "bootIndex", default)]
    pub boot_index: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct InterfaceAttachment {
    /// Subnet the NIC is plugged into
    net_id: String,
}

#[derive(Deserialize)]
struct InterfaceList {
    #[serde(rename = "interfaceAttachments", default)]
    interface_attachments: Vec<InterfaceAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
struct VolumeInfo {
    volume_type: String,
    size: u32,
}

#[derive(Deserialize)]
struct VolumeEnvelope {
    volume: VolumeInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    pub addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroupRef {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

impl ServerInfo {
    fn private_ip(&self) -> Option<&str> {
        let mut networks: Vec<&String> = self.addresses.keys().collect();
        networks.sort();
        networks
            .into_iter()
            .flat_map(|network| &self.addresses[network])
            .find(|a| a.kind.as_deref().unwrap_or("fixed") == "fixed")
            .map(|a| a.addr.as_str())
    }

    fn boot_volume(&self) -> Option<&str> {
        self.volumes_attached
            .iter()
            .find(|v| v.boot_index.as_deref() == Some("0"))
            .map(|v| v.id.as_str())
    }

    fn attributes(&self) -> HashMap<String, Value> {
        let security_groups: Vec<&str> = self
            .security_groups
            .iter()
            .map(|sg| sg.id.as_deref().unwrap_or(&sg.name))
            .collect();
        attributes_from_json(&json!({
            "name": self.name,
            "status": self.status,
            "flavor_ref": self.flavor.id,
            "image_id": self.image.as_ref().map(|i| i.id.as_str()),
            "availability_zone": self.availability_zone,
            "vpc_id": self.metadata.get("vpc_id"),
            "security_groups": security_groups,
            "key_pair": self.key_name,
            "private_ip": self.private_ip(),
        }))
    }
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerInfo,
}

pub struct ComputeInstanceHandler;

impl ComputeInstanceHandler {
    fn server_url(ctx: &ProviderContext, server_id: &str) -> String {
        ctx.url(SERVICE, "v1", &format!("/cloudservers/{}", server_id))
    }

    /// Soft-deleted servers are reported with status `DELETED` for a while
    async fn get(ctx: &ProviderContext, server_id: &str) -> ProviderResult<Option<ServerInfo>> {
        let envelope = found(
            ctx.client
                .get_json::<ServerEnvelope>(&Self::server_url(ctx, server_id))
                .await,
        )?;
        Ok(envelope
            .map(|e| e.server)
            .filter(|s| s.status != STATUS_DELETED))
    }

    /// Placement the server API doesn't echo: the primary NIC's subnet and
    /// the root volume. Either lookup coming back 404 leaves it out.
    async fn placement(
        ctx: &ProviderContext,
        server: &ServerInfo,
    ) -> ProviderResult<HashMap<String, Value>> {
        let mut attributes = HashMap::new();

        let url = ctx.url(SERVICE, "v1", &format!("/cloudservers/{}/os-interface", server.id));
        let nics = found(ctx.client.get_json::<InterfaceList>(&url).await)?;
        if let Some(primary) = nics.and_then(|l| l.interface_attachments.into_iter().next()) {
            attributes.insert("subnet_id".to_string(), Value::String(primary.net_id));
        }

        if let Some(volume_id) = server.boot_volume() {
            let url = ctx.url(VOLUME_SERVICE, "v2", &format!("/cloudvolumes/{}", volume_id));
            if let Some(envelope) = found(ctx.client.get_json::<VolumeEnvelope>(&url).await)? {
                attributes.insert(
                    "root_volume_type".to_string(),
                    Value::String(envelope.volume.volume_type),
                );
                attributes.insert(
                    "root_volume_size".to_string(),
                    Value::Int(i64::from(envelope.volume.size)),
                );
            }
        }

        Ok(attributes)
    }

    async fn wait(ctx: &ProviderContext, server_id: &str, spec: &WaitSpec) -> ProviderResult<()> {
        wait_for_state(spec, || async {
            Ok(observe(Self::get(ctx, server_id).await?, |s| s.status.clone()))
        })
        .await?;
        Ok(())
    }

    async fn resize(
        ctx: &ProviderContext,
        id: &ResourceId,
        server_id: &str,
        flavor_ref: &str,
    ) -> ProviderResult<()> {
        let url = ctx.url(SERVICE, "v1.1", &format!("/cloudservers/{}/resize", server_id));
        let body = json!({"resize": {"flavorRef": flavor_ref}});
        let stable = ctx.wait_spec(TRANSITIONAL, STABLE, ctx.timeouts.update);

        let job: JobResponse = retry_with_wait(
            &Operation::new(OperationKind::Update, id.clone()),
            &ctx.retry_policy(ctx.timeouts.update),
            &stable,
            || async { Ok(ctx.client.post_json(&url, &body).await?) },
            || async { Ok(observe(Self::get(ctx, server_id).await?, |s| s.status.clone())) },
        )
        .await?;

        info!("resizing {} to {} (job {})", id, flavor_ref, job.job_id);
        wait_for_job(&ctx.client, SERVICE, &job.job_id, &ctx.job_spec(ctx.timeouts.update)).await?;
        Self::wait(ctx, server_id, &stable).await
    }
}

#[async_trait]
impl ResourceHandler for ComputeInstanceHandler {
    fn resource_type(&self) -> &'static str {
        "compute_instance"
    }

    fn schema(&self) -> ResourceSchema {
        let fixed = |name: &str| {
            AttributeSchema::new(name, AttributeType::String)
                .required()
                .force_new()
        };
        ResourceSchema::new("compute_instance")
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(fixed("image_id"))
            .attribute(
                AttributeSchema::new("flavor_ref", AttributeType::String)
                    .required()
                    .with_description("Changing the flavor resizes the server"),
            )
            .attribute(fixed("vpc_id"))
            .attribute(fixed("subnet_id"))
            .attribute(fixed("availability_zone"))
            .attribute(
                AttributeSchema::new(
                    "security_groups",
                    AttributeType::List(Box::new(AttributeType::String)),
                )
                .optional_computed()
                .force_new(),
            )
            .attribute(
                AttributeSchema::new(
                    "root_volume_type",
                    AttributeType::Enum(vec![
                        "SATA".into(),
                        "SAS".into(),
                        "SSD".into(),
                        "GPSSD".into(),
                    ]),
                )
                .force_new()
                .with_default(Value::String("SSD".into())),
            )
            .attribute(AttributeSchema::new("root_volume_size", types::positive_int()).force_new())
            .attribute(
                AttributeSchema::new("admin_pass", AttributeType::String)
                    .sensitive()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("key_pair", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(AttributeSchema::new("private_ip", AttributeType::String).computed())
    }

    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let config: InstanceConfig = decode_config(resource)?;
        let url = ctx.url(SERVICE, "v1", "/cloudservers");
        let security_groups: Vec<_> = config
            .security_groups
            .iter()
            .map(|id| json!({"id": id}))
            .collect();
        let body = json!({
            "server": {
                "name": config.name,
                "imageRef": config.image_id,
                "flavorRef": config.flavor_ref,
                "vpcid": config.vpc_id,
                "nics": [{"subnet_id": config.subnet_id}],
                "security_groups": security_groups,
                "availability_zone": config.availability_zone,
                "root_volume": {
                    "volumetype": config.root_volume_type,
                    "size": config.root_volume_size,
                },
                "adminPass": config.admin_pass,
                "key_name": config.key_pair,
            }
        });

        let job: JobResponse = ctx.client.post_json(&url, &body).await?;
        info!("creating {} (job {})", resource.id, job.job_id);
        let finished = wait_for_job(&ctx.client, SERVICE, &job.job_id, &ctx.job_spec(ctx.timeouts.create)).await?;
        let server_id = finished
            .resource_id()
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::new(format!("job {} finished without a server id", job.job_id))
            })?;

        let spec = ctx.wait_spec(&["BUILD"], &["ACTIVE"], ctx.timeouts.create);
        Self::wait(ctx, &server_id, &spec).await?;

        let mut state = self.read(ctx, &resource.id, &server_id).await?;
        carry_sensitive(&self.schema(), &resource.attributes, &mut state);
        state
            .attributes
            .entry("subnet_id".to_string())
            .or_insert(Value::String(config.subnet_id));
        state
            .attributes
            .entry("root_volume_type".to_string())
            .or_insert(Value::String(config.root_volume_type));
        Ok(state)
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State> {
        let Some(server) = Self::get(ctx, identifier).await? else {
            return Ok(State::not_found(id.clone()));
        };
        let mut attributes = server.attributes();
        attributes.extend(Self::placement(ctx, &server).await?);
        Ok(State::existing(id.clone(), attributes).with_identifier(server.id))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let config: InstanceConfig = decode_config(to)?;

        if from.attributes.get("name").and_then(Value::as_str) != Some(config.name.as_str()) {
            let body = json!({"server": {"name": config.name}});
            let _: serde_json::Value = ctx
                .client
                .put_json(&Self::server_url(ctx, identifier), &body)
                .await?;
        }

        if from.attributes.get("flavor_ref").and_then(Value::as_str) != Some(config.flavor_ref.as_str()) {
            Self::resize(ctx, id, identifier, &config.flavor_ref).await?;
        }

        let mut state = self.read(ctx, id, identifier).await?;
        carry_sensitive(&self.schema(), &to.attributes, &mut state);
        for carried in ["subnet_id", "root_volume_type", "root_volume_size"] {
            if let Some(value) = from.attributes.get(carried) {
                state.attributes.entry(carried.to_string()).or_insert(value.clone());
            }
        }
        Ok(state)
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        _id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        if Self::get(ctx, identifier).await?.is_none() {
            return Ok(());
        }

        let url = ctx.url(SERVICE, "v1", "/cloudservers/delete");
        let body = json!({
            "servers": [{"id": identifier}],
            "delete_publicip": false,
            "delete_volume": true,
        });
        let job: JobResponse = ctx.client.post_json(&url, &body).await?;
        wait_for_job(&ctx.client, SERVICE, &job.job_id, &ctx.job_spec(ctx.timeouts.delete)).await?;

        let mut pending: Vec<&str> = TRANSITIONAL.to_vec();
        pending.extend_from_slice(STABLE);
        pending.push("ERROR");
        let spec = ctx.wait_spec(&pending, &[STATUS_DELETED], ctx.timeouts.delete);
        Self::wait(ctx, identifier, &spec).await
    }
}
