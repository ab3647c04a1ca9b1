//! rds_instance - Managed relational database instance
//!
//! Every in-place change is a separate API call, and the database rejects a
//! call (`DBS.200019`) while the previous one is still being applied. Each
//! step therefore runs through `retry_with_wait` and then waits for the
//! instance to settle before the next one starts.

use std::collections::HashMap;

use async_trait::async_trait;
use log::info;
use nimbus_core::provider::{ProviderError, ProviderResult};
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_from_json};
use nimbus_core::retry::{Operation, OperationKind, retry_with_wait};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use nimbus_core::wait::{STATUS_DELETED, WaitSpec, wait_for_state};
use nimbus_sdk::pagination::with_query;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::context::ProviderContext;
use crate::handler::{ResourceHandler, carry_sensitive, decode_config, found, observe};

const SERVICE: &str = "rds";

/// Retention applied when neither the declaration nor the instance has one
const DEFAULT_BACKUP_KEEP_DAYS: i64 = 7;

/// Statuses of an instance that is applying a change
const BUSY: &[&str] = &[
    "BUILD",
    "MODIFYING",
    "REBOOTING",
    "RESTORING",
    "MODIFYING INSTANCE TYPE",
    "BACKING UP",
    "SWITCHOVER",
    "MIGRATING",
    "MODIFYING DATABASE PORT",
];
const ACTIVE: &[&str] = &["ACTIVE"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RdsConfig {
    pub name: String,
    pub datastore_type: String,
    pub datastore_version: String,
    pub flavor: String,
    pub volume_type: String,
    pub volume_size: u32,
    pub availability_zone: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub password: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub backup_start_time: Option<String>,
    #[serde(default)]
    pub backup_keep_days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RdsInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub datastore: Datastore,
    pub flavor_ref: String,
    pub volume: Volume,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub private_ips: Vec<String>,
    #[serde(default)]
    pub backup_strategy: Option<BackupStrategy>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Datastore {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupStrategy {
    pub start_time: String,
    pub keep_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub availability_zone: Option<String>,
}

impl RdsInfo {
    fn attributes(&self) -> HashMap<String, Value> {
        attributes_from_json(&json!({
            "name": self.name,
            "status": self.status,
            "datastore_type": self.datastore.kind,
            "datastore_version": self.datastore.version,
            "flavor": self.flavor_ref,
            "volume_type": self.volume.kind,
            "volume_size": self.volume.size,
            "availability_zone": self.nodes.iter().find_map(|n| n.availability_zone.as_deref()),
            "vpc_id": self.vpc_id,
            "subnet_id": self.subnet_id,
            "security_group_id": self.security_group_id,
            "port": self.port,
            "private_ips": self.private_ips,
            "backup_start_time": self.backup_strategy.as_ref().map(|b| b.start_time.as_str()),
            "backup_keep_days": self.backup_strategy.as_ref().map(|b| b.keep_days),
        }))
    }
}

#[derive(Deserialize)]
struct RdsList {
    #[serde(default)]
    instances: Vec<RdsInfo>,
}

#[derive(Deserialize)]
struct CreatedInstance {
    instance: CreatedId,
    #[serde(default)]
    job_id: Option<String>,
}

#[derive(Deserialize)]
struct CreatedId {
    id: String,
}

#[derive(Clone, Copy)]
enum Verb {
    Put,
    Post,
}

/// One in-place change
struct Step {
    name: &'static str,
    verb: Verb,
    url: String,
    body: JsonValue,
}

pub struct RdsInstanceHandler;

impl RdsInstanceHandler {
    /// Instances are only looked up through the filtered list API
    async fn get(ctx: &ProviderContext, instance_id: &str) -> ProviderResult<Option<RdsInfo>> {
        let url = with_query(
            &ctx.url(SERVICE, "v3", "/instances"),
            &[("id", Some(instance_id.to_string()))],
        )?;
        let list = found(ctx.client.get_json::<RdsList>(&url).await)?;
        Ok(list.and_then(|l| l.instances.into_iter().find(|i| i.id == instance_id)))
    }

    fn stable_spec(ctx: &ProviderContext) -> WaitSpec {
        // A change that was just accepted may not show up in the status yet
        ctx.wait_spec(BUSY, ACTIVE, ctx.timeouts.update)
            .with_continuous_target_occurrence(2)
    }

    /// Issue one mutating call, retrying while the instance is busy, then
    /// wait until it has applied it
    async fn apply_step(
        ctx: &ProviderContext,
        id: &ResourceId,
        instance_id: &str,
        step: Step,
    ) -> ProviderResult<()> {
        let stable = Self::stable_spec(ctx);
        let response: JsonValue = retry_with_wait(
            &Operation::new(OperationKind::Update, id.clone()),
            &ctx.retry_policy(ctx.timeouts.update),
            &stable,
            || async {
                Ok(match step.verb {
                    Verb::Put => ctx.client.put_json(&step.url, &step.body).await?,
                    Verb::Post => ctx.client.post_json(&step.url, &step.body).await?,
                })
            },
            || async { Ok(observe(Self::get(ctx, instance_id).await?, |i| i.status.clone())) },
        )
        .await
        .map_err(|e| e.context(step.name))?;

        match response.get("job_id").and_then(JsonValue::as_str) {
            Some(job_id) => info!("{}: {} submitted (job {})", id, step.name, job_id),
            None => info!("{}: {} submitted", id, step.name),
        }

        wait_for_state(&stable, || async {
            Ok(observe(Self::get(ctx, instance_id).await?, |i| i.status.clone()))
        })
        .await?;
        Ok(())
    }

    fn step(
        ctx: &ProviderContext,
        instance_id: &str,
        name: &'static str,
        verb: Verb,
        action: &str,
        body: JsonValue,
    ) -> Step {
        Step {
            name,
            verb,
            url: ctx.url(SERVICE, "v3", &format!("/instances/{}/{}", instance_id, action)),
            body,
        }
    }
}
#[async_trait]
impl ResourceHandler for RdsInstanceHandler {
    fn resource_type(&self) -> &'static str {
        "rds_instance"
    }

    fn schema(&self) -> ResourceSchema {
        let fixed = |name: &str| {
            AttributeSchema::new(name, AttributeType::String)
                .required()
                .force_new()
        };
        ResourceSchema::new("rds_instance")
            .with_description("Relational database instance")
            .attribute(AttributeSchema::new("name", types::resource_name()).required())
            .attribute(
                AttributeSchema::new(
                    "datastore_type",
                    AttributeType::Enum(vec![
                        "MySQL".into(),
                        "PostgreSQL".into(),
                        "SQLServer".into(),
                    ]),
                )
                .required()
                .force_new(),
            )
            .attribute(fixed("datastore_version"))
            .attribute(AttributeSchema::new("flavor", AttributeType::String).required())
            .attribute(fixed("volume_type"))
            .attribute(
                AttributeSchema::new("volume_size", types::positive_int())
                    .required()
                    .with_description("Storage in GB; it can be enlarged but never shrunk"),
            )
            .attribute(fixed("availability_zone"))
            .attribute(fixed("vpc_id"))
            .attribute(fixed("subnet_id"))
            .attribute(fixed("security_group_id"))
            .attribute(
                AttributeSchema::new("password", AttributeType::String)
                    .required()
                    .sensitive(),
            )
            .attribute(AttributeSchema::new("port", types::port()).optional_computed().force_new())
            .attribute(AttributeSchema::new("backup_start_time", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("backup_keep_days", AttributeType::Int).optional_computed())
            .attribute(AttributeSchema::new("status", AttributeType::String).computed())
            .attribute(
                AttributeSchema::new("private_ips", AttributeType::List(Box::new(AttributeType::String)))
                    .computed(),
            )
    }

    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let config: RdsConfig = decode_config(resource)?;
        let url = ctx.url(SERVICE, "v3", "/instances");
        let backup = config.backup_start_time.as_ref().map(|start_time| {
            json!({"start_time": start_time, "keep_days": config.backup_keep_days.unwrap_or(7)})
        });
        let body = json!({
            "name": config.name,
            "datastore": {"type": config.datastore_type, "version": config.datastore_version},
            "flavor_ref": config.flavor,
            "volume": {"type": config.volume_type, "size": config.volume_size},
            "region": ctx.region(),
            "availability_zone": config.availability_zone,
            "vpc_id": config.vpc_id,
            "subnet_id": config.subnet_id,
            "security_group_id": config.security_group_id,
            "password": config.password,
            "port": config.port.map(|p| p.to_string()),
            "backup_strategy": backup,
        });

        let created: CreatedInstance = ctx.client.post_json(&url, &body).await?;
        let instance_id = created.instance.id;
        info!(
            "creating {} as {} (job {})",
            resource.id,
            instance_id,
            created.job_id.as_deref().unwrap_or("-")
        );

        let spec = ctx.wait_spec(&["BUILD"], ACTIVE, ctx.timeouts.create);
        wait_for_state(&spec, || async {
            Ok(observe(Self::get(ctx, &instance_id).await?, |i| i.status.clone()))
        })
        .await?;

        let mut state = self.read(ctx, &resource.id, &instance_id).await?;
        carry_sensitive(&self.schema(), &resource.attributes, &mut state);
        Ok(state)
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State> {
        Ok(match Self::get(ctx, identifier).await? {
            Some(instance) => {
                State::existing(id.clone(), instance.attributes()).with_identifier(instance.id)
            }
            None => State::not_found(id.clone()),
        })
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let config: RdsConfig = decode_config(to)?;
        let current = |name: &str| from.attributes.get(name);

        let current_size = match current("volume_size") {
            Some(Value::Int(size)) => Some(*size),
            _ => None,
        };
        if let Some(size) = current_size
            && i64::from(config.volume_size) < size
        {
            return Err(ProviderError::config(format!(
                "volume_size can't shrink from {} to {}",
                size, config.volume_size
            ))
            .for_resource(id.clone()));
        }

        let mut steps = Vec::new();
        if current("name").and_then(Value::as_str) != Some(config.name.as_str()) {
            let body = json!({"name": config.name});
            steps.push(Self::step(ctx, identifier, "rename", Verb::Put, "name", body));
        }
        if current("password").and_then(Value::as_str) != Some(config.password.as_str()) {
            let body = json!({"db_user_pwd": config.password});
            steps.push(Self::step(ctx, identifier, "reset password", Verb::Post, "password", body));
        }
        if current("flavor").and_then(Value::as_str) != Some(config.flavor.as_str()) {
            let body = json!({"resize_flavor": {"spec_code": config.flavor}});
            steps.push(Self::step(ctx, identifier, "resize flavor", Verb::Post, "action", body));
        }
        if current_size != Some(i64::from(config.volume_size)) {
            let body = json!({"enlarge_volume": {"size": config.volume_size}});
            steps.push(Self::step(ctx, identifier, "enlarge volume", Verb::Post, "action", body));
        }

        let start_time_changed = config
            .backup_start_time
            .as_deref()
            .is_some_and(|t| current("backup_start_time").and_then(Value::as_str) != Some(t));
        let keep_days_changed = config
            .backup_keep_days
            .is_some_and(|days| current("backup_keep_days") != Some(&Value::Int(i64::from(days))));
        if start_time_changed || keep_days_changed {
            let start_time = config.backup_start_time.clone().or_else(|| {
                current("backup_start_time")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
            // Undeclared retention keeps what the instance has now
            let keep_days = config.backup_keep_days.map(i64::from).unwrap_or_else(|| {
                match current("backup_keep_days") {
                    Some(Value::Int(days)) => *days,
                    _ => DEFAULT_BACKUP_KEEP_DAYS,
                }
            });
            let body = json!({"backup_policy": {
                "start_time": start_time,
                "keep_days": keep_days,
            }});
            steps.push(Self::step(
                ctx,
                identifier,
                "update backup policy",
                Verb::Put,
                "backups/policy",
                body,
            ));
        }

        for step in steps {
            Self::apply_step(ctx, id, identifier, step).await?;
        }

        let mut state = self.read(ctx, id, identifier).await?;
        carry_sensitive(&self.schema(), &to.attributes, &mut state);
        Ok(state)
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        let url = ctx.url(SERVICE, "v3", &format!("/instances/{}", identifier));
        if let Some(response) = found(ctx.client.delete(&url).await)? {
            let job_id = response.get("job_id").and_then(JsonValue::as_str).unwrap_or("-");
            info!("deleting {} (job {})", id, job_id);
        }

        let mut pending: Vec<&str> = BUSY.to_vec();
        pending.extend_from_slice(ACTIVE);
        pending.extend_from_slice(&["DELETING", "FAILED"]);
        let spec = ctx.wait_spec(&pending, &[STATUS_DELETED], ctx.timeouts.delete);
        wait_for_state(&spec, || async {
            Ok(observe(Self::get(ctx, identifier).await?, |i| i.status.clone()))
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use nimbus_core::provider::ErrorKind;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance_json(status: &str, flavor: &str, size: u32) -> serde_json::Value {
        json!({"instances": [{
            "id": "rds-1",
            "name": "orders",
            "status": status,
            "port": 3306,
            "datastore": {"type": "MySQL", "version": "8.0"},
            "flavor_ref": flavor,
            "volume": {"type": "CLOUDSSD", "size": size},
            "vpc_id": "vpc-1",
            "subnet_id": "subnet-1",
            "security_group_id": "sg-1",
            "private_ips": ["10.0.1.20"],
            "backup_strategy": {"start_time": "01:00-02:00", "keep_days": 7},
            "nodes": [{"availability_zone": "az-1"}]
        }], "total_count": 1})
    }

    fn declared(flavor: &str, size: i64) -> Resource {
        let s = |v: &str| Value::String(v.to_string());
        Resource::new("rds_instance", "orders")
            .with_attribute("name", s("orders"))
            .with_attribute("datastore_type", s("MySQL"))
            .with_attribute("datastore_version", s("8.0"))
            .with_attribute("flavor", s(flavor))
            .with_attribute("volume_type", s("CLOUDSSD"))
            .with_attribute("volume_size", Value::Int(size))
            .with_attribute("availability_zone", s("az-1"))
            .with_attribute("vpc_id", s("vpc-1"))
            .with_attribute("subnet_id", s("subnet-1"))
            .with_attribute("security_group_id", s("sg-1"))
            .with_attribute("password", s("S3cret!pw"))
    }

    fn current(flavor: &str, size: i64) -> State {
        let mut attrs = declared(flavor, size).attributes;
        attrs.insert("backup_start_time".into(), Value::String("01:00-02:00".into()));
        attrs.insert("backup_keep_days".into(), Value::Int(7));
        State::existing(ResourceId::new("rds_instance", "orders"), attrs).with_identifier("rds-1")
    }

    #[tokio::test]
    async fn create_waits_for_active_and_keeps_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/proj-1/instances"))
            .and(body_partial_json(json!({"volume": {"size": 40}, "region": "region-1"})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "instance": {"id": "rds-1"}, "job_id": "job-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/proj-1/instances"))
            .and(query_param("id", "rds-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instance_json("ACTIVE", "rds.mysql.c2.large", 40)))
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let state = RdsInstanceHandler
            .create(&ctx, &declared("rds.mysql.c2.large", 40))
            .await
            .unwrap();

        assert_eq!(state.identifier.as_deref(), Some("rds-1"));
        assert_eq!(state.attributes.get("volume_size"), Some(&Value::Int(40)));
        assert_eq!(state.attributes.get("port"), Some(&Value::Int(3306)));
        assert_eq!(
            state.attributes.get("password"),
            Some(&Value::String("S3cret!pw".into()))
        );
    }

    #[tokio::test]
    async fn empty_list_reads_as_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/proj-1/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"instances": [], "total_count": 0})))
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let state = RdsInstanceHandler
            .read(&ctx, &ResourceId::new("rds_instance", "orders"), "rds-1")
            .await
            .unwrap();
        assert!(!state.exists);
    }

    #[tokio::test]
    async fn shrinking_volume_is_rejected_before_any_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "job-1"})))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let id = ResourceId::new("rds_instance", "orders");
        let err = RdsInstanceHandler
            .update(&ctx, &id, "rds-1", &current("rds.mysql.c2.large", 100), &declared("rds.mysql.c2.large", 40))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message.contains("can't shrink"));
    }

    #[tokio::test]
    async fn resize_retries_while_instance_busy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/proj-1/instances/rds-1/action"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error_code": "DBS.200019", "error_msg": "Another operation is being performed"
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/proj-1/instances/rds-1/action"))
            .and(body_partial_json(json!({"resize_flavor": {"spec_code": "rds.mysql.c2.xlarge"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "job-2"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/proj-1/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instance_json("ACTIVE", "rds.mysql.c2.xlarge", 40)))
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let id = ResourceId::new("rds_instance", "orders");
        let state = RdsInstanceHandler
            .update(&ctx, &id, "rds-1", &current("rds.mysql.c2.large", 40), &declared("rds.mysql.c2.xlarge", 40))
            .await
            .unwrap();
        assert_eq!(
            state.attributes.get("flavor"),
            Some(&Value::String("rds.mysql.c2.xlarge".into()))
        );
    }

    #[tokio::test]
    async fn enlarge_volume_posts_new_size() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/proj-1/instances/rds-1/action"))
            .and(body_partial_json(json!({"enlarge_volume": {"size": 100}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "job-3"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/proj-1/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instance_json("ACTIVE", "rds.mysql.c2.large", 100)))
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let id = ResourceId::new("rds_instance", "orders");
        let state = RdsInstanceHandler
            .update(&ctx, &id, "rds-1", &current("rds.mysql.c2.large", 40), &declared("rds.mysql.c2.large", 100))
            .await
            .unwrap();
        assert_eq!(state.attributes.get("volume_size"), Some(&Value::Int(100)));
    }

    #[tokio::test]
    async fn backup_window_change_keeps_current_retention() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v3/proj-1/instances/rds-1/backups/policy"))
            .and(body_partial_json(json!({"backup_policy": {
                "start_time": "03:00-04:00",
                "keep_days": 14
            }})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/proj-1/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instance_json("ACTIVE", "rds.mysql.c2.large", 40)))
            .mount(&server)
            .await;

        let mut from = current("rds.mysql.c2.large", 40);
        from.attributes.insert("backup_keep_days".into(), Value::Int(14));
        let to = declared("rds.mysql.c2.large", 40)
            .with_attribute("backup_start_time", Value::String("03:00-04:00".into()));

        let ctx = context(&server).await;
        let id = ResourceId::new("rds_instance", "orders");
        RdsInstanceHandler
            .update(&ctx, &id, "rds-1", &from, &to)
            .await
            .unwrap();
    }
}
