//! security_group_rule - One ingress or egress rule of a security group
//!
//! Rules are immutable; every attribute forces replacement.

use std::collections::HashMap;

use async_trait::async_trait;
use nimbus_core::provider::{ProviderError, ProviderResult};
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_from_json};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use serde::Deserialize;
use serde_json::json;

use crate::context::ProviderContext;
use crate::handler::{ResourceHandler, decode_config, deleted, found};
use crate::resources::vpc::SERVICE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

fn default_ethertype() -> String {
    "IPv4".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub security_group_id: String,
    pub direction: Direction,
    #[serde(default = "default_ethertype")]
    pub ethertype: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port_range_min: Option<u16>,
    #[serde(default)]
    pub port_range_max: Option<u16>,
    #[serde(default)]
    pub remote_ip_prefix: Option<String>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RuleConfig {
    fn check(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.port_range_min, self.port_range_max)
            && min > max
        {
            return Err(format!(
                "port_range_min {} is greater than port_range_max {}",
                min, max
            ));
        }
        if (self.port_range_min.is_some() || self.port_range_max.is_some()) && self.protocol.is_none() {
            return Err("a port range requires a protocol".to_string());
        }
        if self.remote_ip_prefix.is_some() && self.remote_group_id.is_some() {
            return Err("remote_ip_prefix and remote_group_id are mutually exclusive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleInfo {
    pub id: String,
    pub security_group_id: String,
    pub direction: String,
    pub ethertype: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port_range_min: Option<u16>,
    #[serde(default)]
    pub port_range_max: Option<u16>,
    #[serde(default)]
    pub remote_ip_prefix: Option<String>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RuleInfo {
    fn attributes(&self) -> HashMap<String, Value> {
        attributes_from_json(&json!({
            "security_group_id": self.security_group_id,
            "direction": self.direction,
            "ethertype": self.ethertype,
            "protocol": self.protocol,
            "port_range_min": self.port_range_min,
            "port_range_max": self.port_range_max,
            "remote_ip_prefix": self.remote_ip_prefix,
            "remote_group_id": self.remote_group_id,
            "description": self.description.as_deref().filter(|d| !d.is_empty()),
        }))
    }
}

#[derive(Deserialize)]
struct RuleEnvelope {
    security_group_rule: RuleInfo,
}

pub struct SecurityGroupRuleHandler;

impl SecurityGroupRuleHandler {
    fn rule_url(ctx: &ProviderContext, rule_id: &str) -> String {
        ctx.url(SERVICE, "v1", &format!("/security-group-rules/{}", rule_id))
    }
}

#[async_trait]
impl ResourceHandler for SecurityGroupRuleHandler {
    fn resource_type(&self) -> &'static str {
        "security_group_rule"
    }

    fn schema(&self) -> ResourceSchema {
        let string = |name: &str| AttributeSchema::new(name, AttributeType::String).force_new();
        ResourceSchema::new("security_group_rule")
            .attribute(string("security_group_id").required())
            .attribute(
                AttributeSchema::new(
                    "direction",
                    AttributeType::Enum(vec!["ingress".into(), "egress".into()]),
                )
                .required()
                .force_new(),
            )
            .attribute(
                AttributeSchema::new(
                    "ethertype",
                    AttributeType::Enum(vec!["IPv4".into(), "IPv6".into()]),
                )
                .force_new()
                .with_default(Value::String("IPv4".into())),
            )
            .attribute(
                AttributeSchema::new(
                    "protocol",
                    AttributeType::Enum(vec!["tcp".into(), "udp".into(), "icmp".into()]),
                )
                .force_new(),
            )
            .attribute(AttributeSchema::new("port_range_min", types::port()).force_new())
            .attribute(AttributeSchema::new("port_range_max", types::port()).force_new())
            .attribute(AttributeSchema::new("remote_ip_prefix", types::cidr()).force_new())
            .attribute(string("remote_group_id"))
            .attribute(string("description"))
    }

    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let config: RuleConfig = decode_config(resource)?;
        config
            .check()
            .map_err(|msg| ProviderError::config(msg).for_resource(resource.id.clone()))?;

        let url = ctx.url(SERVICE, "v1", "/security-group-rules");
        let body = json!({
            "security_group_rule": {
                "security_group_id": config.security_group_id,
                "direction": match config.direction {
                    Direction::Ingress => "ingress",
                    Direction::Egress => "egress",
                },
                "ethertype": config.ethertype,
                "protocol": config.protocol,
                "port_range_min": config.port_range_min,
                "port_range_max": config.port_range_max,
                "remote_ip_prefix": config.remote_ip_prefix,
                "remote_group_id": config.remote_group_id,
                "description": config.description,
            }
        });
        let created: RuleEnvelope = ctx.client.post_json(&url, &body).await?;
        let rule = created.security_group_rule;
        Ok(State::existing(resource.id.clone(), rule.attributes()).with_identifier(rule.id))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State> {
        let url = Self::rule_url(ctx, identifier);
        Ok(match found(ctx.client.get_json::<RuleEnvelope>(&url).await)? {
            Some(e) => State::existing(id.clone(), e.security_group_rule.attributes())
                .with_identifier(e.security_group_rule.id),
            None => State::not_found(id.clone()),
        })
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        _id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        deleted(ctx.client.delete(&Self::rule_url(ctx, identifier)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use nimbus_core::provider::ErrorKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ssh_rule() -> Resource {
        Resource::new("security_group_rule", "ssh")
            .with_attribute("security_group_id", Value::String("sg-1".into()))
            .with_attribute("direction", Value::String("ingress".into()))
            .with_attribute("protocol", Value::String("tcp".into()))
            .with_attribute("port_range_min", Value::Int(22))
            .with_attribute("port_range_max", Value::Int(22))
            .with_attribute("remote_ip_prefix", Value::String("0.0.0.0/0".into()))
    }

    #[tokio::test]
    async fn create_ingress_rule() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/proj-1/security-group-rules"))
            .and(body_partial_json(json!({"security_group_rule": {
                "direction": "ingress", "ethertype": "IPv4", "port_range_min": 22
            }})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "security_group_rule": {
                    "id": "rule-1",
                    "security_group_id": "sg-1",
                    "direction": "ingress",
                    "ethertype": "IPv4",
                    "protocol": "tcp",
                    "port_range_min": 22,
                    "port_range_max": 22,
                    "remote_ip_prefix": "0.0.0.0/0",
                    "remote_group_id": null,
                    "description": ""
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let state = SecurityGroupRuleHandler.create(&ctx, &ssh_rule()).await.unwrap();

        assert_eq!(state.identifier.as_deref(), Some("rule-1"));
        assert_eq!(state.attributes.get("port_range_max"), Some(&Value::Int(22)));
        assert!(!state.attributes.contains_key("remote_group_id"));
        assert!(!state.attributes.contains_key("description"));
    }

    #[tokio::test]
    async fn inverted_port_range_is_rejected_before_any_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = context(&server).await;
        let rule = ssh_rule().with_attribute("port_range_min", Value::Int(80));
        let err = SecurityGroupRuleHandler.create(&ctx, &rule).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message.contains("greater than"));
    }

    #[tokio::test]
    async fn rules_cannot_be_updated() {
        let server = MockServer::start().await;
        let ctx = context(&server).await;
        let id = ResourceId::new("security_group_rule", "ssh");
        let from = State::existing(id.clone(), HashMap::new()).with_identifier("rule-1");

        let err = SecurityGroupRuleHandler
            .update(&ctx, &id, "rule-1", &from, &ssh_rule())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }

    #[test]
    fn every_attribute_forces_replacement() {
        let schema = SecurityGroupRuleHandler.schema();
        assert_eq!(schema.force_new_attributes().len(), schema.attributes.len());
    }
}
