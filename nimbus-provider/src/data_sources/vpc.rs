//! vpc data source - Look up an existing VPC by its attributes

use async_trait::async_trait;
use log::debug;
use nimbus_core::provider::{ProviderError, ProviderResult};
use nimbus_core::resource::{Resource, State, Value};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use nimbus_sdk::pagination::{DEFAULT_PAGE_SIZE, collect_marker, with_query};
use serde::Deserialize;

use crate::context::ProviderContext;
use crate::handler::{DataSourceHandler, decode_config};
use crate::resources::vpc::{SERVICE, VpcInfo};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VpcFilter {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cidr: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl VpcFilter {
    fn matches(&self, vpc: &VpcInfo) -> bool {
        let check = |wanted: &Option<String>, actual: &str| {
            wanted.as_deref().is_none_or(|w| w == actual)
        };
        check(&self.id, &vpc.id)
            && check(&self.name, &vpc.name)
            && check(&self.cidr, &vpc.cidr)
            && check(&self.status, &vpc.status)
    }
}

#[derive(Deserialize)]
struct VpcPage {
    #[serde(default)]
    vpcs: Vec<VpcInfo>,
}

pub struct VpcLookup;

#[async_trait]
impl DataSourceHandler for VpcLookup {
    fn data_type(&self) -> &'static str {
        "vpc"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("vpc")
            .with_description("Existing VPC matched by id, name, cidr or status")
            .attribute(AttributeSchema::new("id", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("name", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("cidr", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("status", AttributeType::String).optional_computed())
            .attribute(AttributeSchema::new("description", AttributeType::String).computed())
            .attribute(AttributeSchema::new("enterprise_project_id", AttributeType::String).computed())
    }

    async fn read(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let filter: VpcFilter = decode_config(resource)?;
        let base = ctx.url(SERVICE, "v1", "/vpcs");

        let vpcs = collect_marker(
            DEFAULT_PAGE_SIZE,
            |marker| {
                let base = base.clone();
                async move {
                    let url = with_query(
                        &base,
                        &[("limit", Some(DEFAULT_PAGE_SIZE.to_string())), ("marker", marker)],
                    )?;
                    Ok(ctx.client.get_json::<VpcPage>(&url).await?.vpcs)
                }
            },
            |vpc| vpc.id.clone(),
        )
        .await?;
        debug!("{} vpcs listed for {}", vpcs.len(), resource.id);

        let mut matched: Vec<VpcInfo> = vpcs.into_iter().filter(|v| filter.matches(v)).collect();
        let vpc = match matched.len() {
            0 => {
                return Err(ProviderError::not_found("no VPC matches the given arguments")
                    .for_resource(resource.id.clone()));
            }
            1 => matched.remove(0),
            n => {
                return Err(ProviderError::config(format!(
                    "{} VPCs match the given arguments, narrow the search",
                    n
                ))
                .for_resource(resource.id.clone()));
            }
        };

        let mut attributes = vpc.attributes();
        attributes.insert("id".to_string(), Value::String(vpc.id.clone()));
        Ok(State::existing(resource.id.clone(), attributes).with_identifier(vpc.id))
    }
}
