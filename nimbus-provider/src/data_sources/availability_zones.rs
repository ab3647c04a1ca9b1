//! availability_zones data source - Zones of the configured region

use async_trait::async_trait;
use nimbus_core::provider::ProviderResult;
use nimbus_core::resource::{Resource, State, Value};
use nimbus_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use serde::Deserialize;

use crate::context::ProviderContext;
use crate::handler::{DataSourceHandler, decode_config, string_list};

const SERVICE: &str = "ecs";

fn default_state() -> String {
    "available".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ZoneFilter {
    /// `available`, `unavailable` or `all`
    #[serde(default = "default_state")]
    state: String,
}

#[derive(Deserialize)]
struct ZoneList {
    #[serde(rename = "availabilityZoneInfo", default)]
    zones: Vec<Zone>,
}

#[derive(Deserialize)]
struct Zone {
    #[serde(rename = "zoneName")]
    name: String,
    #[serde(rename = "zoneState")]
    state: ZoneState,
}

#[derive(Deserialize)]
struct ZoneState {
    available: bool,
}

pub struct AvailabilityZones;

#[async_trait]
impl DataSourceHandler for AvailabilityZones {
    fn data_type(&self) -> &'static str {
        "availability_zones"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("availability_zones")
            .attribute(
                AttributeSchema::new(
                    "state",
                    AttributeType::Enum(vec![
                        "available".into(),
                        "unavailable".into(),
                        "all".into(),
                    ]),
                )
                .with_default(Value::String("available".into())),
            )
            .attribute(
                AttributeSchema::new("names", AttributeType::List(Box::new(AttributeType::String)))
                    .computed(),
            )
    }

    async fn read(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State> {
        let filter: ZoneFilter = decode_config(resource)?;
        let url = ctx.url(SERVICE, "v2.1", "/os-availability-zone");
        let list: ZoneList = ctx.client.get_json(&url).await?;

        let mut names: Vec<String> = list
            .zones
            .into_iter()
            .filter(|zone| match filter.state.as_str() {
                "available" => zone.state.available,
                "unavailable" => !zone.state.available,
                _ => true,
            })
            .map(|zone| zone.name)
            .collect();
        names.sort();

        let mut state = State::existing(resource.id.clone(), Default::default())
            .with_identifier(ctx.region());
        state.attributes.insert("state".to_string(), Value::String(filter.state));
        state.attributes.insert("names".to_string(), string_list(&names));
        Ok(state)
    }
}
