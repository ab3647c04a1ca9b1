//! Project configuration (`nimbus.toml`)
//!
//! ```toml
//! [provider]
//! region = "ap-southeast-1"
//! project_id = "0123456789abcdef"
//!
//! [backend]
//! type = "local"
//! path = "state/prod.json"
//!
//! [[data]]
//! type = "availability_zones"
//! name = "all"
//!
//! [[resources]]
//! type = "vpc"
//! name = "main"
//! cidr = "10.0.0.0/16"
//!
//! [[resources]]
//! type = "vpc_subnet"
//! name = "web"
//! vpc_id = "${vpc.main.id}"
//! cidr = "10.0.1.0/24"
//! gateway_ip = "10.0.1.1"
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nimbus_core::resource::{Resource, Value};
use nimbus_core::schema::ResourceSchema;
use nimbus_provider::Timeouts;
use nimbus_state::BackendConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub backend: Option<BackendSettings>,
    #[serde(default)]
    pub resources: Vec<ResourceBlock>,
    #[serde(default)]
    pub data: Vec<ResourceBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Domain suffix of the endpoints
    #[serde(default)]
    pub cloud: Option<String>,
    /// Per-service endpoint URLs
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Operation timeouts in seconds
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    #[serde(default)]
    pub create: Option<u64>,
    #[serde(default)]
    pub update: Option<u64>,
    #[serde(default)]
    pub delete: Option<u64>,
}

impl TimeoutSettings {
    pub fn to_timeouts(&self) -> Timeouts {
        let defaults = Timeouts::default();
        Timeouts {
            create: self.create.map(Duration::from_secs).unwrap_or(defaults.create),
            update: self.update.map(Duration::from_secs).unwrap_or(defaults.update),
            delete: self.delete.map(Duration::from_secs).unwrap_or(defaults.delete),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackendSettings {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, toml::Value>,
}

/// One `[[resources]]` or `[[data]]` table: `type`, `name` and attributes
#[derive(Debug, Deserialize)]
pub struct ResourceBlock {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, toml::Value>,
}

fn to_value(value: &toml::Value) -> Result<Option<Value>, ConfigError> {
    let json = serde_json::to_value(value)
        .map_err(|e| ConfigError::Invalid(format!("unsupported value {}: {}", value, e)))?;
    Ok(Value::from_json(&json))
}

fn to_attributes(
    attributes: &BTreeMap<String, toml::Value>,
) -> Result<HashMap<String, Value>, ConfigError> {
    let mut converted = HashMap::new();
    for (key, value) in attributes {
        if let Some(value) = to_value(value)? {
            converted.insert(key.clone(), value);
        }
    }
    Ok(converted)
}

impl ResourceBlock {
    fn to_resource(&self, read_only: bool) -> Result<Resource, ConfigError> {
        let mut resource =
            Resource::new(&self.resource_type, &self.name).with_read_only(read_only);
        resource.attributes = to_attributes(&self.attributes)?;
        // A managed resource is named after its block unless told otherwise
        if !read_only {
            resource
                .attributes
                .entry("name".to_string())
                .or_insert_with(|| Value::String(self.name.clone()));
        }
        Ok(resource)
    }
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<input>"),
            source,
        })
    }

    pub fn backend_config(&self) -> Result<BackendConfig, ConfigError> {
        match self.backend {
            Some(ref backend) => Ok(BackendConfig {
                backend_type: backend.backend_type.clone(),
                attributes: to_attributes(&backend.attributes)?,
            }),
            None => Ok(BackendConfig::new("local")),
        }
    }

    /// Data blocks followed by resources, each flagged accordingly
    pub fn declared(&self) -> Result<Vec<Resource>, ConfigError> {
        let mut declared = Vec::new();
        for block in &self.data {
            declared.push(block.to_resource(true)?);
        }
        for block in &self.resources {
            declared.push(block.to_resource(false)?);
        }
        Ok(declared)
    }
}

/// Check declared blocks against the provider's schemas and fill in
/// defaults. Collects every problem instead of stopping at the first.
pub fn validate(
    declared: &mut [Resource],
    resource_schemas: &HashMap<String, ResourceSchema>,
    data_schemas: &HashMap<String, ResourceSchema>,
) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let bindings: HashSet<String> = declared.iter().map(|r| r.id.binding()).collect();

    for resource in declared.iter_mut() {
        let kind = if resource.is_data_source() {
            "data source"
        } else {
            "resource"
        };
        if !seen.insert(resource.id.binding()) {
            errors.push(format!("{} is declared more than once", resource.id));
            continue;
        }

        let schemas = if resource.is_data_source() {
            data_schemas
        } else {
            resource_schemas
        };
        let Some(schema) = schemas.get(&resource.id.resource_type) else {
            errors.push(format!(
                "{}: unknown {} type '{}'",
                resource.id, kind, resource.id.resource_type
            ));
            continue;
        };

        for dependency in resource.dependencies() {
            if !bindings.contains(&dependency) {
                errors.push(format!(
                    "{}: reference to undeclared {}",
                    resource.id, dependency
                ));
            }
        }

        schema.apply_defaults(&mut resource.attributes);
        if let Err(type_errors) = schema.validate(&resource.attributes) {
            errors.extend(
                type_errors
                    .into_iter()
                    .map(|e| format!("{}: {}", resource.id, e)),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors.join("\n")))
    }
}
