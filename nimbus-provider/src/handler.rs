//! Handler - Per-resource-type CRUD behind one trait
//!
//! Each resource type decodes its declared attributes into a typed config
//! struct at entry, talks to the SDK, and flattens the API response back
//! into a `State`.

use std::collections::HashMap;

use async_trait::async_trait;
use nimbus_core::provider::{ProviderError, ProviderResult, ResourceType};
use nimbus_core::resource::{Resource, ResourceId, State, Value, attributes_to_json};
use nimbus_core::schema::ResourceSchema;
use nimbus_core::wait::Snapshot;
use nimbus_sdk::SdkError;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::context::ProviderContext;

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Resource type name (e.g., "vpc")
    fn resource_type(&self) -> &'static str;

    fn schema(&self) -> ResourceSchema;

    /// Create the resource and wait until it is usable
    async fn create(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State>;

    /// Read by cloud identifier; `State::not_found` when it no longer exists
    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<State>;

    async fn update(
        &self,
        _ctx: &ProviderContext,
        id: &ResourceId,
        _identifier: &str,
        _from: &State,
        _to: &Resource,
    ) -> ProviderResult<State> {
        Err(ProviderError::unsupported(format!(
            "{} can't be updated in place",
            id.resource_type
        )))
    }

    /// Delete and wait until it is gone. Already deleted is success.
    async fn delete(&self, ctx: &ProviderContext, id: &ResourceId, identifier: &str)
    -> ProviderResult<()>;
}

#[async_trait]
pub trait DataSourceHandler: Send + Sync {
    fn data_type(&self) -> &'static str;

    fn schema(&self) -> ResourceSchema;

    async fn read(&self, ctx: &ProviderContext, resource: &Resource) -> ProviderResult<State>;
}

/// `ResourceType` description of a registered handler
pub struct HandlerType {
    name: &'static str,
    schema: ResourceSchema,
    data_source: bool,
}

impl HandlerType {
    pub fn resource(handler: &dyn ResourceHandler) -> Self {
        Self {
            name: handler.resource_type(),
            schema: handler.schema(),
            data_source: false,
        }
    }

    pub fn data_source(handler: &dyn DataSourceHandler) -> Self {
        Self {
            name: handler.data_type(),
            schema: handler.schema(),
            data_source: true,
        }
    }
}

impl ResourceType for HandlerType {
    fn name(&self) -> &'static str {
        self.name
    }

    fn schema(&self) -> ResourceSchema {
        self.schema.clone()
    }

    fn is_data_source(&self) -> bool {
        self.data_source
    }
}

/// Decode declared attributes into a typed config. Unknown attributes and
/// unresolved references are configuration errors.
pub fn decode_config<T: DeserializeOwned>(resource: &Resource) -> ProviderResult<T> {
    if let Some((name, _)) = resource
        .attributes
        .iter()
        .find(|(_, value)| value.has_reference())
    {
        return Err(ProviderError::config(format!(
            "attribute '{}' still references another resource",
            name
        ))
        .for_resource(resource.id.clone()));
    }

    serde_json::from_value(attributes_to_json(&resource.attributes)).map_err(|e| {
        ProviderError::config(format!("invalid configuration: {}", e))
            .for_resource(resource.id.clone())
    })
}

/// Interpret a read response: a 404 means the object doesn't exist, any
/// other error is returned
pub fn found<T>(result: Result<T, SdkError>) -> ProviderResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Interpret a delete response: deleting something already gone succeeds
pub fn deleted(result: Result<JsonValue, SdkError>) -> ProviderResult<()> {
    found(result).map(|_| ())
}

/// Poller observation of an object that may be gone
pub fn observe<T>(value: Option<T>, status: impl FnOnce(&T) -> String) -> Snapshot<T> {
    match value {
        Some(value) => {
            let status = status(&value);
            Snapshot::found(value, status)
        }
        None => Snapshot::deleted(),
    }
}

/// Copy write-only sensitive attributes (passwords) from the declaration,
/// since the API never returns them
pub fn carry_sensitive(schema: &ResourceSchema, declared: &HashMap<String, Value>, state: &mut State) {
    for (name, value) in declared {
        if schema.is_sensitive(name) && !state.attributes.contains_key(name) {
            state.attributes.insert(name.clone(), value.clone());
        }
    }
}

/// List value of strings
pub fn string_list(values: &[String]) -> Value {
    Value::List(values.iter().cloned().map(Value::String).collect())
}
