//! Nimbus provider implementation
//!
//! Routes each resource type to its handler and shares one
//! `ProviderContext` between them.

use std::collections::HashMap;

use log::debug;
use nimbus_core::provider::{ProviderError, ProviderResult};
use nimbus_core::resource::{Resource, ResourceId, State};
use nimbus_sdk::{ApiClient, ClientConfig};

use crate::context::ProviderContext;
use crate::handler::{DataSourceHandler, ResourceHandler};
use crate::{data_sources, resources};

/// Nimbus cloud provider
pub struct NimbusProvider {
    ctx: ProviderContext,
    handlers: HashMap<&'static str, Box<dyn ResourceHandler>>,
    data_sources: HashMap<&'static str, Box<dyn DataSourceHandler>>,
}

impl NimbusProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self {
            ctx,
            handlers: resources::all()
                .into_iter()
                .map(|h| (h.resource_type(), h))
                .collect(),
            data_sources: data_sources::all()
                .into_iter()
                .map(|h| (h.data_type(), h))
                .collect(),
        }
    }

    /// Build the HTTP client and a context with default timeouts
    pub fn from_config(config: ClientConfig) -> ProviderResult<Self> {
        let client = ApiClient::new(config)?;
        Ok(Self::new(ProviderContext::new(client)))
    }

    pub fn context(&self) -> &ProviderContext {
        &self.ctx
    }

    pub(crate) fn handler(&self, resource_type: &str) -> ProviderResult<&dyn ResourceHandler> {
        self.handlers
            .get(resource_type)
            .map(|h| h.as_ref())
            .ok_or_else(|| {
                ProviderError::unsupported(format!("unknown resource type '{}'", resource_type))
            })
    }

    pub(crate) fn data_source(&self, data_type: &str) -> ProviderResult<&dyn DataSourceHandler> {
        self.data_sources
            .get(data_type)
            .map(|h| h.as_ref())
            .ok_or_else(|| ProviderError::unsupported(format!("unknown data source '{}'", data_type)))
    }

    pub(crate) fn handlers(&self) -> impl Iterator<Item = &dyn ResourceHandler> {
        self.handlers.values().map(|h| h.as_ref())
    }

    pub(crate) fn data_source_handlers(&self) -> impl Iterator<Item = &dyn DataSourceHandler> {
        self.data_sources.values().map(|h| h.as_ref())
    }

    pub async fn read_resource(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> ProviderResult<State> {
        let Some(identifier) = identifier else {
            return Ok(State::not_found(id.clone()));
        };
        debug!("reading {} ({})", id, identifier);
        self.handler(&id.resource_type)?
            .read(&self.ctx, id, identifier)
            .await
            .map_err(|e| e.for_resource(id.clone()))
    }

    pub async fn read_data(&self, resource: &Resource) -> ProviderResult<State> {
        self.data_source(&resource.id.resource_type)?
            .read(&self.ctx, resource)
            .await
            .map_err(|e| e.for_resource(resource.id.clone()))
    }

    pub async fn create_resource(&self, resource: &Resource) -> ProviderResult<State> {
        self.handler(&resource.id.resource_type)?
            .create(&self.ctx, resource)
            .await
            .map_err(|e| e.for_resource(resource.id.clone()))
    }

    pub async fn update_resource(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        self.handler(&id.resource_type)?
            .update(&self.ctx, id, identifier, from, to)
            .await
            .map_err(|e| e.for_resource(id.clone()))
    }

    pub async fn delete_resource(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        self.handler(&id.resource_type)?
            .delete(&self.ctx, id, identifier)
            .await
            .map_err(|e| e.for_resource(id.clone()))
    }
}
