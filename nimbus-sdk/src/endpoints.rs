//! Endpoints - Resolve the base URL of each cloud service

use std::collections::HashMap;

pub const DEFAULT_CLOUD: &str = "myhuaweicloud.com";

/// Service base URLs for one region
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    region: String,
    cloud: String,
    overrides: HashMap<String, String>,
}

impl Endpoints {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            cloud: DEFAULT_CLOUD.to_string(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_cloud(mut self, cloud: impl Into<String>) -> Self {
        self.cloud = cloud.into();
        self
    }

    /// Use `url` for `service` instead of the derived endpoint
    pub fn with_override(mut self, service: impl Into<String>, url: impl Into<String>) -> Self {
        self.overrides.insert(service.into(), url.into());
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Base URL for a service, without a trailing slash
    pub fn url(&self, service: &str) -> String {
        match self.overrides.get(service) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.{}.{}", service, self.region, self.cloud),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_endpoint() {
        let endpoints = Endpoints::new("ap-southeast-1");
        assert_eq!(
            endpoints.url("vpc"),
            "https://vpc.ap-southeast-1.myhuaweicloud.com"
        );
    }

    #[test]
    fn override_wins_and_is_trimmed() {
        let endpoints = Endpoints::new("eu-west-0")
            .with_cloud("example.com")
            .with_override("rds", "http://127.0.0.1:9000/");
        assert_eq!(endpoints.url("rds"), "http://127.0.0.1:9000");
        assert_eq!(endpoints.url("ecs"), "https://ecs.eu-west-0.example.com");
    }
}
