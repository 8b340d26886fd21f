use std::env;
use std::time::Duration;

use reqwest::Client;

use crate::error::Result;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8888";

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the profiler service.
///
/// Cheap to clone; every clone shares the same underlying HTTP client.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl ServerSettings {
    /// Build settings for a service root, without auth
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_token(base_url, None)
    }

    /// Build settings with an optional bearer token
    pub fn with_token(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: normalize_base(base_url.into()),
            token,
            client,
        })
    }

    /// Read settings from PROFILER_BASE_URL and PROFILER_TOKEN,
    /// falling back to the localhost default
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("PROFILER_BASE_URL")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let token = env::var("PROFILER_TOKEN")
            .ok()
            .filter(|value| !value.is_empty());
        Self::with_token(base_url, token)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// API collection endpoint listing running profilers
    pub fn service_url(&self) -> String {
        format!("{}/api/profiler", self.base_url)
    }

    /// API endpoint for one profiler instance
    pub fn api_instance_url(&self, name: &str) -> String {
        format!("{}/{}", self.service_url(), name)
    }

    /// Viewer URL the host embeds for one profiler instance
    pub fn viewer_url(&self, name: &str) -> String {
        format!("{}/profiler/{}", self.base_url, name)
    }
}

fn normalize_base(base_url: String) -> String {
    base_url.trim_end_matches('/').to_string()
}
