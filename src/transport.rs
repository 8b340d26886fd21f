use reqwest::{Method, Response};
use serde_json::Value;

use crate::config::ServerSettings;
use crate::error::{Error, Result};

/// Issue one request against the profiler service.
///
/// Attaches the bearer token when the settings carry one. Status handling
/// is left to the caller.
pub async fn request(
    settings: &ServerSettings,
    method: Method,
    url: &str,
    body: Option<&Value>,
) -> Result<Response> {
    let mut builder = settings.client().request(method, url);
    if let Some(token) = settings.token() {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    if let Some(body) = body {
        builder = builder.json(body);
    }
    Ok(builder.send().await?)
}

/// Drain an unexpected response into an error carrying status and body
pub async fn response_error(resp: Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Error::Response { status, body }
}
