use std::collections::HashSet;

use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use crate::config::ServerSettings;
use crate::error::{Error, Result};
use crate::profiler::{HandleCache, ProfilerHandle, ProfilerModel};
use crate::transport;

/// Start a new profiler bound to a storage path.
///
/// The server assigns the name. Calling twice with the same path creates
/// two distinct profilers.
pub async fn start_new(
    settings: &ServerSettings,
    cache: &HandleCache,
    path: &str,
) -> Result<ProfilerHandle> {
    let body = json!({ "path": path });
    let resp =
        transport::request(settings, Method::POST, &settings.service_url(), Some(&body)).await?;
    if resp.status() != StatusCode::OK {
        return Err(transport::response_error(resp).await);
    }
    let data: Value = resp.json().await?;
    let model: ProfilerModel =
        serde_json::from_value(data).map_err(|err| Error::MalformedData(err.to_string()))?;
    tracing::info!(profiler = %model.name, path = %model.path, "started profiler");
    Ok(ProfilerHandle::new(settings, cache, model))
}

/// List running profilers, pruning cached handles the server no longer
/// reports
pub async fn list_running(
    settings: &ServerSettings,
    cache: &HandleCache,
) -> Result<Vec<ProfilerModel>> {
    let resp = transport::request(settings, Method::GET, &settings.service_url(), None).await?;
    if resp.status() != StatusCode::OK {
        return Err(transport::response_error(resp).await);
    }
    let data: Value = resp.json().await?;
    if !data.is_array() {
        return Err(Error::MalformedData("response is not an array".to_string()));
    }
    let models: Vec<ProfilerModel> =
        serde_json::from_value(data).map_err(|err| Error::MalformedData(err.to_string()))?;

    let live: HashSet<String> = models
        .iter()
        .map(|model| settings.viewer_url(&model.name))
        .collect();
    cache.retain_urls(&live);

    Ok(models)
}

/// Fetch the model for one profiler by name
pub async fn get_model(settings: &ServerSettings, name: &str) -> Result<ProfilerModel> {
    let resp =
        transport::request(settings, Method::GET, &settings.api_instance_url(name), None).await?;
    if resp.status() != StatusCode::OK {
        return Err(transport::response_error(resp).await);
    }
    let data: Value = resp.json().await?;
    serde_json::from_value(data).map_err(|err| Error::MalformedData(err.to_string()))
}

/// Stop a profiler by name.
///
/// A 404 means the profiler is already gone and is treated as success,
/// logging the server's message. Either way the matching cached handle
/// is disposed.
pub async fn shutdown(settings: &ServerSettings, cache: &HandleCache, name: &str) -> Result<()> {
    let resp =
        transport::request(settings, Method::DELETE, &settings.api_instance_url(name), None)
            .await?;
    match resp.status() {
        StatusCode::NO_CONTENT => {
            cache.dispose_url(&settings.viewer_url(name));
            Ok(())
        }
        StatusCode::NOT_FOUND => {
            let message = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|data| {
                    data.get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("profiler {} not found", name));
            tracing::warn!(profiler = %name, "{}", message);
            cache.dispose_url(&settings.viewer_url(name));
            Ok(())
        }
        _ => Err(transport::response_error(resp).await),
    }
}

/// Best-effort shutdown of every running profiler.
///
/// Each shutdown is spawned without awaiting its completion, so this
/// resolves once every request has been dispatched. Callers that need a
/// completion guarantee should use the manager's shutdown_all instead.
pub async fn shutdown_all(settings: &ServerSettings, cache: &HandleCache) -> Result<()> {
    let models = list_running(settings, cache).await?;
    for model in models {
        let settings = settings.clone();
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(err) = shutdown(&settings, &cache, &model.name).await {
                tracing::warn!(profiler = %model.name, error = %err, "shutdown failed");
            }
        });
    }
    Ok(())
}

/// Viewer URL for a profiler by name; no network involved
pub fn get_url(settings: &ServerSettings, name: &str) -> String {
    settings.viewer_url(name)
}
