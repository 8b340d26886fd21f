use std::time::Duration;

use profiler_client::{api, Error, HandleCache, ProfilerModel, ServerSettings};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn settings_for(server: &MockServer) -> ServerSettings {
    ServerSettings::new(server.uri()).unwrap()
}

fn model(name: &str, path: &str) -> ProfilerModel {
    ProfilerModel {
        name: name.to_string(),
        path: path.to_string(),
    }
}

#[tokio::test]
async fn start_new_creates_a_registered_handle() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/profiler"))
        .and(body_json(json!({ "path": "s3://bucket/data" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "prof-1", "path": "s3://bucket/data" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    let handle = api::start_new(&settings, &cache, "s3://bucket/data")
        .await
        .unwrap();

    assert_eq!(handle.name(), "prof-1");
    assert_eq!(handle.path(), "s3://bucket/data");
    assert_eq!(handle.url(), format!("{}/profiler/prof-1", server.uri()));
    assert!(!handle.is_disposed());
}

#[tokio::test]
async fn start_new_surfaces_a_server_error() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/profiler"))
        .respond_with(ResponseTemplate::new(500).set_body_string("exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    let err = api::start_new(&settings, &cache, "s3://bucket/data")
        .await
        .unwrap_err();

    match err {
        Error::Response { status, body } => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "exploded");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn start_new_rejects_a_malformed_model() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/profiler"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unexpected": true })))
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    let err = api::start_new(&settings, &cache, "s3://bucket/data")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MalformedData(_)));
}

#[tokio::test]
async fn list_running_returns_models_with_bearer_auth() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiler"))
        .and(header("Authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "name": "prof-1", "path": "s3://bucket/a" },
            { "name": "prof-2", "path": "s3://bucket/b" },
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let settings = ServerSettings::with_token(server.uri(), Some("secret".to_string())).unwrap();
    let cache = HandleCache::new();
    let models = api::list_running(&settings, &cache).await.unwrap();

    assert_eq!(
        models,
        vec![model("prof-1", "s3://bucket/a"), model("prof-2", "s3://bucket/b")]
    );
}

#[tokio::test]
async fn list_running_rejects_a_non_array_body() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiler"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "not": "an array" })))
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    let err = api::list_running(&settings, &cache).await.unwrap_err();

    assert!(err.to_string().contains("invalid profiler data"));
}

#[tokio::test]
async fn list_running_prunes_cached_handles_the_server_dropped() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/profiler"))
        .and(body_json(json!({ "path": "s3://bucket/a" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "prof-1", "path": "s3://bucket/a" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/profiler"))
        .and(body_json(json!({ "path": "s3://bucket/b" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "prof-2", "path": "s3://bucket/b" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/profiler"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "name": "prof-2", "path": "s3://bucket/b" }])),
        )
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    let first = api::start_new(&settings, &cache, "s3://bucket/a").await.unwrap();
    let second = api::start_new(&settings, &cache, "s3://bucket/b").await.unwrap();

    api::list_running(&settings, &cache).await.unwrap();

    assert!(first.is_disposed());
    assert!(!second.is_disposed());
}

#[tokio::test]
async fn shutdown_deletes_and_disposes_the_cached_handle() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/profiler"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "prof-1", "path": "s3://bucket/a" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/profiler/prof-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    let handle = api::start_new(&settings, &cache, "s3://bucket/a").await.unwrap();

    api::shutdown(&settings, &cache, "prof-1").await.unwrap();

    assert!(handle.is_disposed());
}

#[tokio::test]
async fn shutdown_treats_404_as_already_gone() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/profiler/prof-9"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({ "message": "Profiler prof-9 not found" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();

    api::shutdown(&settings, &cache, "prof-9").await.unwrap();
}

#[tokio::test]
async fn shutdown_surfaces_an_unexpected_status() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/profiler/prof-1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    let err = api::shutdown(&settings, &cache, "prof-1").await.unwrap_err();

    assert!(matches!(err, Error::Response { .. }));
}

#[tokio::test]
async fn get_model_describes_one_profiler() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiler/prof-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "prof-1", "path": "s3://bucket/a" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let fetched = api::get_model(&settings, "prof-1").await.unwrap();

    assert_eq!(fetched, model("prof-1", "s3://bucket/a"));
}

#[tokio::test]
async fn get_model_surfaces_a_missing_profiler() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiler/prof-9"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let err = api::get_model(&settings, "prof-9").await.unwrap_err();

    match err {
        Error::Response { status, .. } => assert_eq!(status.as_u16(), 404),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn shutdown_all_dispatches_a_delete_per_profiler() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiler"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "name": "prof-1", "path": "s3://bucket/a" },
            { "name": "prof-2", "path": "s3://bucket/b" },
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/profiler/prof-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/profiler/prof-2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let cache = HandleCache::new();
    api::shutdown_all(&settings, &cache).await.unwrap();

    // the individual shutdowns are spawned; give them a moment to land
    tokio::time::sleep(Duration::from_millis(200)).await;
}
