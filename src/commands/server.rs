// Status API router and server lifecycle
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use log::info;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{queue, settings, system, AppState};
use crate::error::Result;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(system::health))
        .route("/api/shutdown", post(system::shutdown))
        .route("/api/queue", get(queue::get_queue).post(queue::enqueue))
        .route("/api/start", post(queue::start))
        .route("/api/stop", post(queue::stop))
        .route("/api/clear", post(queue::clear))
        .route("/api/cancel/:id", post(queue::cancel))
        .route("/api/retry/:id", post(queue::retry))
        .route("/api/retry-failed", post(queue::retry_failed))
        .route("/api/progress", get(queue::progress))
        .route(
            "/api/concurrency",
            get(queue::get_concurrency).post(queue::set_concurrency),
        )
        .route(
            "/api/config",
            get(settings::get_settings).post(settings::update_settings),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until POST /api/shutdown or Ctrl+C, then stop all work
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status API listening on http://{}", listener.local_addr()?);

    let shutdown = state.shutdown.clone();
    let dispatcher = state.dispatcher.clone();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
            }
        })
        .await?;

    let canceled = dispatcher.stop_all();
    info!("Status API stopped; {} queued item(s) canceled", canceled);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::error::AppError;
    use crate::file_manager::SettingsStore;
    use crate::models::{Settings, Source};
    use crate::pipeline::{
        FetchedMedia, Fetcher, Pipeline, ProgressFn, SeparationOutput, SeparationRequest, Separator,
    };
    use crate::queue::{AdmissionController, Dispatcher, JobStore};

    struct PendingFetcher;

    #[async_trait]
    impl Fetcher for PendingFetcher {
        async fn fetch(
            &self,
            _source: &Source,
            _progress: ProgressFn,
            cancel: CancellationToken,
        ) -> Result<FetchedMedia> {
            cancel.cancelled().await;
            Err(AppError::Canceled)
        }
    }

    struct NoopSeparator;

    #[async_trait]
    impl Separator for NoopSeparator {
        async fn separate(
            &self,
            request: SeparationRequest,
            _progress: ProgressFn,
            _cancel: CancellationToken,
        ) -> Result<SeparationOutput> {
            Ok(SeparationOutput {
                dest_path: request.folder,
                stems: Vec::new(),
            })
        }
    }

    fn state() -> AppState {
        let mut settings = Settings::default();
        settings.output_dir = "/tmp/stemdeck-api-test".to_string();
        settings.auto_start = false;
        state_with(SettingsStore::in_memory(settings))
    }

    fn state_with(settings: SettingsStore) -> AppState {
        let fetcher: Arc<dyn Fetcher> = Arc::new(PendingFetcher);
        let pipeline = Pipeline {
            remote: Arc::clone(&fetcher),
            local: fetcher,
            separator: Arc::new(NoopSeparator),
        };
        let settings = Arc::new(settings);
        let dispatcher = Dispatcher::new(
            Arc::new(JobStore::new()),
            Arc::new(AdmissionController::new(2)),
            pipeline,
            Arc::clone(&settings),
        );
        AppState::new(dispatcher, settings)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state());
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_enqueue_then_snapshot() {
        let app = router(state());
        let (status, body) = call(
            &app,
            "POST",
            "/api/queue",
            Some(json!({ "urls": ["https://example.com/a", "ftp://nope"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"].as_array().unwrap().len(), 2);

        let (status, body) = call(&app, "GET", "/api/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items[0]["status"], "queued");
        assert_eq!(items[1]["status"], "error");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_payloads() {
        let app = router(state());
        let (status, body) =
            call(&app, "POST", "/api/queue", Some(json!({ "sources": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "config_error");

        let (status, _) = call(&app, "POST", "/api/queue", Some(json!({ "nope": 1 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/api/queue",
            Some(json!({ "sources": ["https://example.com/a"], "stem_mode": "5" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_status_codes() {
        let app = router(state());
        let (_, body) = call(
            &app,
            "POST",
            "/api/queue",
            Some(json!({ "sources": ["https://example.com/a"] })),
        )
        .await;
        let id = body["added"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", &format!("/api/cancel/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["canceled"], true);

        let (status, body) = call(&app, "POST", &format!("/api/cancel/{}", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "invalid_state");

        let (status, _) = call(&app, "POST", "/api/cancel/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_failed_requeues_with_new_ids() {
        let app = router(state());
        let (_, body) = call(
            &app,
            "POST",
            "/api/queue",
            Some(json!({ "sources": ["ftp://nope"] })),
        )
        .await;
        let old_id = body["added"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", "/api/retry-failed", None).await;
        assert_eq!(status, StatusCode::OK);
        let added = body["added"].as_array().unwrap();
        assert_eq!(added.len(), 1);
        assert_ne!(added[0]["id"], old_id.as_str());

        let (status, _) = call(&app, "POST", &format!("/api/retry/{}", old_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_concurrency_limits() {
        let app = router(state());
        let (status, body) = call(&app, "GET", "/api/concurrency", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max"], 2);
        assert_eq!(body["server_max"], 64);

        let (status, _) = call(&app, "POST", "/api/concurrency", Some(json!({ "max": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "POST", "/api/concurrency", Some(json!({ "max": 65 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            call(&app, "POST", "/api/concurrency", Some(json!({ "max": 8 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max"], 8);
    }

    #[tokio::test]
    async fn test_concurrency_unchanged_when_save_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let state = state_with(SettingsStore::load(blocker.join("settings.json")));
        let admission = Arc::clone(state.dispatcher.admission());
        let before = admission.max();
        let app = router(state);

        let (status, body) =
            call(&app, "POST", "/api/concurrency", Some(json!({ "max": 5 }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "io_error");
        assert_eq!(admission.max(), before);

        let (_, body) = call(&app, "GET", "/api/concurrency", None).await;
        assert_eq!(body["max"], before);
    }

    #[tokio::test]
    async fn test_progress_and_clear() {
        let app = router(state());
        call(
            &app,
            "POST",
            "/api/queue",
            Some(json!({ "sources": ["https://example.com/a", "ftp://nope"] })),
        )
        .await;

        let (status, body) = call(&app, "GET", "/api/progress", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["progress"], 0.0);
        assert_eq!(body["counts"]["queued"], 1);
        assert_eq!(body["counts"]["error"], 1);
        assert_eq!(body["concurrency"]["active"], 0);

        let (status, body) = call(&app, "POST", "/api/clear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 1);

        let (status, _) = call(&app, "POST", "/api/clear?mode=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "POST", "/api/clear?mode=reset", None).await;
        assert_eq!(body["cleared"], 1);
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let app = router(state());
        let (status, body) = call(
            &app,
            "POST",
            "/api/config",
            Some(json!({ "stem_mode": "4", "download_weight": 0.4 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stem_mode"], "4");

        let (status, _) =
            call(&app, "POST", "/api/config", Some(json!({ "demucs_model": "nope" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "GET", "/api/config", None).await;
        assert_eq!(body["download_weight"], 0.4);
    }

    #[tokio::test]
    async fn test_shutdown_fires_token() {
        let state = state();
        let token = state.shutdown.clone();
        let app = router(state);
        let (status, body) = call(&app, "POST", "/api/shutdown", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shutting_down"], true);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(AppError::Source("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::InvalidState("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::Worker("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
