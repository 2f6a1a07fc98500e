// Sales Sync - Notification Receiver
// REST API with Axum: object-created notifications in, invocation results out.

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use sales_sync::{
    logging, IngestError, IngestPipeline, LocalObjectStore, NotificationEvent, ObjectStore,
    ObjectStoreError, SqliteTotalsStore, SyncConfig, TotalsStore,
};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
struct AppState<O, S> {
    pipeline: Arc<IngestPipeline<O, S>>,
}

impl<O, S> Clone for AppState<O, S> {
    fn clone(&self) -> Self {
        AppState {
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(error.to_string()),
        }
    }
}

fn failure_response(status: StatusCode, error: impl ToString) -> Response {
    (status, Json(ApiResponse::failure(error))).into_response()
}

fn ingest_error_status(err: &IngestError) -> StatusCode {
    match err {
        IngestError::Event(_) => StatusCode::BAD_REQUEST,
        IngestError::SourceRead {
            source: ObjectStoreError::NotFound(_),
            ..
        } => StatusCode::NOT_FOUND,
        IngestError::SourceRead { .. } => StatusCode::BAD_GATEWAY,
        IngestError::Decode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::Archive { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(serde_json::json!({
        "status": "OK",
        "version": sales_sync::VERSION,
    })))
}

/// POST /api/events - Process an object-created notification
async fn ingest_event<O, S>(State(state): State<AppState<O, S>>, body: String) -> Response
where
    O: ObjectStore + 'static,
    S: TotalsStore + 'static,
{
    let event = match NotificationEvent::from_json(&body) {
        Ok(event) => event,
        Err(e) => return failure_response(StatusCode::BAD_REQUEST, e),
    };

    let pipeline = Arc::clone(&state.pipeline);
    let outcome = tokio::task::spawn_blocking(move || pipeline.handle_event(&event)).await;

    match outcome {
        Ok(Ok(result)) => {
            let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
            (status, Json(ApiResponse::ok(result))).into_response()
        }
        // already logged inside the ingest span
        Ok(Err(e)) => failure_response(ingest_error_status(&e), e),
        Err(e) => {
            error!(error = %e, "ingest worker panicked");
            failure_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// GET /api/totals - All running totals
async fn get_totals<O, S>(State(state): State<AppState<O, S>>) -> Response
where
    O: ObjectStore + 'static,
    S: TotalsStore + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    let outcome = tokio::task::spawn_blocking(move || pipeline.store().list_totals()).await;

    match outcome {
        Ok(Ok(totals)) => (StatusCode::OK, Json(ApiResponse::ok(totals))).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "failed to list totals");
            failure_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(e) => {
            error!(error = %e, "totals worker panicked");
            failure_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[derive(Serialize)]
struct TotalResponse {
    identity: String,
    total_amount: rust_decimal::Decimal,
}

/// GET /api/totals/:identity - One running total
async fn get_total<O, S>(
    State(state): State<AppState<O, S>>,
    Path(identity): Path<String>,
) -> Response
where
    O: ObjectStore + 'static,
    S: TotalsStore + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    let lookup = identity.clone();
    let outcome = tokio::task::spawn_blocking(move || pipeline.store().get_total(&lookup)).await;

    match outcome {
        Ok(Ok(Some(total_amount))) => (
            StatusCode::OK,
            Json(ApiResponse::ok(TotalResponse {
                identity,
                total_amount,
            })),
        )
            .into_response(),
        Ok(Ok(None)) => failure_response(
            StatusCode::NOT_FOUND,
            format!("No total recorded for {}", identity),
        ),
        Ok(Err(e)) => {
            error!(identity = %identity, error = %e, "failed to read total");
            failure_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(e) => {
            error!(identity = %identity, error = %e, "totals worker panicked");
            failure_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

fn app<O, S>(pipeline: Arc<IngestPipeline<O, S>>) -> Router
where
    O: ObjectStore + 'static,
    S: TotalsStore + 'static,
{
    let state = AppState { pipeline };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/events", post(ingest_event::<O, S>))
        .route("/totals", get(get_totals::<O, S>))
        .route("/totals/:identity", get(get_total::<O, S>))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::json_requested());

    let config = SyncConfig::from_env().context("Failed to load configuration")?;
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = SqliteTotalsStore::open(&config.database_path, config.busy_timeout())
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    let objects = LocalObjectStore::new(&config.object_root);
    let pipeline = Arc::new(IngestPipeline::new(objects, store, &config));

    let addr = env::var("SALES_SYNC_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(
        addr = %addr,
        objects = %config.object_root.display(),
        database = %config.database_path.display(),
        mode = %config.update_mode,
        "🚀 sales-sync receiver listening"
    );

    axum::serve(listener, app(pipeline))
        .await
        .context("Server terminated")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use sales_sync::{MemoryObjectStore, MemoryTotalsStore, ObjectLocation};
    use rust_decimal::Decimal;
    use sales_sync::{AggregateTotal, StoreError};
    use std::str::FromStr;
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_pipeline() -> Arc<IngestPipeline<MemoryObjectStore, MemoryTotalsStore>> {
        let pipeline = IngestPipeline::new(
            MemoryObjectStore::new(),
            MemoryTotalsStore::new(),
            &SyncConfig::default(),
        )
        .with_clock(Arc::new(|| Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()));
        Arc::new(pipeline)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_event(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/events")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, json) = send(
            app(test_pipeline()),
            Request::builder().uri("/api/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "OK");
    }

    #[tokio::test]
    async fn test_event_updates_totals() {
        let pipeline = test_pipeline();
        pipeline
            .objects()
            .put_object(
                &ObjectLocation::new("test-bucket", "input/test.csv"),
                b"id,amount\n1,100.50\n2,200.75\n2,-50.0\n3,invalid\n",
            )
            .unwrap();

        let event = r#"{"Records":[{"s3":{"bucket":{"name":"test-bucket"},"object":{"key":"input/test.csv"}}}]}"#;
        let (status, json) = send(app(Arc::clone(&pipeline)), post_event(event)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json["data"]["body"],
            "Processed 2 records from input/test.csv into sales-totals"
        );

        let (status, json) = send(
            app(Arc::clone(&pipeline)),
            Request::builder().uri("/api/totals/1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["total_amount"], "100.50");

        assert_eq!(
            pipeline.store().get_total("2").unwrap(),
            Some(Decimal::from_str("200.75").unwrap())
        );
        println!("✅ Notification processed over HTTP");
    }

    #[tokio::test]
    async fn test_bad_payload_is_rejected() {
        let (status, json) = send(app(test_pipeline()), post_event("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);

        let (status, _) = send(app(test_pipeline()), post_event(r#"{"Records":[]}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let event = r#"{"Records":[{"s3":{"bucket":{"name":"b"},"object":{"key":"input/gone.csv"}}}]}"#;
        let (status, _) = send(app(test_pipeline()), post_event(event)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    /// Totals store whose reads wait until the test opens the gate
    struct GatedStore {
        inner: MemoryTotalsStore,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl GatedStore {
        fn wait(&self) -> Result<(), StoreError> {
            let gate = self
                .gate
                .lock()
                .map_err(|_| StoreError::Unavailable("gate poisoned".to_string()))?;
            gate.recv_timeout(Duration::from_secs(2))
                .map_err(|_| StoreError::Unavailable("gate never opened".to_string()))
        }
    }

    impl TotalsStore for GatedStore {
        fn get_total(&self, identity: &str) -> Result<Option<Decimal>, StoreError> {
            self.wait()?;
            self.inner.get_total(identity)
        }

        fn put_total(&self, identity: &str, total: Decimal) -> Result<(), StoreError> {
            self.inner.put_total(identity, total)
        }

        fn add_to_total(&self, identity: &str, amount: Decimal) -> Result<Decimal, StoreError> {
            self.inner.add_to_total(identity, amount)
        }

        fn list_totals(&self) -> Result<Vec<AggregateTotal>, StoreError> {
            self.wait()?;
            self.inner.list_totals()
        }
    }

    fn gated_app() -> (Router, mpsc::Sender<()>) {
        let (open, gate) = mpsc::channel();
        let store = GatedStore {
            inner: MemoryTotalsStore::with_totals([("1", Decimal::from(7))]),
            gate: Mutex::new(gate),
        };
        let pipeline = IngestPipeline::new(MemoryObjectStore::new(), store, &SyncConfig::default());
        (app(Arc::new(pipeline)), open)
    }

    // The test runtime has a single thread: the gate can only be opened if
    // the handler hands the store call off and yields.
    #[tokio::test]
    async fn test_totals_reads_leave_runtime_free() {
        for uri in ["/api/totals", "/api/totals/1"] {
            let (router, open) = gated_app();
            let request = tokio::spawn(send(
                router,
                Request::builder().uri(uri).body(Body::empty()).unwrap(),
            ));

            tokio::time::sleep(Duration::from_millis(50)).await;
            open.send(()).unwrap();

            let (status, json) = request.await.unwrap();
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(json["success"], true);
        }
    }

    #[tokio::test]
    async fn test_unknown_identity() {
        let (status, json) = send(
            app(test_pipeline()),
            Request::builder().uri("/api/totals/nobody").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
    }
}
