//! Tesseract Bridge - stages bundled language data and serves OCR method calls.

mod bridge;
mod config;
mod engine;
mod markup;
mod provision;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bridge::{Dispatcher, MethodCall, MethodResponse};
use config::BridgeConfig;
use engine::{tesseract::TesseractEngine, RecognitionEngine};
use provision::{ProvisionReport, Provisioner};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tesseract_bridge=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::from_env()?;
    info!(
        "Bundle: {:?}, runtime root: {:?}, policy: {:?}",
        config.bundle_dir, config.runtime_root, config.provision_policy
    );

    let provisioner = Provisioner::new(
        config.bundle_dir.clone(),
        config.runtime_root.clone(),
        config.provision_policy,
    );
    let engine: Arc<dyn RecognitionEngine> = Arc::new(TesseractEngine::new(&config.tesseract_bin));
    info!("Recognition engine: {} ({:?})", engine.name(), config.tesseract_bin);

    let dispatcher = Dispatcher::new(Arc::new(provisioner), engine)
        .with_timeout(config.recognition_timeout);

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/channel", post(invoke))
        .route("/tessdata/provision", post(provision_data))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Method-call channel: `{ "method": "extractText", "arguments": {...} }`.
async fn invoke(
    State(state): State<AppState>,
    Json(call): Json<MethodCall>,
) -> (StatusCode, Json<MethodResponse>) {
    let response = state.dispatcher.call(call).await;
    (status_for(&response), Json(response))
}

/// Stage the language data without running recognition.
async fn provision_data(
    State(state): State<AppState>,
) -> Result<Json<ProvisionReport>, (StatusCode, String)> {
    let lease = state
        .dispatcher
        .provisioner()
        .ensure_provisioned()
        .await
        .map_err(|e| {
            error!("Provisioning failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(lease.report().clone()))
}

// ============================================================================
// Helper functions
// ============================================================================

fn status_for(response: &MethodResponse) -> StatusCode {
    match response {
        MethodResponse::Result(_) => StatusCode::OK,
        MethodResponse::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        MethodResponse::Error(err) => match err.code.as_str() {
            "INVALID_ARGS" => StatusCode::BAD_REQUEST,
            "INIT_ERROR" | "OCR_FAILED" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}
