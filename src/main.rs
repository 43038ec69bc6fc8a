//! Khata Reconciler - turns photographed marks registers into roster-matched scores.

mod config;
mod dedup;
mod matcher;
mod numerals;
mod ocr;
mod openrouter;
mod reconcile;
mod schema;
mod similarity;
mod validate;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use config::ReconcileConfig;
use ocr::vision::VisionMarkReader;
use ocr::ImagePayload;
use openrouter::OpenRouterClient;
use reconcile::Reconciler;
use schema::{ReconciliationReport, RosterEntry};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    reconciler: Arc<Reconciler>,
    config: Arc<ReconcileConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "khata_reconciler=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("RECONCILE_CONFIG")
        .unwrap_or_else(|_| "configs/reconcile.json".to_string());
    let config = ReconcileConfig::load_from_file(std::path::Path::new(&config_path))?;
    info!(
        "Config '{}': threshold={}, concurrency={}, ocr timeout={}s",
        config.name,
        config.matching.similarity_threshold,
        config.max_concurrent_images,
        config.ocr_timeout_secs
    );

    let openrouter = OpenRouterClient::from_env(Duration::from_secs(config.ocr_timeout_secs))?;
    info!("OpenRouter client initialized (model={})", openrouter.model());

    let reader = VisionMarkReader::new(openrouter, config.prompts.extraction.clone());
    let state = AppState {
        reconciler: Arc::new(Reconciler::new(Arc::new(reader), &config)),
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/marks/extract", post(extract_marks))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
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

/// Active reconciliation config.
async fn get_config(State(state): State<AppState>) -> Json<ReconcileConfig> {
    Json((*state.config).clone())
}

/// Upload register photos (and optionally a roster) and reconcile them.
///
/// Multipart fields: one or more `images` files, plus an optional `roster`
/// field holding a JSON array of `{id, name, rollNumber}`.
async fn extract_marks(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ReconciliationReport>, (StatusCode, String)> {
    let mut images = Vec::new();
    let mut roster: Option<Vec<RosterEntry>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("images") | Some("image") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("image-{}", images.len() + 1));
                let declared = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read image: {}", e))
                })?;
                if data.is_empty() {
                    warn!("Skipping empty upload: {}", filename);
                    continue;
                }
                images.push(ImagePayload::new(filename, declared.as_deref(), data.to_vec()));
            }
            Some("roster") => {
                let text = field.text().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read roster: {}", e))
                })?;
                roster = Some(parse_roster(&text).map_err(|e| (StatusCode::BAD_REQUEST, e))?);
            }
            other => warn!("Ignoring unexpected multipart field: {:?}", other),
        }
    }

    if images.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No images uploaded".to_string()));
    }

    info!(
        "Received {} image(s) ({} bytes), roster: {}",
        images.len(),
        images.iter().map(|i| i.bytes.len()).sum::<usize>(),
        roster.as_ref().map(|r| r.len().to_string()).unwrap_or_else(|| "none".to_string())
    );

    let report = state
        .reconciler
        .reconcile(&images, roster.as_deref())
        .await;

    Ok(Json(report))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Parse the roster field; an empty field means an empty roster.
fn parse_roster(text: &str) -> Result<Vec<RosterEntry>, String> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).map_err(|e| format!("Invalid roster JSON: {}", e))
}
