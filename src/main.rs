//! Mailscan - harvest, extraction and dispatch service for a provider-hosted
//! postcard mailbox.

mod completion;
mod config;
mod crawler;
mod dispatch;
mod extract;
mod feed;
mod model;
mod objectstore;
mod ocr;
mod repair;
mod retry;
mod sanitize;
mod schema;
mod similarity;
mod store;
mod sync;
mod validate;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use completion::Completer;
use config::AppConfig;
use crawler::{Crawler, Harvester, HarvestOutcome};
use dispatch::{DispatchOutcome, Dispatcher, HttpConsumerApi, SCAN_PAGE_SIZE};
use extract::{ExtractionOutcome, Extractor};
use feed::{HttpMailFeed, MailFeed, SessionProvider, StaticSessionProvider};
use model::OpenRouterClient;
use objectstore::{HttpObjectStore, ImageArchiver, ObjectStore};
use ocr::mistral::MistralRecognizer;
use schema::{DateRange, MailRecord};
use store::{MailStore, RestMailStore};
use sync::RecordSynchronizer;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    harvester: Arc<Harvester>,
    synchronizer: Arc<RecordSynchronizer>,
    extractor: Arc<Extractor>,
    dispatcher: Arc<Dispatcher>,
    completer: Arc<Completer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "mailscan=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let client = reqwest::Client::new();

    // The session token comes from configuration; browser login and CAPTCHA
    // solving happen outside this service.
    let session = StaticSessionProvider::new(config.feed_session_token.clone())
        .acquire()
        .await?;
    let feed: Arc<dyn MailFeed> = Arc::new(HttpMailFeed::new(
        client.clone(),
        config.feed_base_url.clone(),
        session,
    ));
    info!("mailbox session established");

    let store: Arc<dyn MailStore> = Arc::new(RestMailStore::new(
        client.clone(),
        config.store_url.clone(),
        config.store_service_key.clone(),
    ));
    let objects: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
        client.clone(),
        config.store_url.clone(),
        config.store_service_key.clone(),
    ));
    let synchronizer = Arc::new(RecordSynchronizer::new(store.clone(), config.retry.clone()));
    let archiver = Arc::new(ImageArchiver::new(
        feed.clone(),
        objects.clone(),
        config.storage_bucket.clone(),
    ));

    let recognizer = Arc::new(MistralRecognizer::new(
        client.clone(),
        config.mistral_api_key.clone(),
    ));
    let model_client = Arc::new(OpenRouterClient::new(
        client.clone(),
        config.openrouter_api_key.clone(),
        config.extraction_model.clone(),
    ));
    info!("model clients initialized, extraction model {}", config.extraction_model);

    let consumer = Arc::new(HttpConsumerApi::new(
        client,
        config.consumer_api_url.clone(),
        config.consumer_api_token.clone(),
    ));

    // Build application state
    let state = AppState {
        harvester: Arc::new(Harvester::new(
            Crawler::new(feed.clone()),
            synchronizer.clone(),
            archiver,
        )),
        extractor: Arc::new(Extractor::new(
            objects,
            recognizer,
            model_client,
            synchronizer.clone(),
            config.rules.clone(),
        )),
        dispatcher: Arc::new(Dispatcher::new(
            store,
            consumer,
            config.dispatch_chunk_size,
            SCAN_PAGE_SIZE,
        )),
        completer: Arc::new(Completer::new(synchronizer.clone(), feed)),
        synchronizer,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/harvest/page", post(harvest_page))
        .route("/records/sync", post(sync_record))
        .route("/extract", post(extract_scan))
        .route("/dispatch", post(dispatch_records))
        .route("/complete", post(complete_records))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
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

#[derive(serde::Deserialize)]
struct HarvestRequest {
    start_date: String,
    end_date: String,
    #[serde(default)]
    cursor: i64,
}

/// Crawl one inbox page and sync every in-window record.
async fn harvest_page(
    State(state): State<AppState>,
    Json(request): Json<HarvestRequest>,
) -> Result<Json<HarvestOutcome>, (StatusCode, String)> {
    let range = DateRange::parse(&request.start_date, &request.end_date)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?;

    state
        .harvester
        .harvest_page(&range, request.cursor)
        .await
        .map(Json)
        .map_err(|e| {
            error!("harvest failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("harvest failed: {e:#}"))
        })
}

#[derive(serde::Serialize)]
struct SyncResponse {
    status: &'static str,
}

/// Upsert one record directly, bypassing the crawl.
async fn sync_record(
    State(state): State<AppState>,
    Json(record): Json<MailRecord>,
) -> Result<Json<SyncResponse>, (StatusCode, String)> {
    state.synchronizer.upsert(&record).await.map_err(|e| {
        error!("sync failed for mail {}: {e}", record.id);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("sync failed: {e}"))
    })?;
    Ok(Json(SyncResponse { status: "ok" }))
}

#[derive(serde::Deserialize)]
struct ExtractRequest {
    locator: String,
}

/// Run extraction and validation for one archived scan.
async fn extract_scan(
    State(state): State<AppState>,
    Json(request): Json<ExtractRequest>,
) -> Result<Json<ExtractionOutcome>, (StatusCode, String)> {
    state
        .extractor
        .extract_and_validate(&request.locator)
        .await
        .map(Json)
        .map_err(|e| {
            error!("extraction failed for {}: {e:#}", request.locator);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("extraction failed: {e:#}"),
            )
        })
}

/// Dispatch every validated, not-yet-shredded record downstream.
async fn dispatch_records(
    State(state): State<AppState>,
) -> Result<Json<DispatchOutcome>, (StatusCode, String)> {
    state.dispatcher.dispatch_pending().await.map(Json).map_err(|e| {
        error!("dispatch failed: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("dispatch failed: {e}"))
    })
}

#[derive(serde::Deserialize)]
struct CompleteRequest {
    ids: Vec<i64>,
}

#[derive(serde::Serialize)]
struct CompleteResponse {
    shredded: usize,
}

/// Flag dispatched records as shredded and request the physical shred.
async fn complete_records(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, (StatusCode, String)> {
    state
        .completer
        .complete(&request.ids)
        .await
        .map(|shredded| Json(CompleteResponse { shredded }))
        .map_err(|e| {
            error!("completion failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("completion failed: {e:#}"),
            )
        })
}
