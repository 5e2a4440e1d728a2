//! HTTP front end.
//!
//! One `POST /api/<tab>/process` route per workflow plus health, language,
//! model-status and session routes. Uploads arrive as multipart `files`
//! (or `file`) fields; `session_id` and `text_input` may come either as
//! query parameters or as multipart text fields.

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    routing::{get, post, MethodRouter},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::ModelStatus;
use crate::session::Session;
use crate::workflows::{self, AppContext, IncomingFile, Tab, WorkflowRequest};

/// How often expired sessions are swept
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type SharedContext = Arc<AppContext>;

#[derive(Debug, Default, Deserialize)]
struct ProcessQuery {
    session_id: Option<String>,
    text_input: Option<String>,
}

/// Malformed ids are treated like unknown ones
fn parse_session_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

/// Build the router with CORS, body limit and optional static files
pub fn build_router(ctx: SharedContext) -> Router {
    let body_limit = ctx.config.upload.max_request_bytes();
    let static_dir = ctx.config.server.static_dir.clone();

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/languages", get(languages))
        .route("/api/models/status", get(models_status))
        .route("/api/session/create", post(create_session))
        .route("/api/session/:session_id", get(get_session));

    for tab in Tab::ALL {
        router = router.route(&format!("/api/{}/process", tab), process_route(tab));
    }

    if static_dir.is_dir() {
        info!("Serving static files from {:?}", static_dir);
        router = router.nest_service("/static", ServeDir::new(static_dir));
    }

    router
        .with_state(ctx)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Bind, serve until Ctrl-C or SIGTERM, sweeping expired sessions meanwhile
pub async fn serve(ctx: SharedContext) -> Result<()> {
    ctx.uploads
        .ensure_dirs()
        .await
        .with_context(|| format!("Failed to create upload directory {:?}", ctx.uploads.dir()))?;

    let addr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", listener.local_addr()?);

    let sessions = ctx.sessions.clone();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let purged = sessions.purge_expired().await;
            if purged > 0 {
                debug!("Purged {} expired sessions", purged);
            }
        }
    });

    let result = axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");
    sweeper.abort();
    info!("Server stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn health(State(ctx): State<SharedContext>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "running",
        "models_loaded": ctx.registry.loaded(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn languages(State(ctx): State<SharedContext>) -> Json<BTreeMap<String, String>> {
    Json(ctx.config.languages.clone())
}

async fn models_status(State(ctx): State<SharedContext>) -> Json<Vec<ModelStatus>> {
    Json(ctx.registry.status().await)
}

async fn create_session(State(ctx): State<SharedContext>) -> Json<Value> {
    let session = ctx.sessions.create().await;
    Json(serde_json::json!({
        "session_id": session.id,
        "timestamp": session.created_at.to_rfc3339()
    }))
}

async fn get_session(
    State(ctx): State<SharedContext>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let id = parse_session_id(&session_id).ok_or(ApiError::SessionNotFound)?;
    ctx.sessions
        .get(id)
        .await
        .map(Json)
        .ok_or(ApiError::SessionNotFound)
}

fn process_route(tab: Tab) -> MethodRouter<SharedContext> {
    post(
        move |State(ctx): State<SharedContext>,
              Query(query): Query<ProcessQuery>,
              multipart: Option<Multipart>| async move {
            process(ctx, tab, query, multipart).await
        },
    )
}

async fn process(
    ctx: SharedContext,
    tab: Tab,
    query: ProcessQuery,
    multipart: Option<Multipart>,
) -> Result<Json<Value>, ApiError> {
    let mut request = WorkflowRequest {
        session_id: query.session_id.as_deref().and_then(parse_session_id),
        text_input: query.text_input,
        ..WorkflowRequest::default()
    };
    if let Some(multipart) = multipart {
        read_multipart(multipart, &mut request).await?;
    }

    workflows::run(&ctx, tab, request).await.map(Json)
}

/// Collect file and text fields. Query parameters take precedence over
/// text fields of the same name.
async fn read_multipart(mut multipart: Multipart, request: &mut WorkflowRequest) -> Result<(), ApiError> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                // browsers send an empty part for an untouched file input
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }
                request.files.push(IncomingFile {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            "session_id" => {
                let text = field.text().await?;
                if request.session_id.is_none() {
                    request.session_id = parse_session_id(&text);
                }
            }
            "text_input" => {
                let text = field.text().await?;
                if request.text_input.is_none() {
                    request.text_input = Some(text);
                }
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }
    Ok(())
}
