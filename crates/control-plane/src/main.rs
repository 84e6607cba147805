// Agentdeck API server
// Decision: PostgreSQL event log when DATABASE_URL is set, in-memory otherwise
// Decision: Sessions, agents and views are served over JSON + SSE from one process

use std::sync::Arc;

use agentdeck_control_plane::api::{self, AppState};
use agentdeck_control_plane::config::ServerConfig;
use agentdeck_core::telemetry::{init_telemetry, TelemetryConfig};
use agentdeck_durable::{EventLog, InMemoryEventLog, PostgresEventLog, StreamBroker};
use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG / LOG_LEVEL: Log filter (default: "agentdeck_control_plane=debug,...")
    // - LOG_FORMAT=json: JSON log lines
    let mut telemetry_config =
        TelemetryConfig::from_env().with_service_name("agentdeck-control-plane");
    if telemetry_config.log_filter.is_none() {
        telemetry_config = telemetry_config.with_log_filter(
            "agentdeck_control_plane=debug,agentdeck_durable=info,tower_http=debug",
        );
    }
    init_telemetry(telemetry_config);

    tracing::info!("agentdeck-control-plane starting...");

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    // Pick the event log
    let log: Arc<dyn EventLog> = match &config.database_url {
        Some(url) => {
            let log = PostgresEventLog::connect(url)
                .await
                .context("Failed to connect to database")?;
            log.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Connected to database");
            Arc::new(log)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory event log (not durable)");
            Arc::new(InMemoryEventLog::new())
        }
    };

    let broker = StreamBroker::new(log, config.broker.clone());
    let state = AppState::new(broker.clone(), &config);

    // Background maintenance
    let shutdown = CancellationToken::new();
    let sweeper = state.jobs.spawn_sweeper(shutdown.clone());
    let reaper = state
        .sessions
        .spawn_reaper(config.session_reap_interval, shutdown.clone());

    if !config.api_prefix.is_empty() {
        tracing::info!(prefix = %config.api_prefix, "API prefix configured");
    }

    // Load CORS allowed origins
    // Only needed when UI is served from a different origin than the API
    let cors_origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if cors_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
    } else {
        tracing::info!(origins = ?cors_origins, "CORS origins configured");
    }

    // Build main router with health (not prefixed) and prefixed API routes
    let app = Router::new()
        .route("/health", get(health))
        .merge(build_router_with_prefix(
            api::router(state.clone()),
            &config.api_prefix,
        ));

    // Add CORS layer only if origins are configured
    let app = if !cors_origins.is_empty() {
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::ORIGIN,
                    header::CACHE_CONTROL,
                    header::HeaderName::from_static("last-event-id"),
                ]),
        )
    } else {
        app
    };

    // Add tracing
    let app = app.layer(TraceLayer::new_for_http());

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);

    let signal = shutdown.clone();
    let views = state.views.clone();
    let stopping = broker.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
            views.shutdown();
            // Ends open SSE streams so graceful shutdown can finish
            stopping.shutdown();
        })
        .await
        .context("Server error")?;

    let _ = tokio::join!(sweeper, reaper);
    tracing::info!("agentdeck-control-plane stopped");
    Ok(())
}

/// Build router with optional API prefix (extracted for testing)
fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_routes() -> Router {
        Router::new().route("/v1/test", get(|| async { "ok" }))
    }

    #[tokio::test]
    async fn test_api_prefix_empty() {
        let app = build_router_with_prefix(test_routes(), "");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_api_prefix_set() {
        let app = build_router_with_prefix(test_routes(), "/api");

        // Route should work with prefix
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);

        // Route should NOT work without prefix
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_health() {
        let app = Router::new().route("/health", get(health));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }
}
