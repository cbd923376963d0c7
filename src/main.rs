// main.rs
use anyhow::Context;
use axum::{
    Router,
    routing::{delete, get, post},
};
use lanlight::{
    catalog::{JsonCatalog, ProductCatalog},
    config,
    docs, effects::EffectRegistry,
    handlers::*,
    manager::{Manager, ManagerEvent},
    metrics,
    models::{AppState, WsMessage},
    transport::sim::{SimLan, SimLight},
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = config::Settings::new().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    if settings.metrics.enabled {
        metrics::setup_metrics(settings.metrics.port)?;
        info!("Metrics exported on port {}", settings.metrics.port);
    }

    let catalog: Arc<dyn ProductCatalog> = Arc::new(match &settings.catalog.products_path {
        Some(path) => JsonCatalog::from_file(path)?,
        None => JsonCatalog::embedded()?,
    });

    let lan = Arc::new(SimLan::new());
    for light in &settings.transport.simulated {
        let sim = SimLight::from_settings(light).with_context(|| format!("bad address for light {}", light.id))?;
        lan.add_light(sim);
    }

    let manager = Manager::new(settings.controller.clone(), lan, catalog);
    let effects = EffectRegistry::new();
    let effects_dir = PathBuf::from(settings.catalog.effects_dir.as_deref().unwrap_or("effects"));
    let state = Arc::new(AppState::new(Arc::clone(&manager), Arc::clone(&effects), effects_dir));

    forward_events(Arc::clone(&state));
    manager.discover().await?;

    let app = Router::new()
        .route("/ws/client", get(handle_client_ws_upgrade))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/devices/{id}/commands/{name}", post(run_command))
        .route("/api/diagnostics/errors", get(error_rates))
        .route("/api/effects", get(list_effects).post(start_effect))
        .route("/api/effects/library", get(effect_library))
        .route("/api/effects/{id}", delete(stop_effect))
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", docs::ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind address: {}", e))?;

    info!("Server started on {}", settings.server.address);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

/// Relays every light's events and every finished effect to connected clients.
fn forward_events(state: Arc<AppState>) {
    let mut discovered = state.manager.subscribe();
    let lights = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            match discovered.recv().await {
                Ok(ManagerEvent::Discovered(id)) => {
                    let Some(light) = lights.manager.device(&id) else { continue };
                    let mut events = light.subscribe();
                    let state = Arc::clone(&lights);
                    tokio::spawn(async move {
                        loop {
                            match events.recv().await {
                                Ok(event) => state.broadcast(WsMessage::device_event(&id, event)),
                                Err(RecvError::Lagged(skipped)) => warn!(device = %id, skipped, "event relay lagging"),
                                Err(RecvError::Closed) => break,
                            }
                        }
                    });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "registry relay lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut ended = state.effects.subscribe();
    tokio::spawn(async move {
        loop {
            match ended.recv().await {
                Ok(notice) => state.broadcast(WsMessage::EffectEnded {
                    effect_id: notice.id,
                    name: notice.name,
                }),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}
