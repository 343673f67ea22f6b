//! Registry router assembly and server loop.
//!
//! Public routes (directories, discovery, public status, telemetry
//! aggregates) sit next to scope-gated resource routes. The authentication
//! middleware is the outermost layer so every route-level guard sees the
//! resolved principal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    routing::{delete, get, post, put},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer,
};
use tracing::info;

use super::RegistryState;
use super::auth::{authenticate, require_auth, scope_guard, session_only_guard};
use super::model::Scope;
use super::{agents, certs, jwks, keys, oauth, profiles, telemetry, tokens};
use crate::{Error, Result};

/// Build the registry router.
pub fn create_router(state: Arc<RegistryState>) -> Router {
    let public = Router::new()
        .route("/jwks/{file}", get(jwks::user_directory_handler))
        .route("/agent-jwks/{agent_id}", get(jwks::agent_directory_handler))
        .route(
            "/.well-known/signature-agent-card",
            get(jwks::agent_card_handler),
        )
        .route("/.well-known/ca.pem", get(jwks::ca_pem_handler))
        .route("/profiles", get(profiles::list_profiles_handler))
        .route("/profiles/{username}", get(profiles::get_profile_handler))
        .route("/v1/certs/public-status", get(certs::public_status_handler))
        .route("/telemetry/overview", get(telemetry::overview_handler))
        .route("/telemetry/timeseries", get(telemetry::timeseries_handler))
        .route("/telemetry/top/agents", get(telemetry::top_agents_handler))
        .route("/telemetry/top/origins", get(telemetry::top_origins_handler))
        .route("/telemetry/{username}", get(telemetry::user_stats_handler))
        .route("/agent-activity/{agent_id}", get(telemetry::get_activity_handler))
        .route("/auth/github", get(oauth::github_login_handler))
        .route("/auth/github/callback", get(oauth::github_callback_handler))
        .route("/auth/cli", get(oauth::cli_login_handler))
        .route("/auth/session", get(oauth::session_info_handler))
        .route("/auth/logout", post(oauth::logout_handler));

    let agents_read = Router::new()
        .route("/agents", get(agents::list_agents_handler))
        .route("/agents/{id}", get(agents::get_agent_handler))
        .route("/v1/certs", get(certs::list_certs_handler))
        .route("/v1/certs/status", get(certs::status_handler))
        .route("/v1/certs/{serial}", get(certs::get_cert_handler))
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            scope_guard(Scope::AgentsRead, req, next)
        }));

    let agents_write = Router::new()
        .route("/agents", post(agents::create_agent_handler))
        .route(
            "/agents/{id}",
            put(agents::update_agent_handler).delete(agents::delete_agent_handler),
        )
        .route("/v1/certs/issue", post(certs::issue_handler))
        .route("/v1/certs/revoke", post(certs::revoke_handler))
        .route("/agent-activity", post(telemetry::post_activity_handler))
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            scope_guard(Scope::AgentsWrite, req, next)
        }));

    let keys_read = Router::new()
        .route("/keys", get(keys::active_key_handler))
        .route("/keys/history", get(keys::key_history_handler))
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            scope_guard(Scope::KeysRead, req, next)
        }));

    let keys_write = Router::new()
        .route("/keys", post(keys::register_key_handler))
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            scope_guard(Scope::KeysWrite, req, next)
        }));

    let profile_write = Router::new()
        .route("/profiles", put(profiles::update_profile_handler))
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            scope_guard(Scope::ProfileWrite, req, next)
        }));

    let telemetry_owner = Router::new()
        .route(
            "/telemetry/{username}/visibility",
            put(telemetry::visibility_handler),
        )
        .route_layer(middleware::from_fn(require_auth));

    // Token management never accepts token auth.
    let token_routes = Router::new()
        .route(
            "/auth/tokens",
            post(tokens::create_token_handler).get(tokens::list_tokens_handler),
        )
        .route("/auth/tokens/{id}", delete(tokens::delete_token_handler))
        .route_layer(middleware::from_fn(session_only_guard));

    Router::new()
        .merge(public)
        .merge(agents_read)
        .merge(agents_write)
        .merge(keys_read)
        .merge(keys_write)
        .merge(profile_write)
        .merge(telemetry_owner)
        .merge(token_routes)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            authenticate,
        ))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the registry until SIGTERM/ctrl-c.
pub async fn serve(state: Arc<RegistryState>, addr: SocketAddr) -> Result<()> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Periodic sweep of expired sessions and PoP nonces.
    {
        let store = Arc::clone(&state.store);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.sweep().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    let app = create_router(Arc::clone(&state));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Registry listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Registry shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
