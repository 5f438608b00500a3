//! HTTP API
//!
//! An axum router over a shared [`SessionManager`]. Routes manage the server
//! registry, proxy MCP operations, and drive the OAuth flows, including the
//! callback the authorization server redirects the user to.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::CALLBACK_PATH;
use crate::error::{BridgeError, Result};
use crate::manager::SessionManager;

pub use error::ApiError;

/// Builds the bridge router.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use mcpbridge::{config::BridgeConfig, manager::SessionManager, server};
///
/// # async fn run() -> anyhow::Result<()> {
/// let manager = Arc::new(SessionManager::from_config(&BridgeConfig::default()).await?);
/// let app = server::router(manager);
/// # let _ = app;
/// # Ok(())
/// # }
/// ```
pub fn router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/servers",
            get(handlers::list_servers).post(handlers::create_server),
        )
        .route(
            "/servers/:name",
            get(handlers::get_server)
                .patch(handlers::update_server)
                .delete(handlers::delete_server),
        )
        .route("/servers/:name/connect", post(handlers::connect))
        .route("/servers/:name/disconnect", post(handlers::disconnect))
        .route("/servers/:name/tools", get(handlers::list_tools))
        .route("/servers/:name/tools/:tool", post(handlers::call_tool))
        .route("/servers/:name/resources", get(handlers::list_resources))
        .route(
            "/servers/:name/resources/templates",
            get(handlers::list_resource_templates),
        )
        .route("/servers/:name/resources/read", get(handlers::read_resource))
        .route("/servers/:name/prompts", get(handlers::list_prompts))
        .route("/servers/:name/prompts/:prompt", post(handlers::get_prompt))
        .route("/servers/:name/oauth/authorize", post(handlers::authorize))
        .route("/servers/:name/oauth/status", get(handlers::oauth_status))
        .route(
            "/servers/:name/oauth/client-credentials",
            post(handlers::client_credentials),
        )
        .route(
            "/servers/:name/oauth/tokens",
            axum::routing::delete(handlers::revoke_tokens),
        )
        .route(CALLBACK_PATH, get(handlers::oauth_callback))
        .with_state(manager)
}

/// Serves the router until Ctrl+C or SIGTERM, then closes every upstream
/// connection.
///
/// # Errors
///
/// Returns an error when the address cannot be bound.
pub async fn serve(manager: Arc<SessionManager>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Config(format!("cannot bind {addr}: {e}")))?;
    info!(address = %addr, "Bridge listening");

    axum::serve(listener, router(Arc::clone(&manager)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Closing upstream connections");
    manager.disconnect_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
