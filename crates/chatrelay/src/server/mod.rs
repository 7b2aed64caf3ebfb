//! HTTP front-end
//!
//! One `POST` route per configured `[[routes]]` entry plus `GET /health`.
//! All request state lives in an immutable [`AppState`] built at startup.

mod error;
mod handlers;

pub use error::{ApiError, ErrorKind};
pub use handlers::QueryRequest;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::auth::AllowList;
use crate::config::{AuthConfig, Config, ProviderKind, RelayConfig, RouteConfig};
use crate::error::{RelayError, Result};
use crate::filter::Denylist;
use crate::prompt::PromptShaper;
use crate::upstream::{ChatProvider, CozeProvider, ZhipuProvider, build_http_client};

/// A configured route bound to its provider
pub struct Route {
    pub config: RouteConfig,
    pub provider: Arc<dyn ChatProvider>,
}

/// Shared, read-only state for all handlers
pub struct AppState {
    pub auth: AuthConfig,
    pub allow_list: AllowList,
    pub denylist: Denylist,
    /// Default answer for blocked queries
    pub filter_rejection: String,
    pub shaper: PromptShaper,
    pub relay: RelayConfig,
    pub routes: Vec<Route>,
}

impl AppState {
    /// Build the state, constructing real providers from the config
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = build_http_client(&config.server)?;
        let timeout = Duration::from_secs(config.server.request_timeout_secs);

        let zhipu: Option<Arc<dyn ChatProvider>> = match &config.providers.zhipu {
            Some(c) => Some(Arc::new(ZhipuProvider::new(client.clone(), c, timeout)?)),
            None => None,
        };
        let coze: Option<Arc<dyn ChatProvider>> = match &config.providers.coze {
            Some(c) => Some(Arc::new(CozeProvider::new(client, c, timeout)?)),
            None => None,
        };

        Self::with_providers(config, |kind| match kind {
            ProviderKind::Zhipu => zhipu.clone(),
            ProviderKind::Coze => coze.clone(),
        })
    }

    /// Build the state with caller-supplied providers
    pub fn with_providers<F>(config: &Config, provider_for: F) -> Result<Self>
    where
        F: Fn(ProviderKind) -> Option<Arc<dyn ChatProvider>>,
    {
        let allow_list = if config.auth.enabled {
            AllowList::from_config(&config.auth)?
        } else {
            tracing::warn!("Authentication is disabled; every request is accepted");
            AllowList::default()
        };

        let denylist = Denylist::from_config(&config.filter)?;
        let shaper = PromptShaper::from_config(&config.prompt)?;

        let routes = config
            .routes
            .iter()
            .map(|route| {
                let provider = provider_for(route.provider).ok_or_else(|| {
                    RelayError::Config(format!(
                        "Route '{}' uses {} but that provider is not configured",
                        route.path,
                        route.provider.as_str()
                    ))
                })?;
                Ok(Route {
                    config: route.clone(),
                    provider,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            routes = routes.len(),
            keys = allow_list.len(),
            banwords = denylist.len(),
            "Application state ready"
        );

        Ok(Self {
            auth: config.auth.clone(),
            allow_list,
            denylist,
            filter_rejection: config.filter.rejection_message.clone(),
            shaper,
            relay: config.relay.clone(),
            routes,
        })
    }
}

/// The relay HTTP server
pub struct RelayServer {
    listen_addr: String,
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            listen_addr: config.server.listen_addr.clone(),
            state: Arc::new(AppState::from_config(config)?),
        })
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let app = create_router(self.state.clone());

        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid listen address: {e}")))?;

        for route in &self.state.routes {
            tracing::info!(
                "Route POST {} -> {}",
                route.config.path,
                route.provider.name()
            );
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Server(format!("Failed to bind to {addr}: {e}")))?;

        tracing::info!("Relay listening on {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::Server(format!("Server error: {e}")))?;

        tracing::info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// Create the router with `/health` and every configured route
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/health", get(health_handler));

    for (index, route) in state.routes.iter().enumerate() {
        router = router.route(
            &route.config.path,
            post(
                move |State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes| {
                    handlers::query_handler(state, index, headers, body)
                },
            ),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
