//! Router assembly and the bind/serve loop.

use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{docs::ApiDoc, error::Result, middleware::RateLimitLayer, routes, state::AppState};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 3000, enable_cors: true }
    }
}

pub struct Server {
    config: ServerConfig,
    app: Router,
}

impl Server {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        let app = Self::build_app(state, &config);
        Self { config, app }
    }

    fn build_app(state: Arc<AppState>, config: &ServerConfig) -> Router {
        let swagger = SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi());

        let mut app = routes::create_router(state)
            .merge(swagger)
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(RateLimitLayer::default());

        if config.enable_cors {
            app = app.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
        }

        app
    }

    /// Binds with `ConnectInfo<SocketAddr>` so downstream middleware (the
    /// rate limiter) sees the real peer address instead of the loopback
    /// fallback it otherwise uses.
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr =
            format!("{}:{}", self.config.host, self.config.port).parse().map_err(|e| {
                treasury_core::CoreError::InvalidConfig { field: "host/port".to_string(), reason: format!("{e}") }
            })?;

        info!(%addr, "treasury API listening");
        info!(docs = %format!("http://{addr}/docs"), "swagger ui available");

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            treasury_core::CoreError::OperationFailed(format!("failed to bind {addr}: {e}"))
        })?;

        axum::serve(listener, self.app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| treasury_core::CoreError::OperationFailed(format!("server error: {e}")))?;

        Ok(())
    }

    #[cfg(test)]
    pub fn router(self) -> Router {
        self.app
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_every_interface() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert!(config.enable_cors);
    }
}
