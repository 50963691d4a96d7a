//! Manager server

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Config, Result};
use crate::coordination::serve_monitor;
use crate::coordinator::http::{create_router, ManagerState};
use crate::instance::Instance;
use axum::middleware;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub struct Manager {
    config: Config,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting manager: {}", self.config.instance_name);
        tracing::info!("  HTTP API: {}", self.config.manager.bind_addr);
        tracing::info!("  Monitor: {}", self.config.manager.monitor_addr);
        match &self.config.manager.db_path {
            Some(path) => tracing::info!("  DB path: {}", path.display()),
            None => tracing::info!("  DB path: (in-memory)"),
        }
        tracing::info!("  Last location mode: {}", self.config.last_location_mode);

        let instance = Instance::start(self.config.clone()).await?;

        let monitor_listener = tokio::net::TcpListener::bind(self.config.manager.monitor_addr).await?;
        let monitor = serve_monitor(monitor_listener, instance.service().clone());

        let router = create_router(ManagerState {
            instance: instance.clone(),
        })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_tracing_middleware)),
        );

        let http_listener = tokio::net::TcpListener::bind(self.config.manager.bind_addr).await?;
        let http_server = axum::serve(
            http_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        );

        tracing::info!("✓ Manager ready");

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            res = monitor => {
                if let Err(e) = res {
                    tracing::error!("Monitor error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
            }
        }

        instance.shutdown().await;
        Ok(())
    }
}
