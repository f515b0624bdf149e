//! HTTP server: routing, shared state and the accept loop

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::{self as axum_middleware, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth;
use crate::broker::BrokerConfig;
use crate::config::ServerConfig;
use crate::error::RegistrationError;
use crate::handlers;
use crate::hub::AgentHub;
use crate::proxy::{ProxyServices, ServiceSpec};

/// State shared by every handler
#[derive(Debug)]
pub struct AppState {
    pub config: ServerConfig,
    pub hub: AgentHub,
    pub services: Arc<ProxyServices>,
    /// Fired on shutdown; ends notify streams
    pub shutdown: CancellationToken,
}

/// The outpost server
pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl Server {
    /// Create a server and register the configured proxy services
    pub fn new(config: ServerConfig) -> Result<Self, RegistrationError> {
        Self::with_parts(config, AgentHub::default(), BrokerConfig::default())
    }

    /// Like [`Self::new`] with an explicit hub and broker timing
    pub fn with_parts(
        config: ServerConfig,
        hub: AgentHub,
        broker: BrokerConfig,
    ) -> Result<Self, RegistrationError> {
        let services = Arc::new(ProxyServices::new(
            hub.clone(),
            broker,
            config.proxy_server_host.clone(),
        ));

        for service in &config.proxy_services {
            let host = services.expand_host(&service.host)?;
            services.register(ServiceSpec {
                host,
                agent_name: service.agent_name.clone(),
                agent_id: String::new(),
                target: service.target.clone(),
                replace_host: service.replace_host.clone(),
            })?;
        }

        let state = Arc::new(AppState {
            config: config.clone(),
            hub,
            services,
            shutdown: CancellationToken::new(),
        });

        Ok(Self { config, state })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Build the router with all routes and middleware
    pub fn build_router(&self) -> Router {
        // Agent endpoints carry no API key
        let agent_router = Router::new()
            .route("/api/agent/{name}", get(handlers::agent::notify_stream))
            .route("/api/agent/{name}/{token}", get(handlers::agent::tunnel));

        let client_router = Router::new()
            .route("/api/client", get(handlers::client::list_all))
            .route("/api/client/", get(handlers::client::list_all))
            .route("/api/client/{agent_name}", get(handlers::client::list_agent))
            .route("/api/client/{agent_name}/", get(handlers::client::list_agent))
            .route(
                "/api/client/{agent_name}/exec",
                get(handlers::client::exec).post(handlers::client::exec),
            )
            .route(
                "/api/client/{agent_name}/exec/",
                get(handlers::client::exec).post(handlers::client::exec),
            )
            .route("/api/client/{agent_name}/pty", get(handlers::client::pty))
            .route("/api/client/{agent_name}/pty/", get(handlers::client::pty))
            .route(
                "/api/client/{agent_name}/upgrade",
                post(handlers::client::upgrade),
            )
            .route("/api/proxy", get(handlers::proxy::list))
            .route("/api/proxy/", get(handlers::proxy::list))
            .route(
                "/api/proxy/{host}",
                post(handlers::proxy::register).delete(handlers::proxy::kill),
            )
            .route_layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_api_key,
            ));

        Router::new()
            .merge(agent_router)
            .merge(client_router)
            .fallback(handlers::proxy::forward)
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                route_proxy_hosts,
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        let shutdown = self.state.shutdown.clone();
        let sweeper = self
            .state
            .hub
            .rendezvous
            .spawn_sweeper(shutdown.clone());

        info!(
            "Server '{}' listening on {}",
            self.config.name,
            listener.local_addr()?
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        shutdown.cancel();
        let _ = sweeper.await;
        info!("Server stopped");
        Ok(())
    }

    /// Bind the configured address and serve
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }
}

/// Requests for a registered proxy host go to its service, whatever the path
async fn route_proxy_hosts(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let service = request_host(&request).and_then(|host| state.services.get(host));
    match service {
        Some(service) => service.handle(request).await,
        None => next.run(request).await,
    }
}

/// Host header, or the URI authority for HTTP/2
pub fn request_host(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
}
