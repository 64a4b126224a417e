use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::header::{AUTHORIZATION, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{resolve_listen_addr, ServerConfig};

pub mod connection;
pub mod registry;

pub use connection::{FIRST_FRAME_DEADLINE, HEARTBEAT_PERIOD, PONG_GRACE};
pub use registry::{Registry, RouteOutcome, OUTBOUND_QUEUE};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state behind the relay's WebSocket endpoint.
pub struct RelayState {
    pub registry: Registry,
    allowed_origins: Vec<String>,
    valid_tokens: Vec<String>,
    pub(crate) shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(cfg: &ServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            registry: Registry::new(),
            allowed_origins: cfg.allowed_origins.clone(),
            valid_tokens: cfg.valid_tokens.clone(),
            shutdown,
        }
    }

    /// Gate a connection on its handshake headers, before the upgrade.
    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        if !self.valid_tokens.is_empty() {
            let presented = headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "));
            let accepted = presented
                .map(|token| self.valid_tokens.iter().any(|valid| valid == token))
                .unwrap_or(false);
            if !accepted {
                warn!("rejecting connection: bad or missing bearer token");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }

        if !self.allowed_origins.iter().any(|origin| origin == "*") {
            if let Some(origin) = headers.get(ORIGIN).and_then(|value| value.to_str().ok()) {
                if !self.allowed_origins.iter().any(|allowed| allowed == origin) {
                    warn!(origin, "rejecting connection: origin not allowed");
                    return Err(StatusCode::UNAUTHORIZED);
                }
            }
        }

        Ok(())
    }
}

/// Build the relay router. Exposed separately so tests can serve it on an
/// ephemeral listener.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

/// Run the signaling relay until `shutdown` fires.
pub async fn run(cfg: ServerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    cfg.validate()?;
    if cfg.valid_tokens.is_empty() {
        warn!("authentication disabled: no tokens configured, accepting all peers");
    }

    let addr = resolve_listen_addr(&cfg.addr)?;
    let state = Arc::new(RelayState::new(&cfg, shutdown.clone()));
    let app = router(state);

    if let (Some(cert), Some(key)) = (cfg.tls_cert_file.clone(), cfg.tls_key_file.clone()) {
        let tls = RustlsConfig::from_pem_file(cert, key).await?;
        let handle = axum_server::Handle::new();
        let watcher = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            watcher.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
        info!(%addr, "relay listening (tls)");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "relay listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
    }

    info!("relay stopped");
    Ok(())
}
