use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade, ws::close_code},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{handler, registry::Registry};

const BANNER: &str = "party-bus, a very simple party bus service";

/// HTTP front of the relay: upgrades `GET /{session_id}` to a WebSocket and
/// hands the stream to a peer connection handler.
pub struct Broker {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Broker { listener, registry } = self;
        let app = router(Arc::clone(&registry));

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("relay server failed")?;

        handle_shutdown(&registry).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Routes of the relay, sharing `registry` between all connections.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/:session_id", get(upgrade_session))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Session identifiers are path segments made of ASCII letters, digits and `-`.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

async fn root() -> &'static str {
    BANNER
}

async fn upgrade_session(
    Path(session_id): Path<String>,
    State(registry): State<Arc<Registry>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_valid_session_id(&session_id) {
        return (StatusCode::NOT_FOUND, "unknown session path").into_response();
    }

    ws.on_upgrade(move |socket| handler::serve_peer(registry, session_id, socket))
}

async fn handle_shutdown(registry: &Registry) {
    info!("broker shutting down");
    for session in registry.sessions().await {
        session
            .close_all(close_code::AWAY, "relay shutting down")
            .await;
    }
}
