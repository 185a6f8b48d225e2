use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State as AxumState;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

#[derive(Clone)]
pub struct State {
    /// True while this replica leads and its engines are running
    ready: watch::Receiver<bool>,
}

impl State {
    pub fn new(ready: watch::Receiver<bool>) -> Self {
        Self { ready }
    }

    fn readiness(&self) -> Readiness {
        if *self.ready.borrow() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

pub async fn serve_metrics(
    addr: SocketAddr,
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics listening");

    let app = router(Arc::new(State::new(ready)));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics() -> String {
    cosi_reconcile::metrics::encode()
}

async fn readyz(AxumState(state): AxumState<Arc<State>>) -> Readiness {
    state.readiness()
}

enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Readiness::Ready => (StatusCode::OK, "Ok"),
            Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "NotReady"),
        };
        (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }
}
