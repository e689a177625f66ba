//! HTTP host for the monitor.
//!
//! - `GET /api/state` answers the current state as `{status, charge, runtime}`.
//! - `GET /api/events` streams server-sent events: `state` every poll cycle
//!   and the registered status change event on each flip.
//! - `GET /api/events/registered` lists the registered event names.
//! - `GET /health` reports whether the poller is running.

use std::{future::Future, sync::Arc};

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{broadcast, watch},
};
use tracing::{debug, info, warn};

use crate::broadcast::{EventHub, Message};
use crate::error::{self, Error};
use crate::monitor::UpsMonitor;
use crate::status::UpsState;

/// Shared server state.
pub struct AppState {
    monitor: Arc<UpsMonitor>,
    hub: EventHub,
    shutdown: watch::Receiver<bool>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    pub polling: bool,
    pub listeners: usize,
    pub last_state: Option<UpsState>,
}

pub async fn handle_state(State(app): State<Arc<AppState>>) -> Json<UpsState> {
    let monitor = app.monitor.clone();
    // The first query may block on upsd, keep that off the async workers.
    match tokio::task::spawn_blocking(move || monitor.handle_query()).await {
        Ok(state) => Json(state),
        Err(e) => {
            warn!(error = %e, "State query failed");
            Json(UpsState::unknown())
        }
    }
}

pub async fn handle_events(
    State(app): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = message_stream(app.hub.subscribe(), app.shutdown.clone())
        .map(|message| Event::default().event(message.event()).json_data(message.state()));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn handle_registered(State(app): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(app.monitor.registered_events())
}

pub async fn handle_health(State(app): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        polling: app.monitor.is_running(),
        listeners: app.hub.listeners(),
        last_state: app.monitor.store().peek(),
    })
}

/// Messages from the hub until `shutdown` flips to true. Lagging listeners skip
/// what they missed rather than disconnect.
pub fn message_stream(
    rx: broadcast::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Message> {
    let messages = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => return Some((message, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    messages.take_until(stopped(shutdown))
}

/// Resolves once `shutdown` is set to true or its sender is gone.
pub async fn stopped(mut shutdown: watch::Receiver<bool>) {
    loop {
        let stopping = *shutdown.borrow_and_update();
        if stopping || shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub fn build_router(monitor: Arc<UpsMonitor>, hub: EventHub, shutdown: watch::Receiver<bool>) -> Router {
    let state = Arc::new(AppState {
        monitor,
        hub,
        shutdown,
    });

    Router::new()
        .route("/api/state", get(handle_state))
        .route("/api/events", get(handle_events))
        .route("/api/events/registered", get(handle_registered))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Serves `app` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> error::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Server)
}
