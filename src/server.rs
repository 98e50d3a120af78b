//! Local HTTP proxy that fronts the application's origin.
//!
//! # Endpoints
//!
//! - `GET  /__offgrid/messages` - Server-sent events stream of context messages
//! - `POST /__offgrid/message`  - Control message from a context (`SKIP_WAITING`)
//! - `POST /__offgrid/sync`     - Deferred-synchronization signal `{"tag": ...}`
//! - `GET  /__offgrid/status`   - Lifecycle and generation status
//!
//! Every other request is forwarded to the origin through the interceptor.

use axum::{
  body::Body,
  extract::State,
  http::{HeaderValue, StatusCode},
  response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse,
  },
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, Stream};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::signal;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheResult, CacheStorage};
use crate::lifecycle::LifecycleState;
use crate::net::{is_forwardable, Network, Request, Response};
use crate::sync::ControlMessage;
use crate::worker::Worker;

/// Header naming where a proxied response came from.
const SOURCE_HEADER: &str = "x-offgrid-source";

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

struct AppState<S: CacheStorage, N: Network> {
  worker: Worker<S, N>,
  origin: Url,
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
  tag: String,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
  notified: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
  state: LifecycleState,
  generation: String,
  controlling: String,
  generations: Vec<String>,
  clients: usize,
}

/// Install the current generation, then serve until a shutdown signal.
///
/// A failed install is not fatal: the proxy keeps serving from whatever
/// generation was active before.
pub async fn serve<S, N>(worker: Worker<S, N>, origin: Url, addr: SocketAddr) -> Result<()>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  if let Err(e) = worker.lifecycle.install().await {
    warn!(error = %e, "Continuing with the previously active generation");
  }

  let state = Arc::new(AppState { worker, origin });
  let app = build_router(Arc::clone(&state));

  info!("Starting proxy on {} for {}", addr, state.origin);
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  state.worker.interceptor.settle().await;
  info!("Proxy shutdown complete");
  Ok(())
}

fn build_router<S, N>(state: Arc<AppState<S, N>>) -> Router
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  Router::new()
    .route("/__offgrid/messages", get(messages::<S, N>))
    .route("/__offgrid/message", post(control::<S, N>))
    .route("/__offgrid/sync", post(sync::<S, N>))
    .route("/__offgrid/status", get(status::<S, N>))
    .fallback(proxy::<S, N>)
    .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Register a context and stream the messages posted to it.
async fn messages<S, N>(
  State(state): State<Arc<AppState<S, N>>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let (registration, receiver) = state.worker.clients.register();

  // The registration lives in the stream state, so a closed connection
  // unregisters the context
  let events = stream::unfold(
    (receiver, registration),
    |(mut receiver, registration)| async move {
      let message = receiver.recv().await?;
      let event = Event::default()
        .json_data(&message)
        .unwrap_or_else(|_| Event::default().comment("unserializable message"));
      Some((Ok(event), (receiver, registration)))
    },
  );

  Sse::new(events).keep_alive(KeepAlive::default())
}

async fn control<S, N>(
  State(state): State<Arc<AppState<S, N>>>,
  Json(message): Json<ControlMessage>,
) -> StatusCode
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  state.worker.notifier.handle_message(message);
  StatusCode::ACCEPTED
}

async fn sync<S, N>(
  State(state): State<Arc<AppState<S, N>>>,
  Json(request): Json<SyncRequest>,
) -> Json<SyncResponse>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let notified = state.worker.notifier.handle_sync(&request.tag);
  Json(SyncResponse { notified })
}

async fn status<S, N>(State(state): State<Arc<AppState<S, N>>>) -> Json<StatusResponse>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let lifecycle = &state.worker.lifecycle;
  let generations = state.worker.storage().generations().unwrap_or_else(|e| {
    warn!(error = %e, "Could not list cache generations");
    Vec::new()
  });

  Json(StatusResponse {
    state: lifecycle.state(),
    generation: lifecycle.generation().to_string(),
    controlling: lifecycle.controlling().get(),
    generations,
    clients: state.worker.clients.len(),
  })
}

/// Forward a request to the origin through the interceptor.
async fn proxy<S, N>(
  State(state): State<Arc<AppState<S, N>>>,
  request: axum::extract::Request,
) -> axum::response::Response
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let (parts, body) = request.into_parts();

  let url = upstream_url(&state.origin, parts.uri.path(), parts.uri.query());

  let method = match Method::from_bytes(parts.method.as_str().as_bytes()) {
    Ok(method) => method,
    Err(e) => return (StatusCode::METHOD_NOT_ALLOWED, e.to_string()).into_response(),
  };

  let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
  };

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| is_forwardable(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|value| (name.as_str().to_string(), value.to_string()))
    })
    .collect();

  let request = Request {
    method,
    url,
    headers,
    body: body.to_vec(),
  };

  match state.worker.interceptor.handle(request).await {
    Ok(result) => into_http(result),
    Err(e) => {
      warn!(error = %e, "Request failed with no cached fallback");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

// =============================================================================
// Helpers
// =============================================================================

/// Point the origin at an inbound path and query. The origin's own path is
/// replaced, and nothing in the inbound request can change scheme or host.
fn upstream_url(origin: &Url, path: &str, query: Option<&str>) -> Url {
  let mut url = origin.clone();
  url.set_path(path);
  url.set_query(query);
  url.set_fragment(None);
  url
}

fn into_http(result: CacheResult<Response>) -> axum::response::Response {
  let source = result.source;
  let response = result.data;

  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut builder = axum::http::Response::builder().status(status);

  for (name, value) in &response.headers {
    if is_forwardable(name) {
      builder = builder.header(name.as_str(), value.as_str());
    }
  }
  builder = builder.header(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));

  builder
    .body(Body::from(response.body))
    .unwrap_or_else(|e| (StatusCode::BAD_GATEWAY, e.to_string()).into_response())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      error!(error = %e, "Failed to install Ctrl+C handler");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut terminate) => {
        terminate.recv().await;
      }
      Err(e) => {
        error!(error = %e, "Failed to install signal handler");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }

  info!("Shutdown signal received");
}
