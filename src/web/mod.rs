//! HTTP surface
//!
//! - `GET /` clip listing for a session
//! - `GET /videos/...` the published tree
//! - `GET /replay/{n}` latest clip of camera `n`
//! - `POST /timer`, `POST /decision` scoring server callbacks
//! - `GET /ws` status frames

mod page;

pub use page::{ListingData, ListingPage};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::attempt::session_dir_name;
use crate::config::ServerConfig;
use crate::router::{DecisionForm, EventRouter, RouteError, TimerForm};
use crate::session::{ClipOrder, SessionError, SessionIndex};
use crate::status::{StatusBus, CLIENT_SEND_DEADLINE};
use crate::supervisor::SupervisorHandle;

/// Shared state for web handlers
#[derive(Clone)]
pub struct WebState {
    pub router: EventRouter,
    pub index: SessionIndex,
    pub bus: StatusBus,
    pub supervisor: SupervisorHandle,
    pub page: Arc<ListingPage>,
    /// Number of configured cameras, for the replay links
    pub cameras: u32,
}

pub fn router(state: WebState) -> Router {
    let videos = ServeDir::new(state.index.video_dir());
    Router::new()
        .route("/", get(listing))
        .route("/replay/{camera}", get(replay))
        .route("/timer", post(timer))
        .route("/decision", post(decision))
        .route("/ws", get(status_ws))
        .nest_service("/videos", videos)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listener up front so a taken port fails startup
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.bind, config.port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

pub async fn serve(listener: TcpListener, state: WebState, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Replays on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")
}

fn no_cache(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

#[derive(Debug, Default, Deserialize)]
struct ListingQuery {
    session: Option<String>,
    sort: Option<String>,
    order: Option<String>,
}

async fn listing(State(state): State<WebState>, Query(query): Query<ListingQuery>) -> Response {
    let order = ClipOrder::from_query(query.sort.as_deref(), query.order.as_deref());
    let current = state.supervisor.view().session;
    let index = state.index.clone();
    let cameras = state.cameras;
    let status = state.bus.last();

    let gathered = tokio::task::spawn_blocking(move || {
        let sessions = index.sessions()?;
        let selected = match query.session.filter(|s| !s.is_empty()) {
            Some(requested) => Some(requested),
            None => {
                let current = session_dir_name(&current);
                sessions
                    .iter()
                    .find(|s| s.name == current)
                    .or(sessions.first())
                    .map(|s| s.name.clone())
            }
        };
        let clips = match &selected {
            Some(session) => index.clips(session, order)?,
            None => Vec::new(),
        };
        Ok::<_, SessionError>(ListingData::new(
            &sessions,
            selected.as_deref(),
            clips,
            order,
            cameras,
            status,
        ))
    })
    .await;

    let data = match gathered {
        Ok(Ok(data)) => data,
        Ok(Err(e @ (SessionError::NotFound(_) | SessionError::InvalidName(_)))) => {
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
        Ok(Err(e)) => {
            error!("Listing failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        Err(e) => {
            error!("Listing task failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match state.page.render(&data) {
        Ok(html) => no_cache(Html(html).into_response()),
        Err(e) => {
            error!("Failed to render listing: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `/replay/{n}` and `/replay/{n}.mp4`
async fn replay(
    State(state): State<WebState>,
    Path(camera): Path<String>,
    request: Request,
) -> Response {
    let Ok(camera) = camera.trim_end_matches(".mp4").parse::<u32>() else {
        return (StatusCode::BAD_REQUEST, "camera must be a number").into_response();
    };

    let index = state.index.clone();
    let session = state.supervisor.view().session;
    let found =
        tokio::task::spawn_blocking(move || index.latest_clip(camera, Some(session.as_str()))).await;

    let path = match found {
        Ok(Ok(Some(path))) => path,
        Ok(Ok(None)) => {
            return (StatusCode::NOT_FOUND, format!("No replay for camera {}", camera))
                .into_response();
        }
        Ok(Err(e)) => {
            warn!("Replay lookup for camera {} failed: {}", camera, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        Err(e) => {
            error!("Replay lookup task failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    debug!("Replay camera {} -> {}", camera, path.display());
    match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => no_cache(response.into_response()),
        Err(never) => match never {},
    }
}

async fn timer(State(state): State<WebState>, Form(form): Form<TimerForm>) -> Response {
    match state.router.timer(form).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(RouteError::Malformed(e)) => {
            warn!("Rejected /timer: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(RouteError::Supervisor(e)) => {
            error!("/timer failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn decision(State(state): State<WebState>, Form(form): Form<DecisionForm>) -> Response {
    match state.router.decision(form).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(RouteError::Malformed(e)) => {
            warn!("Rejected /decision: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(RouteError::Supervisor(e)) => {
            error!("/decision failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn status_ws(State(state): State<WebState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status_socket(socket, state.bus))
}

/// Forward status frames to one browser until either side goes away
async fn handle_status_socket(socket: WebSocket, bus: StatusBus) {
    let Some(mut client) = bus.register_client() else {
        return;
    };
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            message = client.rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode status frame: {}", e);
                        continue;
                    }
                };
                match tokio::time::timeout(CLIENT_SEND_DEADLINE, sender.send(Message::Text(json.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Browser client {} send failed: {}", client.id, e);
                        break;
                    }
                    Err(_) => {
                        warn!("Browser client {} missed the send deadline", client.id);
                        break;
                    }
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    bus.unregister_client(client.id);
    let _ = sender.send(Message::Close(None)).await;
}
