mod camera;
mod encoder;
mod mjpeg;

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use cam_feed_common::config::{Config, ConfigError};
use cam_feed_common::frame::STREAM_CONTENT_TYPE;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::camera::{SharedSource, WebcamSource};
use crate::mjpeg::StreamStats;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    source: SharedSource,
    jpeg_quality: u8,
    camera_index: u32,
    stats: Arc<StreamStats>,
    started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

const INDEX_HTML: &str = r#"<html>
    <head>
        <title>Live Video Stream</title>
    </head>
    <body>
        <h1>Live Video Feed</h1>
        <img src="/video_feed" style="width:640px; height:480px;">
    </body>
</html>
"#;

/// GET / — static page embedding the stream.
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /video_feed — unbounded multipart stream, one JPEG part per frame.
async fn video_feed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let parts = mjpeg::part_stream(
        Arc::clone(&state.source),
        state.jpeg_quality,
        Arc::clone(&state.stats),
    )
    .map(Ok::<_, Infallible>);

    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        Body::from_stream(parts),
    )
}

#[derive(Debug, Serialize)]
struct StatusBody {
    active_clients: usize,
    frames_streamed: u64,
    uptime_secs: i64,
    camera_index: u32,
}

/// GET /status — stream counters for quick health checks.
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusBody> {
    Json(StatusBody {
        active_clients: state.stats.active_clients.load(Ordering::Relaxed),
        frames_streamed: state.stats.frames_streamed.load(Ordering::Relaxed),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        camera_index: state.camera_index,
    })
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

/// An explicit config path must load; otherwise `./config.toml` is used if
/// present, otherwise the built-in defaults (the server runs with no file).
fn resolve_config() -> Result<Config, ConfigError> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path),
        None => {
            let default_path = Path::new("config.toml");
            if default_path.exists() {
                Config::load(default_path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let config = match resolve_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        host = config.server.host,
        port = config.server.port,
        camera_index = config.camera.index,
        jpeg_quality = config.camera.quality,
        "starting cam-feed server"
    );

    // The camera is opened exactly once and held for the process lifetime.
    // If this fails there is nothing to serve, so the server never binds.
    let source: SharedSource = match WebcamSource::open(config.camera.index) {
        Ok(s) => Arc::new(Mutex::new(s)),
        Err(e) => {
            error!(error = %e, "failed to open camera");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        source,
        jpeg_quality: config.camera.quality,
        camera_index: config.camera.index,
        stats: Arc::new(StreamStats::default()),
        started_at: Utc::now(),
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(addr, "cam-feed server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    axum::serve(listener, app).await.unwrap();
}
