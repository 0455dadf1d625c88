use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ghostpixel_engine::color::parse_color_ids;
use ghostpixel_engine::{
    Controller, EnergyState, GridCoord, HttpSink, Session, TemplateSource, TileBitmap, TileKey,
};
use ghostpixel_protocol::{
    routes, ColorsInput, ConfigPatch, EnergyInput, IgnoreColorsInput, PendingRequests,
    ReconcileConfig, SessionInput, StatusReport,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

pub mod bridge;
pub mod config;

use bridge::BridgeHost;
use config::Settings;

/// Template uploads can cover a large area; tiles are 4 MB each.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

type ApiError = (StatusCode, String);

pub struct AppState {
    pub controller: Controller<BridgeHost, HttpSink>,
}

impl AppState {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let sink = HttpSink::new(settings.endpoint.clone()).context("build http client")?;
        let host = BridgeHost::new(settings.relog_timeout);
        let controller = Controller::new(
            Arc::new(host),
            Arc::new(sink),
            settings.reconcile.clone(),
            settings.tuning.clone(),
        )
        .context("invalid ignored colors in config")?;
        Ok(Self { controller })
    }

    fn bridge(&self) -> &BridgeHost {
        self.controller.host()
    }
}

pub fn build_router(state: Arc<AppState>, allowed_origins: Vec<String>) -> Router {
    Router::new()
        .route(routes::HEALTH, get(health))
        .route(routes::BOT_START, post(bot_start))
        .route(routes::BOT_STOP, post(bot_stop))
        .route(routes::BOT_RELOAD, post(bot_reload))
        .route(routes::BOT_IGNORED_COLORS, post(bot_ignored_colors))
        .route(routes::BOT_CONFIG, get(bot_config).post(bot_update_config))
        .route(routes::BOT_STATUS, get(bot_status))
        .route(routes::HOST_TEMPLATE, post(host_template))
        .route(routes::HOST_TILE, post(host_tile))
        .route(routes::HOST_COLORS, post(host_colors))
        .route(routes::HOST_ENERGY, post(host_energy))
        .route(routes::HOST_SESSION, post(host_session))
        .route(routes::HOST_PENDING, get(host_pending))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
        // Local security: allow only loopback + Tailscale by default.
        .layer(middleware::from_fn(ip_allowlist))
        // The agent holds a live session token. Never answer with `Access-Control-Allow-Origin: *`;
        // only local tools and the configured host pages may call it from a browser.
        .layer(local_only_cors(allowed_origins))
}

async fn health() -> &'static str {
    "ok"
}

/// Whether the request changed anything, plus the status afterwards.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    pub status: StatusReport,
}

fn ack(state: &AppState, ok: bool) -> Json<Ack> {
    Json(Ack {
        ok,
        status: state.controller.status(),
    })
}

async fn bot_start(State(state): State<Arc<AppState>>) -> Json<Ack> {
    let started = state.controller.start();
    ack(&state, started)
}

async fn bot_stop(State(state): State<Arc<AppState>>) -> Json<Ack> {
    let stopped = state.controller.stop();
    ack(&state, stopped)
}

async fn bot_reload(State(state): State<Arc<AppState>>) -> Json<Ack> {
    state.controller.reload();
    ack(&state, true)
}

async fn bot_ignored_colors(
    State(state): State<Arc<AppState>>,
    Json(input): Json<IgnoreColorsInput>,
) -> Result<Json<ReconcileConfig>, ApiError> {
    state
        .controller
        .set_ignored_colors(&input.colors, input.separator.as_deref())
        .map_err(bad_request)?;
    Ok(Json(state.controller.config()))
}

async fn bot_config(State(state): State<Arc<AppState>>) -> Json<ReconcileConfig> {
    Json(state.controller.config())
}

async fn bot_update_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<ConfigPatch>,
) -> Json<ReconcileConfig> {
    Json(state.controller.update_config(&patch))
}

async fn bot_status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(state.controller.status())
}

#[derive(Debug, Deserialize)]
struct TemplateQuery {
    x: i64,
    y: i64,
    width: u32,
}

async fn host_template(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TemplateQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let row = (q.width as usize).checked_mul(4).unwrap_or(0);
    if row == 0 || body.is_empty() || body.len() % row != 0 {
        return Err(bad_request(format!(
            "template body of {} bytes is not whole rows of width {}",
            body.len(),
            q.width
        )));
    }
    state.bridge().set_template(TemplateSource::new(
        body.to_vec(),
        GridCoord::new(q.x, q.y),
        q.width,
    ));
    state.controller.reload();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TileQuery {
    width: u32,
    height: u32,
}

async fn host_tile(
    State(state): State<Arc<AppState>>,
    Path((x, y)): Path<(i64, i64)>,
    Query(q): Query<TileQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let expected = (q.width as usize)
        .checked_mul(q.height as usize)
        .and_then(|n| n.checked_mul(4));
    if expected.map_or(true, |n| n == 0 || body.len() != n) {
        return Err(bad_request(format!(
            "tile body of {} bytes does not match {}x{}",
            body.len(),
            q.width,
            q.height
        )));
    }
    state.bridge().put_tile(
        TileKey::new(x, y),
        TileBitmap {
            width: q.width,
            height: q.height,
            rgba: body.to_vec().into(),
        },
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn host_colors(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ColorsInput>,
) -> Result<StatusCode, ApiError> {
    let ids = parse_color_ids(&input.colors).map_err(bad_request)?;
    state.bridge().set_colors(ids);
    state.controller.reload();
    Ok(StatusCode::NO_CONTENT)
}

async fn host_energy(
    State(state): State<Arc<AppState>>,
    Json(input): Json<EnergyInput>,
) -> Result<StatusCode, ApiError> {
    if !input.rate_secs.is_finite() || input.rate_secs < 0.0 {
        return Err(bad_request(format!("invalid regeneration rate {}", input.rate_secs)));
    }
    state.bridge().set_energy(EnergyState {
        current: input.current,
        max: input.max,
        rate_secs: input.rate_secs,
    });
    Ok(StatusCode::NO_CONTENT)
}

async fn host_session(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SessionInput>,
) -> StatusCode {
    state.bridge().set_session(Session {
        token: input.token,
        user_id: input.user_id,
        subject: input.subject,
    });
    StatusCode::NO_CONTENT
}

async fn host_pending(State(state): State<Arc<AppState>>) -> Json<PendingRequests> {
    Json(state.bridge().take_pending())
}

fn bad_request(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(settings.addr).await?;
    serve_listener(listener, settings, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    settings: Settings,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState::new(&settings)?);
    let app = build_router(state.clone(), settings.allowed_origins.clone());
    let addr = listener.local_addr()?;
    info!(%addr, endpoint = %settings.endpoint, "server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    state.controller.stop();
    state.controller.wait().await;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| is_allowed_peer_ip(IpAddr::V4(v4))),
    }
}

fn local_only_cors(allowed_origins: Vec<String>) -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    let allowed = Arc::new(allowed_origins);
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _req| {
            is_allowed_origin(origin, &allowed)
        }))
}

fn is_allowed_origin(origin: &axum::http::HeaderValue, extra: &[String]) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };

    // Host pages the bridge script runs on.
    if extra.iter().any(|o| o.trim_end_matches('/') == s) {
        return true;
    }

    // Local tools and reverse proxies.
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}
