use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Query, Request, State},
    http::{HeaderMap, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthService};
use crate::position::BBox;
use crate::shutdown::SessionRegistry;
use crate::store::FlightStore;
use crate::update_bus::UpdateBus;
use crate::ws::{self, FlightItem};

/// Single-page UI shell embedded into the binary; map assets load from the
/// client side.
static INDEX_HTML: &str = include_str!("../static/index.html");

/// Per-handler deadline for the REST API (the WebSocket route sits outside
/// this layer).
const API_TIMEOUT: Duration = Duration::from_secs(15);

/// Cap on proxied trace payloads.
const TRACE_BODY_LIMIT: usize = 5 * 1024 * 1024;

// App state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FlightStore>,
    pub auth: Arc<AuthService>,
    pub bus: UpdateBus,
    pub registry: SessionRegistry,
    pub metrics: PrometheusHandle,
    pub http: reqwest::Client,
    /// Normalised OTLP collector base URL, when tracing is configured
    pub trace_collector: Option<String>,
}

pub fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (
        status,
        Json(json!({
            "errors": message
        })),
    )
}

/// Accept Go-style `:8080` listen addresses by prefixing a wildcard host.
pub fn normalize_listen_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

/// Turn a `host:port` or URL tracing flag into a collector base URL.
pub fn normalize_collector(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

// Middleware for request logging with a short correlation id
async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();

    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

#[derive(Debug, Deserialize)]
pub struct CallsignQuery {
    pub callsign: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct BBoxQuery {
    pub bbox: String,
}

/// `GET /api/flights`: every current aircraft, WS item shape minus trails.
async fn current_flights(State(state): State<AppState>) -> Response {
    match state.store.current_all().await {
        Ok(points) => {
            let items: Vec<FlightItem> = points.iter().map(FlightItem::from).collect();
            Json(items).into_response()
        }
        Err(e) => {
            error!("Failed to read current flights: {:#}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable").into_response()
        }
    }
}

/// `GET /api/flights/bbox?bbox=minLon,minLat,maxLon,maxLat`
async fn flights_in_bbox(
    State(state): State<AppState>,
    Query(query): Query<BBoxQuery>,
) -> Response {
    let Some(bbox) = BBox::parse(&query.bbox) else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid bbox").into_response();
    };
    match state
        .store
        .current_in_bbox(bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat)
        .await
    {
        Ok(points) => {
            let items: Vec<FlightItem> = points.iter().map(FlightItem::from).collect();
            Json(items).into_response()
        }
        Err(e) => {
            error!("Failed to read flights in bbox: {:#}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable").into_response()
        }
    }
}

/// `GET /api/flight?callsign=CS`: latest position for one flight.
async fn flight_by_callsign(
    State(state): State<AppState>,
    Query(query): Query<CallsignQuery>,
) -> Response {
    match state.store.latest_by_callsign(&query.callsign).await {
        Ok(Some(point)) => Json(point).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Unknown callsign").into_response(),
        Err(e) => {
            error!("Failed to look up callsign: {:#}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable").into_response()
        }
    }
}

/// `GET /api/track?callsign=CS&limit=N`: retained history for one flight.
async fn track_by_callsign(
    State(state): State<AppState>,
    Query(query): Query<CallsignQuery>,
) -> Response {
    match state
        .store
        .track_by_callsign(&query.callsign, query.limit.unwrap_or(0))
        .await
    {
        Ok(Some((icao24, points))) => {
            Json(json!({ "icao24": icao24, "points": points })).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Unknown callsign").into_response(),
        Err(e) => {
            error!("Failed to read track: {:#}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable").into_response()
        }
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        "text/plain; version=0.0.4".parse().unwrap(),
    );
    (StatusCode::OK, headers, state.metrics.render())
}

/// `POST /otel/v1/traces`: opaque forward to the configured collector.
async fn proxy_traces(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(base) = &state.trace_collector else {
        return json_error(StatusCode::NOT_FOUND, "Tracing not configured").into_response();
    };

    let mut request = state.http.post(format!("{base}/v1/traces")).body(body);
    for name in [header::CONTENT_TYPE, header::CONTENT_ENCODING] {
        if let Some(value) = headers.get(&name) {
            request = request.header(name, value);
        }
    }

    match request.send().await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = upstream.bytes().await.unwrap_or_default();
            (status, body).into_response()
        }
        Err(e) => {
            warn!("Trace forward failed: {:#}", e);
            json_error(StatusCode::BAD_GATEWAY, "Collector unreachable").into_response()
        }
    }
}

// Fallback: serve the embedded UI shell for client-routable paths
async fn handle_static_file(uri: Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/');

    if path.is_empty() || path == "index.html" || !path.contains('.') {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CACHE_CONTROL,
            "public, max-age=0, must-revalidate".parse().unwrap(),
        );
        return (StatusCode::OK, headers, Html(INDEX_HTML)).into_response();
    }

    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub fn build_router(state: AppState) -> Router {
    // API sub-router: auth+CSRF enforced, bounded handler time
    let api_router = Router::new()
        .route("/flights", get(current_flights))
        .route("/flights/bbox", get(flights_in_bbox))
        .route("/flight", get(flight_by_callsign))
        .route("/track", get(track_by_callsign))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ))
        .layer(TimeoutLayer::new(API_TIMEOUT))
        .with_state(state.clone());

    Router::new()
        .nest("/api", api_router)
        .route("/ws/flights", get(ws::ws_flights))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route(
            "/otel/v1/traces",
            post(proxy_traces).layer(DefaultBodyLimit::max(TRACE_BODY_LIMIT)),
        )
        .fallback(handle_static_file)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state,
            auth::session_middleware,
        ))
        .layer(middleware::from_fn(auth::cors_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
}
