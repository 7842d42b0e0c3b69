use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::auth::{AUTH_COOKIE, CSRF_COOKIE};
use crate::db::unix_now;
use crate::position::{BBox, Point, normalize_callsign};
use crate::store::FlightStore;
use crate::web::{AppState, json_error};

/// Trail attached to upserted items: at most this many points...
const TRAIL_LIMIT: usize = 24;
/// ...no older than this.
const TRAIL_WINDOW: Duration = Duration::from_secs(45 * 60);

/// Client-reported outbound buffer depth above which sends pause.
const BUFFER_HIGH_BYTES: i64 = 1_000_000;

/// A heartbeat goes out when nothing was written for this long.
const HEARTBEAT_IDLE: Duration = Duration::from_secs(25);
const TICK_INTERVAL: Duration = Duration::from_secs(30);

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub lon: f64,
    pub lat: f64,
}

/// One aircraft as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightItem {
    pub icao24: String,
    pub callsign: String,
    pub lon: f64,
    pub lat: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub alt: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub track: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub speed: f64,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<TrailPoint>,
}

impl From<&Point> for FlightItem {
    fn from(p: &Point) -> Self {
        FlightItem {
            icao24: p.icao24.clone(),
            callsign: p.callsign.clone(),
            lon: p.lon,
            lat: p.lat,
            alt: p.alt,
            track: p.track,
            speed: p.speed,
            ts: p.ts,
            trail: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Diff {
        seq: i64,
        upsert: Vec<FlightItem>,
        delete: Vec<String>,
    },
    Hb {
        ts: i64,
    },
    ServerShutdown {
        ts: i64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ack {
        seq: i64,
        #[serde(default)]
        buffered: i64,
    },
    Viewport {
        bbox: String,
    },
}

/// Items are keyed by icao24 when present, otherwise by normalised
/// callsign. Items with neither have no identity and are dropped.
pub fn item_key(item: &FlightItem) -> String {
    if !item.icao24.is_empty() {
        item.icao24.clone()
    } else {
        normalize_callsign(&item.callsign)
    }
}

/// Position, motion or identity changed; trails are derived data and do
/// not count.
fn items_differ(a: &FlightItem, b: &FlightItem) -> bool {
    a.lon != b.lon
        || a.lat != b.lat
        || a.alt != b.alt
        || a.track != b.track
        || a.speed != b.speed
        || a.ts != b.ts
        || a.callsign != b.callsign
}

/// Compare the snapshot the client holds against the current view. With an
/// empty `last` this degenerates to the initial full snapshot. Output is
/// sorted by key so transcripts are deterministic.
pub fn compute_diff(
    last: &HashMap<String, FlightItem>,
    cur: &HashMap<String, FlightItem>,
) -> (Vec<FlightItem>, Vec<String>) {
    let mut upsert: Vec<FlightItem> = cur
        .iter()
        .filter(|(key, item)| match last.get(*key) {
            Some(old) => items_differ(old, item),
            None => true,
        })
        .map(|(_, item)| item.clone())
        .collect();
    upsert.sort_by_key(item_key);

    let mut delete: Vec<String> = last
        .keys()
        .filter(|key| !cur.contains_key(*key))
        .cloned()
        .collect();
    delete.sort();

    (upsert, delete)
}

/// Per-connection protocol state. Mutated only by the session's own loop.
struct Session {
    store: Arc<FlightStore>,
    /// Snapshot as of the last diff that made it onto the wire
    last: HashMap<String, FlightItem>,
    seq: i64,
    /// A diff is on the wire and unacknowledged
    inflight: bool,
    /// Client reported a congested outbound buffer in its last ack
    buffer_high: bool,
    /// An update arrived since the last successful send
    pending: bool,
    last_send: Instant,
    bbox: Option<BBox>,
}

impl Session {
    fn new(store: Arc<FlightStore>) -> Self {
        Session {
            store,
            last: HashMap::new(),
            seq: 0,
            inflight: false,
            buffer_high: false,
            // the first send is the initial snapshot
            pending: true,
            last_send: Instant::now(),
            bbox: None,
        }
    }

    /// Process an ack. Returns whether a follow-up send attempt is wanted.
    fn handle_ack(&mut self, seq: i64, buffered: i64) -> bool {
        if seq != self.seq {
            // stale client; the next diff carries the current seq
            debug!("Ignoring out-of-order ack {} (current {})", seq, self.seq);
            return false;
        }
        self.inflight = false;
        self.buffer_high = buffered > BUFFER_HIGH_BYTES;
        !self.buffer_high
    }

    fn set_viewport(&mut self, bbox: BBox) {
        self.bbox = Some(bbox);
        self.pending = true;
    }

    fn heartbeat_due(&self) -> bool {
        self.last_send.elapsed() > HEARTBEAT_IDLE
    }

    async fn current_view(&self) -> anyhow::Result<HashMap<String, FlightItem>> {
        let points = self.store.current_all().await?;
        let mut view = HashMap::with_capacity(points.len());
        for point in &points {
            if let Some(bbox) = &self.bbox
                && !bbox.contains(point.lon, point.lat)
            {
                continue;
            }
            let item = FlightItem::from(point);
            let key = item_key(&item);
            if key.is_empty() {
                continue;
            }
            view.insert(key, item);
        }
        Ok(view)
    }

    /// Compute the next diff if the flow-control gates allow one. An empty
    /// diff is swallowed here (clearing `pending`); a real diff is handed
    /// back with the view to commit once it reaches the wire.
    async fn prepare_diff(&mut self) -> Option<(ServerMessage, HashMap<String, FlightItem>)> {
        if self.inflight || self.buffer_high || !self.pending {
            return None;
        }
        let cur = match self.current_view().await {
            Ok(cur) => cur,
            Err(e) => {
                // store unavailable: stay pending, retry on the next wake-up
                debug!("Current view unavailable: {:#}", e);
                return None;
            }
        };
        let (mut upsert, delete) = compute_diff(&self.last, &cur);
        if upsert.is_empty() && delete.is_empty() {
            self.pending = false;
            self.last = cur;
            return None;
        }
        for item in &mut upsert {
            if item.icao24.is_empty() {
                continue;
            }
            match self
                .store
                .recent_track_by_icao(&item.icao24, TRAIL_LIMIT, TRAIL_WINDOW)
                .await
            {
                Ok(points) if !points.is_empty() => {
                    item.trail = points
                        .iter()
                        .map(|p| TrailPoint { lon: p.lon, lat: p.lat })
                        .collect();
                }
                Ok(_) => {}
                Err(e) => debug!("Trail unavailable for {}: {:#}", item.icao24, e),
            }
        }
        let msg = ServerMessage::Diff {
            seq: self.seq + 1,
            upsert,
            delete,
        };
        Some((msg, cur))
    }

    /// The diff made it onto the wire; advance the protocol state.
    fn commit_diff(&mut self, cur: HashMap<String, FlightItem>) {
        self.seq += 1;
        self.inflight = true;
        self.last = cur;
        self.pending = false;
        self.last_send = Instant::now();
    }

    async fn try_send(
        &mut self,
        sink: &mut SplitSink<WebSocket, Message>,
    ) -> Result<(), axum::Error> {
        let Some((msg, cur)) = self.prepare_diff().await else {
            return Ok(());
        };
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                debug!("Could not encode diff: {}", e);
                return Ok(());
            }
        };
        sink.send(Message::Text(text.into())).await?;
        self.commit_diff(cur);
        metrics::counter!("ws.diffs_sent").increment(1);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub csrf: Option<String>,
}

/// `GET /ws/flights`: authenticate, then upgrade into a session.
pub async fn ws_flights(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<WsQuery>,
) -> Response {
    let Some(auth_cookie) = jar.get(AUTH_COOKIE) else {
        return json_error(StatusCode::UNAUTHORIZED, "Missing session").into_response();
    };
    if state.auth.verify_token(auth_cookie.value()).is_err() {
        return json_error(StatusCode::UNAUTHORIZED, "Invalid session").into_response();
    }
    let csrf_cookie = jar.get(CSRF_COOKIE).map(|c| c.value().to_string());
    match (csrf_cookie, query.csrf) {
        (Some(cookie), Some(param)) if !cookie.is_empty() && cookie == param => {}
        _ => return json_error(StatusCode::FORBIDDEN, "CSRF token mismatch").into_response(),
    }

    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(socket: WebSocket, state: AppState) {
    info!("WebSocket session established");
    let _guard = state.registry.register();
    let mut shutdown_rx = state.registry.subscribe();
    let mut updates = state.bus.subscribe();

    let (mut sink, stream) = socket.split();
    let (client_tx, client_rx) = flume::unbounded::<ClientMessage>();
    let reader = tokio::spawn(read_loop(stream, client_tx));

    let mut session = Session::new(Arc::clone(&state.store));

    // Initial snapshot goes out right away.
    if session.try_send(&mut sink).await.is_err() {
        reader.abort();
        return;
    }

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + TICK_INTERVAL,
        TICK_INTERVAL,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let goodbye = ServerMessage::ServerShutdown { ts: unix_now() };
                if let Ok(text) = serde_json::to_string(&goodbye) {
                    let _ = sink.send(Message::Text(text.into())).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = client_rx.recv_async() => {
                match msg {
                    Ok(ClientMessage::Ack { seq, buffered }) => {
                        metrics::counter!("ws.acks").increment(1);
                        if session.handle_ack(seq, buffered)
                            && session.try_send(&mut sink).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(ClientMessage::Viewport { bbox }) => {
                        match BBox::parse(&bbox) {
                            Some(parsed) => {
                                session.set_viewport(parsed);
                                if session.try_send(&mut sink).await.is_err() {
                                    break;
                                }
                            }
                            None => debug!("Ignoring invalid viewport {:?}", bbox),
                        }
                    }
                    Err(_) => break, // reader exited
                }
            }
            notified = updates.notified() => {
                if !notified {
                    break;
                }
                session.pending = true;
                if session.try_send(&mut sink).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if session.heartbeat_due() {
                    let hb = ServerMessage::Hb { ts: unix_now() };
                    let Ok(text) = serde_json::to_string(&hb) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    session.last_send = Instant::now();
                } else if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    reader.abort();
    info!("WebSocket session closed");
}

/// Parse client frames and hand them to the session loop. Pings are ponged
/// by the protocol layer; anything unparseable is ignored.
async fn read_loop(mut stream: SplitStream<WebSocket>, tx: flume::Sender<ClientMessage>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(parsed) => {
                    if tx.send(parsed).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Ignoring unparseable client message: {}", e),
            },
            Ok(Message::Close(_)) => {
                debug!("Client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
        }
    }
}
