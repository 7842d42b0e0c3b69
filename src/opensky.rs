use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upstream states endpoint.
pub const STATES_URL: &str = "https://opensky-network.org/api/states/all";

/// Overall request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on the decoded response body.
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// One row of the upstream `states` array. Rows are positional arrays; only
/// the fields this service consumes are extracted, and rows shorter than
/// expected or with unexpected field types decode with the affected fields
/// as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateVector {
    pub icao24: Option<String>,
    pub callsign: Option<String>,
    pub time_position: Option<i64>,
    pub last_contact: Option<i64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub geo_altitude: Option<f64>,
}

impl<'de> Deserialize<'de> for StateVector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values: Vec<Value> = Deserialize::deserialize(deserializer)?;

        let str_at = |i: usize| -> Option<String> {
            values
                .get(i)
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        };
        let f64_at = |i: usize| -> Option<f64> { values.get(i).and_then(Value::as_f64) };
        let i64_at = |i: usize| -> Option<i64> { values.get(i).and_then(Value::as_i64) };

        Ok(StateVector {
            icao24: str_at(0),
            callsign: str_at(1),
            time_position: i64_at(3),
            last_contact: i64_at(4),
            longitude: f64_at(5),
            latitude: f64_at(6),
            baro_altitude: f64_at(7),
            velocity: f64_at(9),
            true_track: f64_at(10),
            geo_altitude: f64_at(13),
        })
    }
}

/// Decoded states response. `states` is null upstream when no aircraft
/// matched; that decodes as an empty vector.
#[derive(Debug, Deserialize)]
pub struct States {
    pub time: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub states: Vec<StateVector>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<StateVector>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Vec<StateVector>> = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Why a fetch failed, split by how the ingester must react.
#[derive(Debug)]
pub enum FetchError {
    /// Upstream signalled throttling (429/503); wait at least `retry_after`.
    RateLimited { retry_after: Option<Duration> },
    /// Anything else transient: network, timeout, bad status, bad body.
    Upstream(anyhow::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(f, "rate limited, retry after {}s", d.as_secs()),
                None => write!(f, "rate limited"),
            },
            FetchError::Upstream(e) => write!(f, "upstream error: {e:#}"),
        }
    }
}

pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Configuration for the upstream client.
#[derive(Debug, Clone)]
pub struct OpenSkyConfig {
    pub url: String,
    /// Explicit proxy override (http/https/socks5). When unset, standard
    /// environment proxies apply via the client builder defaults.
    pub proxy: Option<String>,
    /// Basic-auth credentials; registered accounts get better rate limits.
    pub username: Option<String>,
    pub password: Option<String>,
    /// How long a fetched batch stays valid; callers within the window get
    /// the cached batch instead of a new upstream request.
    pub cache_ttl: Duration,
}

impl Default for OpenSkyConfig {
    fn default() -> Self {
        Self {
            url: STATES_URL.to_string(),
            proxy: None,
            username: None,
            password: None,
            cache_ttl: Duration::from_secs(60),
        }
    }
}

struct CachedBatch {
    fetched_at: Instant,
    states: Arc<States>,
}

/// HTTP client for the upstream states feed.
pub struct OpenSkyClient {
    http: reqwest::Client,
    config: OpenSkyConfig,
    cached: Mutex<Option<CachedBatch>>,
}

impl OpenSkyClient {
    pub fn new(config: OpenSkyConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("miniflightradar/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy_url) = &config.proxy {
            // The explicit proxy replaces environment proxies but still
            // honors the NO_PROXY bypass list.
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("invalid proxy {proxy_url}"))?
                .no_proxy(reqwest::NoProxy::from_env());
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            http: builder.build().context("building upstream HTTP client")?,
            config,
            cached: Mutex::new(None),
        })
    }

    /// Fetch the current states batch, serving from the one-tick cache when
    /// the last successful batch is still fresh.
    pub async fn fetch_states(&self) -> Result<Arc<States>, FetchError> {
        if let Some(states) = self.cached_batch() {
            debug!("Serving states from cache");
            return Ok(states);
        }

        let states = Arc::new(self.fetch_uncached().await?);
        *self.cached.lock().unwrap() = Some(CachedBatch {
            fetched_at: Instant::now(),
            states: Arc::clone(&states),
        });
        Ok(states)
    }

    fn cached_batch(&self) -> Option<Arc<States>> {
        let cached = self.cached.lock().unwrap();
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.config.cache_ttl)
            .map(|c| Arc::clone(&c.states))
    }

    async fn fetch_uncached(&self) -> Result<States, FetchError> {
        let mut request = self.http.get(&self.config.url);
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Upstream(e.into()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            warn!("Upstream rate limit ({}), retry_after={:?}", status, retry_after);
            return Err(FetchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FetchError::Upstream(anyhow!("upstream status {status}")));
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Upstream(e.into()))?;
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(FetchError::Upstream(anyhow!(
                    "response body exceeds {} bytes",
                    MAX_BODY_BYTES
                )));
            }
            body.extend_from_slice(&chunk);
        }

        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Upstream(anyhow!("decoding states response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_vector_positional_parse() {
        let row = serde_json::json!([
            "ABC123", "AAL100  ", "United States", 999999990, 1000000000, -122.5, 37.7, 9000.0,
            false, 230.0, 90.0, 2.5, null, 10000.0, null, false, 0
        ]);
        let sv: StateVector = serde_json::from_value(row).unwrap();
        assert_eq!(sv.icao24.as_deref(), Some("ABC123"));
        assert_eq!(sv.callsign.as_deref(), Some("AAL100  "));
        assert_eq!(sv.time_position, Some(999999990));
        assert_eq!(sv.last_contact, Some(1000000000));
        assert_eq!(sv.longitude, Some(-122.5));
        assert_eq!(sv.latitude, Some(37.7));
        assert_eq!(sv.baro_altitude, Some(9000.0));
        assert_eq!(sv.velocity, Some(230.0));
        assert_eq!(sv.true_track, Some(90.0));
        assert_eq!(sv.geo_altitude, Some(10000.0));
    }

    #[test]
    fn test_state_vector_nulls_and_short_rows() {
        let row = serde_json::json!(["abc123", null, null, null, 1000000000]);
        let sv: StateVector = serde_json::from_value(row).unwrap();
        assert_eq!(sv.icao24.as_deref(), Some("abc123"));
        assert!(sv.callsign.is_none());
        assert!(sv.longitude.is_none());
        assert!(sv.geo_altitude.is_none());
    }

    #[test]
    fn test_state_vector_wrong_types_become_none() {
        let row = serde_json::json!([42, "X", null, "soon", null, "far", 37.7]);
        let sv: StateVector = serde_json::from_value(row).unwrap();
        assert!(sv.icao24.is_none());
        assert!(sv.last_contact.is_none());
        assert!(sv.longitude.is_none());
        assert_eq!(sv.latitude, Some(37.7));
    }

    #[test]
    fn test_states_null_array_decodes_empty() {
        let states: States =
            serde_json::from_str(r#"{"time": 1000000000, "states": null}"#).unwrap();
        assert_eq!(states.time, 1000000000);
        assert!(states.states.is_empty());

        let states: States = serde_json::from_str(r#"{"time": 1}"#).unwrap();
        assert!(states.states.is_empty());
    }

    #[test]
    fn test_states_array_decodes_rows() {
        let states: States = serde_json::from_str(
            r#"{"time": 5, "states": [["abc", "X", "US", null, 5, 1.0, 2.0]]}"#,
        )
        .unwrap();
        assert_eq!(states.states.len(), 1);
        assert_eq!(states.states[0].longitude, Some(1.0));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("45")), Some(Duration::from_secs(45)));
        assert_eq!(parse_retry_after(Some(" 45 ")), Some(Duration::from_secs(45)));
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
