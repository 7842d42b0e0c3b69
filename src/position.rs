use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters, used for great-circle distances.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A normalised position sample for a single aircraft.
/// This is the main domain entity, agnostic to source (upstream states feed)
/// and destination (store, WebSocket clients).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Lowercased hex transponder identifier
    pub icao24: String,
    /// Uppercased, trimmed flight identifier (may be empty)
    pub callsign: String,
    /// WGS-84 longitude, [-180, 180]
    pub lon: f64,
    /// WGS-84 latitude, [-90, 90]
    pub lat: f64,
    /// Altitude in meters, >= 0
    pub alt: f64,
    /// True track in degrees, [0, 360)
    pub track: f64,
    /// Ground speed in m/s, >= 0
    pub speed: f64,
    /// Unix time in seconds
    pub ts: i64,
}

/// Geographic bounding box. Points on the boundary are inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    /// Parse a `minLon,minLat,maxLon,maxLat` string. Returns `None` for
    /// anything malformed: wrong field count, non-finite numbers, inverted
    /// or out-of-range bounds.
    pub fn parse(s: &str) -> Option<BBox> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 4 {
            return None;
        }
        let mut vals = [0f64; 4];
        for (i, field) in fields.iter().enumerate() {
            vals[i] = field.trim().parse::<f64>().ok()?;
            if !vals[i].is_finite() {
                return None;
            }
        }
        let bbox = BBox {
            min_lon: vals[0],
            min_lat: vals[1],
            max_lon: vals[2],
            max_lat: vals[3],
        };
        let lon_ok = (-180.0..=180.0).contains(&bbox.min_lon)
            && (-180.0..=180.0).contains(&bbox.max_lon)
            && bbox.min_lon <= bbox.max_lon;
        let lat_ok = (-90.0..=90.0).contains(&bbox.min_lat)
            && (-90.0..=90.0).contains(&bbox.max_lat)
            && bbox.min_lat <= bbox.max_lat;
        if lon_ok && lat_ok { Some(bbox) } else { None }
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.min_lon <= lon && lon <= self.max_lon && self.min_lat <= lat && lat <= self.max_lat
    }
}

/// Uppercase and trim a callsign.
pub fn normalize_callsign(callsign: &str) -> String {
    callsign.trim().to_ascii_uppercase()
}

/// Lowercase and trim an icao24 identifier.
pub fn normalize_icao(icao: &str) -> String {
    icao.trim().to_ascii_lowercase()
}

/// Clamp a coordinate into its valid range. Non-finite input becomes 0.
pub fn clamp_coord(value: f64, limit: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(-limit, limit)
}

/// Wrap a track angle into [0, 360). Non-finite input becomes 0.
pub fn normalize_track(track: f64) -> f64 {
    if !track.is_finite() {
        return 0.0;
    }
    let wrapped = track % 360.0;
    if wrapped < 0.0 { wrapped + 360.0 } else { wrapped }
}

/// Coerce a value to a finite non-negative number.
pub fn coerce_non_negative(value: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        0.0
    } else {
        value
    }
}

/// Great-circle distance between two points in meters.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}
