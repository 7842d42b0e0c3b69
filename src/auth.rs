use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::unix_now;
use crate::web::{AppState, json_error};

pub const AUTH_COOKIE: &str = "auth";
pub const CSRF_COOKIE: &str = "csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const TOKEN_ISSUER: &str = "miniflightradar";

/// Session token lifetime.
const TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Tokens closer than this to expiry are re-issued.
const REFRESH_THRESHOLD: Duration = Duration::from_secs(72 * 3600);
const COOKIE_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Random per-browser user id
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Signs and validates the session token carried by the `auth` cookie.
pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthService {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Issue a token for a fresh random user id.
    pub fn issue_token(&self) -> Result<String> {
        self.issue_token_for(&Uuid::new_v4().to_string())
    }

    /// Issue a token keeping an existing user id (cookie refresh).
    pub fn issue_token_for(&self, sub: &str) -> Result<String> {
        let now = unix_now();
        self.issue_token_with_times(sub, now, now + TOKEN_TTL.as_secs() as i64)
    }

    pub(crate) fn issue_token_with_times(&self, sub: &str, iat: i64, exp: i64) -> Result<String> {
        let claims = Claims {
            sub: sub.to_string(),
            iat,
            exp,
            iss: TOKEN_ISSUER.to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("signing session token: {e}"))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| anyhow!("invalid session token: {e}"))
    }
}

/// Resolve the signing secret: explicit flag first, then the secret file,
/// otherwise generate 32 random bytes, hex-encode and persist them at the
/// file path with owner-only permissions.
pub fn resolve_secret(flag: Option<&str>, path: &Path) -> Result<Vec<u8>> {
    if let Some(secret) = flag
        && !secret.is_empty()
    {
        return Ok(secret.as_bytes().to_vec());
    }

    match std::fs::read(path) {
        Ok(bytes) => {
            let trimmed = bytes.trim_ascii();
            if !trimmed.is_empty() {
                debug!("Loaded session secret from {}", path.display());
                return Ok(trimmed.to_vec());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    }

    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    let encoded = hex::encode(raw);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
        }
    }
    std::fs::write(path, &encoded).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting {}", path.display()))?;
    }
    info!("Generated new session secret at {}", path.display());
    Ok(encoded.into_bytes())
}

/// 16 random bytes, hex-encoded. Readable by page scripts for the
/// double-submit check.
pub fn new_csrf_token() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Whether the request arrived over HTTPS, directly or via a proxy that
/// says so. TLS never terminates in this process, so only the forwarding
/// headers apply.
pub fn request_is_secure(headers: &HeaderMap) -> bool {
    if headers
        .get(header::FORWARDED)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("proto=https"))
    {
        return true;
    }
    if headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("https"))
    {
        return true;
    }
    headers
        .get("x-forwarded-ssl")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("on"))
}

fn session_cookie(name: &str, value: String, secure: bool, http_only: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_string(), value);
    cookie.set_path("/");
    cookie.set_same_site(SameSite::Lax);
    cookie.set_http_only(http_only);
    cookie.set_secure(secure);
    cookie.set_max_age(time::Duration::days(COOKIE_MAX_AGE_DAYS));
    cookie
}

/// Ensure every response carries a valid session: issue the `auth` cookie
/// when missing/invalid, refresh it when close to expiry, and set the
/// `csrf` cookie when absent.
pub async fn session_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let secure = request_is_secure(request.headers());

    let reissue_sub = match jar.get(AUTH_COOKIE).map(|c| state.auth.verify_token(c.value())) {
        Some(Ok(claims)) => {
            if claims.exp - unix_now() < REFRESH_THRESHOLD.as_secs() as i64 {
                Some(Some(claims.sub))
            } else {
                None
            }
        }
        // missing, expired or tampered: start a fresh session
        _ => Some(None),
    };
    let need_csrf = jar.get(CSRF_COOKIE).is_none();

    let response = next.run(request).await;

    let mut out = CookieJar::new();
    if let Some(sub) = reissue_sub {
        let token = match &sub {
            Some(sub) => state.auth.issue_token_for(sub),
            None => state.auth.issue_token(),
        };
        match token {
            Ok(token) => {
                out = out.add(session_cookie(AUTH_COOKIE, token, secure, true));
            }
            Err(e) => debug!("Could not issue session token: {:#}", e),
        }
    }
    if need_csrf {
        out = out.add(session_cookie(CSRF_COOKIE, new_csrf_token(), secure, false));
    }
    (out, response).into_response()
}

/// Gate for `/api/*`: the `X-CSRF-Token` header must equal the `csrf`
/// cookie and the `auth` cookie must validate.
pub async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let csrf_cookie = jar.get(CSRF_COOKIE).map(|c| c.value()).unwrap_or_default();
    let csrf_header = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if csrf_cookie.is_empty() || csrf_header != csrf_cookie {
        return json_error(StatusCode::FORBIDDEN, "CSRF token mismatch").into_response();
    }

    let Some(auth_cookie) = jar.get(AUTH_COOKIE) else {
        return json_error(StatusCode::UNAUTHORIZED, "Missing session").into_response();
    };
    if state.auth.verify_token(auth_cookie.value()).is_err() {
        return json_error(StatusCode::UNAUTHORIZED, "Invalid session").into_response();
    }

    next.run(request).await
}

/// Reflect the request origin with credentials allowed; preflights are
/// answered directly with 204.
pub async fn cors_middleware(request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut(), origin.as_ref());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors(response.headers_mut(), origin.as_ref());
    response
}

fn apply_cors(headers: &mut HeaderMap, origin: Option<&HeaderValue>) {
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    if let Some(origin) = origin {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, X-CSRF-Token, Authorization"),
        );
    }
}
