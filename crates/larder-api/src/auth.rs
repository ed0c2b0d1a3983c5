use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use larder_core::ProfileSummary;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::error::{sanitize, AppError};

/// Signature algorithms Supabase issues session tokens with
const ALLOWED_ALGORITHMS: [Algorithm; 2] = [Algorithm::RS256, Algorithm::ES256];

/// Subprotocol of the presence socket. Browsers pass the token as a second
/// `bearer.<jwt>` entry because they cannot set an Authorization header.
pub const PRESENCE_PROTOCOL: &str = "larder.presence";
const PROTOCOL_TOKEN_PREFIX: &str = "bearer.";

#[derive(Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub session_id: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// Caller's bearer token, forwarded to PostgREST so row-level security applies
    pub access_token: String,
}

impl AuthenticatedUser {
    /// Profile shown to other editors when the client does not send one
    pub fn profile_summary(&self) -> ProfileSummary {
        let display_name = self
            .display_name
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.user_id.clone());
        ProfileSummary {
            display_name,
            email: self.email.clone(),
            avatar_url: None,
        }
    }
}

impl fmt::Debug for AuthenticatedUser {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthenticatedUser")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Verifies Supabase session tokens against the project's published keys.
#[derive(Clone)]
pub struct SupabaseJwtVerifier {
    client: reqwest::Client,
    config: Arc<AppConfig>,
    keys: Arc<RwLock<SigningKeys>>,
}

impl SupabaseJwtVerifier {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            keys: Arc::new(RwLock::new(SigningKeys::default())),
        }
    }

    pub async fn verify_access_token(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let token_header = decode_header(token).map_err(|error| {
            AppError::unauthorized(format!("Malformed session token: {}", sanitize(&error)))
        })?;
        if !ALLOWED_ALGORITHMS.contains(&token_header.alg) {
            return Err(AppError::unauthorized(format!(
                "Session token algorithm {:?} is not accepted",
                token_header.alg
            )));
        }
        let kid = token_header
            .kid
            .ok_or_else(|| AppError::unauthorized("Session token has no key id"))?;
        let key = self.signing_key(&kid).await?;

        let mut validation = Validation::new(token_header.alg);
        // audience and timing are checked below with the configured skew
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        validation.set_issuer(&[self.config.supabase_jwt_issuer.as_str()]);

        let claims = decode::<SupabaseClaims>(token, &key, &validation)
            .map_err(|error| {
                AppError::unauthorized(format!("Session token rejected: {}", sanitize(&error)))
            })?
            .claims;
        claims.check(
            &self.config.supabase_jwt_audience,
            self.config.auth_clock_skew,
            chrono::Utc::now().timestamp(),
        )?;

        Ok(claims.into_user(token))
    }

    async fn signing_key(&self, kid: &str) -> Result<DecodingKey, AppError> {
        let ttl = self.config.jwks_cache_ttl;
        if let Some(key) = self.keys.read().await.lookup(kid, ttl) {
            return Ok(key);
        }

        let mut keys = self.keys.write().await;
        // another request may have refreshed while we waited
        if let Some(key) = keys.lookup(kid, ttl) {
            return Ok(key);
        }
        keys.replace(fetch_jwks(&self.client, &self.config.supabase_jwks_url).await?);
        keys.lookup(kid, ttl)
            .ok_or_else(|| AppError::unauthorized(format!("Unknown signing key `{kid}`")))
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            if token.is_empty() {
                Err(AppError::unauthorized("Bearer token is empty"))
            } else {
                Ok(token)
            }
        }
        _ => Err(AppError::unauthorized(
            "Authorization header must be `Bearer <token>`",
        )),
    }
}

/// Session token of a WebSocket handshake, from the subprotocol list or the
/// `access_token` query parameter. `None` for ordinary requests.
pub fn extract_socket_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let is_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    if !is_upgrade {
        return None;
    }

    let from_protocol = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|protocol| {
            protocol
                .trim()
                .strip_prefix(PROTOCOL_TOKEN_PREFIX)
                .map(ToString::to_string)
        });
    from_protocol
        .or_else(|| {
            url::form_urlencoded::parse(query?.as_bytes())
                .find(|(key, _)| key == "access_token")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|token| !token.trim().is_empty())
}

/// JWKS keys by `kid`, refreshed after the configured TTL
#[derive(Default)]
struct SigningKeys {
    by_kid: HashMap<String, DecodingKey>,
    refreshed_at: Option<Instant>,
}

impl SigningKeys {
    fn lookup(&self, kid: &str, ttl: Duration) -> Option<DecodingKey> {
        let fresh = self
            .refreshed_at
            .is_some_and(|refreshed| refreshed.elapsed() <= ttl);
        if fresh {
            self.by_kid.get(kid).cloned()
        } else {
            None
        }
    }

    fn replace(&mut self, keys: HashMap<String, DecodingKey>) {
        tracing::debug!(keys = keys.len(), "Refreshed Supabase signing keys");
        self.by_kid = keys;
        self.refreshed_at = Some(Instant::now());
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: Option<String>,
    #[serde(rename = "use")]
    usage: Option<String>,
    n: Option<String>,
    e: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

impl Jwk {
    /// Signing key material, `None` for encryption keys and unknown key types
    fn decoding_key(&self) -> Result<Option<DecodingKey>, AppError> {
        if self.usage.as_deref().is_some_and(|usage| usage != "sig") {
            return Ok(None);
        }
        let key = match (self.kty.as_deref(), &self.n, &self.e, &self.x, &self.y) {
            (Some("RSA"), Some(n), Some(e), _, _) => DecodingKey::from_rsa_components(n, e),
            (Some("EC"), _, _, Some(x), Some(y)) => DecodingKey::from_ec_components(x, y),
            _ => return Ok(None),
        };
        key.map(Some).map_err(|error| {
            AppError::external(format!("Invalid JWKS signing key: {}", sanitize(&error)))
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SupabaseClaims {
    sub: String,
    aud: Option<Value>,
    role: Option<String>,
    exp: Option<i64>,
    iat: Option<i64>,
    nbf: Option<i64>,
    jti: Option<String>,
    session_id: Option<String>,
    email: Option<String>,
    user_metadata: Option<Value>,
}

impl SupabaseClaims {
    /// Reject tokens for another audience, anonymous sessions or outside their lifetime.
    fn check(&self, audience: &str, clock_skew: Duration, now: i64) -> Result<(), AppError> {
        if self.sub.trim().is_empty() {
            return Err(AppError::unauthorized("Session token has no subject"));
        }
        if !self.has_audience(audience) {
            return Err(AppError::unauthorized(
                "Session token was issued for another audience",
            ));
        }
        if self.role.as_deref() != Some("authenticated") {
            return Err(AppError::unauthorized(
                "Session token does not belong to a signed-in user",
            ));
        }

        let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(0);
        let (Some(exp), Some(iat)) = (self.exp, self.iat) else {
            return Err(AppError::unauthorized(
                "Session token lacks `exp` or `iat`",
            ));
        };
        if exp <= now.saturating_sub(skew) {
            return Err(AppError::unauthorized("Session token has expired"));
        }
        let latest_start = now.saturating_add(skew);
        if iat > latest_start || self.nbf.is_some_and(|nbf| nbf > latest_start) {
            return Err(AppError::unauthorized("Session token is not valid yet"));
        }
        Ok(())
    }

    fn has_audience(&self, expected: &str) -> bool {
        match &self.aud {
            Some(Value::String(aud)) => aud == expected,
            Some(Value::Array(auds)) => auds.iter().any(|aud| aud.as_str() == Some(expected)),
            _ => false,
        }
    }

    fn display_name(&self) -> Option<String> {
        let metadata = self.user_metadata.as_ref()?;
        let field = |name: &str| {
            metadata
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        if let Some(full_name) = field("full_name") {
            return Some(full_name.to_string());
        }
        match (field("first_name"), field("last_name")) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (first, last) => first.or(last).map(ToString::to_string),
        }
    }

    fn into_user(self, token: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            display_name: self.display_name(),
            email: self.email.filter(|email| !email.trim().is_empty()),
            session_id: self.session_id.or(self.jti),
            user_id: self.sub,
            access_token: token.to_string(),
        }
    }
}

async fn fetch_jwks(
    client: &reqwest::Client,
    jwks_url: &str,
) -> Result<HashMap<String, DecodingKey>, AppError> {
    let response = client
        .get(jwks_url)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|error| {
            AppError::external(format!("JWKS request failed: {}", sanitize(&error)))
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::external(format!(
            "JWKS endpoint answered HTTP {}",
            status.as_u16()
        )));
    }
    let document = response.json::<JwksDocument>().await.map_err(|error| {
        AppError::external(format!("JWKS document is malformed: {}", sanitize(&error)))
    })?;

    let mut keys = HashMap::new();
    for jwk in &document.keys {
        if let (Some(kid), Some(key)) = (jwk.kid.as_ref(), jwk.decoding_key()?) {
            keys.insert(kid.clone(), key);
        }
    }
    if keys.is_empty() {
        return Err(AppError::external(
            "JWKS document has no usable signing keys",
        ));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;

    const NOW: i64 = 1_717_000_000;

    fn signed_in() -> SupabaseClaims {
        SupabaseClaims {
            sub: "8d1c2f9e".to_string(),
            aud: Some(json!("authenticated")),
            role: Some("authenticated".to_string()),
            exp: Some(NOW + 3_600),
            iat: Some(NOW - 10),
            ..SupabaseClaims::default()
        }
    }

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(
            extract_bearer_token(&headers("bearer eyJhbGciOi.x.y")).unwrap(),
            "eyJhbGciOi.x.y"
        );
        assert!(extract_bearer_token(&headers("Basic dXNlcjpwdw==")).is_err());
        assert!(extract_bearer_token(&headers("Bearer   ")).is_err());
        assert!(extract_bearer_token(&HeaderMap::new()).is_err());
    }

    #[test]
    fn socket_handshakes_may_carry_the_token_elsewhere() {
        let mut upgrade = HeaderMap::new();
        upgrade.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert_eq!(
            extract_socket_token(&upgrade, Some("session_id=s-1&access_token=eyJ.a.b")).as_deref(),
            Some("eyJ.a.b")
        );
        assert_eq!(extract_socket_token(&upgrade, Some("access_token=")), None);
        assert_eq!(extract_socket_token(&upgrade, None), None);

        upgrade.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("larder.presence, bearer.eyJ.c.d"),
        );
        assert_eq!(
            extract_socket_token(&upgrade, Some("access_token=eyJ.a.b")).as_deref(),
            Some("eyJ.c.d")
        );

        // plain requests never read tokens from the query string
        assert_eq!(
            extract_socket_token(&HeaderMap::new(), Some("access_token=eyJ.a.b")),
            None
        );
    }

    #[test]
    fn signed_in_claims_pass() {
        signed_in()
            .check("authenticated", Duration::from_secs(60), NOW)
            .unwrap();

        let mut claims = signed_in();
        claims.aud = Some(json!(["anon", "authenticated"]));
        claims
            .check("authenticated", Duration::from_secs(60), NOW)
            .unwrap();
    }

    #[test]
    fn anonymous_and_foreign_tokens_are_rejected() {
        let mut claims = signed_in();
        claims.role = Some("anon".to_string());
        assert!(claims.check("authenticated", Duration::ZERO, NOW).is_err());

        let mut claims = signed_in();
        claims.aud = Some(json!("service"));
        assert!(claims.check("authenticated", Duration::ZERO, NOW).is_err());
    }

    #[test]
    fn lifetime_respects_clock_skew() {
        let mut claims = signed_in();
        claims.exp = Some(NOW - 30);
        assert!(claims.check("authenticated", Duration::ZERO, NOW).is_err());
        claims
            .check("authenticated", Duration::from_secs(60), NOW)
            .unwrap();

        let mut claims = signed_in();
        claims.iat = Some(NOW + 120);
        let err = claims
            .check("authenticated", Duration::from_secs(30), NOW)
            .unwrap_err();
        assert!(err.to_string().contains("not valid yet"));

        let mut claims = signed_in();
        claims.exp = None;
        assert!(claims.check("authenticated", Duration::ZERO, NOW).is_err());
    }

    #[test]
    fn claims_become_a_user_with_display_name() {
        let mut claims = signed_in();
        claims.email = Some("baker@example.com".to_string());
        claims.jti = Some("jti-1".to_string());
        claims.user_metadata = Some(json!({"first_name": "Paul", "last_name": "Hollywood"}));

        let user = claims.into_user("token-123");
        assert_eq!(user.user_id, "8d1c2f9e");
        assert_eq!(user.display_name.as_deref(), Some("Paul Hollywood"));
        assert_eq!(user.session_id.as_deref(), Some("jti-1"));
        assert_eq!(user.access_token, "token-123");

        let mut claims = signed_in();
        claims.user_metadata = Some(json!({"full_name": "Prue Leith", "first_name": "P"}));
        assert_eq!(claims.display_name().as_deref(), Some("Prue Leith"));
        claims.user_metadata = Some(json!({"last_name": "Leith"}));
        assert_eq!(claims.display_name().as_deref(), Some("Leith"));
    }

    #[test]
    fn profile_summary_falls_back_to_email_then_id() {
        let mut user = AuthenticatedUser {
            user_id: "u-1".to_string(),
            session_id: None,
            email: Some("ana@example.com".to_string()),
            display_name: None,
            access_token: "secret-token".to_string(),
        };
        assert_eq!(user.profile_summary().display_name, "ana@example.com");
        user.email = None;
        assert_eq!(user.profile_summary().display_name, "u-1");
        assert!(!format!("{user:?}").contains("secret-token"));
    }

    #[test]
    fn encryption_keys_are_skipped() {
        let jwk = Jwk {
            kid: Some("enc".to_string()),
            kty: Some("RSA".to_string()),
            usage: Some("enc".to_string()),
            n: Some("AQAB".to_string()),
            e: Some("AQAB".to_string()),
            x: None,
            y: None,
        };
        assert!(jwk.decoding_key().unwrap().is_none());
    }
}
