//! Xero accounting connection via the OAuth2 authorization-code flow.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use larder_core::util::is_http_url;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::AuthenticatedUser;
use crate::config::{url_origin, XeroRuntimeConfig};
use crate::error::{sanitize, AppError};
use crate::routes::{user_fingerprint, AppState};
use crate::supabase::{parse_api_error, XeroConnection};

const AUTHORIZE_URL: &str = "https://login.xero.com/identity/connect/authorize";
const TOKEN_URL: &str = "https://identity.xero.com/connect/token";
const CONNECTIONS_URL: &str = "https://api.xero.com/connections";
const SCOPES: &str = "openid profile email offline_access accounting.transactions \
                      accounting.contacts accounting.settings";

/// Round-tripped through Xero in the `state` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub user_id: String,
    pub redirect_url: String,
}

impl OAuthState {
    pub fn encode(&self) -> Result<String, AppError> {
        let json = serde_json::to_vec(self)
            .map_err(|error| AppError::internal(format!("State encode failed: {error}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Accepts URL-safe and standard (`btoa`) base64, padded or not.
    pub fn decode(value: &str) -> Result<Self, AppError> {
        // an unescaped `+` arrives as a space after query decoding
        let value = value.trim().replace(' ', "+");
        let value = value.trim_end_matches('=');
        let engine = if value.contains(['+', '/']) {
            &STANDARD_NO_PAD
        } else {
            &URL_SAFE_NO_PAD
        };
        let bytes = engine
            .decode(value)
            .map_err(|_| AppError::bad_request("Invalid OAuth state"))?;
        let state: Self = serde_json::from_slice(&bytes)
            .map_err(|_| AppError::bad_request("Invalid OAuth state"))?;
        if state.user_id.trim().is_empty() || !is_http_url(&state.redirect_url) {
            return Err(AppError::bad_request("Invalid OAuth state"));
        }
        Ok(state)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthUrlRequest {
    #[serde(alias = "redirectUrl")]
    pub redirect_url: String,
}

#[derive(Debug, Serialize)]
pub struct AuthUrlResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantConnection {
    tenant_id: String,
    tenant_name: Option<String>,
}

pub async fn auth_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<AuthUrlRequest>,
) -> Result<Json<AuthUrlResponse>, AppError> {
    let config = xero_config(&state)?;
    let redirect_url = payload.redirect_url.trim();
    if !is_http_url(redirect_url) {
        return Err(AppError::bad_request(
            "`redirect_url` must start with http:// or https://",
        ));
    }
    ensure_allowed_redirect(config, redirect_url)?;

    let oauth_state = OAuthState {
        user_id: user.user_id.clone(),
        redirect_url: redirect_url.to_string(),
    };
    let url = authorize_url(config, &oauth_state.encode()?)?;
    Ok(Json(AuthUrlResponse { url }))
}

/// Public endpoint Xero redirects the browser to after consent.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AppError> {
    let raw_state = query
        .state
        .as_deref()
        .ok_or_else(|| AppError::bad_request("Missing OAuth state"))?;
    let oauth_state = OAuthState::decode(raw_state)?;
    // state is unsigned, so the target is checked again before redirecting
    ensure_allowed_redirect(xero_config(&state)?, &oauth_state.redirect_url)?;

    if let Some(error) = query.error.as_deref() {
        let message = query.error_description.as_deref().unwrap_or(error);
        tracing::warn!(
            user = user_fingerprint(&oauth_state.user_id),
            "Xero authorization declined: {error}"
        );
        return redirect_with(&oauth_state.redirect_url, Err(message));
    }
    let Some(code) = query.code.as_deref().filter(|code| !code.trim().is_empty()) else {
        return redirect_with(&oauth_state.redirect_url, Err("Missing authorization code"));
    };

    match connect(&state, &oauth_state.user_id, code).await {
        Ok(tenants) => {
            tracing::info!(
                user = user_fingerprint(&oauth_state.user_id),
                tenants,
                "Xero connected"
            );
            redirect_with(&oauth_state.redirect_url, Ok(()))
        }
        Err(error) => {
            tracing::warn!(
                user = user_fingerprint(&oauth_state.user_id),
                "Xero connection failed: {error}"
            );
            redirect_with(&oauth_state.redirect_url, Err(&error.to_string()))
        }
    }
}

/// Exchange the code, list tenants and store one connection per tenant.
async fn connect(state: &AppState, user_id: &str, code: &str) -> Result<usize, AppError> {
    let config = xero_config(state)?;

    let response = state
        .http
        .post(TOKEN_URL)
        .basic_auth(&config.client_id, Some(&config.client_secret))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri.as_str()),
        ])
        .send()
        .await
        .map_err(|error| {
            AppError::external(format!("Token exchange request failed: {}", sanitize(&error)))
        })?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::external(format!(
            "Token exchange failed: {}",
            parse_api_error(status, &body)
        )));
    }
    let tokens = response.json::<TokenResponse>().await.map_err(|error| {
        AppError::external(format!("Token response parse failed: {}", sanitize(&error)))
    })?;

    let response = state
        .http
        .get(CONNECTIONS_URL)
        .bearer_auth(&tokens.access_token)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|error| {
            AppError::external(format!("Tenant lookup request failed: {}", sanitize(&error)))
        })?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::external(format!(
            "Tenant lookup failed: {}",
            parse_api_error(status, &body)
        )));
    }
    let tenants = response
        .json::<Vec<TenantConnection>>()
        .await
        .map_err(|error| {
            AppError::external(format!("Tenant list parse failed: {}", sanitize(&error)))
        })?;
    if tenants.is_empty() {
        return Err(AppError::external("No Xero organisation was authorized"));
    }

    let expires_at = token_expiry(Utc::now(), tokens.expires_in)?;
    for tenant in &tenants {
        let connection = XeroConnection {
            user_id: user_id.to_string(),
            tenant_id: tenant.tenant_id.clone(),
            tenant_name: tenant.tenant_name.clone(),
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expires_at: expires_at.clone(),
        };
        state.admin.store_xero_connection(&connection).await?;
    }
    Ok(tenants.len())
}

fn token_expiry(now: DateTime<Utc>, expires_in: i64) -> Result<String, AppError> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .map(|expires_at| expires_at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| {
            AppError::external(format!("Xero returned an invalid token lifetime: {expires_in}"))
        })
}

fn ensure_allowed_redirect(config: &XeroRuntimeConfig, redirect_url: &str) -> Result<(), AppError> {
    let allowed = url_origin(redirect_url).is_some_and(|origin| {
        config
            .allowed_redirect_origins
            .iter()
            .any(|allowed| *allowed == origin)
    });
    if allowed {
        Ok(())
    } else {
        Err(AppError::bad_request(
            "`redirect_url` is not an allowed application origin",
        ))
    }
}

fn xero_config(state: &AppState) -> Result<&XeroRuntimeConfig, AppError> {
    state
        .config
        .xero
        .as_ref()
        .ok_or_else(|| AppError::config("Xero integration is not configured"))
}

pub fn authorize_url(config: &XeroRuntimeConfig, state: &str) -> Result<String, AppError> {
    let url = Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("response_type", "code"),
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("scope", SCOPES),
            ("state", state),
        ],
    )
    .map_err(|error| AppError::internal(format!("Authorize URL build failed: {error}")))?;
    Ok(url.into())
}

/// Send the browser back to the app with the outcome in the query string.
fn redirect_with(redirect_url: &str, outcome: Result<(), &str>) -> Result<Response, AppError> {
    let location = outcome_url(redirect_url, outcome)?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

pub fn outcome_url(redirect_url: &str, outcome: Result<(), &str>) -> Result<String, AppError> {
    let mut url = Url::parse(redirect_url)
        .map_err(|_| AppError::bad_request("Invalid redirect URL in OAuth state"))?;
    {
        let mut query = url.query_pairs_mut();
        match outcome {
            Ok(()) => {
                query.append_pair("xero", "connected");
            }
            Err(message) => {
                query
                    .append_pair("xero", "error")
                    .append_pair("message", message);
            }
        }
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> XeroRuntimeConfig {
        XeroRuntimeConfig {
            client_id: "client-123".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://api.example.com/v1/xero/oauth/callback".to_string(),
            allowed_redirect_origins: vec![
                "https://app.example.com".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }

    #[test]
    fn state_survives_the_round_trip() {
        let state = OAuthState {
            user_id: "user-a".to_string(),
            redirect_url: "https://app.example.com/settings/integrations".to_string(),
        };
        let encoded = state.encode().unwrap();
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        assert_eq!(OAuthState::decode(&encoded).unwrap(), state);
    }

    #[test]
    fn tampered_state_is_rejected() {
        assert!(matches!(
            OAuthState::decode("not base64!").unwrap_err(),
            AppError::BadRequest(_)
        ));
        let not_a_url = URL_SAFE_NO_PAD.encode(r#"{"user_id":"u","redirect_url":"javascript:x"}"#);
        assert!(OAuthState::decode(&not_a_url).is_err());
    }

    #[test]
    fn standard_base64_state_is_accepted() {
        // find a redirect whose standard encoding needs `+` or `/`
        let state = (0..6)
            .map(|extra| OAuthState {
                user_id: "user-a".to_string(),
                redirect_url: format!("https://app.example.com/x?q={}>", "?".repeat(extra)),
            })
            .find(|state| {
                let json = serde_json::to_vec(state).unwrap();
                base64::engine::general_purpose::STANDARD
                    .encode(json)
                    .contains(['+', '/'])
            })
            .unwrap();
        let json = serde_json::to_vec(&state).unwrap();
        let btoa = base64::engine::general_purpose::STANDARD.encode(json);

        assert_eq!(OAuthState::decode(&btoa).unwrap(), state);
        // `+` turned into a space by form decoding
        assert_eq!(OAuthState::decode(&btoa.replace('+', " ")).unwrap(), state);
    }

    #[test]
    fn redirects_are_limited_to_configured_origins() {
        let config = config();
        ensure_allowed_redirect(&config, "https://app.example.com/settings/integrations").unwrap();
        ensure_allowed_redirect(&config, "http://localhost:5173/").unwrap();
        for foreign in [
            "https://evil.example.net/",
            "https://app.example.com.evil.net/",
            "http://app.example.com/",
            "javascript:alert(1)",
        ] {
            assert!(matches!(
                ensure_allowed_redirect(&config, foreign),
                Err(AppError::BadRequest(_))
            ));
        }
    }

    #[test]
    fn absurd_token_lifetimes_are_an_upstream_error() {
        let now = Utc::now();
        assert!(token_expiry(now, 1_800).unwrap().ends_with('Z'));
        for lifetime in [i64::MAX, i64::MIN] {
            assert!(matches!(
                token_expiry(now, lifetime),
                Err(AppError::External(_))
            ));
        }
    }

    #[test]
    fn authorize_url_carries_client_scopes_and_state() {
        let url = Url::parse(&authorize_url(&config(), "abc").unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("login.xero.com"));
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["state"], "abc");
        assert_eq!(
            params["redirect_uri"],
            "https://api.example.com/v1/xero/oauth/callback"
        );
        assert!(params["scope"].contains("offline_access"));
        assert!(params["scope"].contains("accounting.settings"));
    }

    #[test]
    fn outcome_url_appends_status() {
        assert_eq!(
            outcome_url("https://app.example.com/settings?tab=xero", Ok(())).unwrap(),
            "https://app.example.com/settings?tab=xero&xero=connected"
        );
        assert_eq!(
            outcome_url("https://app.example.com/settings", Err("access denied")).unwrap(),
            "https://app.example.com/settings?xero=error&message=access+denied"
        );
    }

    #[test]
    fn redirect_uses_302() {
        let response = redirect_with("https://app.example.com/", Ok(())).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://app.example.com/?xero=connected"
        );
    }
}
