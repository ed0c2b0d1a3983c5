use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use larder_core::presence::PresenceRegistry;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, extract_socket_token, SupabaseJwtVerifier};
use crate::config::AppConfig;
use crate::edits::EditSessionStore;
use crate::error::AppError;
use crate::rate_limit::{EndpointRateLimiter, RateLimitMetricsSnapshot};
use crate::records::RecordBackend;
use crate::supabase::{AdminBackend, SupabaseAdminClient};
use crate::{admin, edits, nutrition, records, xero};

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub http: reqwest::Client,
    pub admin: Arc<dyn AdminBackend>,
    pub records: RecordBackend,
    pub presence: PresenceRegistry,
    pub edit_sessions: EditSessionStore,
    pub rate_limiter: Arc<EndpointRateLimiter>,
    jwt_verifier: Arc<SupabaseJwtVerifier>,
}

impl AppState {
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let http = outbound_client()?;
        let admin = Arc::new(SupabaseAdminClient::new(http.clone(), config.clone()));
        Self::with_admin(config, http, admin).await
    }

    async fn with_admin(
        config: Arc<AppConfig>,
        http: reqwest::Client,
        admin: Arc<dyn AdminBackend>,
    ) -> Result<Self, AppError> {
        let records = RecordBackend::from_config(&config, http.clone()).await?;
        Ok(Self {
            jwt_verifier: Arc::new(SupabaseJwtVerifier::new(config.clone())),
            rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            presence: PresenceRegistry::new(),
            edit_sessions: EditSessionStore::default(),
            records,
            admin,
            http,
            config,
        })
    }
}

fn outbound_client() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(OUTBOUND_TIMEOUT)
        .build()
        .map_err(|error| AppError::internal(format!("HTTP client init failed: {error}")))
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/admin/delete-user", post(admin::delete_user))
        .route("/admin/set-user-password", post(admin::set_user_password))
        .route("/admin/signout-user", post(admin::sign_out_user))
        .route(
            "/admin/create-employee-user",
            post(admin::create_employee_user),
        )
        .route("/xero/auth-url", post(xero::auth_url))
        .route("/nutrition/extract", nutrition::extract_route())
        .route("/edits", post(edits::begin_edit))
        .route("/edits/{session_id}", delete(edits::close_edit))
        .route("/edits/{session_id}/check", post(edits::check_edit))
        .route("/edits/{session_id}/resolve", post(edits::resolve_edit))
        .route("/edits/{session_id}/saved", post(edits::mark_edit_saved))
        .route("/edits/{session_id}/heartbeat", post(edits::heartbeat_edit))
        .route(
            "/presence/{resource_type}/{resource_id}",
            get(edits::list_presence),
        )
        .route(
            "/presence/{resource_type}/{resource_id}/ws",
            get(edits::presence_ws),
        )
        .route(
            "/records/{resource_type}/{resource_id}",
            get(records::get_record).put(records::put_record),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Xero redirects the browser here without a bearer token
    let public_routes = Router::new().route("/xero/oauth/callback", get(xero::oauth_callback));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes.merge(public_routes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    open_edit_sessions: usize,
    active_resources: usize,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        open_edit_sessions: state.edit_sessions.open_sessions().await,
        active_resources: state.presence.active_resources().await,
        rate_limit: state.rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = match extract_bearer_token(request.headers()) {
        Ok(token) => token.to_string(),
        Err(missing) => {
            extract_socket_token(request.headers(), request.uri().query()).ok_or(missing)?
        }
    };
    let user = state.jwt_verifier.verify_access_token(&token).await?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Stable per-process hash so logs never carry raw user ids
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}


#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::test_support::local_state;
    use super::{app_router, user_fingerprint, Router};

    async fn send(router: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_is_public() {
        let router = app_router(local_state().await);
        let (status, body) = send(router, Method::GET, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["open_edit_sessions"], 0);
        assert_eq!(body["rate_limit"]["admin_limited"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn v1_routes_require_a_bearer_token() {
        for (method, uri) in [
            (Method::POST, "/v1/admin/delete-user"),
            (Method::POST, "/v1/edits"),
            (Method::GET, "/v1/records/employees/emp-1"),
            (Method::POST, "/v1/nutrition/extract"),
        ] {
            let router = app_router(local_state().await);
            let (status, body) = send(router, method, uri).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
            assert!(body["error"].as_str().unwrap().contains("Unauthorized"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn presence_socket_accepts_a_query_token_on_upgrade() {
        let handshake = |uri: &str| {
            Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header("connection", "upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .body(Body::empty())
                .unwrap()
        };

        let router = app_router(local_state().await);
        let response = router
            .oneshot(handshake("/v1/presence/employees/emp-1/ws"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("Missing Authorization"));

        // the query token is picked up and then verified like a header token
        let router = app_router(local_state().await);
        let response = router
            .oneshot(handshake("/v1/presence/employees/emp-1/ws?access_token=not-a-jwt"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("Malformed session token"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn xero_callback_is_public_but_needs_state() {
        let router = app_router(local_state().await);
        let (status, body) = send(router, Method::GET, "/v1/xero/oauth/callback?code=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("OAuth state"));
    }

    #[test]
    fn fingerprint_is_stable_and_hides_the_id() {
        assert_eq!(user_fingerprint("user-a"), user_fingerprint("user-a"));
        assert_ne!(user_fingerprint("user-a"), user_fingerprint("user-b"));
    }
}
