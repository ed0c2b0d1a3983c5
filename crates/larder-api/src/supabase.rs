//! Privileged access to the Supabase project (GoTrue admin API and PostgREST).

use std::sync::Arc;

use async_trait::async_trait;
use larder_core::util::compact_text;
use larder_core::AppRole;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{sanitize, AppError};

/// Fields for a new login account
#[derive(Debug, Clone)]
pub struct NewAuthUser {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// One row of `admin_audit_log`
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub actor_id: String,
    pub target_user_id: String,
    pub action: String,
    pub details: Value,
}

/// Tokens for one connected Xero organisation
#[derive(Clone, Serialize)]
pub struct XeroConnection {
    pub user_id: String,
    pub tenant_id: String,
    pub tenant_name: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: String,
}

impl std::fmt::Debug for XeroConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("XeroConnection")
            .field("user_id", &self.user_id)
            .field("tenant_id", &self.tenant_id)
            .field("tenant_name", &self.tenant_name)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Operations that need the service-role key.
#[async_trait]
pub trait AdminBackend: Send + Sync {
    /// Role from `user_roles`, `None` when unassigned or unknown
    async fn role_of(&self, user_id: &str) -> Result<Option<AppRole>, AppError>;

    async fn user_exists(&self, user_id: &str) -> Result<bool, AppError>;

    async fn delete_user(&self, user_id: &str) -> Result<(), AppError>;

    async fn update_password(&self, user_id: &str, password: &str) -> Result<(), AppError>;

    /// Remove every session row of the user, signing them out everywhere
    async fn delete_sessions(&self, user_id: &str) -> Result<(), AppError>;

    async fn write_audit_log(&self, entry: &AuditEntry) -> Result<(), AppError>;

    /// Create a confirmed account and return its id
    async fn create_auth_user(&self, user: &NewAuthUser) -> Result<String, AppError>;

    async fn link_employee(&self, employee_id: &str, user_id: &str) -> Result<(), AppError>;

    async fn assign_role(&self, user_id: &str, role: AppRole) -> Result<(), AppError>;

    async fn send_password_reset(&self, email: &str) -> Result<(), AppError>;

    async fn store_xero_connection(&self, connection: &XeroConnection) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct SupabaseAdminClient {
    client: reqwest::Client,
    config: Arc<AppConfig>,
}

impl SupabaseAdminClient {
    pub fn new(client: reqwest::Client, config: Arc<AppConfig>) -> Self {
        Self { client, config }
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1{path}", self.config.supabase_url)
    }

    /// GoTrue admin URL for one user; ids that are not UUIDs never reach the path.
    fn admin_user_url(&self, user_id: &str) -> Result<String, AppError> {
        let id = Uuid::parse_str(user_id.trim())
            .map_err(|_| AppError::bad_request("`user_id` must be a UUID"))?;
        Ok(self.auth_url(&format!("/admin/users/{}", id.hyphenated())))
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1{path}", self.config.supabase_url)
    }

    fn service(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.supabase_service_role_key)
            .bearer_auth(&self.config.supabase_service_role_key)
            .header("Accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, AppError> {
        let response = self.service(request).send().await.map_err(|error| {
            AppError::internal(format!("{what} request failed: {}", sanitize(&error)))
        })?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = format!("{what} failed: {}", parse_api_error(status, &body));
        if status == StatusCode::NOT_FOUND {
            Err(AppError::not_found(message))
        } else {
            Err(AppError::internal(message))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoleRow {
    role: String,
}

#[derive(Debug, Deserialize)]
struct CreatedUser {
    id: String,
}

#[async_trait]
impl AdminBackend for SupabaseAdminClient {
    async fn role_of(&self, user_id: &str) -> Result<Option<AppRole>, AppError> {
        let request = self
            .client
            .get(self.rest_url("/user_roles"))
            .query(&[
                ("user_id", format!("eq.{user_id}")),
                ("select", "role".to_string()),
                ("limit", "1".to_string()),
            ]);
        let rows = self
            .send(request, "Role lookup")
            .await?
            .json::<Vec<RoleRow>>()
            .await
            .map_err(|error| {
                AppError::internal(format!("Role lookup parse failed: {}", sanitize(&error)))
            })?;
        Ok(rows.first().and_then(|row| row.role.parse().ok()))
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool, AppError> {
        let request = self.client.get(self.admin_user_url(user_id)?);
        match self.send(request, "User lookup").await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), AppError> {
        let request = self.client.delete(self.admin_user_url(user_id)?);
        self.send(request, "User deletion").await?;
        Ok(())
    }

    async fn update_password(&self, user_id: &str, password: &str) -> Result<(), AppError> {
        let request = self
            .client
            .put(self.admin_user_url(user_id)?)
            .json(&json!({ "password": password }));
        self.send(request, "Password update").await?;
        Ok(())
    }

    async fn delete_sessions(&self, user_id: &str) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.rest_url("/rpc/admin_delete_user_sessions"))
            .json(&json!({ "target_user_id": user_id }));
        self.send(request, "Session revocation").await?;
        Ok(())
    }

    async fn write_audit_log(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.rest_url("/admin_audit_log"))
            .header("Prefer", "return=minimal")
            .json(entry);
        self.send(request, "Audit log insert").await?;
        Ok(())
    }

    async fn create_auth_user(&self, user: &NewAuthUser) -> Result<String, AppError> {
        let request = self
            .client
            .post(self.auth_url("/admin/users"))
            .json(&json!({
                "email": user.email,
                "password": user.password,
                "email_confirm": true,
                "user_metadata": {
                    "first_name": user.first_name,
                    "last_name": user.last_name,
                }
            }));
        let response = self.service(request).send().await.map_err(|error| {
            AppError::internal(format!("User creation request failed: {}", sanitize(&error)))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("User creation failed: {}", parse_api_error(status, &body));
            // GoTrue answers 422 for duplicate emails and weak passwords
            return Err(if status.is_client_error() {
                AppError::bad_request(message)
            } else {
                AppError::internal(message)
            });
        }
        let created = response.json::<CreatedUser>().await.map_err(|error| {
            AppError::internal(format!("User creation parse failed: {}", sanitize(&error)))
        })?;
        Ok(created.id)
    }

    async fn link_employee(&self, employee_id: &str, user_id: &str) -> Result<(), AppError> {
        let request = self
            .client
            .patch(self.rest_url("/employees"))
            .query(&[("id", format!("eq.{employee_id}"))])
            .header("Prefer", "return=representation")
            .json(&json!({ "user_id": user_id }));
        let rows = self
            .send(request, "Employee link")
            .await?
            .json::<Vec<Value>>()
            .await
            .map_err(|error| {
                AppError::internal(format!("Employee link parse failed: {}", sanitize(&error)))
            })?;
        if rows.is_empty() {
            return Err(AppError::not_found(format!(
                "Employee {employee_id} does not exist"
            )));
        }
        Ok(())
    }

    async fn assign_role(&self, user_id: &str, role: AppRole) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.rest_url("/user_roles"))
            .query(&[("on_conflict", "user_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({ "user_id": user_id, "role": role.as_str() }));
        self.send(request, "Role assignment").await?;
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.auth_url("/recover"))
            .json(&json!({ "email": email }));
        self.send(request, "Password reset email").await?;
        Ok(())
    }

    async fn store_xero_connection(&self, connection: &XeroConnection) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.rest_url("/xero_connections"))
            .query(&[("on_conflict", "user_id,tenant_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(connection);
        self.send(request, "Xero connection upsert").await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
}

pub fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload
            .message
            .or(payload.msg)
            .or(payload.error_description)
            .or(payload.error)
        {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}
