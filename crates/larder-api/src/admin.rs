//! Privileged account management for administrators and managers.

use axum::extract::State;
use axum::{Extension, Json};
use larder_core::password::validate_password;
use larder_core::AppRole;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::rate_limit::ProtectedEndpoint;
use crate::routes::{user_fingerprint, AppState};
use crate::supabase::{AuditEntry, NewAuthUser};

#[derive(Debug, Deserialize)]
pub struct TargetUserRequest {
    #[serde(alias = "userId")]
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct SetPasswordRequest {
    #[serde(alias = "userId")]
    pub user_id: String,
    #[serde(alias = "newPassword")]
    pub new_password: String,
    #[serde(default, alias = "forceSignOut")]
    pub force_sign_out: bool,
}

#[derive(Deserialize)]
pub struct CreateEmployeeUserRequest {
    pub email: String,
    pub password: String,
    #[serde(alias = "firstName")]
    pub first_name: String,
    #[serde(alias = "lastName")]
    pub last_name: String,
    #[serde(alias = "employeeId")]
    pub employee_id: String,
    pub role: String,
    #[serde(default, alias = "sendPasswordResetEmail")]
    pub send_password_reset_email: bool,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct SetPasswordResponse {
    pub success: bool,
    pub signed_out: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateEmployeeUserResponse {
    pub success: bool,
    pub user_id: String,
    pub password_reset_sent: bool,
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<TargetUserRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::Admin, &user.user_id)
        .await?;
    let target_id = target_user_id(&payload.user_id)?;
    let target = target_id.to_string();

    let caller_role = state.admin.role_of(&user.user_id).await?;
    if !caller_role.is_some_and(AppRole::can_delete_users) {
        return Err(AppError::unauthorized(
            "Only administrators and managers can delete users",
        ));
    }
    if is_caller(&user, target_id) {
        return Err(AppError::bad_request("You cannot delete your own account"));
    }
    let target_role = state.admin.role_of(&target).await?;
    if target_role == Some(AppRole::Admin) && caller_role != Some(AppRole::Admin) {
        return Err(AppError::unauthorized(
            "Only administrators can delete administrator accounts",
        ));
    }

    state.admin.delete_user(&target).await?;
    tracing::info!(
        actor = user_fingerprint(&user.user_id),
        target_user = user_fingerprint(&target),
        "User deleted"
    );
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn set_user_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<SetPasswordRequest>,
) -> Result<Json<SetPasswordResponse>, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::Admin, &user.user_id)
        .await?;
    let target_id = target_user_id(&payload.user_id)?;
    let target = target_id.to_string();

    let caller_role = state.admin.role_of(&user.user_id).await?;
    if !caller_role.is_some_and(AppRole::can_set_passwords) {
        return Err(AppError::forbidden(
            "Only administrators can set user passwords",
        ));
    }
    if is_caller(&user, target_id) {
        return Err(AppError::bad_request(
            "Use the account settings to change your own password",
        ));
    }
    validate_password(&payload.new_password)
        .map_err(|error| AppError::bad_request(error.to_string()))?;
    if !state.admin.user_exists(&target).await? {
        return Err(AppError::not_found(format!("User {target} does not exist")));
    }

    state
        .admin
        .update_password(&target, &payload.new_password)
        .await?;
    if payload.force_sign_out {
        state.admin.delete_sessions(&target).await?;
    }

    let entry = AuditEntry {
        actor_id: user.user_id.clone(),
        target_user_id: target.clone(),
        action: "set_password".to_string(),
        details: json!({ "force_sign_out": payload.force_sign_out }),
    };
    // the password already changed, a missing audit row must not undo that
    if let Err(error) = state.admin.write_audit_log(&entry).await {
        tracing::error!(
            actor = user_fingerprint(&user.user_id),
            "Audit log write failed: {error}"
        );
    }

    tracing::info!(
        actor = user_fingerprint(&user.user_id),
        target_user = user_fingerprint(&target),
        signed_out = payload.force_sign_out,
        "Password set by administrator"
    );
    Ok(Json(SetPasswordResponse {
        success: true,
        signed_out: payload.force_sign_out,
    }))
}

pub async fn sign_out_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<TargetUserRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::Admin, &user.user_id)
        .await?;
    let target = target_user_id(&payload.user_id)?.to_string();

    let caller_role = state.admin.role_of(&user.user_id).await?;
    if !caller_role.is_some_and(AppRole::can_sign_out_users) {
        return Err(AppError::forbidden(
            "Only administrators, managers and HR can sign users out",
        ));
    }

    state.admin.delete_sessions(&target).await?;
    tracing::info!(
        actor = user_fingerprint(&user.user_id),
        target_user = user_fingerprint(&target),
        "User signed out of all sessions"
    );
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn create_employee_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<CreateEmployeeUserRequest>,
) -> Result<Json<CreateEmployeeUserResponse>, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::Admin, &user.user_id)
        .await?;

    let caller_role = state.admin.role_of(&user.user_id).await?;
    if !caller_role.is_some_and(AppRole::can_create_employee_users) {
        return Err(AppError::forbidden(
            "Only administrators and managers can create employee accounts",
        ));
    }

    let email = required(&payload.email, "email")?;
    if !email.contains('@') {
        return Err(AppError::bad_request("`email` must be a valid email address"));
    }
    let first_name = required(&payload.first_name, "first_name")?;
    let last_name = required(&payload.last_name, "last_name")?;
    let employee_id = required(&payload.employee_id, "employee_id")?;
    validate_password(&payload.password)
        .map_err(|error| AppError::bad_request(error.to_string()))?;
    let role: AppRole = payload.role.parse()?;
    if role == AppRole::Admin && caller_role != Some(AppRole::Admin) {
        return Err(AppError::forbidden(
            "Only administrators can grant the admin role",
        ));
    }

    let new_user = NewAuthUser {
        email: email.to_string(),
        password: payload.password.clone(),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
    };
    let user_id = state.admin.create_auth_user(&new_user).await?;
    state.admin.link_employee(employee_id, &user_id).await?;
    state.admin.assign_role(&user_id, role).await?;

    let mut password_reset_sent = false;
    if payload.send_password_reset_email {
        match state.admin.send_password_reset(email).await {
            Ok(()) => password_reset_sent = true,
            Err(error) => tracing::warn!(
                target_user = user_fingerprint(&user_id),
                "Password reset email failed: {error}"
            ),
        }
    }

    tracing::info!(
        actor = user_fingerprint(&user.user_id),
        target_user = user_fingerprint(&user_id),
        %role,
        "Employee account created"
    );
    Ok(Json(CreateEmployeeUserResponse {
        success: true,
        user_id,
        password_reset_sent,
    }))
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::bad_request(format!("`{field}` is required")));
    }
    Ok(value)
}

/// Target account id; GoTrue ids are UUIDs and anything else is refused before any lookup.
fn target_user_id(value: &str) -> Result<Uuid, AppError> {
    let value = required(value, "user_id")?;
    Uuid::parse_str(value).map_err(|_| AppError::bad_request("`user_id` must be a UUID"))
}

fn is_caller(user: &AuthenticatedUser, target: Uuid) -> bool {
    Uuid::parse_str(&user.user_id).is_ok_and(|caller| caller == target)
}
