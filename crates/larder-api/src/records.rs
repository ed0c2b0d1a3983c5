//! Record reads and writes on behalf of the caller.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use larder_core::db::{Database, LibSqlRecordRepository};
use larder_core::edit::RecordStore;
use larder_core::util::now_rfc3339;
use larder_core::{RecordSnapshot, ResourceRef};
use serde_json::{Map, Value};

use crate::auth::AuthenticatedUser;
use crate::config::{AppConfig, RecordBackendConfig};
use crate::error::{sanitize, AppError};
use crate::routes::AppState;
use crate::supabase::parse_api_error;

/// Fields the database owns and callers may not overwrite
const PROTECTED_FIELDS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Clone)]
pub enum RecordBackend {
    Supabase {
        client: reqwest::Client,
        base_url: String,
        anon_key: String,
    },
    Local(Arc<Database>),
}

impl RecordBackend {
    pub async fn from_config(config: &AppConfig, client: reqwest::Client) -> Result<Self, AppError> {
        match &config.record_backend {
            RecordBackendConfig::Supabase => Ok(Self::Supabase {
                client,
                base_url: config.supabase_url.clone(),
                anon_key: config.supabase_anon_key.clone(),
            }),
            RecordBackendConfig::Local { path } => {
                let database = if path.as_os_str() == ":memory:" {
                    Database::open_in_memory().await?
                } else {
                    Database::open(path).await?
                };
                tracing::info!(path = %path.display(), "Using local record store");
                Ok(Self::Local(Arc::new(database)))
            }
        }
    }

    /// Store scoped to one caller; PostgREST sees the caller's own token.
    pub fn store_for<'a>(&'a self, user: &AuthenticatedUser) -> ScopedRecordStore<'a> {
        match self {
            Self::Supabase {
                client,
                base_url,
                anon_key,
            } => ScopedRecordStore::Postgrest(PostgrestRecordStore {
                client: client.clone(),
                base_url: base_url.clone(),
                anon_key: anon_key.clone(),
                access_token: user.access_token.clone(),
            }),
            Self::Local(database) => {
                ScopedRecordStore::Local(LibSqlRecordRepository::new(database.connection()))
            }
        }
    }
}

pub enum ScopedRecordStore<'a> {
    Postgrest(PostgrestRecordStore),
    Local(LibSqlRecordRepository<'a>),
}

impl RecordStore for ScopedRecordStore<'_> {
    async fn fetch(&self, resource: &ResourceRef) -> larder_core::Result<Option<RecordSnapshot>> {
        match self {
            Self::Postgrest(store) => store.fetch(resource).await,
            Self::Local(store) => store.fetch(resource).await,
        }
    }

    async fn update(
        &self,
        resource: &ResourceRef,
        data: Map<String, Value>,
    ) -> larder_core::Result<RecordSnapshot> {
        match self {
            Self::Postgrest(store) => store.update(resource, data).await,
            Self::Local(store) => store.update(resource, data).await,
        }
    }
}

/// Rows addressed as `/rest/v1/{resource_type}?id=eq.{resource_id}`
pub struct PostgrestRecordStore {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: String,
}

impl PostgrestRecordStore {
    fn table_url(&self, resource: &ResourceRef) -> String {
        format!("{}/rest/v1/{}", self.base_url, resource.resource_type)
    }

    async fn rows(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> larder_core::Result<Vec<Value>> {
        let response = request
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| {
                larder_core::Error::Remote(format!("{what} request failed: {}", sanitize(&error)))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(larder_core::Error::Remote(format!(
                "{what} failed: {}",
                parse_api_error(status, &body)
            )));
        }
        response.json::<Vec<Value>>().await.map_err(|error| {
            larder_core::Error::Remote(format!("{what} parse failed: {}", sanitize(&error)))
        })
    }
}

impl RecordStore for PostgrestRecordStore {
    async fn fetch(&self, resource: &ResourceRef) -> larder_core::Result<Option<RecordSnapshot>> {
        let request = self.client.get(self.table_url(resource)).query(&[
            ("id", format!("eq.{}", resource.resource_id)),
            ("select", "*".to_string()),
        ]);
        let rows = self.rows(request, "Record fetch").await?;
        rows.into_iter()
            .next()
            .map(|row| RecordSnapshot::from_row(resource.clone(), row))
            .transpose()
    }

    async fn update(
        &self,
        resource: &ResourceRef,
        mut data: Map<String, Value>,
    ) -> larder_core::Result<RecordSnapshot> {
        for field in PROTECTED_FIELDS {
            data.remove(field);
        }
        data.insert("updated_at".to_string(), Value::String(now_rfc3339()));

        let request = self
            .client
            .patch(self.table_url(resource))
            .query(&[("id", format!("eq.{}", resource.resource_id))])
            .header("Prefer", "return=representation")
            .json(&data);
        let row = self
            .rows(request, "Record update")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| larder_core::Error::NotFound(resource.to_string()))?;
        RecordSnapshot::from_row(resource.clone(), row)
    }
}

pub async fn get_record(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> Result<Json<RecordSnapshot>, AppError> {
    let resource = ResourceRef::new(resource_type, resource_id)?;
    let store = state.records.store_for(&user);
    let snapshot = store
        .fetch(&resource)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Record {resource} does not exist")))?;
    Ok(Json(snapshot))
}

pub async fn put_record(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((resource_type, resource_id)): Path<(String, String)>,
    Json(data): Json<Map<String, Value>>,
) -> Result<Json<RecordSnapshot>, AppError> {
    let resource = ResourceRef::new(resource_type, resource_id)?;
    let store = state.records.store_for(&user);
    let snapshot = store.update(&resource, data).await?;
    tracing::info!(%resource, version = %snapshot.updated_at, "Record updated");
    Ok(Json(snapshot))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::routes::test_support::{local_state, seed_record, test_user};

    #[tokio::test(flavor = "multi_thread")]
    async fn get_record_returns_snapshot_with_version() {
        let state = local_state().await;
        seed_record(&state, "employees", "emp-1", json!({ "first_name": "Ada" })).await;

        let Json(snapshot) = get_record(
            State(state),
            Extension(test_user("user-a")),
            Path(("employees".to_string(), "emp-1".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.data["first_name"], "Ada");
        assert!(!snapshot.updated_at.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_record_is_not_found() {
        let state = local_state().await;
        let err = get_record(
            State(state),
            Extension(test_user("user-a")),
            Path(("employees".to_string(), "nope".to_string())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_resource_type_is_rejected() {
        let state = local_state().await;
        let err = get_record(
            State(state),
            Extension(test_user("user-a")),
            Path(("Employees; drop".to_string(), "1".to_string())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_record_advances_version() {
        let state = local_state().await;
        let before = seed_record(&state, "recipes", "r-1", json!({ "name": "Loaf" })).await;

        let Json(after) = put_record(
            State(state),
            Extension(test_user("user-a")),
            Path(("recipes".to_string(), "r-1".to_string())),
            Json(json!({ "name": "Sourdough" }).as_object().cloned().unwrap()),
        )
        .await
        .unwrap();
        assert_eq!(after.data["name"], "Sourdough");
        assert_ne!(after.updated_at, before.updated_at);
    }
}
