//! Versioned record repository backed by libSQL

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use libsql::Connection;
use serde_json::{Map, Value};

use crate::edit::RecordStore;
use crate::error::{Error, Result};
use crate::models::{RecordSnapshot, ResourceRef};

/// Columns managed by the repository rather than by callers
const MANAGED_FIELDS: [&str; 2] = ["created_at", "updated_at"];

/// Read-merge-write attempts before giving up on a hot record
const MAX_WRITE_ATTEMPTS: usize = 32;

/// libSQL implementation of `RecordStore`
pub struct LibSqlRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new record, failing if it already exists
    pub async fn insert(
        &self,
        resource: &ResourceRef,
        data: Map<String, Value>,
    ) -> Result<RecordSnapshot> {
        resource.validate()?;
        let now = next_version(None);
        let body = serde_json::to_string(&strip_managed(data))?;
        self.conn
            .execute(
                "INSERT INTO records (resource_type, resource_id, data, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                [
                    resource.resource_type.as_str(),
                    resource.resource_id.as_str(),
                    body.as_str(),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await?;

        self.fetch(resource)
            .await?
            .ok_or_else(|| Error::Database(format!("inserted record {resource} vanished")))
    }

    /// All records of one type, most recently updated first
    pub async fn list(&self, resource_type: &str) -> Result<Vec<RecordSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT resource_id, data, created_at, updated_at FROM records
                 WHERE resource_type = ?
                 ORDER BY updated_at DESC",
                [resource_type],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let resource = ResourceRef::new(resource_type, row.get::<String>(0)?)?;
            records.push(parse_snapshot(
                resource,
                &row.get::<String>(1)?,
                row.get::<String>(2)?,
                row.get::<String>(3)?,
            )?);
        }
        Ok(records)
    }
}

impl RecordStore for LibSqlRecordRepository<'_> {
    async fn fetch(&self, resource: &ResourceRef) -> Result<Option<RecordSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT data, created_at, updated_at FROM records
                 WHERE resource_type = ? AND resource_id = ?",
                [resource.resource_type.as_str(), resource.resource_id.as_str()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        parse_snapshot(
            resource.clone(),
            &row.get::<String>(0)?,
            row.get::<String>(1)?,
            row.get::<String>(2)?,
        )
        .map(Some)
    }

    async fn update(
        &self,
        resource: &ResourceRef,
        data: Map<String, Value>,
    ) -> Result<RecordSnapshot> {
        let changes = strip_managed(data);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .fetch(resource)
                .await?
                .ok_or_else(|| Error::NotFound(resource.to_string()))?;
            let created_at = current
                .data
                .get("created_at")
                .and_then(Value::as_str)
                .map(str::to_string);

            let mut merged = strip_managed(current.data);
            merged.extend(changes.clone());
            let body = serde_json::to_string(&merged)?;
            let version = next_version(Some(&current.updated_at));

            // only lands if nobody else wrote since our read
            let written = self
                .conn
                .execute(
                    "UPDATE records SET data = ?, updated_at = ?
                     WHERE resource_type = ? AND resource_id = ? AND updated_at = ?",
                    [
                        body.as_str(),
                        version.as_str(),
                        resource.resource_type.as_str(),
                        resource.resource_id.as_str(),
                        current.updated_at.as_str(),
                    ],
                )
                .await?;
            if written == 1 {
                tracing::debug!(%resource, version = %version, "Record updated");
                return parse_snapshot(
                    resource.clone(),
                    &body,
                    created_at.unwrap_or_default(),
                    version,
                );
            }
            tracing::debug!(%resource, "Concurrent write detected, retrying update");
        }

        Err(Error::Database(format!(
            "record {resource} kept changing during update"
        )))
    }
}

fn strip_managed(mut data: Map<String, Value>) -> Map<String, Value> {
    for field in MANAGED_FIELDS {
        data.remove(field);
    }
    data
}

fn parse_snapshot(
    resource: ResourceRef,
    body: &str,
    created_at: String,
    updated_at: String,
) -> Result<RecordSnapshot> {
    let mut data = match serde_json::from_str::<Value>(body)? {
        Value::Object(data) => data,
        _ => {
            return Err(Error::Database(format!(
                "record {resource} holds non-object data"
            )))
        }
    };
    data.insert("created_at".to_string(), Value::String(created_at));
    data.insert("updated_at".to_string(), Value::String(updated_at.clone()));
    Ok(RecordSnapshot {
        resource,
        data,
        updated_at,
    })
}

/// Millisecond RFC 3339 timestamp strictly after `previous`.
fn next_version(previous: Option<&str>) -> String {
    let now = Utc::now().trunc_subsecs(3);
    let next = previous
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc))
        .filter(|previous| *previous >= now)
        .map_or(now, |previous| previous + Duration::milliseconds(1));
    next.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::db::Database;
    use crate::edit::EditTracker;
    use crate::models::{EditSession, ProfileSummary};

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn employee() -> ResourceRef {
        ResourceRef::new("employees", "emp-1").unwrap()
    }

    fn session(user: &str) -> EditSession {
        EditSession::open(
            employee(),
            user,
            ProfileSummary {
                display_name: user.to_string(),
                email: None,
                avatar_url: None,
            },
            "",
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_then_fetch() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());

        let created = repo
            .insert(&employee(), fields(json!({"first_name": "Ana"})))
            .await
            .unwrap();
        let fetched = repo.fetch(&employee()).await.unwrap().unwrap();

        assert_eq!(created, fetched);
        assert_eq!(fetched.data["first_name"], "Ana");
        assert_eq!(fetched.data["updated_at"], fetched.updated_at.as_str());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_missing_is_none() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        assert!(repo.fetch(&employee()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_merges_fields_and_advances_version() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        let created = repo
            .insert(
                &employee(),
                fields(json!({"first_name": "Ana", "department": "QA"})),
            )
            .await
            .unwrap();

        let updated = repo
            .update(
                &employee(),
                fields(json!({"department": "Production", "updated_at": "1999-01-01T00:00:00Z"})),
            )
            .await
            .unwrap();

        assert_eq!(updated.data["first_name"], "Ana");
        assert_eq!(updated.data["department"], "Production");
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_missing_is_not_found() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        let err = repo.update(&employee(), Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_returns_one_type_only() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.insert(&employee(), Map::new()).await.unwrap();
        repo.insert(&ResourceRef::new("suppliers", "s-1").unwrap(), Map::new())
            .await
            .unwrap();

        let employees = repo.list("employees").await.unwrap();
        assert_eq!(employees.len(), 1);
        assert_eq!(employees[0].resource, employee());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_editors_second_saver_sees_conflict() {
        let db = setup().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        let initial = repo
            .insert(&employee(), fields(json!({"first_name": "Ana"})))
            .await
            .unwrap();

        let mut editor_a = EditTracker::new();
        editor_a.initialize_edit(session("a"), &initial);
        let mut editor_b = EditTracker::new();
        editor_b.initialize_edit(session("b"), &initial);

        // B checks, writes and records the new version first
        assert!(editor_b.check_before_save(&repo).await.unwrap().can_save);
        let written = repo
            .update(&employee(), fields(json!({"first_name": "Ann"})))
            .await
            .unwrap();
        editor_b.mark_saved(written.updated_at.clone()).unwrap();

        let result = editor_a.check_before_save(&repo).await.unwrap();
        assert!(!result.can_save);
        let latest = result.latest_data.unwrap();
        assert_eq!(latest.updated_at, written.updated_at);
        assert_eq!(latest.data["first_name"], "Ann");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_keep_every_field_and_distinct_versions() {
        let db = Arc::new(setup().await);
        LibSqlRecordRepository::new(db.connection())
            .insert(&employee(), Map::new())
            .await
            .unwrap();

        for round in 0..50 {
            let writers: Vec<_> = (0..4)
                .map(|writer| {
                    let db = Arc::clone(&db);
                    tokio::spawn(async move {
                        let mut change = Map::new();
                        change.insert(format!("round_{round}_writer_{writer}"), json!(writer));
                        LibSqlRecordRepository::new(db.connection())
                            .update(&employee(), change)
                            .await
                            .unwrap()
                            .updated_at
                    })
                })
                .collect();

            let mut versions = Vec::new();
            for writer in writers {
                versions.push(writer.await.unwrap());
            }
            versions.sort();
            versions.dedup();
            assert_eq!(versions.len(), 4, "round {round} reused a version");

            let latest = LibSqlRecordRepository::new(db.connection())
                .fetch(&employee())
                .await
                .unwrap()
                .unwrap();
            for writer in 0..4 {
                assert!(latest
                    .data
                    .contains_key(&format!("round_{round}_writer_{writer}")));
            }
        }
    }

    #[test]
    fn next_version_is_strictly_increasing() {
        let future = "2999-01-01T00:00:00.000Z";
        assert_eq!(next_version(Some(future)), "2999-01-01T00:00:00.001Z");

        let past = "2000-01-01T00:00:00.000Z";
        assert!(next_version(Some(past)).as_str() > past);
        assert!(next_version(Some("not a timestamp")).ends_with('Z'));
    }
}
