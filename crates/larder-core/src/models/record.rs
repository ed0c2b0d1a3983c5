//! Record identity and snapshot models

use std::fmt;
use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

static RESOURCE_TYPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("Invalid regex"));

/// Identifies one record: a table name plus the row's primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Table name, e.g. `employees`
    pub resource_type: String,
    /// Row identifier within the table
    pub resource_id: String,
}

impl ResourceRef {
    /// Build a validated resource reference
    pub fn new(resource_type: impl AsRef<str>, resource_id: impl AsRef<str>) -> Result<Self> {
        let resource = Self {
            resource_type: resource_type.as_ref().trim().to_string(),
            resource_id: resource_id.as_ref().trim().to_string(),
        };
        resource.validate()?;
        Ok(resource)
    }

    /// Check the table name and id are usable as a query target
    pub fn validate(&self) -> Result<()> {
        if !RESOURCE_TYPE_PATTERN.is_match(&self.resource_type) {
            return Err(Error::InvalidInput(format!(
                "resource_type `{}` must be a lowercase table name",
                self.resource_type
            )));
        }
        if self.resource_id.trim().is_empty() {
            return Err(Error::InvalidInput("resource_id is required".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// The authoritative state of a record at some moment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Which record this is
    pub resource: ResourceRef,
    /// Row contents as returned by the backend
    pub data: Map<String, Value>,
    /// Version marker of the row
    pub updated_at: String,
}

impl RecordSnapshot {
    /// Build a snapshot from a JSON row that carries its own `updated_at`
    pub fn from_row(resource: ResourceRef, row: Value) -> Result<Self> {
        let Value::Object(data) = row else {
            return Err(Error::InvalidInput(format!(
                "record {resource} is not a JSON object"
            )));
        };
        let updated_at = data
            .get("updated_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidInput(format!("record {resource} has no `updated_at` column"))
            })?;
        Ok(Self {
            resource,
            data,
            updated_at,
        })
    }
}

/// Compare two `updated_at` values.
///
/// RFC 3339 values are compared as instants so that `Z` and `+00:00`
/// spellings of the same moment match; anything else falls back to a
/// trimmed string comparison.
pub fn versions_match(left: &str, right: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(left.trim()),
        DateTime::parse_from_rfc3339(right.trim()),
    ) {
        (Ok(left), Ok(right)) => left == right,
        _ => left.trim() == right.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_ref_accepts_table_names() {
        let resource = ResourceRef::new("employees", " 42 ").unwrap();
        assert_eq!(resource.resource_id, "42");
        assert_eq!(resource.to_string(), "employees/42");
    }

    #[test]
    fn resource_ref_rejects_unsafe_table_names() {
        assert!(ResourceRef::new("Employees", "1").is_err());
        assert!(ResourceRef::new("employees;drop", "1").is_err());
        assert!(ResourceRef::new("", "1").is_err());
        assert!(ResourceRef::new("employees", "  ").is_err());
    }

    #[test]
    fn snapshot_from_row_reads_updated_at() {
        let resource = ResourceRef::new("employees", "7").unwrap();
        let snapshot = RecordSnapshot::from_row(
            resource,
            json!({"id": "7", "updated_at": "2024-01-01T10:00:00Z"}),
        )
        .unwrap();
        assert_eq!(snapshot.updated_at, "2024-01-01T10:00:00Z");
    }

    #[test]
    fn snapshot_from_row_requires_updated_at() {
        let resource = ResourceRef::new("employees", "7").unwrap();
        assert!(RecordSnapshot::from_row(resource.clone(), json!({"id": "7"})).is_err());
        assert!(RecordSnapshot::from_row(resource, json!([1, 2])).is_err());
    }

    #[test]
    fn versions_match_normalizes_utc_offsets() {
        assert!(versions_match(
            "2024-01-01T10:00:00Z",
            "2024-01-01T10:00:00+00:00"
        ));
        assert!(!versions_match(
            "2024-01-01T10:00:00Z",
            "2024-01-01T10:05:00Z"
        ));
        assert!(versions_match("v3", " v3 "));
        assert!(!versions_match("v3", "v4"));
    }
}
