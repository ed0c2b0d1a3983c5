//! Edit session and conflict check models

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{RecordSnapshot, ResourceRef};

/// What other editors see about a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// One editor's live lease on a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSession {
    /// Unique per open form, a user may hold several
    pub session_id: String,
    pub resource: ResourceRef,
    pub user_id: String,
    pub profile: ProfileSummary,
    /// Lease acquisition time (RFC 3339)
    pub started_at: String,
    /// `updated_at` of the record when editing began
    pub base_updated_at: String,
}

impl EditSession {
    /// Open a new session on `resource` at version `base_updated_at`
    pub fn open(
        resource: ResourceRef,
        user_id: impl Into<String>,
        profile: ProfileSummary,
        base_updated_at: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Uuid::now_v7().to_string(),
            resource,
            user_id: user_id.into(),
            profile,
            started_at: crate::util::now_rfc3339(),
            base_updated_at: base_updated_at.into(),
        }
    }
}

/// Outcome of the pre-save version comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCheckResult {
    pub can_save: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_data: Option<RecordSnapshot>,
}

impl ConflictCheckResult {
    pub const fn clear() -> Self {
        Self {
            can_save: true,
            latest_data: None,
        }
    }

    pub const fn conflict(latest_data: Option<RecordSnapshot>) -> Self {
        Self {
            can_save: false,
            latest_data,
        }
    }
}

/// The editor's answer to a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Proceed and overwrite the newer server state
    KeepMine,
    /// Discard local edits and adopt the server state
    ReloadLatest,
}

/// Lifecycle of a single edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditState {
    Idle,
    Editing,
    Saving,
    Saved,
    ConflictDetected,
    Overwritten,
    Reloaded,
}
