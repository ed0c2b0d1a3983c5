//! Per-editor state machine

use crate::error::{Error, Result};
use crate::models::{
    versions_match, ConflictCheckResult, ConflictResolution, EditSession, EditState,
    RecordSnapshot,
};

use super::RecordStore;

/// Tracks one editor's view of one record.
///
/// `idle -> editing -> saving -> saved`, or
/// `editing -> conflict_detected -> overwritten | reloaded`.
#[derive(Debug, Clone)]
pub struct EditTracker {
    session: Option<EditSession>,
    state: EditState,
    latest: Option<RecordSnapshot>,
}

impl Default for EditTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EditTracker {
    pub const fn new() -> Self {
        Self {
            session: None,
            state: EditState::Idle,
            latest: None,
        }
    }

    /// Start editing from `initial`, capturing its version as the base.
    pub fn initialize_edit(&mut self, mut session: EditSession, initial: &RecordSnapshot) {
        session.base_updated_at.clone_from(&initial.updated_at);
        tracing::debug!(
            resource = %session.resource,
            base = %session.base_updated_at,
            "Edit initialized"
        );
        self.session = Some(session);
        self.state = EditState::Editing;
        self.latest = None;
    }

    pub const fn state(&self) -> EditState {
        self.state
    }

    pub const fn session(&self) -> Option<&EditSession> {
        self.session.as_ref()
    }

    /// Version the editor started from
    pub fn base_version(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.base_updated_at.as_str())
    }

    /// Server snapshot captured by the last failed check
    pub const fn latest(&self) -> Option<&RecordSnapshot> {
        self.latest.as_ref()
    }

    /// Re-read the record and compare its version with the base version.
    pub async fn check_before_save<S: RecordStore>(
        &mut self,
        store: &S,
    ) -> Result<ConflictCheckResult> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no edit has been initialized".to_string()))?;

        let current = store.fetch(&session.resource).await?;
        let result = match current {
            Some(snapshot) if versions_match(&snapshot.updated_at, &session.base_updated_at) => {
                ConflictCheckResult::clear()
            }
            Some(snapshot) => {
                tracing::info!(
                    resource = %session.resource,
                    base = %session.base_updated_at,
                    server = %snapshot.updated_at,
                    "Concurrent edit detected"
                );
                ConflictCheckResult::conflict(Some(snapshot))
            }
            None => {
                tracing::info!(resource = %session.resource, "Record removed while editing");
                ConflictCheckResult::conflict(None)
            }
        };

        if result.can_save {
            self.state = EditState::Saving;
            self.latest = None;
        } else {
            self.state = EditState::ConflictDetected;
            self.latest.clone_from(&result.latest_data);
        }
        Ok(result)
    }

    /// Apply the editor's choice after a conflict.
    ///
    /// `on_refresh` runs with the server snapshot when the editor reloads.
    pub fn resolve_conflict(
        &mut self,
        resolution: ConflictResolution,
        on_refresh: impl FnOnce(&RecordSnapshot),
    ) -> Result<()> {
        if self.state != EditState::ConflictDetected {
            return Err(Error::InvalidState(format!(
                "cannot resolve a conflict while {:?}",
                self.state
            )));
        }

        match resolution {
            ConflictResolution::KeepMine => {
                self.state = EditState::Overwritten;
            }
            ConflictResolution::ReloadLatest => {
                let latest = self.latest.take().ok_or_else(|| {
                    Error::NotFound("the record no longer exists on the server".to_string())
                })?;
                if let Some(session) = self.session.as_mut() {
                    session.base_updated_at.clone_from(&latest.updated_at);
                }
                on_refresh(&latest);
                self.state = EditState::Reloaded;
            }
        }
        Ok(())
    }

    /// Record that the caller's write landed at `new_updated_at`.
    pub fn mark_saved(&mut self, new_updated_at: impl Into<String>) -> Result<()> {
        if !matches!(self.state, EditState::Saving | EditState::Overwritten) {
            return Err(Error::InvalidState(format!(
                "cannot mark saved while {:?}",
                self.state
            )));
        }
        if let Some(session) = self.session.as_mut() {
            session.base_updated_at = new_updated_at.into();
        }
        self.latest = None;
        self.state = EditState::Saved;
        Ok(())
    }
}
