//! Optimistic concurrency for record editing.
//!
//! An editor captures the record's `updated_at` when a form opens and
//! compares it with the server's current value right before saving. The
//! check reports; it does not lock. The write that follows a clear check is
//! a plain update, so a write landing between check and save still wins.
//!
//! Presence (who else has the record open) is informational only. When the
//! presence channel fails, editing continues and the version check still
//! guards every save.

mod coordinator;
mod tracker;

pub use coordinator::{distinct_other_editors, EditCoordinator};
pub use tracker::EditTracker;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{EditSession, RecordSnapshot, ResourceRef};

/// Source of truth for record versions
#[allow(async_fn_in_trait)]
pub trait RecordStore {
    /// Current snapshot of a record, `None` when it no longer exists
    async fn fetch(&self, resource: &ResourceRef) -> Result<Option<RecordSnapshot>>;

    /// Overwrite a record's fields and bump its version
    async fn update(&self, resource: &ResourceRef, data: Map<String, Value>)
        -> Result<RecordSnapshot>;
}

/// Broadcast channel of active editors
#[allow(async_fn_in_trait)]
pub trait PresenceChannel {
    /// Announce that a session is editing its resource
    async fn track(&self, session: &EditSession) -> Result<()>;

    /// Withdraw a session, unknown ids are ignored
    async fn untrack(&self, session_id: &str) -> Result<()>;

    /// All sessions currently editing `resource`
    async fn editors(&self, resource: &ResourceRef) -> Result<Vec<EditSession>>;
}
