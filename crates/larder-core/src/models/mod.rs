//! Data models for Larder

mod edit_session;
mod record;
mod role;

pub use edit_session::{
    ConflictCheckResult, ConflictResolution, EditSession, EditState, ProfileSummary,
};
pub use record::{versions_match, RecordSnapshot, ResourceRef};
pub use role::AppRole;
