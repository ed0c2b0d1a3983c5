//! larder-core - Core library for Larder
//!
//! This crate holds the record models, the optimistic edit tracker, the
//! presence registry and the account policies shared by the Larder backend.

pub mod db;
pub mod edit;
pub mod error;
pub mod models;
pub mod password;
pub mod presence;
pub mod util;

pub use error::{Error, Result};
pub use models::{
    AppRole, ConflictCheckResult, ConflictResolution, EditSession, EditState, ProfileSummary,
    RecordSnapshot, ResourceRef,
};
