//! State management module for Stackwright.
//!
//! This module provides persistent state storage for tracking provisioned
//! resources, their provider identifiers and outputs, and apply history.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use types::{
    ApplyHistoryEntry, ApplyOperation, MAX_HISTORY, ProvisionedState, ResourceRecord,
    STATE_VERSION, StateChange,
};
