//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::Result;
use super::types::{ProvisionedState, StateChange};
use super::lock::LockInfo;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the provisioned state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<ProvisionedState>>;

    /// Saves a full snapshot of the state.
    async fn save(&self, state: &ProvisionedState) -> Result<()>;

    /// Durably records one change.
    ///
    /// `state` already has `change` applied. Backends without an append log
    /// persist the whole snapshot.
    async fn commit(&self, state: &ProvisionedState, change: &StateChange) -> Result<()> {
        let _ = change;
        self.save(state).await
    }

    /// Deletes the state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state for `operation`.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes any lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<ProvisionedState>> {
        (**self).load().await
    }

    async fn save(&self, state: &ProvisionedState) -> Result<()> {
        (**self).save(state).await
    }

    async fn commit(&self, state: &ProvisionedState, change: &StateChange) -> Result<()> {
        (**self).commit(state, change).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
