//! S3-based state storage backend.
//!
//! Remote state for teams. The layout mirrors the local store: a snapshot
//! object plus one journal object per committed change. A commit first
//! creates `journal/<serial>.json` (only if absent), then rewrites the
//! snapshot conditionally on the version this store last observed, then
//! drops the journal object. Loading replays any journal objects the
//! snapshot does not cover yet.
//!
//! The revision guard refuses to write a serial that does not follow the
//! last one observed, so two writers that slipped past the lock cannot
//! silently overwrite each other.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StackError, StateError};

use super::local::{JournalEntry, replay};
use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{ProvisionedState, StateChange};

/// Snapshot key suffix.
const STATE_KEY: &str = "state.json";

/// Lock key suffix.
const LOCK_KEY: &str = "state.lock";

/// Journal key prefix, relative to the store prefix.
const JOURNAL_PREFIX: &str = "journal/";

/// Error codes S3 returns when a conditional write loses.
const CONFLICT_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// Version of the snapshot this store last read or wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Revision {
    /// Entity tag of the snapshot object, `None` when it did not exist.
    etag: Option<String>,
    /// Serial of the snapshot.
    serial: u64,
}

/// How a write relates to the observed revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    /// One journaled change: the serial must advance by exactly one.
    Commit,
    /// A full snapshot: the serial must not go backwards.
    Save,
}

impl Revision {
    /// Checks that `serial` may be written on top of this revision.
    fn admit(&self, serial: u64, kind: WriteKind) -> Result<()> {
        let admitted = match kind {
            WriteKind::Commit => serial == self.serial + 1,
            WriteKind::Save => serial >= self.serial,
        };

        if admitted {
            Ok(())
        } else {
            Err(StackError::State(StateError::write(format!(
                "Refusing to write serial {serial}: stored state is at serial {}",
                self.serial
            ))))
        }
    }
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
    /// Last observed snapshot, `None` until the first load or write.
    revision: Mutex<Option<Revision>>,
}

impl S3StateStore {
    /// Creates a new S3 state store using the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            revision: Mutex::new(None),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn journal_key(&self, serial: u64) -> String {
        format!("{}{JOURNAL_PREFIX}{serial:020}.json", self.prefix)
    }

    /// Reads an object and its entity tag.
    async fn get_object(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(ToString::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StackError::State(StateError::s3(format!("Failed to read s3://{}/{key}: {e}", self.bucket)))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackError::State(StateError::corrupted(format!(
                        "Invalid UTF-8 in S3 object {key}: {e}"
                    )))
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 get {key} failed: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Writes the snapshot unless someone else wrote it since `revision`.
    ///
    /// Returns the new entity tag.
    async fn put_snapshot(
        &self,
        state: &ProvisionedState,
        revision: Option<&Revision>,
    ) -> Result<Option<String>> {
        let key = self.key(STATE_KEY);
        let content = to_json(state, "state")?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .metadata("serial", state.serial.to_string());

        request = match revision.map(|r| r.etag.as_deref()) {
            Some(Some(etag)) => request.if_match(etag),
            Some(None) => request.if_none_match("*"),
            None => request,
        };

        match request.send().await {
            Ok(output) => Ok(output.e_tag().map(ToString::to_string)),
            Err(e) if CONFLICT_CODES.contains(&e.code().unwrap_or_default()) => {
                Err(StackError::State(StateError::write(format!(
                    "s3://{}/{key} was changed by another writer; refusing to overwrite serial {}",
                    self.bucket, state.serial
                ))))
            }
            Err(e) => Err(StackError::State(StateError::s3(format!("S3 put {key} failed: {e}")))),
        }
    }

    /// Creates the journal object for one change. Fails if that serial was
    /// already journaled.
    async fn put_journal(&self, entry: &JournalEntry) -> Result<()> {
        let key = self.journal_key(entry.serial);
        let content = to_json(entry, "journal entry")?;

        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .if_none_match("*")
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if CONFLICT_CODES.contains(&e.code().unwrap_or_default()) => {
                Err(StackError::State(StateError::write(format!(
                    "Serial {} was already committed by another writer",
                    entry.serial
                ))))
            }
            Err(e) => Err(StackError::State(StateError::s3(format!("S3 put {key} failed: {e}")))),
        }
    }

    /// Lists journaled serials in ascending order.
    async fn journal_serials(&self) -> Result<Vec<u64>> {
        let prefix = self.key(JOURNAL_PREFIX);
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 list {prefix} failed: {e}"))))?;

        let mut serials: Vec<u64> = output
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(journal_serial)
            .collect();
        serials.sort_unstable();
        Ok(serials)
    }

    async fn read_journal(&self, after: u64) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        for serial in self.journal_serials().await? {
            if serial <= after {
                continue;
            }
            let key = self.journal_key(serial);
            let Some((content, _)) = self.get_object(&key).await? else {
                continue;
            };
            let entry: JournalEntry = serde_json::from_str(&content).map_err(|e| {
                StackError::State(StateError::corrupted(format!(
                    "Journal object s3://{}/{key} is unreadable: {e}",
                    self.bucket
                )))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Drops journal objects the snapshot now covers.
    async fn prune_journal(&self, through: u64) -> Result<()> {
        for serial in self.journal_serials().await? {
            if serial <= through {
                self.delete_object(&self.journal_key(serial)).await?;
            }
        }
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 delete {key} failed: {e}"))))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.key(LOCK_KEY)).await? {
            Some((content, _)) => parse_lock(&content).map(Some),
            None => Ok(None),
        }
    }
}

/// Normalizes a key prefix to be empty or end with a single `/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

/// Parses the serial out of a journal object name such as
/// `00000000000000000007.json`.
fn journal_serial(name: &str) -> Option<u64> {
    name.strip_suffix(".json")?.parse().ok()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| {
        StackError::State(StateError::serialization(format!("Failed to serialize {what}: {e}")))
    })
}

fn parse_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        StackError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
    })
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<ProvisionedState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let mut revision = self.revision.lock().await;

        let (snapshot, etag) = match self.get_object(&key).await? {
            Some((json, etag)) => {
                let state: ProvisionedState = serde_json::from_str(&json).map_err(|e| {
                    StackError::State(StateError::corrupted(format!(
                        "Failed to parse state s3://{}/{key}: {e}",
                        self.bucket
                    )))
                })?;
                (Some(state), etag)
            }
            None => (None, None),
        };

        let covered = snapshot.as_ref().map_or(0, |s| s.serial);
        let entries = self.read_journal(covered).await?;
        if !entries.is_empty() {
            warn!(
                "Replaying {} journaled change(s) not yet in the snapshot",
                entries.len()
            );
        }
        let state = replay(snapshot, entries)?;

        // The snapshot etag still guards the next write; the serial reflects
        // what was replayed so the next commit continues the journal.
        *revision = Some(Revision {
            etag,
            serial: state.as_ref().map_or(0, |s| s.serial),
        });

        match &state {
            Some(s) => info!("Loaded state for stack {} (serial {})", s.stack, s.serial),
            None => debug!("No state found in S3"),
        }
        Ok(state)
    }

    async fn save(&self, state: &ProvisionedState) -> Result<()> {
        info!("Saving state to s3://{}/{}", self.bucket, self.key(STATE_KEY));

        let mut revision = self.revision.lock().await;
        if let Some(observed) = revision.as_ref() {
            observed.admit(state.serial, WriteKind::Save)?;
        }

        let etag = self.put_snapshot(state, revision.as_ref()).await?;
        *revision = Some(Revision {
            etag,
            serial: state.serial,
        });
        drop(revision);

        self.prune_journal(state.serial).await
    }

    async fn commit(&self, state: &ProvisionedState, change: &StateChange) -> Result<()> {
        let mut revision = self.revision.lock().await;
        if let Some(observed) = revision.as_ref() {
            observed.admit(state.serial, WriteKind::Commit)?;
        }

        self.put_journal(&JournalEntry::for_commit(state, change)).await?;
        let etag = self.put_snapshot(state, revision.as_ref()).await?;
        *revision = Some(Revision {
            etag,
            serial: state.serial,
        });
        drop(revision);

        self.delete_object(&self.journal_key(state.serial)).await?;
        debug!(
            "Committed state serial {} ({}) to S3",
            state.serial,
            change.resource_name()
        );
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.prune_journal(u64::MAX).await?;
        self.delete_object(&self.key(LOCK_KEY)).await?;
        *self.revision.lock().await = None;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(!self.journal_serials().await?.is_empty())
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 head {key} failed: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        if let Some(existing) = self.read_lock().await? {
            if !existing.is_expired() {
                return Err(StackError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(to_json(&lock_info, "lock")?.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 put {key} failed: {e}"))))?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            }
            Some(existing) => debug!(
                "Lock {lock_id} no longer held; current lock is {}",
                existing.lock_id
            ),
            None => {}
        }

        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        let key = self.key(LOCK_KEY);
        warn!("Force-removing state lock s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.read_lock().await?.is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
