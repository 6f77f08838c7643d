//! Filesystem queue provider for durable single-host queues.
//!
//! Each queue is a directory below the configured data directory:
//!
//! ```text
//! <data_dir>/<queue>/ready/<due>-<entry>.json      waiting for delivery
//! <data_dir>/<queue>/unacked/<due>-<entry>.json    delivered, not yet settled
//! <data_dir>/<queue>/dead/<entry>.json             deliveries exhausted
//! ```
//!
//! Entry names start with a zero-padded enqueue stamp. In `ready/` the name
//! is prefixed with the time the entry becomes available and in `unacked/`
//! with the time its lease expires, both in epoch milliseconds, so a sorted
//! listing can stop at the first entry that is not due yet.
//!
//! Every write goes to a temporary file that is renamed into place, so a crash
//! never leaves a half-written entry behind. A crash between writing the new
//! location and removing the old one leaves the entry in two sets, which
//! results in a duplicate delivery rather than a lost entry.
//!
//! Several processes may share a data directory. Publishing only adds new
//! files and a delivery is only taken back once its lease has expired, so
//! producers never disturb a running consumer. Consumers of the same queue in
//! different processes may occasionally receive the same entry twice.

use crate::client::QueueProvider;
use crate::error::{QueueError, SerializationError};
use crate::message::{
    bytes_serde, Delivery, QueueName, QueueStats, ReceiptHandle, RejectOutcome, Timestamp,
};
use crate::provider::{FilesystemConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "filesystem_tests.rs"]
mod tests;

const READY_DIR: &str = "ready";
const UNACKED_DIR: &str = "unacked";
const DEAD_DIR: &str = "dead";
const ENTRY_EXTENSION: &str = "json";

/// Digits of the due-time prefix; epoch milliseconds fit until the year 2286
const DUE_WIDTH: usize = 13;

// ============================================================================
// Stored Entry Format
// ============================================================================

/// On-disk representation of a queue entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(with = "bytes_serde")]
    body: Bytes,
    enqueued_at: Timestamp,
    delivery_count: u32,
    available_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease: Option<Lease>,
}

/// Ownership record of a delivered entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    consumer: String,
    token: String,
    delivered_at: Timestamp,
    expires_at: Timestamp,
}

impl StoredEntry {
    fn new(body: Bytes) -> Self {
        let now = Timestamp::now();
        Self {
            body,
            enqueued_at: now.clone(),
            delivery_count: 0,
            available_at: now,
            lease: None,
        }
    }

    fn held_by(&self, consumer: &str) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.consumer == consumer)
    }

    fn lease_expired(&self) -> bool {
        self.lease
            .as_ref()
            .map_or(true, |lease| lease.expires_at.has_passed())
    }

    /// Drop the lease and make the entry available in its enqueue position
    fn release(mut self) -> Self {
        self.lease = None;
        self.available_at = self.enqueued_at.clone();
        self
    }
}

// ============================================================================
// FilesystemProvider
// ============================================================================

/// Mutable state guarded by the provider lock
struct StoreState {
    last_stamp: u64,
}

/// Durable queue provider backed by a local directory tree
pub struct FilesystemProvider {
    data_dir: PathBuf,
    config: FilesystemConfig,
    state: Mutex<StoreState>,
}

impl FilesystemProvider {
    /// Open the store, creating the data directory if needed
    ///
    /// Entries delivered by an earlier or concurrent process are left alone;
    /// they are handed out again by [`fetch`](QueueProvider::fetch) once their
    /// lease has expired.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the data directory cannot be created.
    pub async fn open(config: FilesystemConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let data_dir = config.data_dir.clone();
        fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| QueueError::storage("Failed to create data directory", e))?;

        info!(data_dir = %data_dir.display(), "Opened filesystem queue store");
        Ok(Self {
            data_dir,
            config,
            state: Mutex::new(StoreState { last_stamp: 0 }),
        })
    }

    /// Root directory of the store
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn queue_dir(&self, queue: &QueueName, set: &str) -> PathBuf {
        self.data_dir.join(queue.as_str()).join(set)
    }

    fn entry_path(&self, queue: &QueueName, set: &str, stem: &str) -> PathBuf {
        self.queue_dir(queue, set)
            .join(stem)
            .with_extension(ENTRY_EXTENSION)
    }

    /// Next entry name; stamps are strictly increasing within this process
    fn next_entry_name(state: &mut StoreState) -> String {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .unsigned_abs();
        let stamp = now.max(state.last_stamp + 1);
        state.last_stamp = stamp;
        format!("{:020}-{}", stamp, uuid::Uuid::new_v4().simple())
    }

    /// Write `entry` as `to` and remove `from`; each is a (set, file stem) pair
    async fn move_entry(
        &self,
        queue: &QueueName,
        entry: &StoredEntry,
        from: (&str, &str),
        to: (&str, &str),
    ) -> Result<(), QueueError> {
        let (to_set, to_stem) = to;
        fs::create_dir_all(self.queue_dir(queue, to_set))
            .await
            .map_err(|e| QueueError::storage("Failed to create queue directory", e))?;
        write_entry(&self.entry_path(queue, to_set, to_stem), entry).await?;

        let (from_set, from_stem) = from;
        remove_entry(&self.entry_path(queue, from_set, from_stem)).await
    }

    /// Move a leased entry back to ready, or to dead once it used up its deliveries
    async fn return_unacked(
        &self,
        queue: &QueueName,
        stem: &str,
        entry: StoredEntry,
        dead_letter: bool,
    ) -> Result<(), QueueError> {
        let name = entry_name(stem);
        if dead_letter {
            let entry = StoredEntry { lease: None, ..entry };
            return self
                .move_entry(queue, &entry, (UNACKED_DIR, stem), (DEAD_DIR, name))
                .await;
        }

        let entry = entry.release();
        let ready_stem = due_stem(&entry.available_at, name);
        self.move_entry(queue, &entry, (UNACKED_DIR, stem), (READY_DIR, &ready_stem))
            .await
    }

    /// Return every unacknowledged entry accepted by `owned` to ready
    async fn release_matching<F>(&self, queue: &QueueName, owned: F) -> Result<usize, QueueError>
    where
        F: Fn(&StoredEntry) -> bool + Send,
    {
        let mut released = 0;
        for stem in list_entries(&self.queue_dir(queue, UNACKED_DIR)).await? {
            let Some(entry) = self.load_or_quarantine(queue, UNACKED_DIR, &stem).await? else {
                continue;
            };
            if !owned(&entry) {
                continue;
            }

            self.return_unacked(queue, &stem, entry, false).await?;
            released += 1;
        }

        Ok(released)
    }

    /// Take back deliveries whose lease has run out
    async fn reclaim_expired(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let now = now_millis();
        let policy = &self.config.redelivery;

        let mut reclaimed = 0;
        for stem in list_entries(&self.queue_dir(queue, UNACKED_DIR)).await? {
            let Some(expires) = due_millis(&stem) else {
                continue;
            };
            if expires > now {
                break;
            }

            let Some(entry) = self.load_or_quarantine(queue, UNACKED_DIR, &stem).await? else {
                continue;
            };
            if !entry.lease_expired() {
                continue;
            }

            warn!(
                queue = %queue,
                entry = entry_name(&stem),
                delivery_count = entry.delivery_count,
                "Lease expired, reclaiming delivery"
            );
            let dead_letter = policy.should_dead_letter(entry.delivery_count);
            self.return_unacked(queue, &stem, entry, dead_letter).await?;
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Lease one ready entry to `consumer`; `None` if it is gone or not yet due
    async fn lease_entry(
        &self,
        queue: &QueueName,
        stem: &str,
        consumer: &str,
        delivered_at: &Timestamp,
        expires_at: &Timestamp,
    ) -> Result<Option<Delivery>, QueueError> {
        let Some(mut entry) = self.load_or_quarantine(queue, READY_DIR, stem).await? else {
            return Ok(None);
        };
        if !entry.available_at.has_passed() {
            return Ok(None);
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        entry.delivery_count += 1;
        entry.lease = Some(Lease {
            consumer: consumer.to_string(),
            token: token.clone(),
            delivered_at: delivered_at.clone(),
            expires_at: expires_at.clone(),
        });

        let leased_stem = due_stem(expires_at, entry_name(stem));
        self.move_entry(queue, &entry, (READY_DIR, stem), (UNACKED_DIR, &leased_stem))
            .await?;

        Ok(Some(Delivery {
            receipt_handle: ReceiptHandle::new(
                format!("{}:{}", leased_stem, token),
                queue.clone(),
                consumer.to_string(),
                ProviderType::Filesystem,
            ),
            body: entry.body,
            delivery_count: entry.delivery_count,
            enqueued_at: entry.enqueued_at,
            delivered_at: delivered_at.clone(),
        }))
    }

    /// Read an entry; unreadable entries are moved to the dead-letter set
    async fn load_or_quarantine(
        &self,
        queue: &QueueName,
        set: &str,
        stem: &str,
    ) -> Result<Option<StoredEntry>, QueueError> {
        let path = self.entry_path(queue, set, stem);
        match read_entry(&path).await {
            Ok(entry) => Ok(entry),
            Err(QueueError::SerializationError(e)) => {
                warn!(
                    queue = %queue,
                    entry = stem,
                    error = %e,
                    "Corrupt queue entry, moving to dead-letter set"
                );
                let dead_dir = self.queue_dir(queue, DEAD_DIR);
                fs::create_dir_all(&dead_dir)
                    .await
                    .map_err(|e| QueueError::storage("Failed to create queue directory", e))?;
                fs::rename(&path, dead_dir.join(stem).with_extension("corrupt"))
                    .await
                    .map_err(|e| QueueError::storage("Failed to quarantine entry", e))?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Load the unacknowledged entry a receipt refers to
    async fn leased_entry(
        &self,
        receipt: &ReceiptHandle,
    ) -> Result<(String, StoredEntry), QueueError> {
        let not_found = || QueueError::MessageNotFound {
            receipt: receipt.to_string(),
        };

        if receipt.provider_type() != ProviderType::Filesystem {
            return Err(not_found());
        }

        let (stem, token) = parse_handle(receipt.handle()).ok_or_else(not_found)?;
        let path = self.entry_path(receipt.queue(), UNACKED_DIR, stem);
        let entry = read_entry(&path).await?.ok_or_else(not_found)?;

        let leased = entry
            .lease
            .as_ref()
            .is_some_and(|lease| lease.token == token && lease.consumer == receipt.consumer());
        if !leased {
            return Err(not_found());
        }

        Ok((stem.to_string(), entry))
    }
}

#[async_trait]
impl QueueProvider for FilesystemProvider {
    async fn publish(&self, queue: &QueueName, body: Bytes) -> Result<(), QueueError> {
        let max_size = self.provider_type().max_message_size();
        if body.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: body.len(),
                max_size,
            });
        }

        let mut state = self.state.lock().await;
        let name = Self::next_entry_name(&mut state);
        let entry = StoredEntry::new(body);
        let stem = due_stem(&entry.available_at, &name);

        let ready_dir = self.queue_dir(queue, READY_DIR);
        fs::create_dir_all(&ready_dir)
            .await
            .map_err(|e| QueueError::storage("Failed to create queue directory", e))?;
        write_entry(&self.entry_path(queue, READY_DIR, &stem), &entry).await?;

        debug!(queue = %queue, entry = %name, "Stored entry");
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        consumer: &str,
        max_deliveries: u32,
    ) -> Result<Vec<Delivery>, QueueError> {
        let _guard = self.state.lock().await;

        self.reclaim_expired(queue).await?;

        let now = now_millis();
        let delivered_at = Timestamp::now();
        let expires_at = Timestamp::after_millis(self.config.redelivery.visibility_timeout_ms);
        let mut deliveries = Vec::new();
        for stem in list_entries(&self.queue_dir(queue, READY_DIR)).await? {
            if deliveries.len() >= max_deliveries as usize {
                break;
            }
            let Some(due) = due_millis(&stem) else {
                continue;
            };
            if due > now {
                break;
            }

            match self
                .lease_entry(queue, &stem, consumer, &delivered_at, &expires_at)
                .await
            {
                Ok(Some(delivery)) => deliveries.push(delivery),
                Ok(None) => {}
                Err(e) if deliveries.is_empty() => return Err(e),
                Err(e) => {
                    // Entries leased so far must reach the consumer
                    warn!(
                        queue = %queue,
                        consumer,
                        leased = deliveries.len(),
                        error = %e,
                        "Failed to lease entry, delivering partial batch"
                    );
                    break;
                }
            }
        }

        Ok(deliveries)
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let _guard = self.state.lock().await;

        let (stem, _) = self.leased_entry(receipt).await?;
        remove_entry(&self.entry_path(receipt.queue(), UNACKED_DIR, &stem)).await
    }

    async fn reject(&self, receipt: &ReceiptHandle) -> Result<RejectOutcome, QueueError> {
        let _guard = self.state.lock().await;

        let (stem, mut entry) = self.leased_entry(receipt).await?;
        let queue = receipt.queue();
        let policy = &self.config.redelivery;

        if policy.should_dead_letter(entry.delivery_count) {
            self.return_unacked(queue, &stem, entry, true).await?;
            return Ok(RejectOutcome::DeadLettered);
        }

        entry.lease = None;
        entry.available_at = Timestamp::after_millis(policy.redelivery_delay_ms);
        let ready_stem = due_stem(&entry.available_at, entry_name(&stem));
        self.move_entry(queue, &entry, (UNACKED_DIR, &stem), (READY_DIR, &ready_stem))
            .await?;
        Ok(RejectOutcome::Requeued {
            available_at: entry.available_at,
        })
    }

    async fn recover(&self, queue: &QueueName, consumer: &str) -> Result<usize, QueueError> {
        let _guard = self.state.lock().await;
        self.release_matching(queue, |entry| entry.held_by(consumer))
            .await
    }

    async fn redrive_dead_letters(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let _guard = self.state.lock().await;

        let mut redriven = 0;
        for name in list_entries(&self.queue_dir(queue, DEAD_DIR)).await? {
            let path = self.entry_path(queue, DEAD_DIR, &name);
            let mut entry = match read_entry(&path).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(queue = %queue, entry = %name, error = %e, "Skipping unreadable dead-lettered entry");
                    continue;
                }
            };

            entry.lease = None;
            entry.delivery_count = 0;
            entry.available_at = Timestamp::now();
            let ready_stem = due_stem(&entry.available_at, &name);
            self.move_entry(queue, &entry, (DEAD_DIR, &name), (READY_DIR, &ready_stem))
                .await?;
            redriven += 1;
        }

        Ok(redriven)
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, QueueError> {
        let _guard = self.state.lock().await;

        Ok(QueueStats {
            ready: list_entries(&self.queue_dir(queue, READY_DIR)).await?.len(),
            unacked: list_entries(&self.queue_dir(queue, UNACKED_DIR)).await?.len(),
            dead_lettered: list_entries(&self.queue_dir(queue, DEAD_DIR)).await?.len(),
        })
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Filesystem
    }
}

// ============================================================================
// Name Helpers
// ============================================================================

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// File stem ordering `name` by the time `due`
fn due_stem(due: &Timestamp, name: &str) -> String {
    let millis = u64::try_from(due.as_datetime().timestamp_millis()).unwrap_or_default();
    format!("{:0width$}-{}", millis, name, width = DUE_WIDTH)
}

/// Due time of a due-ordered file stem; `None` for foreign files
fn due_millis(stem: &str) -> Option<u64> {
    let (due, name) = stem.split_once('-')?;
    if due.len() != DUE_WIDTH || name.is_empty() {
        return None;
    }
    due.parse().ok()
}

/// Entry name within a due-ordered file stem
fn entry_name(stem: &str) -> &str {
    match due_millis(stem) {
        Some(_) => &stem[DUE_WIDTH + 1..],
        None => stem,
    }
}

/// Split a receipt handle into file stem and lease token
fn parse_handle(handle: &str) -> Option<(&str, &str)> {
    let (stem, token) = handle.split_once(':')?;
    let valid_stem = !stem.is_empty() && stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid_stem || token.is_empty() {
        return None;
    }
    Some((stem, token))
}

// ============================================================================
// File Helpers
// ============================================================================

/// Sorted entry file stems in a set directory; a missing directory is empty
async fn list_entries(dir: &Path) -> Result<Vec<String>, QueueError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::storage("Failed to list entries", e)),
    };

    let mut stems = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| QueueError::storage("Failed to list entries", e))?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            stems.push(stem.to_string());
        }
    }

    stems.sort();
    Ok(stems)
}

/// Read an entry file; `None` if it does not exist
async fn read_entry(path: &Path) -> Result<Option<StoredEntry>, QueueError> {
    let json = match fs::read(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QueueError::storage("Failed to read entry", e)),
    };

    let entry = serde_json::from_slice(&json).map_err(SerializationError::from)?;
    Ok(Some(entry))
}

/// Atomically replace the entry at `path`
async fn write_entry(path: &Path, entry: &StoredEntry) -> Result<(), QueueError> {
    let json = serde_json::to_vec_pretty(entry).map_err(SerializationError::from)?;

    // Unique per write so processes sharing the directory never collide
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| QueueError::storage("Failed to create temp file", e))?;
    file.write_all(&json)
        .await
        .map_err(|e| QueueError::storage("Failed to write entry", e))?;
    file.sync_all()
        .await
        .map_err(|e| QueueError::storage("Failed to sync entry", e))?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| QueueError::storage("Failed to rename temp file", e))
}

async fn remove_entry(path: &Path) -> Result<(), QueueError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(QueueError::storage("Failed to remove entry", e)),
    }
}
