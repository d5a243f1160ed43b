//! File-per-subscription store.

use super::SubscriptionStore;
use crate::error::{BrokerError, Result};
use crate::subscriptions::{Subscription, SubscriptionRecord};
use crate::types::Timestamp;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for subscription files.
const RECORD_MAGIC: &[u8; 4] = b"SUB\0";

/// Current record format version.
const RECORD_VERSION: u8 = 1;

const RECORD_EXTENSION: &str = "sub";

const TEMP_EXTENSION: &str = "tmp";

const LOCK_FILE: &str = ".lock";

/// Header: magic + version + payload length.
const HEADER_LEN: usize = 4 + 1 + 8;

/// Durable store writing one `<id>.sub` file per subscription.
///
/// Each write goes to `<id>.sub.tmp` first and is renamed over the record,
/// so readers see either the old or the new record, never a torn one.
pub struct FileSubscriptionStore {
    /// Directory holding the records.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Decoded records, keyed by id. Also serializes all file access.
    cache: Mutex<LruCache<String, Subscription>>,
}

impl FileSubscriptionStore {
    /// Open the store at `path`, creating the directory on first use.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| BrokerError::Locked)?;

        Self::remove_stale_temp_files(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        debug!(path = %path.display(), "Opened subscription store");

        Ok(Self {
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leftovers of writes interrupted before their rename.
    fn remove_stale_temp_files(path: &Path) -> Result<()> {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                warn!(file = %file_path.display(), "Removing interrupted subscription write");
                fs::remove_file(&file_path)?;
            }
        }
        Ok(())
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.path.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.path
            .join(format!("{}.{}.{}", id, RECORD_EXTENSION, TEMP_EXTENSION))
    }

    /// Ids become file names, so only a conservative character set is accepted.
    fn validate_id(id: &str) -> Result<()> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(BrokerError::InvalidSubscriptionId(id.to_string()))
        }
    }

    fn encode(subscription: &Subscription) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec(&subscription.to_record())?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
        bytes.extend_from_slice(RECORD_MAGIC);
        bytes.push(RECORD_VERSION);
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Subscription> {
        if bytes.len() < HEADER_LEN + 4 {
            return Err(BrokerError::InvalidFormat("Truncated subscription record".into()));
        }
        if &bytes[0..4] != RECORD_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid subscription magic".into()));
        }
        if bytes[4] != RECORD_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported subscription version: {}",
                bytes[4]
            )));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[5..HEADER_LEN]);
        let available = bytes.len() - HEADER_LEN - 4;
        let len = usize::try_from(u64::from_le_bytes(len_bytes))
            .ok()
            .filter(|len| *len == available)
            .ok_or_else(|| {
                BrokerError::InvalidFormat("Subscription record length mismatch".into())
            })?;

        let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&bytes[HEADER_LEN + len..]);
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(payload);

        if stored_checksum != computed_checksum {
            return Err(BrokerError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let record: SubscriptionRecord = rmp_serde::from_slice(payload)?;
        Ok(Subscription::from_record(record))
    }

    /// Write-to-temp then rename. Caller holds the cache lock.
    fn write_record(&self, subscription: &Subscription) -> Result<()> {
        Self::validate_id(&subscription.id)?;

        let bytes = Self::encode(subscription)?;
        let temp_path = self.temp_path(&subscription.id);

        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.record_path(&subscription.id))?;

        // Persist the rename itself where the platform allows it.
        if let Ok(dir) = File::open(&self.path) {
            let _ = dir.sync_all();
        }

        Ok(())
    }

    /// Read one record from disk. `Ok(None)` if the file does not exist.
    fn read_record(&self, id: &str) -> Result<Option<Subscription>> {
        Self::validate_id(id)?;

        match fs::read(self.record_path(id)) {
            Ok(bytes) => Self::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self, cache: &mut LruCache<String, Subscription>, id: &str) -> Result<Option<Subscription>> {
        if let Some(cached) = cache.get(id) {
            return Ok(Some(cached.clone()));
        }

        let loaded = self.read_record(id)?;
        if let Some(ref subscription) = loaded {
            cache.put(id.to_string(), subscription.clone());
        }
        Ok(loaded)
    }
}

impl SubscriptionStore for FileSubscriptionStore {
    fn store_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut cache = self.cache.lock();
        self.write_record(subscription)?;
        cache.put(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    fn get_subscription(&self, id: &str) -> Option<Subscription> {
        let mut cache = self.cache.lock();
        match self.load(&mut cache, id) {
            Ok(found) => found,
            Err(e) => {
                warn!(subscription_id = %id, error = %e, "Could not read subscription");
                None
            }
        }
    }

    fn get_all_subscriptions(&self) -> Vec<Subscription> {
        let mut cache = self.cache.lock();

        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read storage directory");
                return Vec::new();
            }
        };

        let mut result = Vec::new();
        for entry in entries.flatten() {
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(id) = file_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match self.load(&mut cache, id) {
                Ok(Some(subscription)) => result.push(subscription),
                Ok(None) => {}
                Err(e) => {
                    warn!(file = %file_path.display(), error = %e, "Skipping unreadable subscription record");
                }
            }
        }

        result
    }

    fn delete_subscription(&self, id: &str) -> Result<Subscription> {
        let mut cache = self.cache.lock();

        let existing = match self.load(&mut cache, id) {
            Ok(Some(subscription)) => subscription,
            Ok(None) => return Err(BrokerError::UnknownSubscription(id.to_string())),
            Err(BrokerError::InvalidSubscriptionId(_)) => {
                return Err(BrokerError::UnknownSubscription(id.to_string()))
            }
            Err(e) => {
                // The record is unusable either way; drop the file.
                warn!(subscription_id = %id, error = %e, "Deleting unreadable subscription record");
                fs::remove_file(self.record_path(id))?;
                return Err(e);
            }
        };

        cache.pop(id);
        fs::remove_file(self.record_path(id))?;
        Ok(existing)
    }

    fn update_termination_time(
        &self,
        id: &str,
        termination_time: Timestamp,
    ) -> Result<Subscription> {
        let mut cache = self.cache.lock();

        let existing = self
            .load(&mut cache, id)
            .ok()
            .flatten()
            .ok_or_else(|| BrokerError::UnknownSubscription(id.to_string()))?;

        let updated = existing.renewed(termination_time);
        self.write_record(&updated)?;
        cache.put(id.to_string(), updated.clone());
        Ok(updated)
    }
}
