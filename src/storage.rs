//! Content-addressed, dual-bucket key/value storage.
//!
//! A [`Driver`] exposes two logical key spaces ("buckets"). [`Storage`]
//! tracks which bucket is current; background garbage collection flips the
//! flag and migrates live keys across, so reads must tolerate a key sitting
//! in either bucket, and a flip racing with the read itself.

use std::{
    collections::HashMap,
    ops::Not,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Left,
    Right,
}

impl Not for Bucket {
    type Output = Bucket;

    fn not(self) -> Self::Output {
        match self {
            Bucket::Left => Bucket::Right,
            Bucket::Right => Bucket::Left,
        }
    }
}

impl From<bool> for Bucket {
    fn from(flag: bool) -> Self {
        if flag { Bucket::Right } else { Bucket::Left }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Tried to load an empty key")]
    EmptyKey,
    #[error("Object `{key}` is not found")]
    NotFound { key: String },
    #[error("Failed to store `{key}`")]
    StoreFailed { key: String },
}

pub trait Driver: Send + Sync {
    fn load_from_bucket(&self, key: &str, bucket: Bucket) -> Option<Vec<u8>>;

    fn store(&self, key: &str, value: &[u8], bucket: Bucket) -> bool;
}

#[derive(Default)]
pub struct MemoryDriver {
    left: RwLock<HashMap<String, Vec<u8>>>,
    right: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    fn bucket(&self, bucket: Bucket) -> &RwLock<HashMap<String, Vec<u8>>> {
        match bucket {
            Bucket::Left => &self.left,
            Bucket::Right => &self.right,
        }
    }

    pub fn len(&self, bucket: Bucket) -> usize {
        self.bucket(bucket).read().len()
    }

    pub fn is_empty(&self, bucket: Bucket) -> bool {
        self.len(bucket) == 0
    }
}

impl Driver for MemoryDriver {
    fn load_from_bucket(&self, key: &str, bucket: Bucket) -> Option<Vec<u8>> {
        self.bucket(bucket).read().get(key).cloned()
    }

    fn store(&self, key: &str, value: &[u8], bucket: Bucket) -> bool {
        self.bucket(bucket)
            .write()
            .insert(key.to_owned(), value.to_vec());
        true
    }
}

pub struct Storage {
    driver: Arc<dyn Driver>,
    current_bucket: AtomicBool,
}

impl Storage {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            current_bucket: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDriver::default()))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn current_bucket(&self) -> Bucket {
        self.current_bucket.load(Ordering::Acquire).into()
    }

    /// Switches the current bucket, returning the new one.
    pub fn flip_bucket(&self) -> Bucket {
        (!self.current_bucket.fetch_xor(true, Ordering::AcqRel)).into()
    }

    pub fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let bucket = self.current_bucket();
        let found = self
            .load_non_empty(key, bucket)
            .or_else(|| self.load_non_empty(key, !bucket))
            // the flag may have flipped and the key migrated mid-read
            .or_else(|| self.load_non_empty(key, bucket));

        found.ok_or_else(|| {
            debug!(key, "object not found in either bucket");
            StorageError::NotFound {
                key: key.to_owned(),
            }
        })
    }

    fn load_non_empty(&self, key: &str, bucket: Bucket) -> Option<Vec<u8>> {
        self.driver
            .load_from_bucket(key, bucket)
            .filter(|value| !value.is_empty())
    }

    pub fn store(&self, key: &str, value: &[u8]) -> bool {
        !key.is_empty() && self.driver.store(key, value, self.current_bucket())
    }

    /// Stores `value` under the hex SHA-256 digest of its bytes.
    pub fn store_content(&self, value: &[u8]) -> Result<String, StorageError> {
        let key = Digest::of(value).to_hex();
        if self.store(&key, value) {
            Ok(key)
        } else {
            Err(StorageError::StoreFailed { key })
        }
    }

    /// Copies `key` into the current bucket of `to`.
    ///
    /// When `to` is this storage's own driver the key moves from the
    /// alternate bucket; repeated calls succeed once the key has arrived.
    pub fn migrate(&self, key: &str, to: &dyn Driver) -> bool {
        if key.is_empty() {
            return false;
        }
        let target = self.current_bucket();
        let to_self = std::ptr::addr_eq(to as *const dyn Driver, Arc::as_ptr(&self.driver));
        let source = if to_self { !target } else { target };

        if let Some(value) = self.driver.load_from_bucket(key, source) {
            if to.store(key, &value, target) {
                return true;
            }
            warn!(key, "save failure during migration");
            return false;
        }

        let exists = to.load_from_bucket(key, target).is_some();
        if !exists {
            debug!(key, "missing key during migration");
        }
        exists
    }
}
