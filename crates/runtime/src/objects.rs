//! Content-addressed object storage for payloads too large to keep in history
//!
//! Keys are the sha256 of the canonical JSON encoding, so writing the same
//! value twice (for example while a workflow replays) yields the same key.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors from object storage
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectRef),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pointer to an externally stored value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// `sha256:<hex digest>`
    pub key: String,
    /// Encoded size in bytes
    pub size: usize,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.key, self.size)
    }
}

/// Storage for large payloads
///
/// Synchronous because workflow callbacks read through it while applying
/// events.
pub trait ObjectStore: Send + Sync + 'static {
    /// Store a value, returning its content address
    fn put(&self, value: &Value) -> Result<ObjectRef, ObjectStoreError>;

    /// Load a previously stored value
    fn get(&self, object: &ObjectRef) -> Result<Value, ObjectStoreError>;
}

/// Compute the content address of an encoded payload
pub fn content_key(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{}", hex::encode(digest))
}

/// In-memory object store
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, value: &Value) -> Result<ObjectRef, ObjectStoreError> {
        let bytes = serde_json::to_vec(value)?;
        let key = content_key(&bytes);
        let size = bytes.len();
        self.objects.write().entry(key.clone()).or_insert(bytes);
        Ok(ObjectRef { key, size })
    }

    fn get(&self, object: &ObjectRef) -> Result<Value, ObjectStoreError> {
        let objects = self.objects.read();
        let bytes = objects
            .get(&object.key)
            .ok_or_else(|| ObjectStoreError::NotFound(object.clone()))?;
        Ok(serde_json::from_slice(bytes)?)
    }
}
