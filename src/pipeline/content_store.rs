use anyhow::Result;
use std::sync::Arc;

use crate::db::{Database, NewStoredPhoto, StoredPhoto};

/// Byte-identical deduplication across users and runs, keyed by content hash.
#[derive(Clone)]
pub struct ContentStore {
    db: Arc<Database>,
}

impl ContentStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Return the stored photo for `hash`, building and inserting it with
    /// `factory` only when the hash is new. Concurrent writers converge on
    /// whichever row landed first.
    pub fn get_or_create<F>(&self, hash: &str, factory: F) -> Result<StoredPhoto>
    where
        F: FnOnce() -> NewStoredPhoto,
    {
        if let Some(existing) = self.db.get_stored_photo(hash)? {
            tracing::debug!(hash, "content store hit");
            return Ok(existing);
        }

        let photo = factory();
        debug_assert_eq!(photo.content_hash, hash);
        self.db.insert_stored_photo(&photo)
    }

    pub fn photo_count(&self) -> Result<usize> {
        self.db.count_stored_photos()
    }
}
