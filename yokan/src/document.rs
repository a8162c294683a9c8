//! The document layer: an integer-ID document store built over the key/value
//! surface of [`crate::backend`].
//!
//! Documents live under a reserved key schema: `coll_name || 0x00 ||
//! id_be64`. Encoding the id big-endian makes key order match id order. A
//! sibling key, `coll_name || 0x01`, holds the collection's metadata
//! (`next_id`, `count`) as JSON.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::mode::Mode;

const DOC_SEPARATOR: u8 = 0x00;
const META_SEPARATOR: u8 = 0x01;

fn doc_key(collection: &str, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + 1 + 8);
    key.extend_from_slice(collection.as_bytes());
    key.push(DOC_SEPARATOR);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn doc_prefix(collection: &str) -> Vec<u8> {
    let mut key = collection.as_bytes().to_vec();
    key.push(DOC_SEPARATOR);
    key
}

fn meta_key(collection: &str) -> Vec<u8> {
    let mut key = collection.as_bytes().to_vec();
    key.push(META_SEPARATOR);
    key
}

fn id_from_doc_key(key: &[u8], collection: &str) -> Option<u64> {
    let prefix = doc_prefix(collection);
    if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[prefix.len()..]);
    Some(u64::from_be_bytes(bytes))
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionMeta {
    next_id: u64,
    count: u64,
}

/// A document store layered over one backend.
///
/// Each collection's `store`/`update`/`drop` operations take that
/// collection's own lock so `next_id`/`count` stay consistent even though
/// the underlying backend has no cross-key transactions.
pub struct DocumentStore {
    backend: Arc<dyn Backend>,
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        DocumentStore {
            backend,
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, collection: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_meta(&self, collection: &str, mode: &Mode) -> Result<Option<CollectionMeta>> {
        match self.backend.get(&meta_key(collection), mode)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| Error::Other(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn write_meta(&self, collection: &str, meta: &CollectionMeta, mode: &Mode) -> Result<()> {
        let bytes = serde_json::to_vec(meta).map_err(|e| Error::Other(e.to_string()))?;
        self.backend.put(&meta_key(collection), &bytes, mode)
    }

    /// Creates a collection. Fails if it already exists.
    pub async fn create(&self, collection: &str) -> Result<()> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        let mode = Mode::new();
        if self.read_meta(collection, &mode)?.is_some() {
            return Err(Error::InvalidArgs(format!("collection already exists: {}", collection)));
        }
        self.write_meta(collection, &CollectionMeta { next_id: 0, count: 0 }, &mode)
    }

    /// Drops a collection and every document in it.
    pub async fn drop(&self, collection: &str) -> Result<()> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        let mode = Mode::new();
        if self.read_meta(collection, &mode)?.is_none() {
            return Err(Error::InvalidArgs(format!("no such collection: {}", collection)));
        }

        let prefix = doc_prefix(collection);
        let mut to_erase = Vec::new();
        self.backend.list_keys(&prefix, &crate::filter::PrefixFilter::new(prefix.clone()), usize::MAX, &mode, &mut |k| {
            to_erase.push(k.to_vec());
            true
        })?;
        for key in to_erase {
            self.backend.erase(&key, &mode)?;
        }
        self.backend.erase(&meta_key(collection), &mode)
    }

    pub fn exists(&self, collection: &str) -> Result<bool> {
        Ok(self.read_meta(collection, &Mode::new())?.is_some())
    }

    pub fn size(&self, collection: &str) -> Result<u64> {
        self.require_meta(collection).map(|m| m.count)
    }

    pub fn last_id(&self, collection: &str) -> Result<u64> {
        self.require_meta(collection).map(|m| m.next_id)
    }

    fn require_meta(&self, collection: &str) -> Result<CollectionMeta> {
        self.read_meta(collection, &Mode::new())?
            .ok_or_else(|| Error::InvalidArgs(format!("no such collection: {}", collection)))
    }

    /// Stores a new document, assigning and returning its id.
    pub async fn store(&self, collection: &str, doc: &[u8]) -> Result<u64> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        let mode = Mode::new();
        let mut meta = self
            .read_meta(collection, &mode)?
            .ok_or_else(|| Error::InvalidArgs(format!("no such collection: {}", collection)))?;

        let id = meta.next_id;
        self.backend.put(&doc_key(collection, id), doc, &mode)?;
        meta.next_id += 1;
        meta.count += 1;
        self.write_meta(collection, &meta, &mode)?;
        Ok(id)
    }

    /// Stores several documents in one collection, returning their ids in
    /// order.
    pub async fn store_multi(&self, collection: &str, docs: &[&[u8]]) -> Result<Vec<u64>> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        let mode = Mode::new();
        let mut meta = self
            .read_meta(collection, &mode)?
            .ok_or_else(|| Error::InvalidArgs(format!("no such collection: {}", collection)))?;

        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = meta.next_id;
            self.backend.put(&doc_key(collection, id), doc, &mode)?;
            meta.next_id += 1;
            meta.count += 1;
            ids.push(id);
        }
        self.write_meta(collection, &meta, &mode)?;
        Ok(ids)
    }

    pub fn load(&self, collection: &str, id: u64) -> Result<Option<Vec<u8>>> {
        self.backend.get(&doc_key(collection, id), &Mode::new())
    }

    /// The byte length of one stored document, or `None` if `id` does not
    /// exist.
    pub fn length(&self, collection: &str, id: u64) -> Result<Option<u64>> {
        self.backend.length(&doc_key(collection, id), &Mode::new())
    }

    /// Overwrites an existing document. Fails with `InvalidId` if `id`
    /// does not exist, unless `mode` carries `UPDATE_NEW`.
    pub async fn update(&self, collection: &str, id: u64, doc: &[u8], mode: &Mode) -> Result<()> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;

        let key = doc_key(collection, id);
        let exists = self.backend.exists(&key, mode)?;
        if !exists && !mode.is_update_new() {
            return Err(Error::InvalidId(id));
        }
        self.backend.put(&key, doc, mode)?;

        if !exists {
            let mut meta = self.require_meta(collection)?;
            meta.count += 1;
            meta.next_id = meta.next_id.max(id + 1);
            self.write_meta(collection, &meta, mode)?;
        }
        Ok(())
    }

    pub async fn erase(&self, collection: &str, id: u64) -> Result<()> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        let mode = Mode::new();
        let key = doc_key(collection, id);
        if !self.backend.exists(&key, &mode)? {
            return Err(Error::InvalidId(id));
        }
        self.backend.erase(&key, &mode)?;
        let mut meta = self.require_meta(collection)?;
        meta.count = meta.count.saturating_sub(1);
        self.write_meta(collection, &meta, &mode)
    }

    /// Visits up to `count` documents starting at `from_id` that satisfy
    /// `filter`, in id order.
    pub fn list(
        &self,
        collection: &str,
        from_id: u64,
        filter: &dyn Filter,
        count: usize,
        mode: &Mode,
        visit: &mut dyn FnMut(u64, &[u8]) -> bool,
    ) -> Result<()> {
        let from_key = doc_key(collection, from_id);
        let prefix = doc_prefix(collection);
        let mut matched = 0usize;
        self.backend.list_keyvals(&from_key, &crate::filter::PrefixFilter::new(prefix.clone()), usize::MAX, mode, &mut |k, v| {
            if matched >= count {
                return false;
            }
            let id = match id_from_doc_key(k, collection) {
                Some(id) => id,
                None => return true,
            };
            if !filter.check_doc(id, v) {
                return true;
            }
            matched += 1;
            visit(id, v)
        })?;
        Ok(())
    }
}
