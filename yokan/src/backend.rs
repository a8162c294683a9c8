//! The backend capability layer: a uniform key/value operation surface
//! implemented by pluggable storage engines, plus a reference in-memory
//! backend used by tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::migration::MigrationHandle;
use crate::mode::Mode;

/// The operations a backend may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Put,
    Get,
    Exists,
    Length,
    Erase,
    ListKeys,
    ListKeyVals,
    Iter,
}

/// What a backend can do. Operations absent from `supported` fail with
/// [`Error::OpUnsupported`]; `preserves_values` distinguishes kv backends
/// from set backends (which discard values); `range_iteration` advertises
/// ordered traversal.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub preserves_values: bool,
    pub range_iteration: bool,
    supported: [bool; 8],
}

impl Capabilities {
    pub fn kv_default() -> Self {
        Capabilities {
            preserves_values: true,
            range_iteration: true,
            supported: [true; 8],
        }
    }

    fn index(op: Op) -> usize {
        match op {
            Op::Put => 0,
            Op::Get => 1,
            Op::Exists => 2,
            Op::Length => 3,
            Op::Erase => 4,
            Op::ListKeys => 5,
            Op::ListKeyVals => 6,
            Op::Iter => 7,
        }
    }

    pub fn supports(&self, op: Op) -> bool {
        self.supported[Self::index(op)]
    }

    pub fn set_supports(&mut self, op: Op, supported: bool) -> &mut Self {
        self.supported[Self::index(op)] = supported;
        self
    }

    /// Fails with [`Error::OpUnsupported`] unless `op` is supported.
    ///
    /// `Op::Iter` has no dedicated trait method: it gates the engine's
    /// range-scan streaming RPCs (`iter`/`doc_iter`), which are built on top
    /// of [`Backend::list_keys`]/[`Backend::list_keyvals`] the same way
    /// `Op::ListKeyVals` gates the bounded, non-streaming listing RPCs.
    pub fn require(&self, op: Op, name: &'static str) -> Result<()> {
        if self.supports(op) {
            Ok(())
        } else {
            Err(Error::OpUnsupported(name))
        }
    }
}

/// A pluggable storage engine.
///
/// Batch entry points take already-decoded slices pointing into staging
/// buffers; backends never see RDMA handles directly (the request engine
/// pulls/pushes them). Listing and iteration entry points take a filter and
/// invoke a visitor per match, never materialising rejected records.
pub trait Backend: Send + Sync {
    fn capabilities(&self) -> &Capabilities;

    fn count(&self, mode: &Mode) -> Result<u64>;

    fn put(&self, key: &[u8], value: &[u8], mode: &Mode) -> Result<()>;

    fn get(&self, key: &[u8], mode: &Mode) -> Result<Option<Vec<u8>>>;

    fn exists(&self, key: &[u8], mode: &Mode) -> Result<bool>;

    fn length(&self, key: &[u8], mode: &Mode) -> Result<Option<u64>>;

    fn erase(&self, key: &[u8], mode: &Mode) -> Result<()>;

    /// Visits up to `count` keys starting at (or after, depending on
    /// `INCLUSIVE`) `from_key` that satisfy `filter`, in the backend's
    /// ordered traversal order. `visit` returns `false` to stop early.
    fn list_keys(
        &self,
        from_key: &[u8],
        filter: &dyn Filter,
        count: usize,
        mode: &Mode,
        visit: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()>;

    /// Like [`Backend::list_keys`] but also yields the value of each match.
    fn list_keyvals(
        &self,
        from_key: &[u8],
        filter: &dyn Filter,
        count: usize,
        mode: &Mode,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()>;

    /// The backend's own configuration, echoed back for diagnostics.
    fn get_config(&self) -> serde_json::Value;

    /// Deletes all persistent state owned by this backend.
    fn destroy(&self) -> Result<()>;

    /// Freezes the backend for migration and returns a handle describing
    /// the files to ship. See [`crate::migration`].
    fn start_migration(&self) -> Result<Box<dyn MigrationHandle>>;

    /// Recovers backend state from files shipped by a migration source.
    fn recover_from_migration(&self, root: &str, files: &[String]) -> Result<()>;
}

/// A reference in-memory key/value backend (`type = "map"`). Not a
/// production storage engine; used for tests and local development.
pub struct MapBackend {
    data: DashMap<Vec<u8>, Vec<u8>>,
    capabilities: Capabilities,
}

impl MapBackend {
    pub fn new() -> Self {
        MapBackend {
            data: DashMap::new(),
            capabilities: Capabilities::kv_default(),
        }
    }

    fn validate_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            Err(Error::InvalidArgs("key must not be empty".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MapBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MapBackend {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn count(&self, _mode: &Mode) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn put(&self, key: &[u8], value: &[u8], mode: &Mode) -> Result<()> {
        self.capabilities.require(Op::Put, "put")?;
        Self::validate_key(key)?;

        let exists = self.data.contains_key(key);
        if mode.is_new_only() && exists {
            return Err(Error::InvalidArgs("key already exists".into()));
        }
        if mode.is_exist_only() && !exists {
            return Err(Error::InvalidArgs("key does not exist".into()));
        }

        if mode.is_append() {
            let mut entry = self.data.entry(key.to_vec()).or_insert_with(Vec::new);
            entry.extend_from_slice(value);
        } else {
            self.data.insert(key.to_vec(), value.to_vec());
        }
        Ok(())
    }

    fn get(&self, key: &[u8], mode: &Mode) -> Result<Option<Vec<u8>>> {
        self.capabilities.require(Op::Get, "get")?;
        Self::validate_key(key)?;
        let _ = mode;
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    fn exists(&self, key: &[u8], _mode: &Mode) -> Result<bool> {
        self.capabilities.require(Op::Exists, "exists")?;
        Self::validate_key(key)?;
        Ok(self.data.contains_key(key))
    }

    fn length(&self, key: &[u8], _mode: &Mode) -> Result<Option<u64>> {
        self.capabilities.require(Op::Length, "length")?;
        Self::validate_key(key)?;
        Ok(self.data.get(key).map(|v| v.len() as u64))
    }

    fn erase(&self, key: &[u8], _mode: &Mode) -> Result<()> {
        self.capabilities.require(Op::Erase, "erase")?;
        Self::validate_key(key)?;
        self.data.remove(key);
        Ok(())
    }

    fn list_keys(
        &self,
        from_key: &[u8],
        filter: &dyn Filter,
        count: usize,
        mode: &Mode,
        visit: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()> {
        self.capabilities.require(Op::ListKeys, "list_keys")?;
        self.ordered_keys_from(from_key, mode.is_inclusive())
            .filter(|k| filter.check(k, None))
            .take(count)
            .try_for_each(|k| if visit(&k) { Ok(()) } else { Err(()) })
            .ok();
        Ok(())
    }

    fn list_keyvals(
        &self,
        from_key: &[u8],
        filter: &dyn Filter,
        count: usize,
        mode: &Mode,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.capabilities.require(Op::ListKeyVals, "list_keyvals")?;
        for key in self.ordered_keys_from(from_key, mode.is_inclusive()) {
            let value = match self.data.get(&key) {
                Some(v) => v.clone(),
                None => continue,
            };
            if !filter.check(&key, Some(&value)) {
                continue;
            }
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn get_config(&self) -> serde_json::Value {
        serde_json::json!({ "type": "map" })
    }

    fn destroy(&self) -> Result<()> {
        self.data.clear();
        Ok(())
    }

    /// Snapshots the map to a JSON file under a fresh temp directory and
    /// hands that directory/filename pair back as the migration handle.
    /// The destination reads the same file straight off disk: this
    /// in-process reference backend models spec.md's "external file-transfer
    /// subsystem" as same-filesystem file access, since source and
    /// destination share one process here.
    fn start_migration(&self) -> Result<Box<dyn MigrationHandle>> {
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> =
            self.data.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| Error::Other(e.to_string()))?;

        let root = std::env::temp_dir().join(format!("yokan-migration-{}", Uuid::new_v4()));
        fs::create_dir_all(&root)?;
        let file_name = "snapshot.json".to_string();
        fs::write(root.join(&file_name), &bytes)?;

        Ok(Box::new(MapMigrationHandle { root, file_name }))
    }

    fn recover_from_migration(&self, root: &str, files: &[String]) -> Result<()> {
        let file_name = files
            .first()
            .ok_or_else(|| Error::InvalidArgs("migration file list is empty".into()))?;
        let bytes = fs::read(PathBuf::from(root).join(file_name))?;
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> =
            serde_json::from_slice(&bytes).map_err(|e| Error::Other(e.to_string()))?;
        for (key, value) in snapshot {
            self.data.insert(key, value);
        }
        Ok(())
    }
}

/// The migration handle [`MapBackend::start_migration`] hands out: a single
/// JSON snapshot file under a fresh temp directory. `cancel` removes it so a
/// canceled migration leaves no observable trace.
struct MapMigrationHandle {
    root: PathBuf,
    file_name: String,
}

impl MigrationHandle for MapMigrationHandle {
    fn root(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn files(&self) -> Vec<String> {
        vec![self.file_name.clone()]
    }

    fn cancel(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

impl MapBackend {
    fn ordered_keys_from(&self, from_key: &[u8], inclusive: bool) -> impl Iterator<Item = Vec<u8>> {
        let snapshot: BTreeMap<Vec<u8>, ()> = self.data.iter().map(|e| (e.key().clone(), ())).collect();
        let from_key = from_key.to_vec();
        snapshot.into_keys().filter(move |k| {
            if from_key.is_empty() {
                true
            } else if inclusive {
                k.as_slice() >= from_key.as_slice()
            } else {
                k.as_slice() > from_key.as_slice()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PrefixFilter;

    #[test]
    fn put_then_get_returns_exact_value() {
        let backend = MapBackend::new();
        let mode = Mode::new();
        backend.put(b"foo", b"bar", &mode).unwrap();
        assert_eq!(backend.get(b"foo", &mode).unwrap(), Some(b"bar".to_vec()));
    }

    #[test]
    fn empty_key_is_invalid_args() {
        let backend = MapBackend::new();
        let mode = Mode::new();
        assert!(backend.put(b"", b"v", &mode).is_err());
    }

    #[test]
    fn erase_then_exists_is_false() {
        let backend = MapBackend::new();
        let mode = Mode::new();
        backend.put(b"foo", b"bar", &mode).unwrap();
        backend.erase(b"foo", &mode).unwrap();
        assert!(!backend.exists(b"foo", &mode).unwrap());
    }

    #[test]
    fn list_keys_respects_prefix_filter_and_order() {
        let backend = MapBackend::new();
        let mode = Mode::new();
        for (k, v) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3"), ("other", "x")] {
            backend.put(k.as_bytes(), v.as_bytes(), &mode).unwrap();
        }
        let filter = PrefixFilter::new(b"k".to_vec());
        let mut seen = Vec::new();
        backend
            .list_keys(b"", &filter, 10, &mode, &mut |k| {
                seen.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]);
    }

    #[test]
    fn new_only_rejects_existing_key() {
        let backend = MapBackend::new();
        let mut mode = Mode::new();
        backend.put(b"foo", b"bar", &mode).unwrap();
        mode.set_new_only(true);
        assert!(backend.put(b"foo", b"baz", &mode).is_err());
    }

    #[test]
    fn migration_snapshot_round_trips_into_a_fresh_backend() {
        let source = MapBackend::new();
        let mode = Mode::new();
        for (k, v) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3")] {
            source.put(k.as_bytes(), v.as_bytes(), &mode).unwrap();
        }

        let mut handle = source.start_migration().unwrap();
        let destination = MapBackend::new();
        destination.recover_from_migration(&handle.root(), &handle.files()).unwrap();

        for (k, v) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3")] {
            assert_eq!(destination.get(k.as_bytes(), &mode).unwrap(), Some(v.as_bytes().to_vec()));
        }

        let root = handle.root();
        handle.cancel();
        assert!(!std::path::Path::new(&root).exists());
    }
}
