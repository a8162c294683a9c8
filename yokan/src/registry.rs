//! The database registry: per-provider database lifecycle, locking, and the
//! id/name index.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::backend::{Backend, MapBackend};
use crate::config::DatabaseConfig;
use crate::document::DocumentStore;
use crate::error::{Error, Result};
use crate::migration::MigrationCoordinator;

/// A factory building a backend instance from its JSON configuration.
pub type BackendFactory = fn(&serde_json::Value) -> Result<Arc<dyn Backend>>;

fn map_backend_factory(_config: &serde_json::Value) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(MapBackend::new()))
}

/// One open database: a backend instance, its per-operation lock, its
/// migration state, and the document layer built on top of it.
pub struct Database {
    pub id: Uuid,
    pub name: Option<String>,
    backend: Arc<dyn Backend>,
    /// Per-database operation lock: reads take the read side, mutations the
    /// write side. Listings hold the read side across all their batches.
    op_lock: RwLock<()>,
    migration: MigrationCoordinator,
    documents: DocumentStore,
}

impl Database {
    fn new(id: Uuid, name: Option<String>, backend: Arc<dyn Backend>) -> Self {
        Database {
            id,
            name,
            documents: DocumentStore::new(backend.clone()),
            backend,
            op_lock: RwLock::new(()),
            migration: MigrationCoordinator::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn migration(&self) -> &MigrationCoordinator {
        &self.migration
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.op_lock.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.op_lock.write().await
    }
}

/// Holds the provider's live databases, keyed by id and, secondarily, by
/// name.
///
/// `structural` guards transitions between the two index maps (open,
/// close, destroy); routine lookups only need to read the (already
/// internally concurrent) maps and do not contend with it.
pub struct Registry {
    by_id: DashMap<Uuid, Arc<Database>>,
    by_name: DashMap<String, Uuid>,
    backend_factories: DashMap<String, BackendFactory>,
    structural: RwLock<()>,
}

impl Registry {
    pub fn new() -> Self {
        let registry = Registry {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            backend_factories: DashMap::new(),
            structural: RwLock::new(()),
        };
        registry.register_backend("map", map_backend_factory);
        registry
    }

    /// Registers a backend type for use by `open_db`.
    pub fn register_backend(&self, backend_type: &str, factory: BackendFactory) {
        self.backend_factories.insert(backend_type.to_string(), factory);
    }

    /// Opens a new database, rejecting invalid configuration before any
    /// storage is created.
    #[instrument(skip(self, config))]
    pub async fn open(&self, config: DatabaseConfig) -> Result<Uuid> {
        let factory = *self
            .backend_factories
            .get(&config.backend_type)
            .ok_or_else(|| Error::InvalidBackend(config.backend_type.clone()))?;

        let _guard = self.structural.write().await;

        if let Some(name) = &config.name {
            if self.by_name.contains_key(name) {
                return Err(Error::InvalidArgs(format!("database name already in use: {}", name)));
            }
        }

        let backend = factory(&config.config)?;
        let id = Uuid::new_v4();
        let db = Arc::new(Database::new(id, config.name.clone(), backend));

        self.by_id.insert(id, db);
        if let Some(name) = config.name {
            self.by_name.insert(name, id);
        }
        Ok(id)
    }

    /// Looks up a database id by name.
    pub fn find_by_name(&self, name: &str) -> Result<Uuid> {
        self.by_name
            .get(name)
            .map(|e| *e.value())
            .ok_or_else(|| Error::InvalidDatabase(format!("no database named {}", name)))
    }

    /// A snapshot of every live database id.
    pub fn list_dbs(&self) -> Vec<Uuid> {
        self.by_id.iter().map(|e| *e.key()).collect()
    }

    /// Resolves a database for an ordinary (non-migration) operation.
    /// Fails if the database is unknown or mid-migration.
    pub async fn get(&self, id: Uuid) -> Result<Arc<Database>> {
        let db = self
            .by_id
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::InvalidDatabase(id.to_string()))?;
        if !db.migration().accepts_operations().await {
            return Err(Error::InvalidDatabase(format!("{} is mid-migration", id)));
        }
        Ok(db)
    }

    /// Resolves a database for a migration-internal RPC, bypassing the
    /// migration-state check ordinary operations are subject to.
    pub fn get_any(&self, id: Uuid) -> Result<Arc<Database>> {
        self.by_id
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::InvalidDatabase(id.to_string()))
    }

    /// Drops the in-memory handle for a database without touching its
    /// persistent state.
    #[instrument(skip(self))]
    pub async fn close(&self, id: Uuid) -> Result<()> {
        let _guard = self.structural.write().await;
        let db = self
            .by_id
            .remove(&id)
            .ok_or_else(|| Error::InvalidDatabase(id.to_string()))?
            .1;
        if let Some(name) = &db.name {
            self.by_name.remove(name);
        }
        Ok(())
    }

    /// Deletes a database's persistent state and drops its handle. Valid
    /// from the `Idle` and `Migrated` migration states; rejected mid-flight.
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: Uuid) -> Result<()> {
        let _guard = self.structural.write().await;
        let db = self
            .by_id
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::InvalidDatabase(id.to_string()))?;
        if db.migration().state().await == crate::migration::MigrationState::Migrating {
            return Err(Error::InvalidDatabase(format!("{} is mid-migration", id)));
        }

        let db = self.by_id.remove(&id).expect("checked above").1;
        if let Some(name) = &db.name {
            self.by_name.remove(name);
        }
        db.backend().destroy()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
