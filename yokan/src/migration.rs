//! The migration coordinator: freeze, transfer, and install of a database
//! to another provider.

use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// An object representing an in-progress migration of one database.
///
/// Requesting one from a backend (1) locks all access to the database
/// until the handle is dropped, (2) provides the list of files to ship,
/// and (3) lets the coordinator mark the migration canceled without
/// leaving any observable state change.
pub trait MigrationHandle: Send {
    /// The path relative to which the files returned by `files` are
    /// located.
    fn root(&self) -> String;

    /// The ordered list of files to migrate, relative to `root`.
    fn files(&self) -> Vec<String>;

    /// Marks the migration as canceled.
    fn cancel(&mut self);
}

/// The migration state of one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Accepting operations normally.
    Idle,
    /// Frozen for migration; the backend's write lock is held.
    Migrating,
    /// Migration completed; the database rejects all further operations.
    Migrated,
}

/// Tracks one database's migration state across the
/// `Idle -> Migrating -> {Migrated | Idle}` transitions.
pub struct MigrationCoordinator {
    state: RwLock<MigrationState>,
}

impl MigrationCoordinator {
    pub fn new() -> Self {
        MigrationCoordinator {
            state: RwLock::new(MigrationState::Idle),
        }
    }

    pub async fn state(&self) -> MigrationState {
        *self.state.read().await
    }

    /// Transitions `Idle -> Migrating`. Fails if a migration is already in
    /// progress or the database was already migrated away.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            MigrationState::Idle => {
                *state = MigrationState::Migrating;
                Ok(())
            }
            MigrationState::Migrating => Err(Error::InvalidDatabase("migration already in progress".into())),
            MigrationState::Migrated => Err(Error::InvalidDatabase("database already migrated".into())),
        }
    }

    /// Transitions `Migrating -> Migrated`. Subsequent operations on this
    /// database must be rejected with `INVALID_DATABASE`.
    pub async fn complete(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != MigrationState::Migrating {
            return Err(Error::InvalidDatabase("no migration in progress".into()));
        }
        *state = MigrationState::Migrated;
        Ok(())
    }

    /// Transitions `Migrating -> Idle` with no state change observable
    /// from the outside.
    pub async fn cancel(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != MigrationState::Migrating {
            return Err(Error::InvalidDatabase("no migration in progress".into()));
        }
        *state = MigrationState::Idle;
        Ok(())
    }

    /// Whether the database currently accepts ordinary operations.
    pub async fn accepts_operations(&self) -> bool {
        *self.state.read().await == MigrationState::Idle
    }
}

impl Default for MigrationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
