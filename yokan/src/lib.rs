//! `yokan` is a provider-side request engine for a distributed key/value and
//! document storage microservice.
//!
//! This crate implements the storage-and-dispatch core of such a service: a
//! database registry with id/name lookup and migration, a pluggable backend
//! capability layer, a document layer built over it, a bulk wire codec for
//! batched operations, a staging buffer cache, a filter plane (prefix,
//! suffix, Lua, and native plugin filters), and a request engine tying all
//! of it together across direct, bulk-pull, and streaming back-RPC request
//! shapes. The RDMA-capable transport fabric itself is out of scope (see
//! [`transport`]) — this crate defines the traits a real transport drives
//! and an in-process implementation sufficient to exercise the whole
//! engine.
//!
//! # Optional Features
//!
//! - **`lua-filter`** — Lua chunk filters via `mlua` (default).
//! - **`native-filter`** — dynamically loaded native filter libraries via
//!   `libloading` (default).
//!
//! # Example
//!
//! ```
//! use yokan::config::{DatabaseConfig, ProviderConfig};
//! use yokan::engine::RequestEngine;
//! use yokan::mode::Mode;
//!
//! #[tokio::main]
//! async fn main() -> yokan::Result<()> {
//!     let engine = RequestEngine::new(ProviderConfig::default())?;
//!
//!     let db_config = DatabaseConfig {
//!         backend_type: "map".to_string(),
//!         config: serde_json::json!({}),
//!         name: Some("example".to_string()),
//!     };
//!     let db_id = engine.open_db(db_config).await?;
//!
//!     let mode = Mode::new();
//!     engine.put(db_id, b"key", b"value", &mode).await?;
//!     let value = engine.get(db_id, b"key", &mode).await?;
//!     assert_eq!(value, b"value");
//!
//!     engine.close_db(db_id).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod buffer;
pub mod bulk;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod filter;
pub mod migration;
pub mod mode;
pub mod registry;
pub mod sentinel;
pub mod streaming;
pub mod transport;

pub use error::{Error, Result};

/// Initializes the crate's `tracing` subscriber from the `RUST_LOG`
/// environment variable. Intended for binaries embedding this crate;
/// library consumers that already configure `tracing` should not call this.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
