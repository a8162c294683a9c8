//! Transport glue: endpoint identity, bulk handle creation, and back-RPC
//! wiring.
//!
//! The real RDMA-capable RPC transport is out of scope for this crate (see
//! `SPEC_FULL.md` §1); this module defines the traits the request engine
//! drives and an in-process loopback implementation sufficient to exercise
//! the whole engine and the streaming pipeline without a real fabric.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// The stable identity string every provider advertises on its endpoint.
pub const PROVIDER_IDENTITY: &str = "yokan";

/// Verifies a client-presented identity string against the one this
/// provider advertises.
pub fn verify_identity(presented: &str) -> Result<()> {
    if presented == PROVIDER_IDENTITY {
        Ok(())
    } else {
        Err(Error::InvalidProvider(format!("unexpected identity: {}", presented)))
    }
}

/// Tracks which provider ids have registered their RPC endpoints in this
/// process, rejecting duplicate registration.
#[derive(Default)]
pub struct EndpointRegistry {
    registered: DashSet<String>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider_id`'s RPC endpoints. Fails if already
    /// registered.
    pub fn register(&self, provider_id: &str) -> Result<()> {
        if !self.registered.insert(provider_id.to_string()) {
            return Err(Error::InvalidProvider(format!("provider already registered: {}", provider_id)));
        }
        Ok(())
    }
}

/// An RDMA descriptor naming a remote (or third-party) buffer.
///
/// When `origin` is set, the provider pulls/pushes against the memory of
/// whoever exposed the handle, regardless of who sent the request.
#[async_trait]
pub trait BulkHandle: Send + Sync {
    /// Pulls `size` bytes starting at `offset` from the remote buffer.
    async fn pull(&self, offset: u64, size: u64) -> Result<Bytes>;

    /// Pushes `data` to the remote buffer starting at `offset`.
    async fn push(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// The number of contiguous RDMA segments backing this handle. The
    /// codec requires this to be 1 for any region it reads directly.
    fn segment_count(&self) -> usize {
        1
    }
}

/// An in-process bulk handle backed by a shared byte buffer, standing in
/// for RDMA-registered caller memory.
#[derive(Clone)]
pub struct LocalBulkHandle {
    buffer: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl LocalBulkHandle {
    pub fn new(initial: Vec<u8>) -> Self {
        LocalBulkHandle { buffer: Arc::new(parking_lot::Mutex::new(initial)) }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }
}

#[async_trait]
impl BulkHandle for LocalBulkHandle {
    async fn pull(&self, offset: u64, size: u64) -> Result<Bytes> {
        let buffer = self.buffer.lock();
        let offset = offset as usize;
        let size = size as usize;
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::InvalidArgs("bulk pull out of range".into()))?;
        if end > buffer.len() {
            return Err(Error::InvalidArgs("bulk pull out of range".into()));
        }
        Ok(Bytes::copy_from_slice(&buffer[offset..end]))
    }

    async fn push(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buffer = self.buffer.lock();
        let offset = offset as usize;
        let end = offset + data.len();
        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// One batch of streaming results delivered to a client's back-RPC
/// handler.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    /// The opaque callback-context handle the client attached to the
    /// original request. Echoed back unchanged.
    pub op_ref: u64,
    pub start: u64,
    pub count: u64,
    pub payload: Bytes,
}

/// The client-side endpoint a streaming operation's back-RPCs are
/// delivered to.
///
/// Implementations correspond to `fetch_back`/`iter_back` (bulk push) or
/// `*_direct_back` (embedded payload) on the wire; this crate only models
/// the provider side of the call and the status it gets back.
#[async_trait]
pub trait BackRpcEndpoint: Send + Sync {
    /// Delivers one batch and awaits the client's reply status. A non-zero
    /// status aborts the remaining batches of this operation.
    async fn deliver(&self, batch: BatchMessage) -> Result<i32>;
}

/// An in-process back-RPC endpoint that forwards batches over a channel,
/// for tests driving the engine without a real client process.
pub struct ChannelBackRpcEndpoint {
    sender: mpsc::UnboundedSender<BatchMessage>,
}

impl ChannelBackRpcEndpoint {
    /// Creates a linked endpoint/receiver pair.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<BatchMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelBackRpcEndpoint { sender }, receiver)
    }
}

#[async_trait]
impl BackRpcEndpoint for ChannelBackRpcEndpoint {
    async fn deliver(&self, batch: BatchMessage) -> Result<i32> {
        self.sender.send(batch)?;
        Ok(0)
    }
}
