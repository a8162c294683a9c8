//! Streaming back-RPC: batched server-to-client delivery for `fetch` and
//! `iter`-style operations.

use bytes::Bytes;

use crate::error::Result;
use crate::transport::{BackRpcEndpoint, BatchMessage};

/// The outcome of a streaming operation's batch delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub batches_sent: usize,
    pub items_sent: usize,
    /// Set when a back-RPC reply reported a non-zero status, in which case
    /// no further batches were sent.
    pub aborted: bool,
}

/// Streams `items` back to a client's back-RPC endpoint in batches of
/// `batch_size` (0 meaning "all at once"), encoding each batch with
/// `encode_batch` and awaiting the client's reply before sending the next
/// one.
///
/// Batches are delivered strictly in order and indices are contiguous and
/// monotonically increasing, matching the ordering guarantee one streaming
/// operation must provide. The first non-success reply aborts the
/// remaining batches.
pub async fn stream_items<T>(
    op_ref: u64,
    batch_size: usize,
    items: &[T],
    mut encode_batch: impl FnMut(&[T]) -> Bytes,
    endpoint: &dyn BackRpcEndpoint,
) -> Result<StreamOutcome> {
    if items.is_empty() {
        return Ok(StreamOutcome { batches_sent: 0, items_sent: 0, aborted: false });
    }

    let chunk_size = if batch_size == 0 { items.len() } else { batch_size };

    let mut batches_sent = 0;
    let mut items_sent = 0;

    for chunk in items.chunks(chunk_size) {
        let start = items_sent as u64;
        let payload = encode_batch(chunk);
        let status = endpoint
            .deliver(BatchMessage {
                op_ref,
                start,
                count: chunk.len() as u64,
                payload,
            })
            .await?;

        batches_sent += 1;
        items_sent += chunk.len();

        if status != 0 {
            return Ok(StreamOutcome { batches_sent, items_sent, aborted: true });
        }
    }

    Ok(StreamOutcome { batches_sent, items_sent, aborted: false })
}
