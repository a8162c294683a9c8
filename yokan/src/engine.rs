//! The request engine: dispatch for the three request shapes (direct,
//! bulk-pull, streaming back-RPC) across every logical operation.
//!
//! For every incoming request the engine resolves the target database
//! (under the provider registry), takes the database's operation lock,
//! obtains a staging buffer sized to the payload, pulls the input, invokes
//! the backend, and pushes the output (or streams it back via back-RPC)
//! before releasing the buffer and dropping the locks.

use uuid::Uuid;

use bytes::Bytes;
use tracing::instrument;

use crate::backend::Op;
use crate::buffer::{BufferCache, TransferMode};
use crate::bulk;
use crate::config::{DatabaseConfig, ProviderConfig};
use crate::error::Result;
use crate::filter::build_filter;
use crate::mode::Mode;
use crate::registry::Registry;
use crate::sentinel::Sentinel;
use crate::streaming::StreamOutcome;
use crate::transport::{BackRpcEndpoint, BatchMessage, BulkHandle, EndpointRegistry};

/// The provider-side request engine: the database registry, the buffer
/// cache, and the endpoint registry it dispatches requests through.
pub struct RequestEngine {
    pub registry: Registry,
    pub buffer_cache: BufferCache,
    pub endpoints: EndpointRegistry,
}

impl RequestEngine {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(RequestEngine {
            registry: Registry::new(),
            buffer_cache: BufferCache::new(&config.buffer_cache)?,
            endpoints: EndpointRegistry::new(),
        })
    }

    // --- lifecycle (database registry passthrough) ------------------------

    pub async fn open_db(&self, config: DatabaseConfig) -> Result<Uuid> {
        self.registry.open(config).await
    }

    pub async fn close_db(&self, id: Uuid) -> Result<()> {
        self.registry.close(id).await
    }

    pub async fn destroy_db(&self, id: Uuid) -> Result<()> {
        self.registry.destroy(id).await
    }

    pub fn list_dbs(&self) -> Vec<Uuid> {
        self.registry.list_dbs()
    }

    pub fn find_by_name(&self, name: &str) -> Result<Uuid> {
        self.registry.find_by_name(name)
    }

    // --- direct shape: embedded payload, no RDMA ---------------------------

    #[instrument(skip(self, value))]
    pub async fn put(&self, id: Uuid, key: &[u8], value: &[u8], mode: &Mode) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.backend().put(key, value, mode)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid, key: &[u8], mode: &Mode) -> Result<Vec<u8>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.backend().get(key, mode)?.ok_or(crate::error::Error::KeyNotFound)
    }

    pub async fn exists(&self, id: Uuid, key: &[u8], mode: &Mode) -> Result<bool> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.backend().exists(key, mode)
    }

    pub async fn length(&self, id: Uuid, key: &[u8], mode: &Mode) -> Result<u64> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.backend().length(key, mode)?.ok_or(crate::error::Error::KeyNotFound)
    }

    pub async fn erase(&self, id: Uuid, key: &[u8], mode: &Mode) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.backend().erase(key, mode)
    }

    pub async fn count(&self, id: Uuid, mode: &Mode) -> Result<u64> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.backend().count(mode)
    }

    // --- direct-batch shape: embedded payload, NO_RDMA, no bulk handle ------
    //
    // A client with no RDMA-capable registered memory (`mode.is_no_rdma()`)
    // sends the batch payload inline in the RPC instead of exposing a
    // `BulkHandle`; the provider reads it in place and returns the response
    // inline too. These are the `NO_RDMA` counterparts of `put_bulk`/
    // `get_bulk`/`exists_bulk`/`length_bulk`/`erase_bulk` below, sharing the
    // same codec and only differing in where the bytes come from.

    /// `put_direct`: decodes `payload` as `[ksizes][vsizes][keys][values]`
    /// and applies every item.
    #[instrument(skip(self, payload))]
    pub async fn put_direct(&self, id: Uuid, payload: &[u8], count: usize, mode: &Mode) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        let (keys, values) = bulk::decode_put(payload, count)?;
        for (key, value) in keys.iter().zip(values.iter()) {
            db.backend().put(key, value, mode)?;
        }
        Ok(())
    }

    /// `get_direct`: decodes `payload` as `[ksizes][keys]`, looks each key
    /// up, and returns the packed `[vsizes][values]` response directly.
    #[instrument(skip(self, payload))]
    pub async fn get_direct(&self, id: Uuid, payload: &[u8], count: usize, vbufsize: usize, mode: &Mode) -> Result<Vec<u8>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        let keys = bulk::decode_keys(payload, count)?;

        let mut values = Vec::with_capacity(keys.len());
        for key in &keys {
            values.push(db.backend().get(key, mode)?);
        }
        let lookups: Vec<bulk::Lookup> = values
            .iter()
            .map(|v| match v {
                Some(v) => bulk::Lookup::Found(v.as_slice()),
                None => bulk::Lookup::NotFound,
            })
            .collect();

        let (out_sizes, data) = bulk::encode_get_response(&lookups, &[], true, vbufsize);
        let mut response = bulk::encode_sizes(&out_sizes);
        response.extend_from_slice(&data);
        Ok(response)
    }

    /// `exists_direct`: decodes `payload` as `[ksizes][keys]` and returns a
    /// presence bitfield.
    pub async fn exists_direct(&self, id: Uuid, payload: &[u8], count: usize, mode: &Mode) -> Result<Vec<u8>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        let keys = bulk::decode_keys(payload, count)?;
        let mut flags = Vec::with_capacity(keys.len());
        for key in &keys {
            flags.push(db.backend().exists(key, mode)?);
        }
        Ok(bulk::encode_exists_bitfield(&flags))
    }

    /// `length_direct`: decodes `payload` as `[ksizes][keys]` and returns a
    /// size per key, `KEY_NOT_FOUND` for keys with no value.
    pub async fn length_direct(&self, id: Uuid, payload: &[u8], count: usize, mode: &Mode) -> Result<Vec<u8>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        let keys = bulk::decode_keys(payload, count)?;
        let mut sizes = Vec::with_capacity(keys.len());
        for key in &keys {
            sizes.push(match db.backend().length(key, mode)? {
                Some(len) => len,
                None => Sentinel::KeyNotFound.encode(),
            });
        }
        Ok(bulk::encode_sizes(&sizes))
    }

    /// `erase_direct`: decodes `payload` as `[ksizes][keys]` and erases
    /// every key.
    pub async fn erase_direct(&self, id: Uuid, payload: &[u8], count: usize, mode: &Mode) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        let keys = bulk::decode_keys(payload, count)?;
        for key in &keys {
            db.backend().erase(key, mode)?;
        }
        Ok(())
    }

    // --- bulk-pull shape ----------------------------------------------------

    /// `put_bulk`: pulls the `[ksizes][vsizes][keys][values]` layout into a
    /// staging buffer and applies every item.
    #[instrument(skip(self, input))]
    pub async fn put_bulk(&self, id: Uuid, input: &dyn BulkHandle, size: u64, count: usize, mode: &Mode) -> Result<()> {
        bulk::validate_header(size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.write().await;

        let mut staging = self.buffer_cache.get(size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, size).await;
        let result = match pulled {
            Ok(bytes) => {
                staging.data[..bytes.len()].copy_from_slice(&bytes);
                bulk::decode_put(&staging.data[..bytes.len()], count).and_then(|(keys, values)| {
                    for (key, value) in keys.iter().zip(values.iter()) {
                        db.backend().put(key, value, mode)?;
                    }
                    Ok(())
                })
            }
            Err(e) => Err(e),
        };
        self.buffer_cache.release(staging);
        result
    }

    /// `get_bulk`: pulls `[ksizes][keys]` from `input`, looks each key up,
    /// and pushes the packed `[vsizes][values]` response to `output`.
    ///
    /// Values are written back-to-back up to `vbufsize` total; once the
    /// running total would overflow it, that and every following item
    /// reports `SIZE_TOO_SMALL` instead (see [`bulk::encode_get_response`]).
    #[instrument(skip(self, input, output))]
    pub async fn get_bulk(
        &self,
        id: Uuid,
        input: &dyn BulkHandle,
        input_size: u64,
        output: &dyn BulkHandle,
        vbufsize: usize,
        count: usize,
        mode: &Mode,
    ) -> Result<()> {
        bulk::validate_header(input_size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.read().await;

        let mut staging = self.buffer_cache.get(input_size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, input_size).await;
        let response = pulled.and_then(|bytes| {
            staging.data[..bytes.len()].copy_from_slice(&bytes);
            let keys = bulk::decode_keys(&staging.data[..bytes.len()], count)?;

            let mut values = Vec::with_capacity(keys.len());
            for key in &keys {
                values.push(db.backend().get(key, mode)?);
            }
            let lookups: Vec<bulk::Lookup> = values
                .iter()
                .map(|v| match v {
                    Some(v) => bulk::Lookup::Found(v.as_slice()),
                    None => bulk::Lookup::NotFound,
                })
                .collect();

            let (out_sizes, data) = bulk::encode_get_response(&lookups, &[], true, vbufsize);
            let mut response = bulk::encode_sizes(&out_sizes);
            response.extend_from_slice(&data);
            Ok(response)
        });
        self.buffer_cache.release(staging);

        output.push(0, &response?).await
    }

    /// `exists_bulk`: pulls `[ksizes][keys]` from `input` and pushes an
    /// LSB-first presence bitfield to `output`.
    #[instrument(skip(self, input, output))]
    pub async fn exists_bulk(
        &self,
        id: Uuid,
        input: &dyn BulkHandle,
        input_size: u64,
        output: &dyn BulkHandle,
        count: usize,
        mode: &Mode,
    ) -> Result<()> {
        bulk::validate_header(input_size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.read().await;

        let mut staging = self.buffer_cache.get(input_size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, input_size).await;
        let response = pulled.and_then(|bytes| {
            staging.data[..bytes.len()].copy_from_slice(&bytes);
            let keys = bulk::decode_keys(&staging.data[..bytes.len()], count)?;
            let mut flags = Vec::with_capacity(keys.len());
            for key in &keys {
                flags.push(db.backend().exists(key, mode)?);
            }
            Ok(bulk::encode_exists_bitfield(&flags))
        });
        self.buffer_cache.release(staging);

        output.push(0, &response?).await
    }

    /// `length_bulk`: pulls `[ksizes][keys]` from `input` and pushes a size
    /// per key (`KEY_NOT_FOUND` for keys with no value) to `output`.
    #[instrument(skip(self, input, output))]
    pub async fn length_bulk(
        &self,
        id: Uuid,
        input: &dyn BulkHandle,
        input_size: u64,
        output: &dyn BulkHandle,
        count: usize,
        mode: &Mode,
    ) -> Result<()> {
        bulk::validate_header(input_size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.read().await;

        let mut staging = self.buffer_cache.get(input_size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, input_size).await;
        let response = pulled.and_then(|bytes| {
            staging.data[..bytes.len()].copy_from_slice(&bytes);
            let keys = bulk::decode_keys(&staging.data[..bytes.len()], count)?;
            let mut sizes = Vec::with_capacity(keys.len());
            for key in &keys {
                sizes.push(match db.backend().length(key, mode)? {
                    Some(len) => len,
                    None => Sentinel::KeyNotFound.encode(),
                });
            }
            Ok(bulk::encode_sizes(&sizes))
        });
        self.buffer_cache.release(staging);

        output.push(0, &response?).await
    }

    /// `erase_bulk`: pulls `[ksizes][keys]` from `input` and erases every
    /// key.
    #[instrument(skip(self, input))]
    pub async fn erase_bulk(&self, id: Uuid, input: &dyn BulkHandle, input_size: u64, count: usize, mode: &Mode) -> Result<()> {
        bulk::validate_header(input_size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.write().await;

        let mut staging = self.buffer_cache.get(input_size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, input_size).await;
        let result = pulled.and_then(|bytes| {
            staging.data[..bytes.len()].copy_from_slice(&bytes);
            let keys = bulk::decode_keys(&staging.data[..bytes.len()], count)?;
            for key in &keys {
                db.backend().erase(key, mode)?;
            }
            Ok(())
        });
        self.buffer_cache.release(staging);
        result
    }

    /// `list_keys`: a bounded, non-streaming listing (use
    /// [`RequestEngine::iter`] for the streaming shape used by large
    /// listings).
    #[instrument(skip(self))]
    pub async fn list_keys(
        &self,
        id: Uuid,
        from_key: &[u8],
        filter_bytes: &[u8],
        count: usize,
        mode: &Mode,
    ) -> Result<Vec<Vec<u8>>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        let filter = build_filter(mode, filter_bytes)?;

        let mut out = Vec::new();
        db.backend().list_keys(from_key, filter.as_ref(), count, mode, &mut |k| {
            out.push(k.to_vec());
            out.len() < count
        })?;
        Ok(out)
    }

    #[instrument(skip(self))]
    pub async fn list_keyvals(
        &self,
        id: Uuid,
        from_key: &[u8],
        filter_bytes: &[u8],
        count: usize,
        mode: &Mode,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        let filter = build_filter(mode, filter_bytes)?;

        let mut out = Vec::new();
        db.backend().list_keyvals(from_key, filter.as_ref(), count, mode, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            out.len() < count
        })?;
        Ok(out)
    }

    /// `list_keys_bulk`: pulls a 2-entry packed `[from_key][filter]` buffer
    /// from `input` and pushes the bounded `[ksizes][keys]` result to
    /// `output` — the RDMA bulk-pull counterpart of `list_keys`.
    #[instrument(skip(self, input, output))]
    pub async fn list_keys_bulk(
        &self,
        id: Uuid,
        input: &dyn BulkHandle,
        input_size: u64,
        output: &dyn BulkHandle,
        count: usize,
        mode: &Mode,
    ) -> Result<usize> {
        bulk::validate_header(input_size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.read().await;

        let mut staging = self.buffer_cache.get(input_size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, input_size).await;
        let response = pulled.and_then(|bytes| {
            staging.data[..bytes.len()].copy_from_slice(&bytes);
            let parts = bulk::decode_packed(&staging.data[..bytes.len()], 2)?;
            let (from_key, filter_bytes) = (parts[0], parts[1]);
            let filter = build_filter(mode, filter_bytes)?;

            let mut keys: Vec<Vec<u8>> = Vec::new();
            db.backend().list_keys(from_key, filter.as_ref(), count, mode, &mut |k| {
                keys.push(k.to_vec());
                keys.len() < count
            })?;
            let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
            Ok((keys.len(), bulk::encode_packed(&refs)))
        });
        self.buffer_cache.release(staging);

        let (found, payload) = response?;
        output.push(0, &payload).await?;
        Ok(found)
    }

    /// `list_keyvals_bulk`: the RDMA bulk-pull counterpart of
    /// `list_keyvals`, pushing `[ksizes][vsizes][keys][values]`.
    #[instrument(skip(self, input, output))]
    pub async fn list_keyvals_bulk(
        &self,
        id: Uuid,
        input: &dyn BulkHandle,
        input_size: u64,
        output: &dyn BulkHandle,
        count: usize,
        mode: &Mode,
    ) -> Result<usize> {
        bulk::validate_header(input_size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.read().await;

        let mut staging = self.buffer_cache.get(input_size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, input_size).await;
        let response = pulled.and_then(|bytes| {
            staging.data[..bytes.len()].copy_from_slice(&bytes);
            let parts = bulk::decode_packed(&staging.data[..bytes.len()], 2)?;
            let (from_key, filter_bytes) = (parts[0], parts[1]);
            let filter = build_filter(mode, filter_bytes)?;

            let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            db.backend().list_keyvals(from_key, filter.as_ref(), count, mode, &mut |k, v| {
                pairs.push((k.to_vec(), v.to_vec()));
                pairs.len() < count
            })?;
            let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
            let values: Vec<&[u8]> = pairs.iter().map(|(_, v)| v.as_slice()).collect();
            Ok((pairs.len(), bulk::encode_put(&keys, &values)?))
        });
        self.buffer_cache.release(staging);

        let (found, payload) = response?;
        output.push(0, &payload).await?;
        Ok(found)
    }

    // --- streaming back-RPC shape -------------------------------------------
    //
    // `iter` range-scans from `from_key`/`filter` the way `list_keyvals`
    // does but unbounded in client-facing size, so results stream back in
    // `batch_size`-bounded back-RPC batches instead of one big response.
    // `fetch` takes an explicit key list instead of scanning a range — the
    // streaming counterpart of a multi-get, useful when values may be large
    // enough that the caller wants them delivered incrementally. Both pull
    // at most one batch's worth of data from the backend at a time so
    // server memory stays bounded by `batch_size`, not by the total result
    // size.

    /// Streams up to `count` key/value pairs matching `filter`, starting at
    /// `from_key`, back to the client's back-RPC endpoint in batches of
    /// `batch_size` (0 meaning one batch holding up to `count` items).
    ///
    /// Each batch is pulled from the backend and delivered before the next
    /// one is requested, re-scanning from just past the last key seen; at
    /// no point does the provider hold more than one batch's pairs.
    #[instrument(skip(self, endpoint))]
    pub async fn iter(
        &self,
        id: Uuid,
        from_key: &[u8],
        filter_bytes: &[u8],
        count: usize,
        batch_size: usize,
        op_ref: u64,
        mode: &Mode,
        endpoint: &dyn BackRpcEndpoint,
    ) -> Result<StreamOutcome> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.backend().capabilities().require(Op::Iter, "iter")?;
        let filter = build_filter(mode, filter_bytes)?;

        let chunk_size = if batch_size == 0 { count.max(1) } else { batch_size };
        let mut cursor = from_key.to_vec();
        let mut scan_mode = Mode::from_raw(mode.raw())?;
        let mut remaining = count;
        let mut batches_sent = 0usize;
        let mut items_sent = 0usize;

        loop {
            if remaining == 0 {
                break;
            }
            let take = chunk_size.min(remaining);
            let mut pairs = Vec::with_capacity(take);
            db.backend().list_keyvals(&cursor, filter.as_ref(), take, &scan_mode, &mut |k, v| {
                pairs.push((k.to_vec(), v.to_vec()));
                pairs.len() < take
            })?;
            if pairs.is_empty() {
                break;
            }

            let got = pairs.len();
            cursor = pairs[got - 1].0.clone();
            let payload = encode_keyval_batch(&pairs);
            let status = endpoint
                .deliver(BatchMessage { op_ref, start: items_sent as u64, count: got as u64, payload })
                .await?;
            batches_sent += 1;
            items_sent += got;
            if status != 0 {
                return Ok(StreamOutcome { batches_sent, items_sent, aborted: true });
            }

            remaining -= got;
            if got < take {
                break;
            }
            // Re-scanning from the last key seen would re-match it under
            // INCLUSIVE; drop that bit for every batch after the first.
            scan_mode.set_inclusive(false);
        }

        Ok(StreamOutcome { batches_sent, items_sent, aborted: false })
    }

    /// Streams the value of each of `keys` back to the client's back-RPC
    /// endpoint in batches of `batch_size` (0 meaning one batch). A key with
    /// no value reports `KEY_NOT_FOUND` for that item without failing the
    /// batch.
    #[instrument(skip(self, endpoint))]
    pub async fn fetch(
        &self,
        id: Uuid,
        keys: &[Vec<u8>],
        batch_size: usize,
        op_ref: u64,
        mode: &Mode,
        endpoint: &dyn BackRpcEndpoint,
    ) -> Result<StreamOutcome> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;

        let chunk_size = if batch_size == 0 { keys.len().max(1) } else { batch_size };
        let mut batches_sent = 0usize;
        let mut items_sent = 0usize;

        for chunk in keys.chunks(chunk_size) {
            let mut items = Vec::with_capacity(chunk.len());
            for key in chunk {
                items.push((key.clone(), db.backend().get(key, mode)?));
            }
            let payload = encode_fetch_batch(&items);
            let status = endpoint
                .deliver(BatchMessage { op_ref, start: items_sent as u64, count: items.len() as u64, payload })
                .await?;
            batches_sent += 1;
            items_sent += items.len();
            if status != 0 {
                return Ok(StreamOutcome { batches_sent, items_sent, aborted: true });
            }
        }

        Ok(StreamOutcome { batches_sent, items_sent, aborted: false })
    }

    /// The document-layer counterpart of [`RequestEngine::iter`]: streams
    /// up to `count` documents matching `filter`, starting at `from_id`, in
    /// `batch_size`-bounded back-RPC batches.
    #[instrument(skip(self, endpoint))]
    pub async fn doc_iter(
        &self,
        id: Uuid,
        coll: &str,
        from_id: u64,
        filter_bytes: &[u8],
        count: usize,
        batch_size: usize,
        op_ref: u64,
        mode: &Mode,
        endpoint: &dyn BackRpcEndpoint,
    ) -> Result<StreamOutcome> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        let filter = build_filter(mode, filter_bytes)?;

        let chunk_size = if batch_size == 0 { count.max(1) } else { batch_size };
        let mut cursor = from_id;
        let mut remaining = count;
        let mut batches_sent = 0usize;
        let mut items_sent = 0usize;

        loop {
            if remaining == 0 {
                break;
            }
            let take = chunk_size.min(remaining);
            let mut docs = Vec::with_capacity(take);
            db.documents().list(coll, cursor, filter.as_ref(), take, mode, &mut |doc_id, doc| {
                docs.push((doc_id, doc.to_vec()));
                docs.len() < take
            })?;
            if docs.is_empty() {
                break;
            }

            let got = docs.len();
            cursor = docs[got - 1].0 + 1;
            let payload = encode_doc_batch(&docs);
            let status = endpoint
                .deliver(BatchMessage { op_ref, start: items_sent as u64, count: got as u64, payload })
                .await?;
            batches_sent += 1;
            items_sent += got;
            if status != 0 {
                return Ok(StreamOutcome { batches_sent, items_sent, aborted: true });
            }

            remaining -= got;
            if got < take {
                break;
            }
        }

        Ok(StreamOutcome { batches_sent, items_sent, aborted: false })
    }

    /// The document-layer counterpart of [`RequestEngine::fetch`]: streams
    /// the document for each of `ids`, reporting `KEY_NOT_FOUND` for ids
    /// that don't exist without failing the batch.
    #[instrument(skip(self, endpoint))]
    pub async fn doc_fetch(
        &self,
        id: Uuid,
        coll: &str,
        ids: &[u64],
        batch_size: usize,
        op_ref: u64,
        endpoint: &dyn BackRpcEndpoint,
    ) -> Result<StreamOutcome> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;

        let chunk_size = if batch_size == 0 { ids.len().max(1) } else { batch_size };
        let mut batches_sent = 0usize;
        let mut items_sent = 0usize;

        for chunk in ids.chunks(chunk_size) {
            let mut items = Vec::with_capacity(chunk.len());
            for &doc_id in chunk {
                items.push((doc_id, db.documents().load(coll, doc_id)?));
            }
            let payload = encode_doc_fetch_batch(&items);
            let status = endpoint
                .deliver(BatchMessage { op_ref, start: items_sent as u64, count: items.len() as u64, payload })
                .await?;
            batches_sent += 1;
            items_sent += items.len();
            if status != 0 {
                return Ok(StreamOutcome { batches_sent, items_sent, aborted: true });
            }
        }

        Ok(StreamOutcome { batches_sent, items_sent, aborted: false })
    }

    // --- document layer passthrough -----------------------------------------

    pub async fn coll_create(&self, id: Uuid, name: &str) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.documents().create(name).await
    }

    pub async fn coll_drop(&self, id: Uuid, name: &str) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.documents().drop(name).await
    }

    pub async fn coll_size(&self, id: Uuid, name: &str) -> Result<u64> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.documents().size(name)
    }

    pub async fn coll_last_id(&self, id: Uuid, name: &str) -> Result<u64> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.documents().last_id(name)
    }

    pub async fn coll_exists(&self, id: Uuid, name: &str) -> Result<bool> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.documents().exists(name)
    }

    pub async fn doc_store(&self, id: Uuid, coll: &str, doc: &[u8]) -> Result<u64> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.documents().store(coll, doc).await
    }

    pub async fn doc_store_multi(&self, id: Uuid, coll: &str, docs: &[&[u8]]) -> Result<Vec<u64>> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.documents().store_multi(coll, docs).await
    }

    /// `doc_store_packed`: decodes a `[sizes][packed bytes]` payload
    /// embedded directly in the request (the `NO_RDMA` counterpart of
    /// `doc_store_bulk`) and stores each document via `store_multi`.
    pub async fn doc_store_packed(&self, id: Uuid, coll: &str, payload: &[u8], count: usize) -> Result<Vec<u64>> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        let docs = bulk::decode_packed(payload, count)?;
        db.documents().store_multi(coll, &docs).await
    }

    /// `doc_store_bulk`: the RDMA bulk-pull counterpart of
    /// `doc_store_packed` — pulls the `[sizes][packed bytes]` payload from
    /// `input` before storing.
    #[instrument(skip(self, input))]
    pub async fn doc_store_bulk(&self, id: Uuid, coll: &str, input: &dyn BulkHandle, input_size: u64, count: usize) -> Result<Vec<u64>> {
        bulk::validate_header(input_size as usize, 0, input.segment_count())?;

        let db = self.registry.get(id).await?;
        let _guard = db.write().await;

        let mut staging = self.buffer_cache.get(input_size as usize, TransferMode::ReadOnly)?;
        let pulled = input.pull(0, input_size).await;
        let result = match pulled {
            Ok(bytes) => {
                staging.data[..bytes.len()].copy_from_slice(&bytes);
                let docs = bulk::decode_packed(&staging.data[..bytes.len()], count)?;
                db.documents().store_multi(coll, &docs).await
            }
            Err(e) => Err(e),
        };
        self.buffer_cache.release(staging);
        result
    }

    pub async fn doc_load(&self, id: Uuid, coll: &str, doc_id: u64) -> Result<Vec<u8>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.documents().load(coll, doc_id)?.ok_or(crate::error::Error::InvalidId(doc_id))
    }

    pub async fn doc_length(&self, id: Uuid, coll: &str, doc_id: u64) -> Result<u64> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        db.documents().length(coll, doc_id)?.ok_or(crate::error::Error::InvalidId(doc_id))
    }

    pub async fn doc_update(&self, id: Uuid, coll: &str, doc_id: u64, doc: &[u8], mode: &Mode) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.documents().update(coll, doc_id, doc, mode).await
    }

    pub async fn doc_erase(&self, id: Uuid, coll: &str, doc_id: u64) -> Result<()> {
        let db = self.registry.get(id).await?;
        let _guard = db.write().await;
        db.documents().erase(coll, doc_id).await
    }

    pub async fn doc_list(
        &self,
        id: Uuid,
        coll: &str,
        from_id: u64,
        filter_bytes: &[u8],
        count: usize,
        mode: &Mode,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let db = self.registry.get(id).await?;
        let _guard = db.read().await;
        let filter = build_filter(mode, filter_bytes)?;

        let mut out = Vec::new();
        db.documents().list(coll, from_id, filter.as_ref(), count, mode, &mut |doc_id, doc| {
            out.push((doc_id, doc.to_vec()));
            out.len() < count
        })?;
        Ok(out)
    }

    // --- migration -----------------------------------------------------------

    /// Migrates database `id` to `destination`, which is a (possibly
    /// separate) engine hosting the same registered backend types. Returns
    /// the destination's new database id.
    #[instrument(skip(self, destination))]
    pub async fn migrate_db(&self, id: Uuid, destination: &RequestEngine, dest_config: DatabaseConfig) -> Result<Uuid> {
        let db = self.registry.get_any(id)?;
        db.migration().start().await?;

        let mut handle = match db.backend().start_migration() {
            Ok(h) => h,
            Err(e) => {
                db.migration().cancel().await?;
                return Err(e);
            }
        };

        let migrate_result: Result<Uuid> = async {
            let root = handle.root();
            let files = handle.files();

            let new_id = destination.open_db(dest_config).await?;
            let dest_db = destination.registry.get_any(new_id)?;
            dest_db.backend().recover_from_migration(&root, &files)?;
            Ok(new_id)
        }
        .await;

        match migrate_result {
            Ok(new_id) => {
                db.migration().complete().await?;
                Ok(new_id)
            }
            Err(e) => {
                handle.cancel();
                db.migration().cancel().await?;
                Err(e)
            }
        }
    }
}

fn encode_keyval_batch(pairs: &[(Vec<u8>, Vec<u8>)]) -> Bytes {
    let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
    let values: Vec<&[u8]> = pairs.iter().map(|(_, v)| v.as_slice()).collect();
    Bytes::from(bulk::encode_put(&keys, &values).unwrap_or_default())
}

/// Encodes a `fetch` batch: `[vsizes][values packed]`, with a missing key
/// reporting [`Sentinel::KeyNotFound`] in its size slot and contributing no
/// bytes to the packed region.
fn encode_fetch_batch(items: &[(Vec<u8>, Option<Vec<u8>>)]) -> Bytes {
    let sizes: Vec<u64> = items
        .iter()
        .map(|(_, v)| match v {
            Some(value) => value.len() as u64,
            None => Sentinel::KeyNotFound.encode(),
        })
        .collect();
    let mut out = bulk::encode_sizes(&sizes);
    for (_, v) in items {
        if let Some(value) = v {
            out.extend_from_slice(value);
        }
    }
    Bytes::from(out)
}

/// Encodes a `doc_iter` batch: a run of `[id][size][bytes]` entries.
fn encode_doc_batch(docs: &[(u64, Vec<u8>)]) -> Bytes {
    let mut out = Vec::new();
    for (doc_id, doc) in docs {
        out.extend_from_slice(&doc_id.to_le_bytes());
        out.extend_from_slice(&(doc.len() as u64).to_le_bytes());
        out.extend_from_slice(doc);
    }
    Bytes::from(out)
}

/// Encodes a `doc_fetch` batch: `[id][size][bytes]` entries, with a missing
/// id reporting [`Sentinel::KeyNotFound`] as its size and no trailing bytes.
fn encode_doc_fetch_batch(items: &[(u64, Option<Vec<u8>>)]) -> Bytes {
    let mut out = Vec::new();
    for (doc_id, doc) in items {
        out.extend_from_slice(&doc_id.to_le_bytes());
        match doc {
            Some(d) => {
                out.extend_from_slice(&(d.len() as u64).to_le_bytes());
                out.extend_from_slice(d);
            }
            None => {
                out.extend_from_slice(&Sentinel::KeyNotFound.encode().to_le_bytes());
            }
        }
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferCacheConfig;
    use crate::error::Error;
    use crate::sentinel::Sentinel;
    use crate::transport::LocalBulkHandle;

    fn engine() -> RequestEngine {
        RequestEngine::new(ProviderConfig {
            database: None,
            buffer_cache: BufferCacheConfig::Default,
            use_progress_thread: false,
        })
        .unwrap()
    }

    fn map_config() -> DatabaseConfig {
        DatabaseConfig { backend_type: "map".into(), config: serde_json::json!({}), name: None }
    }

    #[tokio::test]
    async fn scenario_put_get_length_exists_erase() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        let mode = Mode::new();

        engine.put(id, b"foo", b"bar", &mode).await.unwrap();
        assert_eq!(engine.get(id, b"foo", &mode).await.unwrap(), b"bar");
        assert_eq!(engine.length(id, b"foo", &mode).await.unwrap(), 3);
        assert!(engine.exists(id, b"foo", &mode).await.unwrap());
        engine.erase(id, b"foo", &mode).await.unwrap();
        assert!(!engine.exists(id, b"foo", &mode).await.unwrap());
    }

    #[tokio::test]
    async fn scenario_list_keys_in_order() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        let mode = Mode::new();
        for (k, v) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3")] {
            engine.put(id, k.as_bytes(), v.as_bytes(), &mode).await.unwrap();
        }
        let keys = engine.list_keys(id, b"", b"k", 10, &mode).await.unwrap();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]);
    }

    #[tokio::test]
    async fn scenario_documents() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.coll_create(id, "C").await.unwrap();
        assert!(engine.coll_exists(id, "C").await.unwrap());
        assert_eq!(engine.doc_store(id, "C", b"alpha").await.unwrap(), 0);
        assert_eq!(engine.doc_store(id, "C", b"beta").await.unwrap(), 1);
        assert_eq!(engine.coll_size(id, "C").await.unwrap(), 2);
        assert_eq!(engine.coll_last_id(id, "C").await.unwrap(), 2);
        engine.doc_update(id, "C", 0, b"ALPHA", &Mode::new()).await.unwrap();
        assert_eq!(engine.doc_load(id, "C", 0).await.unwrap(), b"ALPHA");
        assert_eq!(engine.doc_length(id, "C", 0).await.unwrap(), 5);

        let ids = engine.doc_store_multi(id, "C", &[b"x", b"yy"]).await.unwrap();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(engine.coll_size(id, "C").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn scenario_get_missing_key_is_key_not_found() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        let err = engine.get(id, b"missing", &Mode::new()).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound));
    }

    #[tokio::test]
    async fn scenario_get_bulk_reports_key_not_found_sentinel_per_item() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.put(id, b"k1", b"v1", &Mode::new()).await.unwrap();

        let mut request = bulk::encode_sizes(&[2, 7]);
        request.extend_from_slice(b"k1missing");

        let input = LocalBulkHandle::new(request.clone());
        let output = LocalBulkHandle::new(vec![0u8; 64]);
        engine
            .get_bulk(id, &input, request.len() as u64, &output, 64, 2, &Mode::new())
            .await
            .unwrap();

        let response = output.snapshot();
        let (sizes, _) = bulk::decode_sizes(&response, 2).unwrap();
        assert_eq!(sizes[0], 2);
        assert_eq!(sizes[1], Sentinel::KeyNotFound.encode());
    }

    #[tokio::test]
    async fn scenario_put_bulk_then_get_round_trips() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();

        let keys: Vec<&[u8]> = vec![b"k1", b"k2"];
        let values: Vec<&[u8]> = vec![b"v1", b"v2"];
        let request = bulk::encode_put(&keys, &values).unwrap();
        let input = LocalBulkHandle::new(request.clone());

        engine.put_bulk(id, &input, request.len() as u64, 2, &Mode::new()).await.unwrap();
        assert_eq!(engine.get(id, b"k1", &Mode::new()).await.unwrap(), b"v1");
        assert_eq!(engine.get(id, b"k2", &Mode::new()).await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn scenario_iter_streams_all_matches() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        for (k, v) in [("k1", "v1"), ("k2", "v2")] {
            engine.put(id, k.as_bytes(), v.as_bytes(), &Mode::new()).await.unwrap();
        }
        let (endpoint, mut rx) = crate::transport::ChannelBackRpcEndpoint::pair();
        let outcome = engine
            .iter(id, b"", b"k", 10, 0, 42, &Mode::new(), &endpoint)
            .await
            .unwrap();
        assert_eq!(outcome.items_sent, 2);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.op_ref, 42);
    }

    #[tokio::test]
    async fn scenario_iter_bounds_memory_to_one_batch_at_a_time() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        for i in 0..5u8 {
            engine.put(id, &[b'k', i], &[b'v', i], &Mode::new()).await.unwrap();
        }
        let (endpoint, mut rx) = crate::transport::ChannelBackRpcEndpoint::pair();
        let outcome = engine.iter(id, b"", b"", 5, 2, 7, &Mode::new(), &endpoint).await.unwrap();
        assert_eq!(outcome.items_sent, 5);
        assert_eq!(outcome.batches_sent, 3);

        let mut seen = 0u64;
        while let Ok(batch) = rx.try_recv() {
            assert!(batch.count <= 2);
            seen += batch.count;
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn scenario_fetch_reports_key_not_found_without_failing_batch() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.put(id, b"k1", b"v1", &Mode::new()).await.unwrap();

        let (endpoint, mut rx) = crate::transport::ChannelBackRpcEndpoint::pair();
        let keys = vec![b"k1".to_vec(), b"missing".to_vec()];
        let outcome = engine.fetch(id, &keys, 0, 9, &Mode::new(), &endpoint).await.unwrap();
        assert_eq!(outcome.items_sent, 2);

        let batch = rx.recv().await.unwrap();
        let (sizes, consumed) = bulk::decode_sizes(&batch.payload, 2).unwrap();
        assert_eq!(sizes[0], 2);
        assert_eq!(sizes[1], Sentinel::KeyNotFound.encode());
        assert_eq!(&batch.payload[consumed..], b"v1");
    }

    #[tokio::test]
    async fn scenario_direct_put_get_round_trips_without_rdma() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        let mode = Mode::new();

        let keys: Vec<&[u8]> = vec![b"d1", b"d2"];
        let values: Vec<&[u8]> = vec![b"v1", b"v2"];
        let payload = bulk::encode_put(&keys, &values).unwrap();
        engine.put_direct(id, &payload, 2, &mode).await.unwrap();

        let request = bulk::encode_packed(&keys);
        let response = engine.get_direct(id, &request, 2, usize::MAX, &mode).await.unwrap();
        let (sizes, consumed) = bulk::decode_sizes(&response, 2).unwrap();
        assert_eq!(sizes, vec![2, 2]);
        assert_eq!(&response[consumed..], b"v1v2");
    }

    #[tokio::test]
    async fn scenario_exists_bulk_reports_bitfield() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.put(id, b"k1", b"v1", &Mode::new()).await.unwrap();

        let keys: Vec<&[u8]> = vec![b"k1", b"missing"];
        let request = bulk::encode_packed(&keys);
        let input = LocalBulkHandle::new(request.clone());
        let output = LocalBulkHandle::new(vec![0u8; 8]);
        engine.exists_bulk(id, &input, request.len() as u64, &output, 2, &Mode::new()).await.unwrap();

        let flags = bulk::decode_exists_bitfield(&output.snapshot(), 2).unwrap();
        assert_eq!(flags, vec![true, false]);
    }

    #[tokio::test]
    async fn scenario_erase_bulk_removes_every_key() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.put(id, b"k1", b"v1", &Mode::new()).await.unwrap();
        engine.put(id, b"k2", b"v2", &Mode::new()).await.unwrap();

        let keys: Vec<&[u8]> = vec![b"k1", b"k2"];
        let request = bulk::encode_packed(&keys);
        let input = LocalBulkHandle::new(request.clone());
        engine.erase_bulk(id, &input, request.len() as u64, 2, &Mode::new()).await.unwrap();

        assert!(!engine.exists(id, b"k1", &Mode::new()).await.unwrap());
        assert!(!engine.exists(id, b"k2", &Mode::new()).await.unwrap());
    }

    #[tokio::test]
    async fn scenario_list_keyvals_bulk_round_trips() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        for (k, v) in [("k1", "v1"), ("k2", "v2")] {
            engine.put(id, k.as_bytes(), v.as_bytes(), &Mode::new()).await.unwrap();
        }

        let request = bulk::encode_packed(&[b"", b"k"]);
        let input = LocalBulkHandle::new(request.clone());
        let output = LocalBulkHandle::new(Vec::new());
        let found = engine
            .list_keyvals_bulk(id, &input, request.len() as u64, &output, 10, &Mode::new())
            .await
            .unwrap();
        assert_eq!(found, 2);

        let output_snapshot = output.snapshot();
        let (keys, values) = bulk::decode_put(&output_snapshot, 2).unwrap();
        assert_eq!(keys, vec![b"k1".as_slice(), b"k2".as_slice()]);
        assert_eq!(values, vec![b"v1".as_slice(), b"v2".as_slice()]);
    }

    #[tokio::test]
    async fn scenario_doc_iter_and_doc_fetch_stream_documents() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.coll_create(id, "C").await.unwrap();
        engine.doc_store_multi(id, "C", &[b"a", b"b", b"c"]).await.unwrap();

        let (endpoint, mut rx) = crate::transport::ChannelBackRpcEndpoint::pair();
        let outcome = engine.doc_iter(id, "C", 0, b"", 10, 2, 1, &Mode::new(), &endpoint).await.unwrap();
        assert_eq!(outcome.items_sent, 3);
        assert_eq!(outcome.batches_sent, 2);
        drop(rx);

        let (endpoint, mut rx) = crate::transport::ChannelBackRpcEndpoint::pair();
        let outcome = engine.doc_fetch(id, "C", &[0, 99], 0, 2, &endpoint).await.unwrap();
        assert_eq!(outcome.items_sent, 2);
        let batch = rx.recv().await.unwrap();
        assert!(!batch.payload.is_empty());
    }

    #[tokio::test]
    async fn scenario_doc_store_packed_then_doc_store_bulk() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.coll_create(id, "C").await.unwrap();

        let packed = bulk::encode_packed(&[b"doc-a", b"doc-b"]);
        let ids = engine.doc_store_packed(id, "C", &packed, 2).await.unwrap();
        assert_eq!(ids, vec![0, 1]);

        let input = LocalBulkHandle::new(packed.clone());
        let ids = engine.doc_store_bulk(id, "C", &input, packed.len() as u64, 2).await.unwrap();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(engine.coll_size(id, "C").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn scenario_migrate_db_moves_data_to_a_fresh_database() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        for (k, v) in [("k1", "v1"), ("k2", "v2")] {
            engine.put(id, k.as_bytes(), v.as_bytes(), &Mode::new()).await.unwrap();
        }

        let new_id = engine.migrate_db(id, &engine, map_config()).await.unwrap();
        assert_ne!(new_id, id);
        assert_eq!(engine.get(new_id, b"k1", &Mode::new()).await.unwrap(), b"v1");
        assert_eq!(engine.get(new_id, b"k2", &Mode::new()).await.unwrap(), b"v2");
        assert!(matches!(engine.get(id, b"k1", &Mode::new()).await, Err(Error::InvalidDatabase(_))));
    }

    #[tokio::test]
    async fn scenario_destroy_then_any_op_is_invalid_database() {
        let engine = engine();
        let id = engine.open_db(map_config()).await.unwrap();
        engine.destroy_db(id).await.unwrap();
        assert!(matches!(engine.get(id, b"x", &Mode::new()).await, Err(Error::InvalidDatabase(_))));
    }
}
