//! Sentinel-size reporting: missing keys and undersized client buffers
//! surface the right sentinel rather than failing the whole operation.

use yokan::bulk;
use yokan::config::{DatabaseConfig, ProviderConfig};
use yokan::engine::RequestEngine;
use yokan::mode::Mode;
use yokan::sentinel::Sentinel;
use yokan::transport::{ChannelBackRpcEndpoint, LocalBulkHandle};

fn map_config() -> DatabaseConfig {
    DatabaseConfig { backend_type: "map".into(), config: serde_json::json!({}), name: None }
}

#[tokio::test]
async fn get_bulk_reports_key_not_found_for_missing_keys() {
    let engine = RequestEngine::new(ProviderConfig::default()).unwrap();
    let id = engine.open_db(map_config()).await.unwrap();
    engine.put(id, b"k1", b"v1", &Mode::new()).await.unwrap();

    let request = bulk::encode_packed(&[b"k1", b"missing"]);
    let input = LocalBulkHandle::new(request.clone());
    let output = LocalBulkHandle::new(vec![0u8; 64]);
    engine.get_bulk(id, &input, request.len() as u64, &output, 64, 2, &Mode::new()).await.unwrap();

    let (sizes, _) = bulk::decode_sizes(&output.snapshot(), 2).unwrap();
    assert_eq!(sizes[0], 1);
    assert_eq!(sizes[1], Sentinel::KeyNotFound.encode());
}

#[tokio::test]
async fn get_direct_reports_size_too_small_once_packed_buffer_is_exhausted() {
    let engine = RequestEngine::new(ProviderConfig::default()).unwrap();
    let id = engine.open_db(map_config()).await.unwrap();
    engine.put(id, b"k1", b"0123456789", &Mode::new()).await.unwrap();
    engine.put(id, b"k2", b"abcdefghij", &Mode::new()).await.unwrap();

    let request = bulk::encode_packed(&[b"k1", b"k2"]);
    let response = engine.get_direct(id, &request, 2, 10, &Mode::new()).await.unwrap();
    let (sizes, _) = bulk::decode_sizes(&response, 2).unwrap();
    assert_eq!(sizes[0], 10);
    assert_eq!(sizes[1], Sentinel::SizeTooSmall.encode());
}

#[tokio::test]
async fn length_bulk_reports_key_not_found_per_missing_key() {
    let engine = RequestEngine::new(ProviderConfig::default()).unwrap();
    let id = engine.open_db(map_config()).await.unwrap();
    engine.put(id, b"k1", b"abc", &Mode::new()).await.unwrap();

    let request = bulk::encode_packed(&[b"k1", b"missing"]);
    let input = LocalBulkHandle::new(request.clone());
    let output = LocalBulkHandle::new(Vec::new());
    engine.length_bulk(id, &input, request.len() as u64, &output, 2, &Mode::new()).await.unwrap();

    let (sizes, _) = bulk::decode_sizes(&output.snapshot(), 2).unwrap();
    assert_eq!(sizes[0], 3);
    assert_eq!(sizes[1], Sentinel::KeyNotFound.encode());
}

#[tokio::test]
async fn fetch_reports_key_not_found_without_aborting_the_stream() {
    let engine = RequestEngine::new(ProviderConfig::default()).unwrap();
    let id = engine.open_db(map_config()).await.unwrap();
    engine.put(id, b"k1", b"v1", &Mode::new()).await.unwrap();

    let (endpoint, mut rx) = ChannelBackRpcEndpoint::pair();
    let keys = vec![b"k1".to_vec(), b"missing".to_vec()];
    let outcome = engine.fetch(id, &keys, 0, 1, &Mode::new(), &endpoint).await.unwrap();
    assert!(!outcome.aborted);
    assert_eq!(outcome.items_sent, 2);

    let batch = rx.recv().await.unwrap();
    let (sizes, _) = bulk::decode_sizes(&batch.payload, 2).unwrap();
    assert_eq!(sizes[1], Sentinel::KeyNotFound.encode());
}
