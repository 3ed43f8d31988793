//! End-to-end: TusClient against the real router on a local socket

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;

use tusk::config::{ClientConfig, ServerConfig};
use tusk::store::{fields, get_upload, MemoryStore, MetadataStore, SharedStore, StoreSettings, UploadType, CLIENT_PREFIX};
use tusk::transfer::{Checksum, ChecksumAlgorithm};
use tusk::{TusClient, TusError, TusServer};

async fn spawn_server(dir: &Path) -> (String, TusServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());

    let config = ServerConfig {
        base_url: Some(endpoint.clone()),
        upload_dir: dir.join("uploads"),
        chunk_size: 1024,
        ..Default::default()
    };
    let server = TusServer::new(config, Arc::new(MemoryStore::default()));
    let app = server.router();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (endpoint, server)
}

fn client_cache() -> SharedStore {
    Arc::new(MemoryStore::new(StoreSettings::new(CLIENT_PREFIX, 3600)))
}

fn client(endpoint: &str, cache: SharedStore) -> TusClient {
    let config = ClientConfig {
        endpoint: endpoint.to_string(),
        chunk_size: 1024,
        ..Default::default()
    };
    TusClient::new(config, cache)
}

async fn source_file(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join("source.bin");
    tokio::fs::write(&path, &content).await.unwrap();
    (path, content)
}

async fn stored_content(server: &TusServer, key: &str) -> Vec<u8> {
    let record = get_upload(server.store().as_ref(), key, false).await.unwrap().unwrap();
    tokio::fs::read(&record.file_path).await.unwrap()
}

#[tokio::test]
async fn test_upload_creates_and_sends_whole_file() {
    let dir = TempDir::new().unwrap();
    let (endpoint, server) = spawn_server(dir.path()).await;
    let (path, content) = source_file(dir.path(), 10_000).await;

    let mut client = client(&endpoint, client_cache());
    client.file(&path).await.unwrap();
    client.set_key("movie");

    assert_eq!(client.get_offset().await.unwrap(), None);
    assert_eq!(client.upload(None).await.unwrap(), 10_000);
    assert_eq!(client.get_offset().await.unwrap(), Some(10_000));
    assert_eq!(client.upload_url().await.unwrap(), format!("{endpoint}/files/movie"));

    assert_eq!(stored_content(&server, "movie").await, content);
}

#[tokio::test]
async fn test_upload_resumes_from_server_offset() {
    let dir = TempDir::new().unwrap();
    let (endpoint, server) = spawn_server(dir.path()).await;
    let (path, content) = source_file(dir.path(), 10_000).await;
    let cache = client_cache();

    let mut first = client(&endpoint, cache.clone());
    first.file(&path).await.unwrap();
    first.set_key("movie");
    assert_eq!(first.upload(Some(4_000)).await.unwrap(), 4_000);

    // A new client sharing the cache picks up where the first stopped
    let mut second = client(&endpoint, cache);
    second.file(&path).await.unwrap();
    second.set_key("movie");
    assert_eq!(second.get_offset().await.unwrap(), Some(4_000));
    assert_eq!(second.upload(None).await.unwrap(), 10_000);

    assert_eq!(stored_content(&server, "movie").await, content);
}

#[tokio::test]
async fn test_partial_uploads_concatenate_into_final() {
    let dir = TempDir::new().unwrap();
    let (endpoint, server) = spawn_server(dir.path()).await;
    let (path, content) = source_file(dir.path(), 9_000).await;

    let mut client = client(&endpoint, client_cache());
    client.file(&path).await.unwrap();
    client.set_key("doc");

    let mut partials = Vec::new();
    for start in [0u64, 3_000, 6_000] {
        client.seek(start);
        assert_eq!(client.upload(Some(3_000)).await.unwrap(), 3_000);
        partials.push(client.key().unwrap().to_string());
    }

    assert!(partials.iter().all(|key| key.starts_with("doc_")));

    let checksum = client.concat("doc", &partials).await.unwrap();
    assert_eq!(checksum, Checksum::of(ChecksumAlgorithm::Sha256, &content).hex());

    let record = get_upload(server.store().as_ref(), "doc", false).await.unwrap().unwrap();
    assert_eq!(record.upload_type, UploadType::Final);
    assert_eq!((record.offset, record.size), (9_000, 9_000));
    assert_eq!(stored_content(&server, "doc").await, content);

    for partial in &partials {
        assert!(server.store().get(partial, true).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_delete_terminates_upload() {
    let dir = TempDir::new().unwrap();
    let (endpoint, server) = spawn_server(dir.path()).await;
    let (path, _content) = source_file(dir.path(), 2_000).await;
    let cache = client_cache();

    let mut client = client(&endpoint, cache.clone());
    client.file(&path).await.unwrap();
    client.set_key("movie");
    client.upload(None).await.unwrap();

    client.delete().await.unwrap();

    assert!(server.store().get("movie", true).await.unwrap().is_none());
    assert!(cache.get("movie", true).await.unwrap().is_none());
    assert_eq!(client.get_offset().await.unwrap(), None);
    assert!(matches!(client.delete().await, Err(TusError::NotFound(_))));
}

#[tokio::test]
async fn test_expired_cache_entry_fails_fast() {
    let dir = TempDir::new().unwrap();
    let (endpoint, _server) = spawn_server(dir.path()).await;
    let (path, _content) = source_file(dir.path(), 5_000).await;
    let cache = client_cache();

    let mut client = client(&endpoint, cache.clone());
    client.file(&path).await.unwrap();
    client.set_key("movie");
    assert_eq!(client.upload(Some(1_000)).await.unwrap(), 1_000);

    cache
        .set("movie", fields(json!({ "expires_at": "Mon, 01 Jan 2001 00:00:00 GMT" })))
        .await
        .unwrap();

    assert!(matches!(client.upload(None).await, Err(TusError::Expired(_))));
}
