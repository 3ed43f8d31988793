//! Every store backend must give the same answers for the same calls

use serde_json::{json, Value};
use tempfile::TempDir;

use tusk::store::{fields, FileStore, MemoryStore, MetadataStore, SqliteStore, StoreSettings};

const EXPIRED: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    File,
    Sqlite,
}

const BACKENDS: [Backend; 3] = [Backend::Memory, Backend::File, Backend::Sqlite];

/// Two stores over one backend, namespaced `server:` and `client:`
async fn open_pair(backend: Backend, dir: &TempDir) -> (Box<dyn MetadataStore>, Box<dyn MetadataStore>) {
    let server = StoreSettings::new("server:", 3600);
    let client = StoreSettings::new("client:", 3600);

    match backend {
        // Separate maps; isolation is trivially true here
        Backend::Memory => (Box::new(MemoryStore::new(server)), Box::new(MemoryStore::new(client))),
        Backend::File => {
            let path = dir.path().join("records.json");
            (
                Box::new(FileStore::new(path.clone(), server)),
                Box::new(FileStore::new(path, client)),
            )
        }
        Backend::Sqlite => {
            let url = format!("sqlite://{}", dir.path().join("records.db").display());
            (
                Box::new(SqliteStore::connect(&url, server).await.unwrap()),
                Box::new(SqliteStore::connect(&url, client).await.unwrap()),
            )
        }
    }
}

#[tokio::test]
async fn test_set_is_a_shallow_merge_on_every_backend() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_pair(backend, &dir).await;

        store
            .set("k", fields(json!({"offset": 3, "metadata": {"a": "1"}, "checksum": "x"})))
            .await
            .unwrap();
        store
            .set("k", fields(json!({"metadata": {"b": "2"}, "checksum": null})))
            .await
            .unwrap();

        let record = store.get("k", false).await.unwrap().unwrap();
        assert_eq!(record["offset"], 3, "{backend:?}");
        assert_eq!(record["metadata"], json!({"b": "2"}), "{backend:?}");
        assert_eq!(record.get("checksum"), Some(&Value::Null), "{backend:?}");
        assert!(record.contains_key("expires_at"), "{backend:?}");
    }
}

#[tokio::test]
async fn test_expired_records_are_hidden_on_every_backend() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_pair(backend, &dir).await;

        store
            .set("old", fields(json!({"offset": 1, "expires_at": EXPIRED})))
            .await
            .unwrap();

        assert!(store.get("old", false).await.unwrap().is_none(), "{backend:?}");
        let record = store.get("old", true).await.unwrap().unwrap();
        assert_eq!(record["expires_at"], EXPIRED, "{backend:?}");

        // Expired keys are still listed so the sweep can find them
        assert_eq!(store.keys().await.unwrap(), vec!["old".to_string()], "{backend:?}");
    }
}

#[tokio::test]
async fn test_keys_stay_inside_their_prefix_on_every_backend() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let (server, client) = open_pair(backend, &dir).await;

        server.set("shared", fields(json!({"offset": 7}))).await.unwrap();
        client.set("shared", fields(json!({"location": "http://x/files/shared"}))).await.unwrap();
        client.set("mine", fields(json!({"location": "http://x/files/mine"}))).await.unwrap();

        assert_eq!(server.keys().await.unwrap(), vec!["shared".to_string()], "{backend:?}");

        let mut client_keys = client.keys().await.unwrap();
        client_keys.sort();
        assert_eq!(client_keys, vec!["mine".to_string(), "shared".to_string()], "{backend:?}");

        let record = server.get("shared", false).await.unwrap().unwrap();
        assert_eq!(record["offset"], 7, "{backend:?}");
        assert!(!record.contains_key("location"), "{backend:?}");

        assert!(client.delete("shared").await.unwrap(), "{backend:?}");
        assert!(server.get("shared", false).await.unwrap().is_some(), "{backend:?}");
    }
}

#[tokio::test]
async fn test_delete_all_reports_any_removal_on_every_backend() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_pair(backend, &dir).await;

        store.set("a", fields(json!({"offset": 0}))).await.unwrap();

        let keys = vec!["a".to_string(), "missing".to_string()];
        assert!(store.delete_all(&keys).await.unwrap(), "{backend:?}");
        assert!(!store.delete_all(&keys).await.unwrap(), "{backend:?}");
        assert!(store.keys().await.unwrap().is_empty(), "{backend:?}");
    }
}
