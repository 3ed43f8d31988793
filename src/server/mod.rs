//! tus Server
//!
//! Maps HTTP verbs onto the upload lifecycle:
//! - POST {api_path} - create an upload, or concatenate partial uploads
//! - HEAD {api_path}/:key - report the current offset
//! - PATCH {api_path}/:key - append bytes from the stored offset
//! - GET {api_path}/:key - download the file
//! - DELETE {api_path}/:key - terminate the upload
//! - OPTIONS - advertise version, extensions and checksum algorithms

mod error;
mod expiration;
mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{head, post},
    Router,
};
use tokio::sync::broadcast;

use crate::config::ServerConfig;
use crate::events::{EventBus, UploadEvent};
use crate::protocol::{TUS_RESUMABLE, TUS_VERSION, TUS_VERSION_HEADER};
use crate::store::SharedStore;
use crate::transfer::TransferEngine;

pub use error::ApiError;

/// Cheaply cloneable handle; doubles as the router state
#[derive(Clone)]
pub struct TusServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    upload_dir: PathBuf,
    store: SharedStore,
    engine: TransferEngine,
    events: EventBus,
}

impl TusServer {
    pub fn new(config: ServerConfig, store: SharedStore) -> Self {
        let events = EventBus::new();
        let engine = TransferEngine::new(store.clone(), config.chunk_size).with_events(events.clone());

        // Records keep absolute paths so they stay valid whatever the cwd
        let upload_dir = if config.upload_dir.is_absolute() {
            config.upload_dir.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&config.upload_dir))
                .unwrap_or_else(|_| config.upload_dir.clone())
        };

        Self {
            inner: Arc::new(ServerInner {
                config,
                upload_dir,
                store,
                engine,
                events,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.inner.engine
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn publish(&self, event: UploadEvent) {
        self.inner.events.publish(event);
    }

    /// Every upload lives in its own directory named after its key
    pub fn file_path(&self, key: &str, name: &str) -> PathBuf {
        self.inner.upload_dir.join(key).join(name)
    }

    /// Public URL of an upload, from `base_url` or the request's `Host`
    pub fn location(&self, request_headers: &HeaderMap, key: &str) -> String {
        let base = match &self.inner.config.base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => {
                let host = request_headers
                    .get(axum::http::header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("localhost");
                format!("http://{host}")
            }
        };

        format!("{base}{}/{key}", self.collection_path().trim_end_matches('/'))
    }

    fn collection_path(&self) -> &str {
        &self.inner.config.api_path
    }

    /// Build the router for the upload endpoints
    pub fn router(&self) -> Router {
        let collection = self.collection_path().to_string();
        let item = format!("{}/:key", collection.trim_end_matches('/'));

        Router::new()
            .route(
                &collection,
                post(handlers::create)
                    .get(handlers::missing_key)
                    .options(handlers::options),
            )
            .route(
                &item,
                head(handlers::status)
                    .patch(handlers::append)
                    .get(handlers::download)
                    .delete(handlers::terminate)
                    .options(handlers::options),
            )
            .layer(middleware::from_fn(negotiate_version))
            .with_state(self.clone())
    }
}

/// Rejects foreign protocol versions and stamps `Tus-Resumable` on replies.
///
/// OPTIONS is exempt both ways since it precedes negotiation.
async fn negotiate_version(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let client_version = request
        .headers()
        .get(TUS_RESUMABLE)
        .map(|value| value.to_str().unwrap_or_default().trim().to_string());

    let mut response = match client_version {
        Some(version) if version != TUS_VERSION => {
            tracing::debug!(version = %version, "Rejected unsupported protocol version");
            let mut response = StatusCode::PRECONDITION_FAILED.into_response();
            response
                .headers_mut()
                .insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
            response
        }
        _ => next.run(request).await,
    };

    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}
