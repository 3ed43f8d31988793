//! Tusk
//!
//! Resumable file uploads over the tus 1.0.0 protocol, server and client.
//!
//! # Modules
//!
//! - `store`: Metadata stores (memory, locked JSON file, sqlite)
//! - `transfer`: Chunked resumable writes, merging and checksums
//! - `server`: axum router implementing the upload lifecycle
//! - `client`: reqwest-based uploader with resumption and partial uploads
//! - `protocol`: Header names and codecs shared by both sides

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transfer;

pub use client::TusClient;
pub use config::{ClientConfig, Config, ServerConfig, StoreConfig};
pub use error::{Result, TusError};
pub use events::{EventBus, UploadEvent};
pub use server::TusServer;
