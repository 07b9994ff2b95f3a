//! # Revis Core
//!
//! Server-side core for browsing very large key-value stores through a
//! request/response API without ever holding a request open for a full
//! keyspace scan.
//!
//! ## Overview
//!
//! - [`pool`]: bounded, lazily dialed connection pool per remote store
//! - [`iterator`]: cursor-driven key iteration over one pooled connection
//! - [`runner`]: pipelined type/value lookups, flush and bulk delete for one store
//! - [`registry`]: one runner per connection identity, evicted when idle
//! - [`session`]: background scan producers exposed as paged sessions
//! - [`delete`]: concurrent batched deletion with an aggregated report
//! - [`backend`]: the store protocol seam, with Redis and in-memory backends
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use revis_core::{RedisConnector, RevisService, ServiceConfig};
//!
//! async fn browse() -> revis_core::Result<()> {
//!     let config = ServiceConfig::load("revis.toml")?;
//!     let service = RevisService::from_config(config, Arc::new(RedisConnector))?;
//!
//!     let mut page = service.start_scan("local", "user:*").await?;
//!     println!("{} keys", page.len());
//!     while let Some(id) = page.session_id {
//!         page = service.continue_scan(id).await?;
//!         println!("{} more keys", page.len());
//!     }
//!
//!     service.close().await;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

pub mod backend;
pub mod config;
pub mod delete;
pub mod error;
pub mod iterator;
pub mod pool;
pub mod registry;
pub mod runner;
pub mod service;
pub mod session;
pub mod store;

pub use backend::{Connector, MemoryBackend, RedisConnector, StoreConnection, StoredValue};
pub use config::{DeleteConfig, PoolConfig, RegistryConfig, ScanConfig, ServiceConfig};
pub use delete::DeleteReport;
pub use error::{Result, RevisError};
pub use runner::CommandRunner;
pub use service::RevisService;
pub use session::{ScanBridge, ScanEvent};
pub use store::{ConnectionStore, InMemoryConnectionStore};

pub use revis_model as model;
