//! Seam between the core and the remote key-value store.
//!
//! The core only ever issues the handful of logical operations exposed by
//! [`StoreConnection`]. [`redis`] talks to a real server; [`memory`] keeps an
//! in-process keyspace with the same observable behaviour.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use revis_model::{ConnectionDescriptor, KeyKind};
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryBackend, StoredValue};
pub use self::redis::RedisConnector;

#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Command used to read a key's value, chosen from its discovered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCommand {
    /// `GET key`
    Get,
    /// `LRANGE key 0 -1`
    ListRange,
    /// `SMEMBERS key`
    SetMembers,
    /// `ZRANGEBYSCORE key -inf +inf WITHSCORES`
    SortedRangeWithScores,
    /// `HGETALL key`
    HashGetAll,
}

impl ValueCommand {
    pub fn for_kind(kind: KeyKind) -> Self {
        match kind {
            KeyKind::String => ValueCommand::Get,
            KeyKind::List => ValueCommand::ListRange,
            KeyKind::Set => ValueCommand::SetMembers,
            KeyKind::SortedSet => ValueCommand::SortedRangeWithScores,
            KeyKind::Hash => ValueCommand::HashGetAll,
        }
    }
}

/// One pipelined value lookup.
#[derive(Debug, Clone, Copy)]
pub struct ValueQuery<'a> {
    pub key: &'a str,
    pub command: ValueCommand,
}

/// Undecoded reply to a value lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Text(String),
    Items(Vec<String>),
}

/// One live connection, already authenticated and pointed at its database.
///
/// Pipelined methods issue every command before reading any reply and
/// return replies in request order.
#[async_trait]
pub trait StoreConnection: Send + fmt::Debug {
    async fn ping(&mut self) -> BackendResult<String>;

    /// One cursor step. A returned cursor of `0` means the scan is complete.
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> BackendResult<(u64, Vec<String>)>;

    async fn key_types(&mut self, keys: &[String]) -> BackendResult<Vec<String>>;

    async fn fetch_values(&mut self, queries: &[ValueQuery<'_>]) -> BackendResult<Vec<Reply>>;

    /// Non-blocking delete; returns how many keys existed.
    async fn unlink(&mut self, keys: &[String]) -> BackendResult<usize>;

    async fn flush_db(&mut self) -> BackendResult<()>;
}

/// Opens connections for a descriptor: dial, then `AUTH` when a secret is
/// configured, then `SELECT` when the database is non-zero.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        timeout: Duration,
    ) -> BackendResult<Box<dyn StoreConnection>>;
}
