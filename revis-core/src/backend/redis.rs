use std::fmt;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{RedisError, Value};
use async_trait::async_trait;
use revis_model::ConnectionDescriptor;
use tracing::debug;

use super::{
    BackendError, BackendResult, Connector, Reply, StoreConnection, ValueCommand, ValueQuery,
};

impl From<RedisError> for BackendError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() {
            BackendError::Io(err.to_string())
        } else if err.code().is_some() {
            BackendError::Server(err.to_string())
        } else {
            BackendError::Protocol(err.to_string())
        }
    }
}

/// Dials real Redis-compatible servers over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        timeout: Duration,
    ) -> BackendResult<Box<dyn StoreConnection>> {
        let address = descriptor.address();
        debug!("Dialing store at {}", address);

        let client = ::redis::Client::open(format!("redis://{address}/"))?;

        let establish = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            if !descriptor.secret.is_empty() {
                ::redis::cmd("AUTH")
                    .arg(descriptor.secret.expose())
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            if descriptor.database > 0 {
                ::redis::cmd("SELECT")
                    .arg(descriptor.database)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            Ok::<_, RedisError>(conn)
        };

        let conn = tokio::time::timeout(timeout, establish)
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;

        Ok(Box::new(RedisConnection { address, conn }))
    }
}

pub struct RedisConnection {
    address: String,
    conn: MultiplexedConnection,
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("address", &self.address)
            .field("connection", &"MultiplexedConnection")
            .finish()
    }
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn ping(&mut self) -> BackendResult<String> {
        let reply: String = ::redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(reply)
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> BackendResult<(u64, Vec<String>)> {
        let (next_cursor, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await?;
        Ok((next_cursor, keys))
    }

    async fn key_types(&mut self, keys: &[String]) -> BackendResult<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for key in keys {
            pipe.cmd("TYPE").arg(key);
        }
        let types: Vec<String> = pipe.query_async(&mut self.conn).await?;
        Ok(types)
    }

    async fn fetch_values(&mut self, queries: &[ValueQuery<'_>]) -> BackendResult<Vec<Reply>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for query in queries {
            match query.command {
                ValueCommand::Get => pipe.cmd("GET").arg(query.key),
                ValueCommand::ListRange => pipe.cmd("LRANGE").arg(query.key).arg(0).arg(-1),
                ValueCommand::SetMembers => pipe.cmd("SMEMBERS").arg(query.key),
                ValueCommand::SortedRangeWithScores => pipe
                    .cmd("ZRANGEBYSCORE")
                    .arg(query.key)
                    .arg("-inf")
                    .arg("+inf")
                    .arg("WITHSCORES"),
                ValueCommand::HashGetAll => pipe.cmd("HGETALL").arg(query.key),
            };
        }

        let values: Vec<Value> = pipe.query_async(&mut self.conn).await?;
        values.into_iter().map(reply_from_value).collect()
    }

    async fn unlink(&mut self, keys: &[String]) -> BackendResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = ::redis::cmd("UNLINK")
            .arg(keys)
            .query_async(&mut self.conn)
            .await?;
        Ok(removed)
    }

    async fn flush_db(&mut self) -> BackendResult<()> {
        ::redis::cmd("FLUSHDB")
            .query_async::<()>(&mut self.conn)
            .await?;
        Ok(())
    }
}

fn reply_from_value(value: Value) -> BackendResult<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Array(items) | Value::Set(items) => items
            .into_iter()
            .map(text_from_value)
            .collect::<BackendResult<Vec<_>>>()
            .map(Reply::Items),
        other => text_from_value(other).map(Reply::Text),
    }
}

fn text_from_value(value: Value) -> BackendResult<String> {
    match value {
        Value::BulkString(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(text) => Ok(text),
        Value::Int(number) => Ok(number.to_string()),
        Value::Okay => Ok("OK".to_string()),
        other => Err(BackendError::Protocol(format!(
            "unexpected reply element: {other:?}"
        ))),
    }
}
