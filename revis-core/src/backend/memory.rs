//! In-process keyspace speaking the same logical protocol as a real server.
//!
//! Cursor scans walk keys in sorted order and, like the real primitive, treat
//! `COUNT` as the number of keys examined, so a step may return an empty
//! batch with a non-zero cursor. A cursor remembers the last key it examined,
//! so deleting keys mid-scan never makes it skip survivors. A handful of hooks
//! inject failures for exercising error paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use revis_model::ConnectionDescriptor;

use super::{
    BackendError, BackendResult, Connector, Reply, StoreConnection, ValueCommand, ValueQuery,
};

const DATABASE_COUNT: u32 = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    String(String),
    List(Vec<String>),
    Set(BTreeSet<String>),
    SortedSet(Vec<(String, f64)>),
    Hash(BTreeMap<String, String>),
}

impl StoredValue {
    pub fn string(value: impl Into<String>) -> Self {
        StoredValue::String(value.into())
    }

    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StoredValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn set<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StoredValue::Set(members.into_iter().map(Into::into).collect())
    }

    pub fn sorted_set<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        StoredValue::SortedSet(
            members
                .into_iter()
                .map(|(member, score)| (member.into(), score))
                .collect(),
        )
    }

    pub fn hash<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        StoredValue::Hash(
            fields
                .into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        )
    }

    fn type_tag(&self) -> &'static str {
        match self {
            StoredValue::String(_) => "string",
            StoredValue::List(_) => "list",
            StoredValue::Set(_) => "set",
            StoredValue::SortedSet(_) => "zset",
            StoredValue::Hash(_) => "hash",
        }
    }
}

type Keyspace = BTreeMap<String, StoredValue>;

#[derive(Debug, Default)]
struct State {
    databases: HashMap<u32, Keyspace>,
    password: Option<String>,
    refuse_connections: Option<String>,
    scans_before_failure: Option<usize>,
    failing_unlink_key: Option<String>,
    failing_flush: Option<BackendError>,
    reply_overrides: HashMap<String, Reply>,
    panic_on_fetch: bool,
    scan_delay: Option<Duration>,
    /// Live scan cursors, each pointing at the last key it examined.
    cursors: HashMap<u64, String>,
    next_cursor: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dials: AtomicUsize,
    open_connections: AtomicUsize,
    scan_calls: AtomicUsize,
    unlink_calls: AtomicUsize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    counters: Counters,
}

/// Cloneable handle to one in-process store. Clones share the keyspace.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("key_count", &self.len(0))
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `AUTH` with this password on every new connection.
    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.shared.state.lock().password = Some(password.into());
        self
    }

    pub fn insert(&self, key: impl Into<String>, value: StoredValue) {
        self.insert_in(0, key, value);
    }

    pub fn insert_in(&self, database: u32, key: impl Into<String>, value: StoredValue) {
        self.shared
            .state
            .lock()
            .databases
            .entry(database)
            .or_default()
            .insert(key.into(), value);
    }

    pub fn contains(&self, database: u32, key: &str) -> bool {
        self.shared
            .state
            .lock()
            .databases
            .get(&database)
            .is_some_and(|keyspace| keyspace.contains_key(key))
    }

    pub fn len(&self, database: u32) -> usize {
        self.shared
            .state
            .lock()
            .databases
            .get(&database)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, database: u32) -> bool {
        self.len(database) == 0
    }

    /// Makes every new dial fail with an I/O error carrying `reason`.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.shared.state.lock().refuse_connections = Some(reason.into());
    }

    pub fn accept_connections(&self) {
        self.shared.state.lock().refuse_connections = None;
    }

    /// Lets `successful` scan calls through, then fails every later one.
    pub fn fail_scans_after(&self, successful: usize) {
        self.shared.state.lock().scans_before_failure = Some(successful);
    }

    /// Fails any unlink batch that contains `key`.
    pub fn fail_unlink_containing(&self, key: impl Into<String>) {
        self.shared.state.lock().failing_unlink_key = Some(key.into());
    }

    /// Fails every `FLUSHDB` with `err`.
    pub fn fail_flushes(&self, err: BackendError) {
        self.shared.state.lock().failing_flush = Some(err);
    }

    /// Answers value lookups for `key` with `reply` instead of the stored
    /// value.
    pub fn override_reply(&self, key: impl Into<String>, reply: Reply) {
        self.shared.state.lock().reply_overrides.insert(key.into(), reply);
    }

    /// Makes value lookups panic, standing in for an unexpected fault inside
    /// a worker task.
    pub fn panic_on_fetch(&self) {
        self.shared.state.lock().panic_on_fetch = true;
    }

    /// Makes every scan step take `delay` before answering.
    pub fn delay_scans(&self, delay: Duration) {
        self.shared.state.lock().scan_delay = Some(delay);
    }

    pub fn dial_count(&self) -> usize {
        self.shared.counters.dials.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.counters.open_connections.load(Ordering::SeqCst)
    }

    pub fn scan_calls(&self) -> usize {
        self.shared.counters.scan_calls.load(Ordering::SeqCst)
    }

    pub fn unlink_calls(&self) -> usize {
        self.shared.counters.unlink_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        _timeout: Duration,
    ) -> BackendResult<Box<dyn StoreConnection>> {
        {
            let state = self.shared.state.lock();
            if let Some(reason) = &state.refuse_connections {
                return Err(BackendError::Io(format!(
                    "{}: {reason}",
                    descriptor.address()
                )));
            }
            match (&state.password, descriptor.secret.is_empty()) {
                (Some(expected), false) if expected == descriptor.secret.expose() => {}
                (Some(_), false) => {
                    return Err(BackendError::Server(
                        "WRONGPASS invalid username-password pair".to_string(),
                    ));
                }
                (Some(_), true) => {
                    return Err(BackendError::Server(
                        "NOAUTH Authentication required".to_string(),
                    ));
                }
                (None, false) => {
                    return Err(BackendError::Server(
                        "ERR AUTH called without any password configured".to_string(),
                    ));
                }
                (None, true) => {}
            }
            if descriptor.database >= DATABASE_COUNT {
                return Err(BackendError::Server("ERR DB index is out of range".to_string()));
            }
        }

        self.shared.counters.dials.fetch_add(1, Ordering::SeqCst);
        self.shared
            .counters
            .open_connections
            .fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            database: descriptor.database,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    database: u32,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("database", &self.database)
            .finish()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared
            .counters
            .open_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> BackendResult<String> {
        Ok("PONG".to_string())
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> BackendResult<(u64, Vec<String>)> {
        let calls = self.shared.counters.scan_calls.fetch_add(1, Ordering::SeqCst);
        let matcher = glob_to_regex(pattern)?;
        let delay = self.shared.state.lock().scan_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.state.lock();
        if state
            .scans_before_failure
            .is_some_and(|successful| calls >= successful)
        {
            return Err(BackendError::Protocol(
                "malformed SCAN reply: cursor is not an integer".to_string(),
            ));
        }

        let start = match cursor {
            0 => Bound::Unbounded,
            live => match state.cursors.remove(&live) {
                Some(last) => Bound::Excluded(last),
                None => return Err(BackendError::Server("ERR invalid cursor".to_string())),
            },
        };

        let (examined, more) = match state.databases.get(&self.database) {
            Some(keyspace) => {
                let mut range = keyspace.range::<String, _>((start, Bound::Unbounded));
                let examined: Vec<String> =
                    range.by_ref().take(count.max(1)).map(|(key, _)| key.clone()).collect();
                (examined, range.next().is_some())
            }
            None => (Vec::new(), false),
        };

        let next_cursor = match examined.last() {
            Some(last) if more => {
                state.next_cursor += 1;
                let id = state.next_cursor;
                state.cursors.insert(id, last.clone());
                id
            }
            _ => 0,
        };
        let keys = examined
            .into_iter()
            .filter(|key| matcher.is_match(key))
            .collect();

        Ok((next_cursor, keys))
    }

    async fn key_types(&mut self, keys: &[String]) -> BackendResult<Vec<String>> {
        let state = self.shared.state.lock();
        let keyspace = state.databases.get(&self.database);
        Ok(keys
            .iter()
            .map(|key| {
                keyspace
                    .and_then(|keyspace| keyspace.get(key))
                    .map_or("none", StoredValue::type_tag)
                    .to_string()
            })
            .collect())
    }

    async fn fetch_values(&mut self, queries: &[ValueQuery<'_>]) -> BackendResult<Vec<Reply>> {
        let should_panic = self.shared.state.lock().panic_on_fetch;
        if should_panic {
            panic!("memory backend: injected fault while fetching values");
        }

        let state = self.shared.state.lock();
        let keyspace = state.databases.get(&self.database);
        queries
            .iter()
            .map(|query| {
                if let Some(reply) = state.reply_overrides.get(query.key) {
                    return Ok(reply.clone());
                }
                let stored = keyspace.and_then(|keyspace| keyspace.get(query.key));
                value_reply(stored, query.command)
            })
            .collect()
    }

    async fn unlink(&mut self, keys: &[String]) -> BackendResult<usize> {
        self.shared.counters.unlink_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if let Some(failing) = &state.failing_unlink_key
            && keys.contains(failing)
        {
            return Err(BackendError::Io(format!(
                "connection reset while unlinking {} keys",
                keys.len()
            )));
        }

        let Some(keyspace) = state.databases.get_mut(&self.database) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|key| keyspace.remove(*key).is_some()).count())
    }

    async fn flush_db(&mut self) -> BackendResult<()> {
        let mut state = self.shared.state.lock();
        if let Some(err) = &state.failing_flush {
            return Err(err.clone());
        }
        state.databases.remove(&self.database);
        Ok(())
    }
}

fn wrong_type() -> BackendError {
    BackendError::Server(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn value_reply(stored: Option<&StoredValue>, command: ValueCommand) -> BackendResult<Reply> {
    let Some(stored) = stored else {
        return Ok(match command {
            ValueCommand::Get => Reply::Nil,
            _ => Reply::Items(Vec::new()),
        });
    };

    match (command, stored) {
        (ValueCommand::Get, StoredValue::String(value)) => Ok(Reply::Text(value.clone())),
        (ValueCommand::ListRange, StoredValue::List(items)) => Ok(Reply::Items(items.clone())),
        (ValueCommand::SetMembers, StoredValue::Set(members)) => {
            Ok(Reply::Items(members.iter().cloned().collect()))
        }
        (ValueCommand::SortedRangeWithScores, StoredValue::SortedSet(members)) => {
            let mut ordered = members.clone();
            ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            Ok(Reply::Items(
                ordered
                    .into_iter()
                    .flat_map(|(member, score)| [member, score.to_string()])
                    .collect(),
            ))
        }
        (ValueCommand::HashGetAll, StoredValue::Hash(fields)) => Ok(Reply::Items(
            fields
                .iter()
                .flat_map(|(field, value)| [field.clone(), value.clone()])
                .collect(),
        )),
        _ => Err(wrong_type()),
    }
}

/// Translates a glob-style `MATCH` pattern (`*`, `?`, `[...]`, `\` escapes)
/// into an anchored regex. An empty pattern matches everything.
fn glob_to_regex(pattern: &str) -> BackendResult<Regex> {
    if pattern.is_empty() {
        return Regex::new("(?s)^.*$").map_err(|e| BackendError::Protocol(e.to_string()));
    }

    let mut translated = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    translated.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            '[' => {
                translated.push('[');
                if let Some(first) = chars.next() {
                    match first {
                        '^' => translated.push('^'),
                        other => translated.push_str(&escape_class_char(other)),
                    }
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '-' {
                        translated.push('-');
                    } else {
                        translated.push_str(&escape_class_char(inner));
                    }
                }
                translated.push(']');
            }
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');

    Regex::new(&translated)
        .map_err(|e| BackendError::Protocol(format!("invalid MATCH pattern {pattern:?}: {e}")))
}

fn escape_class_char(ch: char) -> String {
    match ch {
        '\\' | ']' | '[' | '^' | '&' | '~' => format!("\\{ch}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new("memory", 6379)
    }

    #[test]
    fn glob_patterns_follow_match_semantics() {
        let cases = [
            ("user:*", "user:42", true),
            ("user:*", "session:1", false),
            ("h?llo", "hello", true),
            ("h?llo", "heello", false),
            ("h[ae]llo", "hallo", true),
            ("h[^e]llo", "hello", false),
            ("h[a-b]llo", "hbllo", true),
            ("a\\*b", "a*b", true),
            ("a\\*b", "axb", false),
            ("price.usd", "price.usd", true),
            ("price.usd", "priceXusd", false),
            ("", "anything", true),
        ];
        for (pattern, key, expected) in cases {
            let regex = glob_to_regex(pattern).expect("pattern compiles");
            assert_eq!(regex.is_match(key), expected, "{pattern} vs {key}");
        }
    }

    #[tokio::test]
    async fn scan_examines_count_keys_per_step() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend.insert(format!("a:{i}"), StoredValue::string("v"));
        }
        backend.insert("b:0", StoredValue::string("v"));

        let mut conn = backend
            .connect(&descriptor(), Duration::from_secs(1))
            .await
            .expect("connect");

        let (cursor, keys) = conn.scan(0, "b:*", 3).await.expect("scan");
        assert_ne!(cursor, 0);
        assert!(keys.is_empty());

        let (cursor, keys) = conn.scan(cursor, "b:*", 3).await.expect("scan");
        assert_eq!(cursor, 0);
        assert_eq!(keys, vec!["b:0".to_string()]);
    }

    #[tokio::test]
    async fn authentication_is_enforced() {
        let backend = MemoryBackend::new().with_password("s3cret");

        let err = backend
            .connect(&descriptor(), Duration::from_secs(1))
            .await
            .expect_err("missing password must fail");
        assert!(matches!(err, BackendError::Server(msg) if msg.starts_with("NOAUTH")));

        let ok = backend
            .connect(&descriptor().with_secret("s3cret"), Duration::from_secs(1))
            .await;
        assert!(ok.is_ok());
        assert_eq!(backend.open_connections(), 1);
        drop(ok);
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn reading_a_value_with_the_wrong_command_fails() {
        let backend = MemoryBackend::new();
        backend.insert("l", StoredValue::list(["a"]));
        let mut conn = backend
            .connect(&descriptor(), Duration::from_secs(1))
            .await
            .expect("connect");

        let err = conn
            .fetch_values(&[ValueQuery {
                key: "l",
                command: ValueCommand::Get,
            }])
            .await
            .expect_err("GET on a list");
        assert!(matches!(err, BackendError::Server(msg) if msg.starts_with("WRONGTYPE")));
    }
}
