//! Service configuration.
//!
//! Every section carries defaults, so a TOML file only needs the knobs it
//! wants to change. Environment variables prefixed with `REVIS_` override the
//! file.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use revis_model::ConnectionDescriptor;
use serde::Deserialize;

use crate::error::{Result, RevisError};

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub pool: PoolConfig,
    pub registry: RegistryConfig,
    pub scan: ScanConfig,
    pub delete: DeleteConfig,
    /// Descriptors used to seed the in-memory connection store.
    pub connections: Vec<ConnectionDescriptor>,
}

/// Sizing and timeouts for the per-store connection pool.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on simultaneously checked-out connections per store.
    pub max_connections: usize,
    /// Dial + AUTH + SELECT budget for one new connection (ms).
    pub connect_timeout_ms: u64,
    /// How long a checkout waits for a free slot before failing (ms).
    pub checkout_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_ms: 4_000,
            checkout_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A runner unused for this long is closed and forgotten.
    pub idle_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 31 * 60,
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// `COUNT` hint passed to each cursor scan call.
    pub scan_count: usize,
    /// Keys per published chunk.
    pub chunk_size: usize,
    /// Hard cap on keys produced by one session.
    pub max_keys_per_session: usize,
    /// A session not continued within this window is cancelled.
    pub session_idle_timeout_secs: u64,
    /// Cadence of the expired-session sweep.
    pub sweep_interval_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_count: 200,
            chunk_size: 200,
            max_keys_per_session: 2_100,
            session_idle_timeout_secs: 5 * 60,
            sweep_interval_secs: 30,
        }
    }
}

impl ScanConfig {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Chunks a producer may run ahead of its consumer. Sized so a capped
    /// session never blocks on the channel.
    pub fn buffered_chunks(&self) -> usize {
        self.max_keys_per_session.div_ceil(self.chunk_size.max(1)).max(1)
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct DeleteConfig {
    /// Keys buffered before a batch is handed to its own unlink task.
    pub batch_size: usize,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self { batch_size: 50_000 }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RevisError::Config(format!("invalid TOML: {e}")))
    }

    /// Reads the file, applies `REVIS_*` overrides and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RevisError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "REVIS_POOL_MAX_CONNECTIONS", &mut self.pool.max_connections)?;
        override_from(&lookup, "REVIS_POOL_CONNECT_TIMEOUT_MS", &mut self.pool.connect_timeout_ms)?;
        override_from(
            &lookup,
            "REVIS_POOL_CHECKOUT_TIMEOUT_MS",
            &mut self.pool.checkout_timeout_ms,
        )?;
        override_from(&lookup, "REVIS_IDLE_TIMEOUT_SECS", &mut self.registry.idle_timeout_secs)?;
        override_from(&lookup, "REVIS_SCAN_COUNT", &mut self.scan.scan_count)?;
        override_from(&lookup, "REVIS_SCAN_CHUNK_SIZE", &mut self.scan.chunk_size)?;
        override_from(&lookup, "REVIS_SCAN_MAX_KEYS", &mut self.scan.max_keys_per_session)?;
        override_from(
            &lookup,
            "REVIS_SESSION_IDLE_TIMEOUT_SECS",
            &mut self.scan.session_idle_timeout_secs,
        )?;
        override_from(&lookup, "REVIS_DELETE_BATCH_SIZE", &mut self.delete.batch_size)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.pool.max_connections == 0, "pool.max_connections must be at least 1"),
            (self.pool.connect_timeout_ms == 0, "pool.connect_timeout_ms must be non-zero"),
            (self.pool.checkout_timeout_ms == 0, "pool.checkout_timeout_ms must be non-zero"),
            (self.registry.idle_timeout_secs == 0, "registry.idle_timeout_secs must be non-zero"),
            (self.scan.scan_count == 0, "scan.scan_count must be at least 1"),
            (self.scan.chunk_size == 0, "scan.chunk_size must be at least 1"),
            (self.scan.max_keys_per_session == 0, "scan.max_keys_per_session must be at least 1"),
            (
                self.scan.session_idle_timeout_secs == 0,
                "scan.session_idle_timeout_secs must be non-zero",
            ),
            (self.scan.sweep_interval_secs == 0, "scan.sweep_interval_secs must be non-zero"),
            (self.delete.batch_size == 0, "delete.batch_size must be at least 1"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(RevisError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

fn override_from<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| RevisError::Config(format!("{name}={raw:?}: {e}")))?;
    }
    Ok(())
}
