use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Plaintext credential for a remote store.
///
/// The buffer is wiped when dropped and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(<redacted>)")
        }
    }
}

/// Everything needed to dial one remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionDescriptor {
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    #[cfg_attr(
        feature = "serde",
        serde(default, alias = "password", skip_serializing_if = "Secret::is_empty")
    )]
    pub secret: Secret,
    #[cfg_attr(feature = "serde", serde(default, alias = "db"))]
    pub database: u32,
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            name: None,
            host: host.into(),
            port,
            secret: Secret::default(),
            database: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<Secret>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// `host:port` of the remote store.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The key under which the registry tracks this connection: the display
    /// name when set, otherwise `host:port` with a `[db]` suffix for non-zero
    /// databases.
    pub fn identity(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ if self.database > 0 => {
                format!("{}[{}]", self.address(), self.database)
            }
            _ => self.address(),
        }
    }
}
