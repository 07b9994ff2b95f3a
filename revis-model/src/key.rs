//! Keys and the values attached to them.
//!
//! The backend's type space is fixed, so values are a closed set of shapes
//! rather than a dynamic payload.

use std::fmt;

use chrono::{DateTime, Utc};

/// Backend type of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum KeyKind {
    #[default]
    String,
    List,
    Set,
    #[cfg_attr(feature = "serde", serde(rename = "zset"))]
    SortedSet,
    Hash,
}

impl KeyKind {
    /// Maps a `TYPE` reply onto a kind. Tags outside the known set are
    /// treated like plain strings.
    pub fn from_type_tag(tag: &str) -> Self {
        match tag {
            "list" => KeyKind::List,
            "set" => KeyKind::Set,
            "zset" => KeyKind::SortedSet,
            "hash" => KeyKind::Hash,
            _ => KeyKind::String,
        }
    }

    pub fn as_type_tag(&self) -> &'static str {
        match self {
            KeyKind::String => "string",
            KeyKind::List => "list",
            KeyKind::Set => "set",
            KeyKind::SortedSet => "zset",
            KeyKind::Hash => "hash",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_type_tag())
    }
}

/// Member of a sorted set together with its score.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// One field of a hash.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HashField {
    pub field: String,
    pub value: String,
}

/// Value payload of a key, one variant per backend shape.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum KeyValue {
    Scalar(String),
    List(Vec<String>),
    Set(Vec<String>),
    SortedSet(Vec<ScoredMember>),
    Hash(Vec<HashField>),
}

impl KeyValue {
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyValue::Scalar(_) => KeyKind::String,
            KeyValue::List(_) => KeyKind::List,
            KeyValue::Set(_) => KeyKind::Set,
            KeyValue::SortedSet(_) => KeyKind::SortedSet,
            KeyValue::Hash(_) => KeyKind::Hash,
        }
    }
}

/// A key produced by a scan, enriched with its type and value once fetched.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KeyRecord {
    pub key: String,
    /// `None` means the default scalar type.
    #[cfg_attr(
        feature = "serde",
        serde(rename = "type", skip_serializing_if = "Option::is_none")
    )]
    pub kind: Option<KeyKind>,
    /// `None` until fetched, or when the key vanished before its value was
    /// read.
    #[cfg_attr(feature = "serde", serde(rename = "val"))]
    pub value: Option<KeyValue>,
    #[cfg_attr(
        feature = "serde",
        serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: None,
            value: None,
            expires_at: None,
        }
    }

    pub fn with_value(mut self, value: KeyValue) -> Self {
        self.kind = match value.kind() {
            KeyKind::String => None,
            other => Some(other),
        };
        self.value = Some(value);
        self
    }

    /// Effective kind, resolving an absent tag to the scalar default.
    pub fn effective_kind(&self) -> KeyKind {
        self.kind.unwrap_or_default()
    }
}
