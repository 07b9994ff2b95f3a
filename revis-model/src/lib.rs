//! Data model definitions shared between the revis core and its callers.
#![allow(missing_docs)]

pub mod connection;
pub mod ids;
pub mod key;
pub mod page;

// Intentionally curated re-exports for downstream consumers.
pub use connection::{ConnectionDescriptor, Secret};
pub use ids::SessionId;
pub use key::{HashField, KeyKind, KeyRecord, KeyValue, ScoredMember};
pub use page::ScanPage;
