#![allow(dead_code)]

use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use revis_core::model::{ConnectionDescriptor, KeyRecord, ScanPage};
use revis_core::{
    InMemoryConnectionStore, MemoryBackend, RevisService, ScanConfig, ServiceConfig, StoredValue,
};

pub const CONNECTION: &str = "local";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "revis_core=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::new("memory", 6379).with_name(CONNECTION)
}

pub fn scan_config(chunk_size: usize, scan_count: usize, max_keys: usize) -> ScanConfig {
    ScanConfig {
        chunk_size,
        scan_count,
        max_keys_per_session: max_keys,
        ..ScanConfig::default()
    }
}

#[derive(Debug)]
pub struct TestService {
    pub backend: MemoryBackend,
    pub store: Arc<InMemoryConnectionStore>,
    pub service: RevisService,
}

/// Service over a fresh in-memory backend with one connection named
/// [`CONNECTION`].
pub fn build_service(config: ServiceConfig) -> TestService {
    build_service_with(MemoryBackend::new(), config)
}

pub fn build_service_with(backend: MemoryBackend, config: ServiceConfig) -> TestService {
    init_tracing();
    let store = Arc::new(InMemoryConnectionStore::from_descriptors([descriptor()]));
    let service = RevisService::new(config, store.clone(), Arc::new(backend.clone()));
    TestService {
        backend,
        store,
        service,
    }
}

pub fn seed_strings(backend: &MemoryBackend, prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let key = format!("{prefix}:{i:04}");
            backend.insert(key.clone(), StoredValue::string(format!("value-{i}")));
            key
        })
        .collect()
}

pub fn keys_of(records: &[KeyRecord]) -> Vec<String> {
    records.iter().map(|record| record.key.clone()).collect()
}

/// Follows a scan to its last page and returns every page in order.
pub async fn drain_scan(service: &RevisService, pattern: &str) -> Result<Vec<ScanPage>> {
    let mut page = service
        .start_scan(CONNECTION, pattern)
        .await
        .context("start scan")?;
    let mut pages = Vec::new();
    while let Some(id) = page.session_id {
        pages.push(page);
        page = service
            .continue_scan(id)
            .await
            .with_context(|| format!("continue session {id}"))?;
    }
    pages.push(page);
    Ok(pages)
}
