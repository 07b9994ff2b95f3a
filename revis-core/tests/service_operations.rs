mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use revis_core::model::ConnectionDescriptor;
use revis_core::{
    DeleteConfig, MemoryBackend, RegistryConfig, RevisError, RevisService, ServiceConfig,
    StoredValue,
};

use support::{CONNECTION, build_service, build_service_with, descriptor, seed_strings};

fn delete_config(batch_size: usize) -> ServiceConfig {
    ServiceConfig {
        delete: DeleteConfig { batch_size },
        ..ServiceConfig::default()
    }
}

#[tokio::test]
async fn delete_counts_every_batch() -> Result<()> {
    let test = build_service(delete_config(50));
    seed_strings(&test.backend, "session", 120);
    seed_strings(&test.backend, "user", 7);

    let report = test.service.delete_matching(CONNECTION, "session:*").await?;

    assert_eq!(report.count, 120);
    assert!(report.deleted_all_keys);
    assert_eq!(test.backend.unlink_calls(), 3);
    assert_eq!(test.backend.len(0), 7);
    Ok(())
}

#[tokio::test]
async fn delete_reports_first_error_and_completed_batches() -> Result<()> {
    let test = build_service(delete_config(10));
    seed_strings(&test.backend, "tmp", 30);
    test.backend.fail_unlink_containing("tmp:0015");

    let report = test.service.delete_matching(CONNECTION, "tmp:*").await?;

    assert_eq!(report.count, 20);
    assert!(!report.deleted_all_keys);
    assert!(matches!(report.error, Some(RevisError::DeleteBatch(_))));
    assert_eq!(test.backend.len(0), 10);
    Ok(())
}

#[tokio::test]
async fn delete_report_serializes_without_the_error() -> Result<()> {
    let test = build_service(delete_config(10));
    seed_strings(&test.backend, "tmp", 4);

    let report = test.service.delete_matching(CONNECTION, "tmp:*").await?;
    let json = serde_json::to_value(&report)?;

    assert_eq!(json, serde_json::json!({ "count": 4, "deletedAllKeys": true }));
    Ok(())
}

#[tokio::test]
async fn flush_clears_only_the_selected_database() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_in(2, "a", StoredValue::string("1"));
    backend.insert_in(0, "b", StoredValue::string("2"));
    let test = build_service_with(backend, ServiceConfig::default());
    test.store
        .upsert(
            ConnectionDescriptor::new("memory", 6379).with_database(2),
            None,
        )
        .await;

    test.service.flush("memory:6379[2]").await?;

    assert!(test.backend.is_empty(2));
    assert!(test.backend.contains(0, "b"));
    Ok(())
}

#[tokio::test]
async fn connection_test_checks_credentials() {
    let backend = MemoryBackend::new().with_password("hunter2");
    let test = build_service_with(backend, ServiceConfig::default());

    test.service
        .test_connection(&descriptor().with_secret("hunter2"))
        .await
        .expect("correct password");

    let err = test
        .service
        .test_connection(&descriptor())
        .await
        .expect_err("password required");
    assert!(matches!(err, RevisError::Connection(msg) if msg.contains("NOAUTH")));

    assert!(test.service.registry().is_empty().await);
}

#[tokio::test]
async fn closing_a_connection_redials_on_next_use() -> Result<()> {
    let test = build_service(ServiceConfig::default());
    seed_strings(&test.backend, "k", 3);

    test.service.start_scan(CONNECTION, "*").await?;
    test.service.start_scan(CONNECTION, "*").await?;
    assert_eq!(test.backend.dial_count(), 1);

    assert!(test.service.close_connection(CONNECTION).await);
    assert!(!test.service.close_connection(CONNECTION).await);

    test.service.start_scan(CONNECTION, "*").await?;
    assert_eq!(test.backend.dial_count(), 2);
    Ok(())
}

#[tokio::test]
async fn edited_descriptors_take_effect_after_close() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_in(0, "zero", StoredValue::string("0"));
    backend.insert_in(4, "four", StoredValue::string("4"));
    let test = build_service_with(backend, ServiceConfig::default());

    let page = test.service.start_scan(CONNECTION, "*").await?;
    assert_eq!(page.keys[0].key, "zero");

    let replaced = test
        .store
        .upsert(descriptor().with_database(4), Some(CONNECTION))
        .await;
    test.service.close_connection(&replaced.expect("replaced")).await;

    let page = test.service.start_scan(CONNECTION, "*").await?;
    assert_eq!(page.keys[0].key, "four");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_runner_is_evicted_and_rebuilt() -> Result<()> {
    let test = build_service(ServiceConfig {
        registry: RegistryConfig {
            idle_timeout_secs: 120,
        },
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "k", 2);

    let first = test.service.registry().get_runner(CONNECTION).await?;
    tokio::time::sleep(Duration::from_secs(90)).await;
    let again = test.service.registry().get_runner(CONNECTION).await?;
    assert!(Arc::ptr_eq(&first, &again));

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert!(!test.service.registry().contains(CONNECTION).await);
    assert!(first.is_closed());

    test.service.start_scan(CONNECTION, "*").await?;
    assert_eq!(test.backend.dial_count(), 2);
    Ok(())
}

#[tokio::test]
async fn closed_service_refuses_further_work() -> Result<()> {
    let test = build_service(ServiceConfig::default());
    seed_strings(&test.backend, "tmp", 3);
    test.service.start_scan(CONNECTION, "*").await?;

    test.service.close().await;

    assert!(matches!(
        test.service.start_scan(CONNECTION, "*").await,
        Err(RevisError::PoolClosed(_))
    ));
    assert!(matches!(
        test.service.delete_matching(CONNECTION, "tmp:*").await,
        Err(RevisError::PoolClosed(_))
    ));
    assert!(matches!(
        test.service.flush(CONNECTION).await,
        Err(RevisError::PoolClosed(_))
    ));
    assert_eq!(test.backend.len(0), 3);
    assert_eq!(test.backend.dial_count(), 1);
    assert_eq!(test.backend.open_connections(), 0);
    assert!(test.service.registry().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn from_config_serves_listed_connections() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert("greeting", StoredValue::string("hello"));
    let config = ServiceConfig::from_toml_str(
        r#"
        [[connections]]
        name = "demo"
        host = "memory"
        port = 6379
        "#,
    )?;

    let service = RevisService::from_config(config, Arc::new(backend))?;
    let page = service.start_scan("demo", "greet*").await?;
    assert_eq!(page.len(), 1);
    service.close().await;
    Ok(())
}

#[tokio::test]
async fn from_config_rejects_invalid_settings() {
    let mut config = ServiceConfig::default();
    config.delete.batch_size = 0;
    assert!(matches!(
        RevisService::from_config(config, Arc::new(MemoryBackend::new())),
        Err(RevisError::Config(_))
    ));
}
