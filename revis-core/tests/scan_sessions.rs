mod support;

use std::time::Duration;

use anyhow::Result;
use revis_core::model::{KeyKind, KeyValue, ScoredMember, SessionId};
use revis_core::{RevisError, ServiceConfig, StoredValue};

use support::{CONNECTION, build_service, drain_scan, keys_of, scan_config, seed_strings};

#[tokio::test]
async fn pages_follow_scan_order_with_typed_values() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(2, 200, 2_100),
        ..ServiceConfig::default()
    });
    test.backend.insert("user:1", StoredValue::string("x"));
    test.backend.insert("user:2", StoredValue::list(["a", "b"]));
    test.backend
        .insert("user:3", StoredValue::sorted_set([("m", 1.5)]));
    test.backend.insert("order:1", StoredValue::string("ignored"));

    let first = test.service.start_scan(CONNECTION, "user:*").await?;
    assert!(first.has_more);
    assert_eq!(keys_of(&first.keys), ["user:1", "user:2"]);
    assert_eq!(first.keys[0].kind, None);
    assert_eq!(first.keys[0].value, Some(KeyValue::Scalar("x".into())));
    assert_eq!(first.keys[1].kind, Some(KeyKind::List));
    assert_eq!(
        first.keys[1].value,
        Some(KeyValue::List(vec!["a".into(), "b".into()]))
    );
    let id = first.session_id.expect("more pages follow");
    assert_eq!(test.service.sessions().session_count(), 1);

    let second = test.service.continue_scan(id).await?;
    assert!(!second.has_more);
    assert_eq!(second.session_id, None);
    assert_eq!(keys_of(&second.keys), ["user:3"]);
    assert_eq!(second.keys[0].kind, Some(KeyKind::SortedSet));
    assert_eq!(
        second.keys[0].value,
        Some(KeyValue::SortedSet(vec![ScoredMember {
            member: "m".into(),
            score: 1.5
        }]))
    );
    assert_eq!(test.service.sessions().session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn scan_without_matches_keeps_no_session() -> Result<()> {
    let test = build_service(ServiceConfig::default());
    seed_strings(&test.backend, "order", 5);

    let page = test.service.start_scan(CONNECTION, "user:*").await?;
    assert!(page.is_empty());
    assert!(!page.has_more);
    assert_eq!(page.session_id, None);
    assert_eq!(test.service.sessions().session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_and_consumed_sessions_are_rejected() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(3, 200, 2_100),
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "k", 10);

    let stranger = SessionId::new();
    assert!(matches!(
        test.service.continue_scan(stranger).await,
        Err(RevisError::SessionNotFound(id)) if id == stranger
    ));

    let first = test.service.start_scan(CONNECTION, "k:*").await?;
    let id = first.session_id.expect("more pages follow");
    let second = test.service.continue_scan(id).await?;
    assert!(second.has_more);
    assert_ne!(second.session_id, Some(id));

    assert!(matches!(
        test.service.continue_scan(id).await,
        Err(RevisError::SessionNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn pages_concatenate_to_every_key_once() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(7, 3, 2_100),
        ..ServiceConfig::default()
    });
    let expected = seed_strings(&test.backend, "item", 45);
    seed_strings(&test.backend, "other", 20);

    let pages = drain_scan(&test.service, "item:*").await?;
    let seen: Vec<String> = pages.iter().flat_map(|page| keys_of(&page.keys)).collect();

    assert_eq!(seen, expected);
    assert_eq!(pages.len(), 7);
    assert!(pages[..6].iter().all(|page| page.len() == 7 && page.has_more));
    assert_eq!(pages[6].len(), 3);
    Ok(())
}

#[tokio::test]
async fn sessions_stop_at_the_key_cap() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(10, 25, 35),
        ..ServiceConfig::default()
    });
    let all = seed_strings(&test.backend, "item", 80);

    let pages = drain_scan(&test.service, "*").await?;
    let seen: Vec<String> = pages.iter().flat_map(|page| keys_of(&page.keys)).collect();

    assert_eq!(seen, all[..35]);
    let last = pages.last().expect("at least one page");
    assert!(!last.has_more);
    assert_eq!(last.len(), 5);
    Ok(())
}

#[tokio::test]
async fn cap_on_a_chunk_boundary_ends_with_that_chunk() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(10, 25, 20),
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "item", 80);

    let pages = drain_scan(&test.service, "*").await?;
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[1].len(), 10);
    assert!(!pages[1].has_more);
    Ok(())
}

#[tokio::test]
async fn iteration_error_ends_the_session() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(2, 2, 2_100),
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "k", 6);
    test.backend.fail_scans_after(1);

    let first = test.service.start_scan(CONNECTION, "k:*").await?;
    assert_eq!(first.len(), 2);
    let id = first.session_id.expect("cursor is still live");

    let err = test
        .service
        .continue_scan(id)
        .await
        .expect_err("second scan step fails");
    assert!(matches!(err, RevisError::Iteration(_)));
    assert_eq!(test.service.sessions().session_count(), 0);
    assert!(matches!(
        test.service.continue_scan(id).await,
        Err(RevisError::SessionNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn unparsable_scores_fail_the_scan() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(5, 200, 2_100),
        ..ServiceConfig::default()
    });
    test.backend
        .insert("z", StoredValue::sorted_set([("m", 1.0)]));
    test.backend.override_reply(
        "z",
        revis_core::backend::Reply::Items(vec!["m".into(), "not-a-score".into()]),
    );

    let err = test
        .service
        .start_scan(CONNECTION, "*")
        .await
        .expect_err("score must parse");
    assert!(matches!(err, RevisError::Fetch(_)));
    assert_eq!(test.service.sessions().session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn producer_panic_is_delivered_as_an_error() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(2, 200, 2_100),
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "k", 5);
    test.backend.panic_on_fetch();

    let err = test
        .service
        .start_scan(CONNECTION, "k:*")
        .await
        .expect_err("producer panics");
    assert!(matches!(err, RevisError::Internal(msg) if msg.contains("panicked")));
    assert_eq!(test.service.sessions().session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_connection_is_reported() {
    let test = build_service(ServiceConfig::default());
    assert!(matches!(
        test.service.start_scan("nowhere", "*").await,
        Err(RevisError::ConnectionNotFound(name)) if name == "nowhere"
    ));
}

#[tokio::test(start_paused = true)]
async fn abandoned_session_expires_and_releases_its_connection() -> Result<()> {
    let mut scan = scan_config(1, 1, 2_100);
    scan.session_idle_timeout_secs = 10;
    scan.sweep_interval_secs = 1;
    let test = build_service(ServiceConfig {
        scan,
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "k", 5);
    test.backend.delay_scans(Duration::from_secs(30));

    let first = test.service.start_scan(CONNECTION, "k:*").await?;
    let id = first.session_id.expect("more pages follow");
    let runner = test.service.registry().get_runner(CONNECTION).await?;
    assert_eq!(runner.in_use(), 1, "producer still holds its iterator");

    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(test.service.sessions().session_count(), 0);
    assert_eq!(runner.in_use(), 0);
    assert!(matches!(
        test.service.continue_scan(id).await,
        Err(RevisError::SessionNotFound(_))
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn continuing_pushes_the_expiry_back() -> Result<()> {
    let mut scan = scan_config(1, 200, 2_100);
    scan.session_idle_timeout_secs = 10;
    scan.sweep_interval_secs = 1;
    let test = build_service(ServiceConfig {
        scan,
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "k", 3);

    let first = test.service.start_scan(CONNECTION, "k:*").await?;
    tokio::time::sleep(Duration::from_secs(8)).await;
    let second = test
        .service
        .continue_scan(first.session_id.expect("more"))
        .await?;
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert_eq!(test.service.sessions().session_count(), 1);
    let last = test
        .service
        .continue_scan(second.session_id.expect("more"))
        .await?;
    assert!(!last.has_more);
    Ok(())
}

#[tokio::test]
async fn close_cancels_sessions_and_pools() -> Result<()> {
    let test = build_service(ServiceConfig {
        scan: scan_config(2, 200, 2_100),
        ..ServiceConfig::default()
    });
    seed_strings(&test.backend, "k", 6);

    let first = test.service.start_scan(CONNECTION, "k:*").await?;
    let runner = test.service.registry().get_runner(CONNECTION).await?;
    test.service.close().await;

    assert_eq!(test.service.sessions().session_count(), 0);
    assert!(runner.is_closed());
    assert!(matches!(
        test.service
            .continue_scan(first.session_id.expect("more"))
            .await,
        Err(RevisError::SessionNotFound(_))
    ));
    Ok(())
}
