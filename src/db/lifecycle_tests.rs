use std::time::Duration;

use super::*;
use crate::db::{ingest, query_merged, MergedFilter, StoreLocation, TerminalRecord};

fn memory() -> SchemaLifecycle {
    SchemaLifecycle::new(StoreConfig::in_memory()).expect("config")
}

#[tokio::test]
async fn starts_absent_then_initializes() {
    let lc = memory();
    assert!(!lc.status().await.active);

    let name = lc.initialize().await.unwrap();
    let status = lc.status().await;
    assert!(status.active);
    assert_eq!(status.schema.as_deref(), Some(name.as_str()));
    assert_eq!(status.generation, Some(1));
}

#[tokio::test]
async fn initialize_twice_is_a_conflict() {
    let lc = memory();
    lc.initialize().await.unwrap();
    assert!(matches!(lc.initialize().await, Err(AuditError::SchemaActive(_))));
}

#[tokio::test]
async fn reset_yields_new_empty_schema() {
    let lc = memory();
    let first = lc.initialize().await.unwrap();
    ingest(lc.supervisor(), vec![TerminalRecord::new("C1", "Acme", "N", "E")])
        .await
        .unwrap();

    let second = lc.reset().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(lc.status().await.generation, Some(2));
    assert!(query_merged(lc.supervisor(), MergedFilter::default()).await.unwrap().is_empty());

    // the fresh schema behaves like a new instance
    assert_eq!(
        ingest(lc.supervisor(), vec![TerminalRecord::new("C1", "Acme", "N", "E")]).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn reset_from_absent_recovers() {
    let lc = memory();
    let name = lc.reset().await.unwrap();
    assert_eq!(lc.status().await.schema.as_deref(), Some(name.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_waits_for_outstanding_lease() {
    let lc = Arc::new(memory());
    let first = lc.initialize().await.unwrap();

    let lease = lc.supervisor().current().await.unwrap();
    let resetter = Arc::clone(&lc);
    let pending = tokio::spawn(async move { resetter.reset().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished(), "reset must not swap under a live lease");
    assert_eq!(lease.name(), &first);
    drop(lease);

    let second = pending.await.unwrap().unwrap();
    assert_ne!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_reset_is_rejected() {
    let lc = Arc::new(memory());
    lc.initialize().await.unwrap();

    let lease = lc.supervisor().current().await.unwrap();
    let resetter = Arc::clone(&lc);
    let first = tokio::spawn(async move { resetter.reset().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(lc.reset().await, Err(AuditError::ResetInProgress)));
    assert!(matches!(lc.initialize().await, Err(AuditError::ResetInProgress)));

    drop(lease);
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn failed_reset_leaves_no_active_schema() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let location = StoreLocation::Directory(data.clone());
    let lc = SchemaLifecycle::new(StoreConfig::new(location)).unwrap();
    let first = lc.initialize().await.unwrap();

    // swap the data directory for a plain file: nothing under it can be dropped
    std::fs::remove_dir_all(&data).unwrap();
    std::fs::write(&data, b"").unwrap();

    assert!(matches!(lc.reset().await, Err(AuditError::Lifecycle(_))));
    assert!(!lc.status().await.active);
    let err = ingest(lc.supervisor(), vec![TerminalRecord::new("C1", "A", "B", "C")])
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::NoActiveSchema));

    std::fs::remove_file(&data).unwrap();
    let recovered = lc.initialize().await.unwrap();
    assert_ne!(recovered, first);
    assert!(lc.status().await.active);
    assert!(lc.config().location.schema_exists(&recovered));
}

#[tokio::test]
async fn directory_reset_deletes_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let location = StoreLocation::Directory(dir.path().to_path_buf());
    let lc = SchemaLifecycle::new(StoreConfig::new(location.clone())).unwrap();

    let first = lc.initialize().await.unwrap();
    assert!(location.schema_exists(&first));

    let second = lc.reset().await.unwrap();
    assert!(!location.schema_exists(&first));
    assert!(location.schema_exists(&second));
}

#[tokio::test]
async fn drop_tears_down_active_schema() {
    let dir = tempfile::tempdir().unwrap();
    let location = StoreLocation::Directory(dir.path().to_path_buf());

    let lc = SchemaLifecycle::new(StoreConfig::new(location.clone())).unwrap();
    let name = lc.initialize().await.unwrap();
    drop(lc);
    assert!(!location.schema_exists(&name));

    let mut keep = StoreConfig::new(location.clone());
    keep.keep_on_exit = true;
    let lc = SchemaLifecycle::new(keep).unwrap();
    let kept = lc.initialize().await.unwrap();
    drop(lc);
    assert!(location.schema_exists(&kept));
}

#[tokio::test]
async fn timed_out_build_is_queued_even_without_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let location = StoreLocation::Directory(dir.path().to_path_buf());
    let lc = SchemaLifecycle::new(StoreConfig::new(location.clone())).unwrap();
    let name = SchemaName::generate("terminal").unwrap();

    assert!(!location.schema_exists(&name));
    assert!(lc.may_have_left(&name, &AuditError::Timeout(Duration::from_secs(1))));
    assert!(!lc.may_have_left(&name, &AuditError::Internal("join".into())));

    location.create_schema(&name).unwrap();
    assert!(lc.may_have_left(&name, &AuditError::Internal("join".into())));
}

#[tokio::test]
async fn late_file_from_timed_out_build_is_dropped_next_time() {
    let dir = tempfile::tempdir().unwrap();
    let location = StoreLocation::Directory(dir.path().to_path_buf());
    let lc = SchemaLifecycle::new(StoreConfig::new(location.clone())).unwrap();

    // queued at timeout, the file shows up once the abandoned build finishes
    let late = SchemaName::generate("terminal").unwrap();
    lc.gate.lock().await.push(late.clone());
    location.create_schema(&late).unwrap();

    let active = lc.initialize().await.unwrap();
    assert!(!location.schema_exists(&late));
    assert!(location.schema_exists(&active));
    assert!(lc.gate.lock().await.is_empty());
}
