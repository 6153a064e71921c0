use super::*;
use crate::db::{SchemaLifecycle, StoreConfig};

async fn active() -> SchemaLifecycle {
    let lc = SchemaLifecycle::new(StoreConfig::in_memory()).expect("config");
    lc.initialize().await.expect("initialize");
    lc
}

async fn count(lc: &SchemaLifecycle, table: &'static str) -> i64 {
    lc.supervisor()
        .with_current(move |s| {
            Ok(s.conn()?
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn empty_batch_is_rejected_without_store_access() {
    let lc = SchemaLifecycle::new(StoreConfig::in_memory()).unwrap();
    // no schema is active: a validation error proves the store was never touched
    let err = ingest::<VisitRecord>(lc.supervisor(), vec![]).await.unwrap_err();
    assert!(matches!(err, AuditError::Validation(ref m) if m.contains("Visit")));
}

#[tokio::test]
async fn visits_append_without_dedup() {
    let lc = active().await;
    let batch = vec![VisitRecord::new("C1"), VisitRecord::new("C1"), VisitRecord::new("C2")];
    assert_eq!(ingest(lc.supervisor(), batch.clone()).await.unwrap(), 3);
    assert_eq!(ingest(lc.supervisor(), batch).await.unwrap(), 3);
    assert_eq!(count(&lc, "Visit").await, 6);
}

#[tokio::test]
async fn terminal_duplicates_are_skipped_not_overwritten() {
    let lc = active().await;
    let batch = vec![
        TerminalRecord::new("C1", "Acme", "North", "East"),
        TerminalRecord::new("C2", "Bolt", "South", "West"),
        TerminalRecord::new("C1", "Acme Renamed", "X", "Y"),
        TerminalRecord::new("C3", "Core", "South", "West"),
        TerminalRecord::new("C2", "Bolt Again", "X", "Y"),
    ];
    assert_eq!(ingest(lc.supervisor(), batch).await.unwrap(), 3);

    // a later batch conflicting with stored rows is skipped too
    let again = vec![
        TerminalRecord::new("C1", "Other", "A", "B"),
        TerminalRecord::new("C4", "Dyn", "A", "B"),
    ];
    assert_eq!(ingest(lc.supervisor(), again).await.unwrap(), 1);
    assert_eq!(count(&lc, "Terminal").await, 4);

    let name: String = lc
        .supervisor()
        .with_current(|s| {
            Ok(s.conn()?.query_row(
                "SELECT customer_name FROM Terminal WHERE customer_code = 'C1'",
                [],
                |r| r.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(name, "Acme");
}

#[tokio::test]
async fn missing_fields_are_stored_as_null() {
    let lc = active().await;
    let partial = ScanRecord {
        customer_code: Some("C1".into()),
        product_code: None,
        product_name: Some(String::new()),
    };
    assert_eq!(ingest(lc.supervisor(), vec![partial]).await.unwrap(), 1);

    let nulls: i64 = lc
        .supervisor()
        .with_current(|s| {
            Ok(s.conn()?.query_row(
                "SELECT COUNT(*) FROM Scan WHERE product_code IS NULL AND product_name IS NULL",
                [],
                |r| r.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(nulls, 1);
}

#[tokio::test]
async fn terminals_without_code_are_all_kept() {
    // NULL never conflicts on the unique index
    let lc = active().await;
    let batch = vec![TerminalRecord::default(), TerminalRecord::default()];
    assert_eq!(ingest(lc.supervisor(), batch).await.unwrap(), 2);
}
