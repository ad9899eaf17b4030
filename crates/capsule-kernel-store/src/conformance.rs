//! Behaviour every `CapsuleStore` backend must share. Each backend's test
//! module runs these against a fresh instance.

use serde_json::json;

use capsule_kernel_core::{ProofBuilder, ProofObject, TimeCapsule};

use crate::error::StoreError;
use crate::traits::CapsuleStore;

pub(crate) const DIMENSION: &str = "accrual.calculate";

pub(crate) fn proof(accrued: f64, ts: i64) -> ProofObject {
    ProofBuilder::new(DIMENSION)
        .inputs(&json!({"hoursWorked": 80, "yearlyAccrued": accrued}))
        .outputs(&json!({"yearlyAccrued": accrued + 2.67, "capped": false}))
        .statute_ref("Reference Sick Time Act §3(a)")
        .timestamp(ts)
        .seal()
        .unwrap()
}

pub(crate) fn capsule(subject: &str, accrued: f64, ts: i64) -> TimeCapsule {
    TimeCapsule::new(subject, DIMENSION, proof(accrued, ts), ts, ts, "v1").unwrap()
}

pub(crate) async fn store_and_retrieve(store: &dyn CapsuleStore) {
    let c = capsule("emp-1", 0.0, 10);
    store.store(&c).await.unwrap();
    assert_eq!(store.retrieve(&c.id).await.unwrap(), Some(c.clone()));
    assert_eq!(store.active("emp-1", DIMENSION).await.unwrap(), Some(c.clone()));
    assert!(store.active("emp-2", DIMENSION).await.unwrap().is_none());
    assert!(matches!(store.store(&c).await, Err(StoreError::Duplicate(_))));
    assert_eq!(store.count().await.unwrap(), 1);
}

pub(crate) async fn single_active(store: &dyn CapsuleStore) {
    store.store(&capsule("emp-1", 0.0, 10)).await.unwrap();
    let err = store.store(&capsule("emp-1", 1.0, 20)).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
    // other subjects are independent
    store.store(&capsule("emp-2", 1.0, 20)).await.unwrap();
}

pub(crate) async fn supersede_chain(store: &dyn CapsuleStore) {
    let first = capsule("emp-1", 0.0, 10);
    store.store(&first).await.unwrap();
    let second = store.supersede(&first.id, proof(2.67, 20), 20, "v1").await.unwrap();

    assert_eq!(second.supersedes, Some(first.id));
    assert_eq!(second.calculated_at, 20);
    let old = store.retrieve(&first.id).await.unwrap().unwrap();
    assert!(!old.is_active);
    assert_eq!(old.superseded_by, Some(second.id));
    assert_eq!(store.active("emp-1", DIMENSION).await.unwrap().unwrap().id, second.id);

    let timeline = store.timeline("emp-1", DIMENSION).await.unwrap();
    assert_eq!(timeline.iter().map(|c| c.id).collect::<Vec<_>>(), vec![first.id, second.id]);
    assert_eq!(timeline.iter().filter(|c| c.is_active).count(), 1);

    assert!(matches!(
        store.supersede(&first.id, proof(5.0, 30), 30, "v1").await,
        Err(StoreError::AlreadySuperseded(_))
    ));
}

pub(crate) async fn as_of(store: &dyn CapsuleStore) {
    let first = capsule("emp-1", 0.0, 100);
    store.store(&first).await.unwrap();
    let second = store.supersede(&first.id, proof(2.67, 200), 200, "v1").await.unwrap();

    let at = |t| store.as_of("emp-1", DIMENSION, t);
    assert!(at(50).await.unwrap().is_none());
    assert_eq!(at(150).await.unwrap().unwrap().id, first.id);
    assert_eq!(at(200).await.unwrap().unwrap().id, second.id);
}

pub(crate) async fn export(store: &dyn CapsuleStore) {
    let first = capsule("emp-1", 0.0, 10);
    store.store(&first).await.unwrap();
    store.supersede(&first.id, proof(2.67, 20), 20, "v1").await.unwrap();
    let other_dim = TimeCapsule::new("emp-1", "usage.record", proof(1.0, 15), 15, 15, "v1").unwrap();
    store.store(&other_dim).await.unwrap();

    let export = store.export_timeline("emp-1", 99).await.unwrap();
    assert_eq!(export.capsules.len(), 3);
    assert_eq!(export.capsules[2].dimension, "usage.record");

    let json = export.to_json().unwrap();
    let back = capsule_kernel_core::LedgerExport::from_json(&json).unwrap();
    let report = back.verify_all();
    assert!(report.is_valid(), "{:?}", report);
    assert_eq!(report.verified, 3);
}

pub(crate) async fn rejects_tampered(store: &dyn CapsuleStore) {
    let mut c = capsule("emp-1", 0.0, 10);
    c.ruleset_version = "v2".into();
    assert!(matches!(store.store(&c).await, Err(StoreError::Integrity(_))));
    assert_eq!(store.count().await.unwrap(), 0);
}
