//! Integration tests for the workflow manager.
//!
//! These exercise the full path from event routing through runner
//! transactions to atomic persistence, against both storage backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use navis_core::model::{DataMap, WorkflowState};
use navis_core::storage::{Table, WriteBatch};
use navis_core::{
    Database, EventData, MemoryStorage, Role, SourceStates, SqliteStorage, Stage, StepBuilder,
    StepStatus, Subscription, WorkflowBuilder, WorkflowError, WorkflowManager, WorkflowRegistry,
    WorkflowStatus, WorkflowStorage, ALL_STATES,
};
use serde_json::{json, Value};
use uuid::Uuid;

fn loan_application() -> WorkflowBuilder {
    WorkflowBuilder::new("Loan Application")
        .stage(Stage::new("intake", "Intake"))
        .stage(Stage::new("decision", "Decision"))
        .role(Role::new("applicant", "Applicant"))
        .role(Role::new("officer", "Loan Officer"))
        .step(
            StepBuilder::new("review", "Document Review", "intake")
                .states(["CREATED", "RUNNING", "DONE"])
                .start("CREATED")
                .initial()
                .finish_on(["DONE"])
                .transition("RUNNING", SourceStates::only(["CREATED"]), |ctx, _| {
                    ctx.set_step_memory("reviewer", json!("u-officer"))?;
                    Ok(vec!["Review started".to_string()])
                })
                .allow("DONE", SourceStates::only(["RUNNING"])),
        )
        .step(
            StepBuilder::new("signature", "Signature", "decision")
                .multi()
                .states(["PENDING", "SIGNED"])
                .finish_on(["SIGNED"])
                .allow("SIGNED", ALL_STATES)
                .on_event("document-signed", |ctx, data| {
                    ctx.transit_step("SIGNED", data)?;
                    Ok(vec!["Signature received".to_string()])
                }),
        )
        .on_event("documents-uploaded", |ctx, data| {
            let count = data.get("count").cloned().unwrap_or(Value::Null);
            ctx.set_memory("documents", count)?;
            Ok(vec!["Documents received".to_string()])
        })
}

fn fraud_screening() -> WorkflowBuilder {
    WorkflowBuilder::new("Fraud Screening")
        .stage(Stage::new("screen", "Screen"))
        .step(
            StepBuilder::new("screen", "Screen", "screen")
                .states(["QUEUED", "CLEARED"])
                .initial()
                .finish_on(["CLEARED"])
                .allow("CLEARED", SourceStates::only(["QUEUED"])),
        )
        .subscribe(
            Subscription::new("documents-uploaded", |ctx, _| {
                let id = ctx.steps("screen")[0].id;
                ctx.transit(id, "CLEARED", &Value::Null)?;
                Ok(vec!["Screened".to_string()])
            })
            .priority(-1),
        )
}

fn registry() -> Arc<WorkflowRegistry> {
    let mut registry = WorkflowRegistry::new();
    registry.register(loan_application()).unwrap();
    registry.register(fraud_screening()).unwrap();
    Arc::new(registry)
}

fn amount(value: i64) -> DataMap {
    let mut params = DataMap::new();
    params.insert("amount".into(), json!(value));
    params
}

/// Create, start, move the review step and add a participant; commit everything.
async fn drive(manager: &WorkflowManager) -> WorkflowState {
    let handle = manager
        .create_workflow("loan-application", "application", "A-1", amount(5000), None)
        .await
        .unwrap();
    {
        let mut runner = handle.lock().await;
        let review = runner.find_step("review").unwrap().id;
        runner
            .transaction(|tx| {
                tx.start(DataMap::new())?;
                tx.add_participant("u-1", "applicant")?;
                tx.transit_step(review, "RUNNING", Value::Null)?;
                tx.add_step("signature", Some("sig-a".into()), None)?;
                Ok(())
            })
            .unwrap();
    }
    manager.commit_workflow(&handle).await.unwrap();
    let state = handle.lock().await.state().clone();
    state
}

#[tokio::test]
async fn test_create_commit_and_reload_from_memory() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = WorkflowManager::new(registry(), storage.clone());
    let original = drive(&manager).await;

    let fresh = WorkflowManager::new(registry(), storage.clone());
    let handle = fresh
        .load_workflow_by_id("loan-application", original.id)
        .await
        .unwrap();
    let loaded = handle.lock().await.state().clone();
    assert_eq!(loaded, original);
    assert_eq!(loaded.status, WorkflowStatus::Active);
    assert_eq!(loaded.params.get("amount"), Some(&json!(5000)));

    let review = loaded.steps.iter().find(|s| s.step_key == "review").unwrap();
    assert_eq!(review.label, "RUNNING");
    assert_eq!(review.memory.get("reviewer"), Some(&json!("u-officer")));

    // Cached under the resource key as well.
    let by_resource = fresh
        .load_workflow("loan-application", "application", "A-1")
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&handle, &by_resource));
    assert_eq!(fresh.cached().await, 1);
}

#[tokio::test]
async fn test_sqlite_round_trip_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("navis.db");
    let path = path.to_str().unwrap();

    let original = {
        let storage = Arc::new(SqliteStorage::open(path).unwrap());
        let manager = WorkflowManager::new(registry(), storage);
        drive(&manager).await
    };

    let storage = Arc::new(SqliteStorage::open(path).unwrap());
    assert_eq!(storage.count(Table::Workflow).await.unwrap(), 1);
    assert_eq!(storage.count(Table::WorkflowStep).await.unwrap(), 2);
    assert_eq!(storage.count(Table::WorkflowParticipant).await.unwrap(), 1);

    let manager = WorkflowManager::new(registry(), storage);
    let handle = manager
        .load_workflow("loan-application", "application", "A-1")
        .await
        .unwrap();
    let loaded = handle.lock().await.state().clone();
    assert_eq!(loaded, original);

    // The reloaded runner keeps working and persists further changes.
    {
        let mut runner = handle.lock().await;
        let review = runner.find_step("review").unwrap().id;
        runner
            .transaction(|tx| tx.transit_step(review, "DONE", Value::Null))
            .unwrap();
    }
    manager.commit_workflow(&handle).await.unwrap();

    let storage = Arc::new(SqliteStorage::new(Database::open(path).unwrap()));
    let state = storage
        .fetch_workflow_state_by_id("loan-application", original.id)
        .await
        .unwrap()
        .unwrap();
    let review = state.steps.iter().find(|s| s.step_key == "review").unwrap();
    assert_eq!(review.status, StepStatus::Completed);
    assert_eq!(state.progress, 0.5);
}

#[tokio::test]
async fn test_mutation_order_is_preserved_in_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = WorkflowManager::new(registry(), storage.clone());
    let state = drive(&manager).await;

    let rows = storage.rows(Table::WorkflowMutation).await;
    assert!(!rows.is_empty());
    let orders: Vec<u64> = rows.iter().map(|r| r["order"].as_u64().unwrap()).collect();
    assert!(orders.windows(2).all(|w| w[0] < w[1]), "{:?}", orders);
    assert_eq!(rows[0]["kind"], json!("initialize-workflow"));
    assert!(rows.iter().all(|r| r["workflow_id"] == json!(state.id)));

    let activities: Vec<String> = storage
        .rows(Table::WorkflowActivity)
        .await
        .iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        activities,
        vec!["create", "start", "add_participant", "transit_step", "add_step"]
    );
}

#[tokio::test]
async fn test_event_fans_out_in_priority_order() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = WorkflowManager::new(registry(), storage.clone());

    for key in ["loan-application", "fraud-screening"] {
        let handle = manager
            .create_workflow(key, "application", "A-1", DataMap::new(), None)
            .await
            .unwrap();
        handle
            .lock()
            .await
            .transaction(|tx| tx.start(DataMap::new()))
            .unwrap();
    }

    let data = EventData::new("application", "A-1").with("count", json!(4));
    let affected = manager.process_event("documents-uploaded", &data).await.unwrap();
    assert_eq!(affected.len(), 2);

    let first = affected[0].lock().await.state().clone();
    let second = affected[1].lock().await.state().clone();
    assert_eq!(first.key, "fraud-screening");
    assert_eq!(first.status, WorkflowStatus::Completed);
    assert_eq!(second.key, "loan-application");
    assert_eq!(second.memory.get("documents"), Some(&json!(4)));

    assert!(manager.commit().await.unwrap() > 0);
    assert_eq!(storage.count(Table::Workflow).await, 2);
    let messages: Vec<String> = storage
        .rows(Table::WorkflowMessage)
        .await
        .iter()
        .map(|r| r["content"].as_str().unwrap().to_string())
        .collect();
    assert!(messages.contains(&"Screened".to_string()));
    assert!(messages.contains(&"Documents received".to_string()));
}

#[tokio::test]
async fn test_unrouted_event_touches_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = WorkflowManager::new(registry(), storage.clone());

    let data = EventData::new("application", "A-1");
    let affected = manager.process_event("loan-withdrawn", &data).await.unwrap();
    assert!(affected.is_empty());
    assert_eq!(manager.cached().await, 0);
    assert_eq!(manager.commit().await.unwrap(), 0);
    assert_eq!(storage.count(Table::WorkflowMutation).await, 0);
}

#[tokio::test]
async fn test_routed_event_without_instance_is_not_found() {
    let manager = WorkflowManager::new(registry(), Arc::new(MemoryStorage::new()));
    let data = EventData::new("application", "A-404");
    let err = manager
        .process_event("documents-uploaded", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)), "{}", err);
}

#[tokio::test]
async fn test_step_event_requires_selector() {
    let manager = WorkflowManager::new(registry(), Arc::new(MemoryStorage::new()));
    let data = EventData::new("application", "A-1");
    let err = manager.process_event("document-signed", &data).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Execution(_)), "{}", err);
}

#[tokio::test]
async fn test_failed_fan_out_rolls_back_every_target() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = WorkflowManager::new(registry(), storage.clone());

    let fraud = manager
        .create_workflow("fraud-screening", "application", "A-1", DataMap::new(), None)
        .await
        .unwrap();
    fraud
        .lock()
        .await
        .transaction(|tx| tx.start(DataMap::new()))
        .unwrap();
    manager.commit_workflow(&fraud).await.unwrap();
    // BLANK workflows do not accept events.
    let loan = manager
        .create_workflow("loan-application", "application", "A-1", DataMap::new(), None)
        .await
        .unwrap();
    manager.commit_workflow(&loan).await.unwrap();
    let mutations = storage.count(Table::WorkflowMutation).await;

    // Screening runs first and succeeds, then the loan application rejects the event.
    let data = EventData::new("application", "A-1").with("count", json!(1));
    let err = manager
        .process_event("documents-uploaded", &data)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cannot process event"), "{}", err);

    {
        let runner = fraud.lock().await;
        assert!(!runner.has_pending());
        assert_eq!(runner.status(), WorkflowStatus::Active);
        assert_eq!(runner.find_step("screen").unwrap().label, "QUEUED");
    }
    {
        let runner = loan.lock().await;
        assert!(!runner.has_pending());
        assert!(runner.state().memory.is_empty());
    }

    assert_eq!(manager.commit().await.unwrap(), 0);
    assert_eq!(storage.count(Table::WorkflowMutation).await, mutations);
    let persisted = storage
        .fetch_workflow_state("fraud-screening", "application", "A-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(persisted.status, WorkflowStatus::Active);
}

#[tokio::test]
async fn test_reloaded_workflow_keeps_audit_order_increasing() {
    let storage = Arc::new(MemoryStorage::new());
    let original = drive(&WorkflowManager::new(registry(), storage.clone())).await;

    let fresh = WorkflowManager::new(registry(), storage.clone());
    let handle = fresh
        .load_workflow_by_id("loan-application", original.id)
        .await
        .unwrap();
    handle.lock().await.transaction(|tx| tx.pause()).unwrap();
    fresh.commit_workflow(&handle).await.unwrap();

    for table in [Table::WorkflowMutation, Table::WorkflowActivity] {
        let orders: Vec<u64> = storage
            .rows(table)
            .await
            .iter()
            .map(|r| r["order"].as_u64().unwrap())
            .collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]), "{:?}", orders);
    }
    let last = storage.rows(Table::WorkflowActivity).await;
    assert_eq!(last.last().unwrap()["name"], json!("pause"));
}

/// Storage that can be told to reject every batch.
struct FlakyStorage {
    inner: MemoryStorage,
    fail: AtomicBool,
}

#[async_trait]
impl WorkflowStorage for FlakyStorage {
    async fn fetch_workflow_state(
        &self,
        key: &str,
        resource_name: &str,
        resource_id: &str,
    ) -> navis_core::Result<Option<WorkflowState>> {
        self.inner
            .fetch_workflow_state(key, resource_name, resource_id)
            .await
    }

    async fn fetch_workflow_state_by_id(
        &self,
        key: &str,
        id: Uuid,
    ) -> navis_core::Result<Option<WorkflowState>> {
        self.inner.fetch_workflow_state_by_id(key, id).await
    }

    async fn last_order(&self, workflow_id: Uuid) -> navis_core::Result<u64> {
        self.inner.last_order(workflow_id).await
    }

    async fn apply(&self, batch: WriteBatch) -> navis_core::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkflowError::Storage("disk full".into()));
        }
        self.inner.apply(batch).await
    }
}

#[tokio::test]
async fn test_failed_commit_restores_buffer_and_persists_nothing() {
    let storage = Arc::new(FlakyStorage {
        inner: MemoryStorage::new(),
        fail: AtomicBool::new(true),
    });
    let manager = WorkflowManager::new(registry(), storage.clone());
    let handle = manager
        .create_workflow("loan-application", "application", "A-1", DataMap::new(), None)
        .await
        .unwrap();
    let pending = handle.lock().await.pending().clone();

    let err = manager.commit_workflow(&handle).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Storage(_)));
    assert_eq!(handle.lock().await.pending(), &pending);
    assert_eq!(storage.inner.count(Table::Workflow).await, 0);

    storage.fail.store(false, Ordering::SeqCst);
    let written = manager.commit_workflow(&handle).await.unwrap();
    assert_eq!(written, pending.mutations.len());
    assert!(!handle.lock().await.has_pending());
    assert_eq!(storage.inner.count(Table::Workflow).await, 1);
    assert_eq!(
        storage.inner.count(Table::WorkflowMutation).await,
        pending.mutations.len()
    );

    // A second commit is a no-op.
    assert_eq!(manager.commit_workflow(&handle).await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_workflow_is_not_found() {
    let manager = WorkflowManager::new(registry(), Arc::new(MemoryStorage::new()));
    let err = manager
        .load_workflow_by_id("loan-application", Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)));

    let err = manager
        .load_workflow("loan-application", "application", "A-9")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)));
}
