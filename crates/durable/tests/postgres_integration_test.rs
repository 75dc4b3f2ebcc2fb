//! Integration tests for PostgresWorkflowStore
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p opsflow-durable --test postgres_integration_test
//!
//! Each test is a no-op when DATABASE_URL is unset. Migrations are applied
//! on connect, and every test works in its own tenant.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use opsflow_durable::forms::{FormDefinition, FormStatus};
use opsflow_durable::inbox::{TaskDefinition, TaskFilter, TaskHistoryEntry, TaskStatus, WorkflowTask};
use opsflow_durable::persistence::{
    ActionClaim, ActionOutcome, ExecutionUpdate, NewActionClaim, PostgresWorkflowStore,
    StoreError, WorkflowExecution, WorkflowRegistration, WorkflowStore, WorkflowVersion,
};
use opsflow_durable::workflow::{
    names, EventRange, EventType, ExecutionStatus, WorkflowDefinition, WorkflowEvent,
};

/// Connect and migrate, or `None` when no database is configured
async fn create_test_store() -> Option<PostgresWorkflowStore> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to PostgreSQL");
    let store = PostgresWorkflowStore::new(pool);
    store.migrate().await.expect("Failed to run migrations");
    Some(store)
}

fn tenant() -> String {
    format!("test-{}", Uuid::now_v7())
}

/// Register a workflow and start an execution with its first event
async fn seed_execution(store: &PostgresWorkflowStore, tenant: &str) -> WorkflowExecution {
    let now = Utc::now();
    let registration = WorkflowRegistration {
        registration_id: Uuid::now_v7(),
        tenant: tenant.to_string(),
        name: "invoice_approval".into(),
        category: Some("finance".into()),
        tags: vec!["ap".into()],
        created_at: now,
    };
    let version = WorkflowVersion {
        version_id: Uuid::now_v7(),
        registration_id: registration.registration_id,
        version: "1.0.0".into(),
        is_current: true,
        definition: WorkflowDefinition::new("state_machine", json!({"initial_state": "draft"})),
        parameters: json!({}),
        created_at: now,
    };
    store
        .insert_registration(&registration, &version)
        .await
        .expect("insert registration");

    let execution = WorkflowExecution {
        execution_id: Uuid::now_v7(),
        tenant: tenant.to_string(),
        workflow_name: registration.name.clone(),
        workflow_version_id: version.version_id,
        current_state: "draft".into(),
        status: ExecutionStatus::Active,
        context_data: json!({"amount": 10}),
        sequence: 1,
        created_at: now,
        updated_at: now,
    };
    store
        .create_execution(&execution, &event(&execution, 0, names::WORKFLOW_STARTED, "draft"))
        .await
        .expect("create execution");
    execution
}

fn event(execution: &WorkflowExecution, sequence: i64, name: &str, to: &str) -> WorkflowEvent {
    WorkflowEvent {
        event_id: Uuid::now_v7(),
        execution_id: execution.execution_id,
        tenant: execution.tenant.clone(),
        sequence,
        event_name: name.into(),
        event_type: if sequence == 0 {
            EventType::Lifecycle
        } else {
            EventType::External
        },
        from_state: None,
        to_state: to.into(),
        user_id: None,
        payload: json!({}),
        created_at: Utc::now(),
    }
}

// ============================================
// Registry Tests
// ============================================

#[tokio::test]
async fn test_versions_and_current_flip() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let tenant = tenant();
    let execution = seed_execution(&store, &tenant).await;
    let registration = store
        .find_registration_by_name(&tenant, "invoice_approval")
        .await
        .expect("find")
        .expect("exists");

    let v2 = WorkflowVersion {
        version_id: Uuid::now_v7(),
        registration_id: registration.registration_id,
        version: "2.0.0".into(),
        is_current: true,
        definition: WorkflowDefinition::new("state_machine", json!({})),
        parameters: json!({"currency": "EUR"}),
        created_at: Utc::now(),
    };
    store.insert_version(&tenant, &v2).await.expect("insert v2");

    let dup = store.insert_version(&tenant, &v2).await;
    assert!(matches!(dup, Err(StoreError::Duplicate { .. })));

    let versions = store
        .list_versions(&tenant, registration.registration_id)
        .await
        .expect("versions");
    assert_eq!(versions.len(), 2);
    assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);
    assert!(versions[1].is_current);

    store
        .set_current_version(&tenant, registration.registration_id, "1.0.0")
        .await
        .expect("flip");
    let current = store
        .find_version(&tenant, execution.workflow_version_id)
        .await
        .expect("find")
        .expect("exists");
    assert!(current.is_current);

    let missing = store
        .set_current_version(&tenant, registration.registration_id, "9.9.9")
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound { .. })));
}

// ============================================
// Event Log Tests
// ============================================

#[tokio::test]
async fn test_append_and_load_events() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let tenant = tenant();
    let execution = seed_execution(&store, &tenant).await;

    for (seq, to) in [(1, "review"), (2, "approved")] {
        store
            .append_event(
                &event(&execution, seq, "advance", to),
                &ExecutionUpdate {
                    current_state: to.into(),
                    status: ExecutionStatus::Active,
                    context_data: json!({"amount": 10, "step": seq}),
                },
            )
            .await
            .expect("append");
    }

    let events = store
        .load_events(&tenant, execution.execution_id, EventRange::all())
        .await
        .expect("load");
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].to_state, "approved");

    let tail = store
        .load_events(&tenant, execution.execution_id, EventRange::all().after(1))
        .await
        .expect("load tail");
    assert_eq!(tail.len(), 1);

    let stored = store
        .get_execution(&tenant, execution.execution_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.current_state, "approved");
    assert_eq!(stored.sequence, 3);

    let found = store
        .find_event(&tenant, execution.execution_id, events[1].event_id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(found, events[1]);
}

#[tokio::test]
async fn test_stale_sequence_conflicts_and_rolls_back() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let tenant = tenant();
    let execution = seed_execution(&store, &tenant).await;

    let result = store
        .append_event(
            &event(&execution, 5, "advance", "review"),
            &ExecutionUpdate {
                current_state: "review".into(),
                status: ExecutionStatus::Active,
                context_data: json!({}),
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(StoreError::ConcurrencyConflict {
            expected: 5,
            actual: 1
        })
    ));

    let stored = store
        .get_execution(&tenant, execution.execution_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.current_state, "draft");
    assert_eq!(stored.sequence, 1);
}

#[tokio::test]
async fn test_tenant_isolation() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let tenant = tenant();
    let execution = seed_execution(&store, &tenant).await;

    let other = store
        .get_execution("someone-else", execution.execution_id)
        .await
        .expect("get");
    assert!(other.is_none());

    let events = store
        .load_events("someone-else", execution.execution_id, EventRange::all())
        .await;
    assert!(matches!(events, Err(StoreError::ExecutionNotFound(_))));
}

// ============================================
// Action Log Tests
// ============================================

#[tokio::test]
async fn test_action_claim_lifecycle() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let tenant = tenant();
    let execution = seed_execution(&store, &tenant).await;

    let claim = NewActionClaim {
        tenant: tenant.clone(),
        execution_id: execution.execution_id,
        action_name: "send_notification".into(),
        event_id: None,
        idempotency_key: format!("{}:send_notification:evt", execution.execution_id),
        parameters: json!({"recipient": "cfo"}),
    };
    let fresh = chrono::Duration::minutes(5);

    let ActionClaim::Acquired(first) = store.claim_action(&claim, fresh).await.expect("claim")
    else {
        panic!("expected acquisition");
    };
    assert_eq!(first.attempt, 1);

    let second = store.claim_action(&claim, fresh).await.expect("claim");
    assert!(matches!(second, ActionClaim::InFlight(_)));

    store
        .complete_action(first.result_id, ActionOutcome::Failed("timeout".into()))
        .await
        .expect("fail");

    let ActionClaim::Acquired(retry) = store.claim_action(&claim, fresh).await.expect("claim")
    else {
        panic!("failed record should be re-acquired");
    };
    assert_eq!(retry.attempt, 2);

    store
        .complete_action(retry.result_id, ActionOutcome::Succeeded(json!({"sent": true})))
        .await
        .expect("succeed");

    let done = store.claim_action(&claim, fresh).await.expect("claim");
    assert!(matches!(done, ActionClaim::AlreadyCompleted(r) if r.result == Some(json!({"sent": true}))));
}

// ============================================
// Task and Form Tests
// ============================================

#[tokio::test]
async fn test_task_update_checks_status() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let tenant = tenant();
    let execution = seed_execution(&store, &tenant).await;
    let now = Utc::now();

    store
        .insert_form(&FormDefinition {
            form_id: "approval".into(),
            tenant: tenant.clone(),
            version: "1.0.0".into(),
            name: "Approval".into(),
            description: None,
            category: "general".into(),
            status: FormStatus::Active,
            json_schema: json!({"type": "object"}),
            ui_schema: None,
            default_values: None,
            created_at: now,
        })
        .await
        .expect("insert form");

    let definition = TaskDefinition {
        task_definition_id: Uuid::now_v7(),
        tenant: tenant.clone(),
        task_type: "invoice_approval".into(),
        name: "Invoice approval".into(),
        form_id: "approval".into(),
        default_priority: "medium".into(),
        default_sla_days: 3,
        created_at: now,
    };
    store
        .insert_task_definition(&definition)
        .await
        .expect("insert definition");
    assert!(matches!(
        store.insert_task_definition(&definition).await,
        Err(StoreError::Duplicate { .. })
    ));

    let mut task = WorkflowTask {
        task_id: Uuid::now_v7(),
        tenant: tenant.clone(),
        execution_id: execution.execution_id,
        task_definition_id: definition.task_definition_id,
        task_type: definition.task_type.clone(),
        form_id: "approval".into(),
        title: "Approve".into(),
        description: None,
        status: TaskStatus::Pending,
        priority: "medium".into(),
        due_date: None,
        context_data: json!({}),
        assigned_roles: vec!["finance_approver".into()],
        assigned_users: vec![],
        claimed_by: None,
        response_data: None,
        draft_data: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };
    let history = TaskHistoryEntry {
        history_id: Uuid::now_v7(),
        task_id: task.task_id,
        tenant: tenant.clone(),
        action: "create".into(),
        from_status: None,
        to_status: TaskStatus::Pending,
        user_id: None,
        details: None,
        created_at: now,
    };
    store.insert_task(&task, &history).await.expect("insert task");

    task.status = TaskStatus::Claimed;
    task.claimed_by = Some("alice".into());
    store
        .update_task(&task, TaskStatus::Pending, None)
        .await
        .expect("claim");

    let stale = store.update_task(&task, TaskStatus::Pending, None).await;
    assert!(matches!(stale, Err(StoreError::StatusConflict { .. })));

    let by_role = store
        .list_tasks(
            &tenant,
            &TaskFilter {
                role: Some("finance_approver".into()),
                ..Default::default()
            },
        )
        .await
        .expect("list");
    assert_eq!(by_role.len(), 1);
    assert_eq!(by_role[0].claimed_by.as_deref(), Some("alice"));

    let versions = store
        .list_form_versions(&tenant, "approval")
        .await
        .expect("forms");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, FormStatus::Active);
}
