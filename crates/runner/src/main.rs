// Opsflow runner
//
// Wires the engine to a store and drives one invoice approval end to end.
// Uses PostgreSQL when DATABASE_URL is set, the in-memory store otherwise.

use std::sync::Arc;

use anyhow::{Context, Result};
use opsflow_durable::inbox::CREATE_HUMAN_TASK;
use opsflow_durable::prelude::*;
use opsflow_durable::telemetry::{init_telemetry, TelemetryConfig};
use sqlx::postgres::PgPoolOptions;

const TENANT: &str = "demo";
const FORM_ID: &str = "invoice_approval_form";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "opsflow_runner=info,opsflow_durable=info")
    // - LOG_FORMAT: "json" for JSON lines
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "opsflow" {
        telemetry_config.service_name = "opsflow-runner".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("opsflow_runner=info,opsflow_durable=info".to_string());
    }
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = EngineConfig::from_env();
    tracing::info!(
        snapshot_interval = config.snapshot_interval,
        max_events = config.max_events_per_execution,
        "opsflow-runner starting"
    );

    let demo = async {
        match DatabaseConfig::from_env() {
            Some(db) => {
                let pool = PgPoolOptions::new()
                    .max_connections(db.max_connections)
                    .connect(&db.url)
                    .await
                    .context("Failed to connect to database")?;
                let store = PostgresWorkflowStore::new(pool);
                store.migrate().await.context("Failed to run migrations")?;
                tracing::info!("Using PostgreSQL store");
                run_demo(Arc::new(store), config).await
            }
            None => {
                tracing::info!("DATABASE_URL not set, using in-memory store");
                run_demo(Arc::new(InMemoryWorkflowStore::new()), config).await
            }
        }
    };

    tokio::select! {
        result = demo => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Demo failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    tracing::info!("Runner shutdown complete");
    Ok(())
}

async fn run_demo<S: WorkflowStore>(store: Arc<S>, config: EngineConfig) -> Result<()> {
    let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&store)));
    let actions = Arc::new(ActionRegistry::with_stale_after(
        Arc::clone(&store),
        config.action_claim_stale_after,
    ));
    let forms = Arc::new(FormRegistry::new(Arc::clone(&store)));

    actions.register_simple_action(
        "send_notification",
        "Log a notification to a recipient",
        vec![
            ParamSpec::required("recipient", ParamType::String),
            ParamSpec::optional("message", ParamType::String),
        ],
        handler_fn(|ctx, params| async move {
            tracing::info!(
                execution_id = %ctx.execution_id,
                recipient = %params["recipient"],
                message = %params["message"],
                "notification sent"
            );
            Ok(json!({ "delivered": true }))
        }),
    );

    ensure_workflow(&registry).await?;
    ensure_form(&forms).await?;

    let engine = Arc::new(ExecutionEngine::new(
        Arc::clone(&store),
        registry,
        Arc::clone(&actions),
        config,
    ));
    let inbox = Arc::new(TaskInboxService::new(store, Arc::clone(&engine), forms));
    register_inbox_actions(&actions, Arc::downgrade(&inbox));

    let execution_id = engine
        .create_execution(
            TENANT,
            CreateExecution::new(
                "invoice_approval",
                json!({ "invoice_id": "INV-2001", "amount": 1250 }),
            )
            .with_user("clerk"),
        )
        .await
        .context("Failed to start execution")?;

    let submitted = engine
        .deliver_event(
            TENANT,
            DeliverEvent::external(execution_id, "submit", json!({}))
                .with_user(Some("clerk".to_string())),
        )
        .await
        .context("Failed to submit invoice")?;
    tracing::info!(
        %execution_id,
        state = %submitted.current_state,
        actions = submitted.actions.len(),
        "Invoice submitted"
    );

    let task = inbox
        .list_tasks(
            TENANT,
            &TaskFilter {
                execution_id: Some(execution_id),
                status: Some(TaskStatus::Pending),
                ..Default::default()
            },
        )
        .await?
        .into_iter()
        .next()
        .context("No approval task was created")?;

    inbox.claim_task(TENANT, task.task_id, "approver").await?;
    inbox
        .complete_task(
            TENANT,
            task.task_id,
            json!({ "decision": "approve", "comment": "within budget" }),
            Some("approver".to_string()),
        )
        .await
        .context("Failed to complete approval task")?;

    let execution = engine.require_execution(TENANT, execution_id).await?;
    let replayed = engine.replay(TENANT, execution_id, None).await?;
    tracing::info!(
        %execution_id,
        state = %execution.current_state,
        status = %execution.status.as_str(),
        events = execution.sequence,
        replay_matches = replayed.state == execution.current_state,
        "Invoice approval finished"
    );

    Ok(())
}

/// Register the invoice workflow unless a previous run already did
async fn ensure_workflow<S: WorkflowStore>(registry: &WorkflowRegistry<S>) -> Result<()> {
    let definition = WorkflowDefinition::new(
        "state_machine",
        json!({
            "initial_state": "draft",
            "states": {
                "draft": { "on": {
                    "submit": { "target": "pending_approval", "actions": [
                        { "action": "send_notification", "params": {
                            "recipient": "finance",
                            "message": "$context.invoice_id"
                        } },
                        { "action": CREATE_HUMAN_TASK, "params": {
                            "taskType": "invoice_approval",
                            "title": "Approve invoice",
                            "formId": FORM_ID,
                            "assignTo": { "roles": ["finance_approver"] },
                            "contextData": { "amount": "$context.amount" }
                        } }
                    ] }
                } },
                "pending_approval": { "on": {
                    "task_completed": [
                        { "target": "approved", "when": {
                            "path": "payload.form_data.decision", "op": "eq", "value": "approve"
                        } },
                        { "target": "rejected" }
                    ]
                } },
                "approved": { "status": "completed" },
                "rejected": { "status": "rejected" }
            }
        }),
    );

    match registry
        .register(TENANT, NewRegistration::new("invoice_approval", "1.0.0", definition))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::Conflict => {
            tracing::debug!("invoice_approval already registered");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to register workflow"),
    }
}

async fn ensure_form<S: WorkflowStore>(forms: &FormRegistry<S>) -> Result<()> {
    if forms.exists(TENANT, FORM_ID).await? {
        return Ok(());
    }
    let schema = json!({
        "type": "object",
        "properties": {
            "decision": { "type": "string", "enum": ["approve", "reject"] },
            "comment": { "type": "string", "maxLength": 500 }
        },
        "required": ["decision"]
    });
    forms
        .register(
            TENANT,
            NewForm::new(FORM_ID, "1.0.0", schema)
                .with_name("Invoice approval")
                .active(),
        )
        .await
        .context("Failed to register form")?;
    Ok(())
}
