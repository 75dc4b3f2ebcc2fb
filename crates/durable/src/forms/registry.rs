//! Versioned, tenant-scoped form registry

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::definition::{FormDefinition, FormOverrides, FormStatus, NewForm};
use super::schema::{self, ValidationReport};
use crate::error::ErrorKind;
use crate::persistence::{StoreError, WorkflowStore};

/// Errors from form operations
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No such form or version
    #[error("form not found: {form_id}{}", .version.as_ref().map(|v| format!("@{v}")).unwrap_or_default())]
    NotFound {
        form_id: String,
        version: Option<String>,
    },

    /// Invalid form definition
    #[error("invalid form: {0}")]
    InvalidDefinition(String),

    /// Status may only move forward
    #[error("form {form_id}@{version} cannot move from {from} to {to}")]
    IllegalStatus {
        form_id: String,
        version: String,
        from: FormStatus,
        to: FormStatus,
    },

    /// Submitted data does not satisfy the schema
    #[error("form data invalid: {}", .0.summary())]
    ValidationFailed(ValidationReport),
}

impl FormError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidDefinition(_) | Self::ValidationFailed(_) => ErrorKind::Validation,
            Self::IllegalStatus { .. } => ErrorKind::Conflict,
        }
    }
}

/// Registry of versioned form schemas
///
/// A stored version is never edited; changes go through
/// [`create_new_version`](Self::create_new_version).
pub struct FormRegistry<S: WorkflowStore> {
    store: Arc<S>,
}

impl<S: WorkflowStore> FormRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Register a form version
    #[instrument(skip(self, form), fields(form_id = %form.form_id, version = %form.version))]
    pub async fn register(&self, tenant: &str, form: NewForm) -> Result<FormDefinition, FormError> {
        check_definition(&form.form_id, &form.version, &form.json_schema)?;

        let definition = FormDefinition {
            form_id: form.form_id,
            tenant: tenant.to_string(),
            version: form.version,
            name: form.name,
            description: form.description,
            category: form.category,
            status: form.status,
            json_schema: form.json_schema,
            ui_schema: form.ui_schema,
            default_values: form.default_values,
            created_at: Utc::now(),
        };
        self.store.insert_form(&definition).await?;

        info!(status = %definition.status, "registered form");
        Ok(definition)
    }

    /// Get an exact version, or the most recently created active version
    pub async fn get_form(
        &self,
        tenant: &str,
        form_id: &str,
        version: Option<&str>,
    ) -> Result<Option<FormDefinition>, FormError> {
        match version {
            Some(version) => Ok(self.store.find_form(tenant, form_id, version).await?),
            None => Ok(self
                .store
                .list_form_versions(tenant, form_id)
                .await?
                .into_iter()
                .filter(|f| f.status == FormStatus::Active)
                .max_by_key(|f| f.created_at)),
        }
    }

    /// Like [`get_form`](Self::get_form) but missing forms are an error
    pub async fn require_form(
        &self,
        tenant: &str,
        form_id: &str,
        version: Option<&str>,
    ) -> Result<FormDefinition, FormError> {
        self.get_form(tenant, form_id, version)
            .await?
            .ok_or_else(|| FormError::NotFound {
                form_id: form_id.to_string(),
                version: version.map(str::to_string),
            })
    }

    /// Whether any version of the form exists, regardless of status
    pub async fn exists(&self, tenant: &str, form_id: &str) -> Result<bool, FormError> {
        Ok(!self
            .store
            .list_form_versions(tenant, form_id)
            .await?
            .is_empty())
    }

    /// Fork the most recently created version under a new version string
    ///
    /// Fields not overridden are inherited, status included.
    #[instrument(skip(self, overrides))]
    pub async fn create_new_version(
        &self,
        tenant: &str,
        form_id: &str,
        new_version: &str,
        overrides: FormOverrides,
    ) -> Result<FormDefinition, FormError> {
        let base = self
            .store
            .list_form_versions(tenant, form_id)
            .await?
            .into_iter()
            .max_by_key(|f| f.created_at)
            .ok_or_else(|| FormError::NotFound {
                form_id: form_id.to_string(),
                version: None,
            })?;

        let json_schema = overrides.json_schema.unwrap_or(base.json_schema);
        check_definition(form_id, new_version, &json_schema)?;

        let definition = FormDefinition {
            form_id: base.form_id,
            tenant: tenant.to_string(),
            version: new_version.to_string(),
            name: overrides.name.unwrap_or(base.name),
            description: overrides.description.or(base.description),
            category: overrides.category.unwrap_or(base.category),
            status: overrides.status.unwrap_or(base.status),
            json_schema,
            ui_schema: overrides.ui_schema.or(base.ui_schema),
            default_values: overrides.default_values.or(base.default_values),
            created_at: Utc::now(),
        };
        self.store.insert_form(&definition).await?;

        debug!(from = %base.version, "forked form version");
        Ok(definition)
    }

    /// Move a version along its lifecycle
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        tenant: &str,
        form_id: &str,
        version: &str,
        status: FormStatus,
    ) -> Result<(), FormError> {
        let form = self.require_form(tenant, form_id, Some(version)).await?;
        if form.status == status {
            return Ok(());
        }
        if !form.status.can_transition_to(status) {
            return Err(FormError::IllegalStatus {
                form_id: form_id.to_string(),
                version: version.to_string(),
                from: form.status,
                to: status,
            });
        }
        self.store
            .update_form_status(tenant, form_id, version, status)
            .await?;
        info!(from = %form.status, to = %status, "form status changed");
        Ok(())
    }

    pub async fn list_forms(
        &self,
        tenant: &str,
        category: Option<&str>,
    ) -> Result<Vec<FormDefinition>, FormError> {
        Ok(self.store.list_forms(tenant, category).await?)
    }

    /// Validate data against a stored form
    pub async fn validate_submission(
        &self,
        tenant: &str,
        form_id: &str,
        version: Option<&str>,
        data: &Value,
    ) -> Result<ValidationReport, FormError> {
        let form = self.require_form(tenant, form_id, version).await?;
        Ok(schema::validate(&form.json_schema, data))
    }
}

fn check_definition(form_id: &str, version: &str, json_schema: &Value) -> Result<(), FormError> {
    if form_id.trim().is_empty() {
        return Err(FormError::InvalidDefinition("form_id is empty".into()));
    }
    if version.trim().is_empty() {
        return Err(FormError::InvalidDefinition("version is empty".into()));
    }
    if !json_schema.is_object() {
        return Err(FormError::InvalidDefinition(
            "json_schema must be an object".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkflowStore;
    use serde_json::json;

    fn registry() -> FormRegistry<InMemoryWorkflowStore> {
        FormRegistry::new(Arc::new(InMemoryWorkflowStore::new()))
    }

    fn schema() -> Value {
        json!({"type": "object", "required": ["decision"],
               "properties": {"decision": {"type": "string"}}})
    }

    #[tokio::test]
    async fn test_latest_active_version() {
        let forms = registry();
        forms
            .register("acme", NewForm::new("approval", "1", schema()).active())
            .await
            .expect("v1");
        forms
            .register("acme", NewForm::new("approval", "2", schema()).active())
            .await
            .expect("v2");
        forms
            .register("acme", NewForm::new("approval", "3", schema()))
            .await
            .expect("v3 draft");

        let current = forms
            .get_form("acme", "approval", None)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(current.version, "2");

        assert!(forms
            .get_form("globex", "approval", None)
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_version_conflicts() {
        let forms = registry();
        forms
            .register("acme", NewForm::new("approval", "1", schema()))
            .await
            .expect("v1");
        let err = forms
            .register("acme", NewForm::new("approval", "1", schema()))
            .await
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_new_version_inherits() {
        let forms = registry();
        forms
            .register(
                "acme",
                NewForm::new("approval", "1", schema())
                    .with_category("finance")
                    .active(),
            )
            .await
            .expect("v1");

        let v2 = forms
            .create_new_version(
                "acme",
                "approval",
                "2",
                FormOverrides {
                    name: Some("Approval v2".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("v2");

        assert_eq!(v2.category, "finance");
        assert_eq!(v2.status, FormStatus::Active);
        assert_eq!(v2.name, "Approval v2");
        assert_eq!(v2.json_schema, schema());
    }

    #[tokio::test]
    async fn test_status_lifecycle() {
        let forms = registry();
        forms
            .register("acme", NewForm::new("approval", "1", schema()))
            .await
            .expect("v1");
        forms
            .set_status("acme", "approval", "1", FormStatus::Active)
            .await
            .expect("activate");

        let err = forms
            .set_status("acme", "approval", "1", FormStatus::Draft)
            .await
            .expect_err("cannot go back");
        assert!(matches!(err, FormError::IllegalStatus { .. }));
    }

    #[tokio::test]
    async fn test_rejects_non_object_schema() {
        let forms = registry();
        let err = forms
            .register("acme", NewForm::new("approval", "1", json!("string")))
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_validate_submission() {
        let forms = registry();
        forms
            .register("acme", NewForm::new("approval", "1", schema()).active())
            .await
            .expect("v1");

        let report = forms
            .validate_submission("acme", "approval", None, &json!({}))
            .await
            .expect("validate");
        assert!(!report.valid);
        assert_eq!(report.errors[0].path, "/decision");
    }
}
