//! Versioned workflow registry and templates

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::catalog::{AnyWorkflow, CatalogError, LogicCatalog};
use crate::error::ErrorKind;
use crate::persistence::{
    StoreError, WorkflowRegistration, WorkflowStore, WorkflowTemplate, WorkflowVersion,
};
use crate::workflow::{merge_objects, WorkflowDefinition};

/// Initial version of registrations created from a template
pub const TEMPLATE_INITIAL_VERSION: &str = "1.0.0";

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Definition does not build
    #[error("invalid definition: {0}")]
    Catalog(#[from] CatalogError),

    /// Workflow, version, or template missing
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Bad input
    #[error("invalid registration: {0}")]
    Invalid(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Catalog(_) | Self::Invalid(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

/// Input for [`WorkflowRegistry::register`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRegistration {
    pub name: String,
    pub version: String,
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewRegistration {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        definition: WorkflowDefinition,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            definition,
            parameters: Value::Object(Default::default()),
            category: None,
            tags: vec![],
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Input for [`WorkflowRegistry::register_template`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub parameters: Value,
}

/// A registration resolved to one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub registration: WorkflowRegistration,
    pub version: WorkflowVersion,
}

impl Registration {
    pub fn registration_id(&self) -> Uuid {
        self.registration.registration_id
    }

    pub fn name(&self) -> &str {
        &self.registration.name
    }
}

/// Registry of versioned workflow definitions
///
/// Exactly one version per registration is current; new versions become
/// current when registered.
pub struct WorkflowRegistry<S: WorkflowStore> {
    store: Arc<S>,
    catalog: LogicCatalog,
}

impl<S: WorkflowStore> WorkflowRegistry<S> {
    /// Registry with the built-in logic catalog
    pub fn new(store: Arc<S>) -> Self {
        Self::with_catalog(store, LogicCatalog::new())
    }

    pub fn with_catalog(store: Arc<S>, catalog: LogicCatalog) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &LogicCatalog {
        &self.catalog
    }

    /// Build the logic a version runs
    pub fn build_logic(&self, version: &WorkflowVersion) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        Ok(self.catalog.build(&version.definition)?)
    }

    /// Register a new workflow or a new version of an existing one
    ///
    /// The registered version becomes current.
    #[instrument(skip(self, new), fields(name = %new.name, version = %new.version))]
    pub async fn register(&self, tenant: &str, new: NewRegistration) -> Result<Uuid, RegistryError> {
        if new.name.trim().is_empty() {
            return Err(RegistryError::Invalid("name is empty".into()));
        }
        if new.version.trim().is_empty() {
            return Err(RegistryError::Invalid("version is empty".into()));
        }
        if !(new.parameters.is_object() || new.parameters.is_null()) {
            return Err(RegistryError::Invalid("parameters must be an object".into()));
        }
        self.catalog.build(&new.definition)?;

        let parameters = if new.parameters.is_null() {
            Value::Object(Default::default())
        } else {
            new.parameters
        };

        let existing = self.store.find_registration_by_name(tenant, &new.name).await?;
        let registration_id = match existing {
            Some(registration) => registration.registration_id,
            None => {
                let registration = WorkflowRegistration {
                    registration_id: Uuid::now_v7(),
                    tenant: tenant.to_string(),
                    name: new.name.clone(),
                    category: new.category.clone(),
                    tags: new.tags.clone(),
                    created_at: Utc::now(),
                };
                let version = new_version(
                    registration.registration_id,
                    &new.version,
                    new.definition.clone(),
                    parameters.clone(),
                );
                match self.store.insert_registration(&registration, &version).await {
                    Ok(()) => {
                        info!(registration_id = %registration.registration_id, "registered workflow");
                        return Ok(registration.registration_id);
                    }
                    // Lost a race with a concurrent first registration
                    Err(StoreError::Duplicate { .. }) => self
                        .store
                        .find_registration_by_name(tenant, &new.name)
                        .await?
                        .ok_or_else(|| RegistryError::not_found("workflow", &new.name))?
                        .registration_id,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let version = new_version(registration_id, &new.version, new.definition, parameters);
        self.store.insert_version(tenant, &version).await?;

        info!(%registration_id, "registered workflow version");
        Ok(registration_id)
    }

    /// Look up by name; `version = None` resolves the current version
    pub async fn get_by_name(
        &self,
        tenant: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<Registration>, RegistryError> {
        let Some(registration) = self.store.find_registration_by_name(tenant, name).await? else {
            return Ok(None);
        };
        self.resolve(tenant, registration, version).await
    }

    /// Look up by id; `version = None` resolves the current version
    pub async fn get_by_id(
        &self,
        tenant: &str,
        registration_id: Uuid,
        version: Option<&str>,
    ) -> Result<Option<Registration>, RegistryError> {
        let Some(registration) = self.store.find_registration(tenant, registration_id).await?
        else {
            return Ok(None);
        };
        self.resolve(tenant, registration, version).await
    }

    async fn resolve(
        &self,
        tenant: &str,
        registration: WorkflowRegistration,
        version: Option<&str>,
    ) -> Result<Option<Registration>, RegistryError> {
        let versions = self
            .store
            .list_versions(tenant, registration.registration_id)
            .await?;
        let found = match version {
            Some(v) => versions.into_iter().find(|candidate| candidate.version == v),
            None => versions.into_iter().find(|candidate| candidate.is_current),
        };
        Ok(found.map(|version| Registration {
            registration,
            version,
        }))
    }

    /// Version record by id (used when replaying executions)
    pub async fn find_version(
        &self,
        tenant: &str,
        version_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, RegistryError> {
        Ok(self.store.find_version(tenant, version_id).await?)
    }

    /// Make a registered version current
    #[instrument(skip(self))]
    pub async fn set_current_version(
        &self,
        tenant: &str,
        registration_id: Uuid,
        version: &str,
    ) -> Result<(), RegistryError> {
        self.store
            .set_current_version(tenant, registration_id, version)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => {
                    RegistryError::not_found("workflow version", format!("{registration_id}@{version}"))
                }
                other => other.into(),
            })?;
        info!("current version changed");
        Ok(())
    }

    pub async fn list(&self, tenant: &str) -> Result<Vec<WorkflowRegistration>, RegistryError> {
        Ok(self.store.list_registrations(tenant).await?)
    }

    /// All versions of a registration, oldest first
    pub async fn list_versions(
        &self,
        tenant: &str,
        registration_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, RegistryError> {
        Ok(self.store.list_versions(tenant, registration_id).await?)
    }

    /// Store a template
    #[instrument(skip(self, template), fields(name = %template.name))]
    pub async fn register_template(
        &self,
        tenant: &str,
        template: NewTemplate,
    ) -> Result<Uuid, RegistryError> {
        self.catalog.build(&template.definition)?;

        let record = WorkflowTemplate {
            template_id: Uuid::now_v7(),
            tenant: tenant.to_string(),
            name: template.name,
            description: template.description,
            category: template.category,
            tags: template.tags,
            definition: template.definition,
            parameters: if template.parameters.is_null() {
                Value::Object(Default::default())
            } else {
                template.parameters
            },
            created_at: Utc::now(),
        };
        self.store.insert_template(&record).await?;

        debug!(template_id = %record.template_id, "registered template");
        Ok(record.template_id)
    }

    /// Create a registration from a template at version `1.0.0`
    ///
    /// `parameters` are merged over the template's defaults.
    #[instrument(skip(self, parameters))]
    pub async fn create_from_template(
        &self,
        tenant: &str,
        template_id: Uuid,
        name: &str,
        parameters: Option<Value>,
    ) -> Result<Uuid, RegistryError> {
        let template = self
            .store
            .find_template(tenant, template_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("workflow template", template_id))?;

        let parameters = match parameters {
            Some(overrides) => merge_objects(&template.parameters, &overrides),
            None => template.parameters.clone(),
        };

        let mut new = NewRegistration::new(name, TEMPLATE_INITIAL_VERSION, template.definition)
            .with_parameters(parameters)
            .with_tags(template.tags);
        new.category = template.category;

        self.register(tenant, new).await
    }
}

fn new_version(
    registration_id: Uuid,
    version: &str,
    definition: WorkflowDefinition,
    parameters: Value,
) -> WorkflowVersion {
    WorkflowVersion {
        version_id: Uuid::now_v7(),
        registration_id,
        version: version.to_string(),
        is_current: true,
        definition,
        parameters,
        created_at: Utc::now(),
    }
}
