//! Form definitions and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a form version
///
/// Moves forward only: draft → active → deprecated → archived. Skipping a
/// step forward is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormStatus {
    Draft,
    Active,
    Deprecated,
    Archived,
}

impl FormStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: FormStatus) -> bool {
        next > *self
    }
}

impl std::fmt::Display for FormStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored form version
///
/// Content is immutable after insert; only `status` changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormDefinition {
    pub form_id: String,
    pub tenant: String,
    pub version: String,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub status: FormStatus,
    pub json_schema: Value,
    pub ui_schema: Option<Value>,
    pub default_values: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`FormRegistry::register`](super::FormRegistry::register)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewForm {
    pub form_id: String,
    pub name: String,
    pub version: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_status")]
    pub status: FormStatus,
    pub json_schema: Value,
    #[serde(default)]
    pub ui_schema: Option<Value>,
    #[serde(default)]
    pub default_values: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_status() -> FormStatus {
    FormStatus::Draft
}

impl NewForm {
    pub fn new(form_id: impl Into<String>, version: impl Into<String>, json_schema: Value) -> Self {
        let form_id = form_id.into();
        Self {
            name: form_id.clone(),
            form_id,
            version: version.into(),
            category: default_category(),
            status: default_status(),
            json_schema,
            ui_schema: None,
            default_values: None,
            description: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_status(mut self, status: FormStatus) -> Self {
        self.status = status;
        self
    }

    pub fn active(self) -> Self {
        self.with_status(FormStatus::Active)
    }
}

/// Partial changes applied when forking a new version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormOverrides {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub status: Option<FormStatus>,
    pub json_schema: Option<Value>,
    pub ui_schema: Option<Value>,
    pub default_values: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        assert!(FormStatus::Draft.can_transition_to(FormStatus::Active));
        assert!(FormStatus::Active.can_transition_to(FormStatus::Archived));
        assert!(!FormStatus::Deprecated.can_transition_to(FormStatus::Active));
        assert!(!FormStatus::Active.can_transition_to(FormStatus::Active));
    }
}
