//! Action handler trait and parameter specs

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ActionContext;

/// Error returned by a handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A side-effecting operation invoked by workflows
///
/// Handlers run at most once per idempotency key to a successful outcome;
/// the registry records every attempt.
///
/// # Example
///
/// ```ignore
/// struct SendNotification { mailer: Mailer }
///
/// #[async_trait]
/// impl ActionHandler for SendNotification {
///     async fn execute(&self, ctx: &ActionContext, params: Value) -> Result<Value, HandlerError> {
///         let id = self.mailer.send(&params, &ctx.idempotency_key).await?;
///         Ok(json!({ "message_id": id }))
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: &ActionContext, params: Value) -> Result<Value, HandlerError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`ActionHandler`]
///
/// ```ignore
/// registry.register_simple_action(
///     "log_decision",
///     "Record a decision",
///     vec![ParamSpec::required("decision", ParamType::String)],
///     handler_fn(|_ctx, params| async move { Ok(params) }),
/// );
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ActionContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn execute(&self, ctx: &ActionContext, params: Value) -> Result<Value, HandlerError> {
        (self.f)(ctx.clone(), params).await
    }
}

/// Declared parameter type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Any JSON value; the handler interprets it
    Any,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
        }
    }
}

/// Registered metadata for an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ActionDescriptor {
    /// Check params against the declared specs
    ///
    /// Null counts as absent. Undeclared keys are passed through.
    pub fn validate_params(&self, params: &Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let object = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(format!("parameters must be an object, got {other}")),
        };

        let mut problems = Vec::new();
        for spec in &self.params {
            match object.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    problems.push(format!("missing required parameter '{}'", spec.name))
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.param_type.matches(value) => problems.push(format!(
                    "parameter '{}' must be a {}",
                    spec.name, spec.param_type
                )),
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> ActionDescriptor {
        ActionDescriptor {
            name: "send_notification".into(),
            description: "Send a notification".into(),
            params: vec![
                ParamSpec::required("recipient", ParamType::String),
                ParamSpec::optional("urgent", ParamType::Boolean),
            ],
        }
    }

    #[test]
    fn test_validate_params() {
        let d = descriptor();
        assert!(d.validate_params(&json!({"recipient": "cfo"})).is_ok());
        assert!(d
            .validate_params(&json!({"recipient": "cfo", "urgent": null, "extra": 1}))
            .is_ok());

        let err = d.validate_params(&json!({"urgent": "yes"})).expect_err("invalid");
        assert!(err.contains("missing required parameter 'recipient'"));
        assert!(err.contains("parameter 'urgent' must be a boolean"));

        assert!(d.validate_params(&json!([1])).is_err());
    }

    #[test]
    fn test_any_param_accepts_every_shape() {
        let d = ActionDescriptor {
            name: "create_human_task".into(),
            description: String::new(),
            params: vec![ParamSpec::optional("assignTo", ParamType::Any)],
        };
        for value in [json!("finance"), json!(5), json!(["a"]), json!({"roles": []})] {
            assert!(d.validate_params(&json!({ "assignTo": value })).is_ok());
        }
        assert_eq!(ParamType::Any.to_string(), "any");
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|ctx, params| async move {
            Ok(json!({"tenant": ctx.tenant, "echo": params}))
        });
        let ctx = ActionContext::new("acme", uuid::Uuid::now_v7(), "k");

        let out = handler
            .execute(&ctx, json!({"a": 1}))
            .await
            .expect("should run");
        assert_eq!(out, json!({"tenant": "acme", "echo": {"a": 1}}));
    }
}
