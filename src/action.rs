use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::OrchestrateError;
use crate::payload::Payload;

/// Reference to a remote action, either fully qualified (`package/name`) or a
/// short name resolved against a configured default package. Short names are
/// resolved once at configuration-load time, never in the hot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionRef {
    Qualified { package: String, name: String },
    Short(String),
}

impl ActionRef {
    pub fn parse(s: &str) -> Result<Self, OrchestrateError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(OrchestrateError::configuration("empty action reference"));
        }
        match s.split_once('/') {
            None => Ok(ActionRef::Short(s.to_string())),
            Some((package, name)) => {
                if package.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(OrchestrateError::configuration(format!(
                        "malformed action reference `{}`",
                        s
                    )));
                }
                Ok(ActionRef::Qualified {
                    package: package.to_string(),
                    name: name.to_string(),
                })
            }
        }
    }

    pub fn qualify(&self, default_package: &str) -> QualifiedAction {
        match self {
            ActionRef::Qualified { package, name } => QualifiedAction::new(package, name),
            ActionRef::Short(name) => QualifiedAction::new(default_package, name),
        }
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionRef::Qualified { package, name } => write!(f, "{}/{}", package, name),
            ActionRef::Short(name) => write!(f, "{}", name),
        }
    }
}

impl TryFrom<String> for ActionRef {
    type Error = OrchestrateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ActionRef::parse(&value)
    }
}

impl From<ActionRef> for String {
    fn from(value: ActionRef) -> Self {
        value.to_string()
    }
}

impl JsonSchema for ActionRef {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "ActionRef".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }
}

/// A fully resolved action address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedAction {
    package: String,
    name: String,
}

impl QualifiedAction {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.package, self.name)
    }
}

impl fmt::Display for QualifiedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.name)
    }
}

/// JSON-shaped result of a remote invocation. Extra top-level fields (for
/// example a pattern directive) travel in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Invocation {
    pub fn ok(payload: Payload) -> Self {
        Self::with_status(200, Some(payload))
    }

    /// Explicit pipeline stop, no content.
    pub fn stop(payload: Option<Payload>) -> Self {
        Self::with_status(204, payload)
    }

    pub fn with_status(status_code: u16, payload: Option<Payload>) -> Self {
        Self {
            status_code,
            payload,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    pub blocking: bool,
    pub want_result: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            want_result: true,
        }
    }
}

impl InvokeOptions {
    pub fn fire_and_forget() -> Self {
        Self {
            blocking: false,
            want_result: false,
        }
    }
}

/// The one primitive every pipeline component depends on: invoke a named
/// remote action with JSON params and get a JSON result back.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(
        &self,
        action: &QualifiedAction,
        params: Value,
        opts: InvokeOptions,
    ) -> Result<Invocation, OrchestrateError>;
}

pub type ActionHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Invocation, OrchestrateError>> + Send + Sync>;

/// In-process `ActionInvoker`: a registry of named handlers. This is both the
/// crate's native extension point and the test harness.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<DashMap<String, ActionHandler>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionRegistry({} actions)", self.actions.len())
    }
}

impl ActionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            actions: Arc::new(DashMap::new()),
        })
    }

    /// Register an async handler. A handler registered under the same name
    /// replaces the previous one.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Invocation, OrchestrateError>> + Send + 'static,
    {
        self.actions.insert(
            name.to_string(),
            Arc::new(
                move |params| -> BoxFuture<'static, Result<Invocation, OrchestrateError>> {
                    Box::pin(handler(params))
                },
            ),
        );
    }

    /// Register a plain synchronous handler.
    pub fn register_fn<F>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Result<Invocation, OrchestrateError> + Send + Sync + 'static,
    {
        self.register(name, move |params| std::future::ready(handler(params)));
    }

    pub fn unregister(&self, name: &str) {
        self.actions.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    fn lookup(&self, action: &QualifiedAction) -> Option<ActionHandler> {
        self.actions
            .get(&action.full_name())
            .or_else(|| self.actions.get(action.name()))
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[async_trait]
impl ActionInvoker for ActionRegistry {
    async fn invoke(
        &self,
        action: &QualifiedAction,
        params: Value,
        opts: InvokeOptions,
    ) -> Result<Invocation, OrchestrateError> {
        let handler = self.lookup(action).ok_or_else(|| {
            OrchestrateError::not_found(format!("no action registered as `{}`", action))
        })?;
        if !opts.blocking {
            let name = action.full_name();
            let fut = handler(params);
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    warn!(action = %name, "fire-and-forget invocation failed: {}", e);
                }
            });
            return Ok(Invocation::with_status(202, None));
        }
        handler(params).await
    }
}
