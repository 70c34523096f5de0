use std::fs;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::action::{ActionInvoker, ActionRef, InvokeOptions, QualifiedAction};
use crate::error::OrchestrateError;
use crate::payload::Payload;

/// One configured middleware step. `parameters` are merged into the
/// invocation params next to the payload; the three property flags drive the
/// engine's failure handling.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepConfig {
    pub action: ActionRef,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, rename = "final", skip_serializing_if = "std::ops::Not::not")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub catch: bool,
}

impl StepConfig {
    pub fn new(action: ActionRef) -> Self {
        Self {
            action,
            parameters: Value::Null,
            is_final: false,
            continue_on_error: false,
            catch: false,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn finally(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn catching(mut self) -> Self {
        self.catch = true;
        self
    }
}

/// A step with its action reference resolved to a full address.
#[derive(Debug, Clone)]
struct Step {
    action: QualifiedAction,
    parameters: Value,
    is_final: bool,
    continue_on_error: bool,
    catch: bool,
}

/// One record per invocation actually made, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub action: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub status_code: u16,
}

/// Outcome of a pipeline run: the last known payload, the ordered trace of
/// invoked actions, and the aggregate status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub status_code: u16,
    pub payload: Payload,
    pub records: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OrchestrateError>,
}

impl PipelineRun {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Names of the actions that were actually invoked, in order.
    pub fn executed(&self) -> Vec<String> {
        self.records.iter().map(|r| r.action.clone()).collect()
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("JSON error: {0}")]
    Serialization(String),
    #[error("invalid step: {0}")]
    Invalid(String),
}

/// Engine control flow, driven by step outcomes rather than by bubbling
/// errors: `Recovering` means a failure is pending and only `final`/`catch`
/// steps run until a catch succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Running,
    Recovering,
    ShortCircuited,
}

enum StepOutcome {
    Ok(Payload),
    /// 204: deliberate stop, distinct from error handling.
    Stop(Option<Payload>),
    Fail {
        error: OrchestrateError,
        payload: Option<Payload>,
    },
    /// Returned payload failed canonical validation: pipeline-level 400,
    /// not a step failure.
    Invalid(OrchestrateError),
}

/// The middleware pipeline engine: executes an ordered list of steps against
/// a payload, enforcing stop/continue/catch/final semantics. Failure is never
/// retried here; retries belong to the invoker.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(configs: Vec<StepConfig>, default_package: &str) -> Self {
        let steps = configs
            .into_iter()
            .map(|c| Step {
                action: c.action.qualify(default_package),
                parameters: c.parameters,
                is_final: c.is_final,
                continue_on_error: c.continue_on_error,
                catch: c.catch,
            })
            .collect();
        Self { steps }
    }

    pub fn from_file(path: &str, default_package: &str) -> Result<Self, PipelineConfigError> {
        let json = fs::read_to_string(path)
            .map_err(|e| PipelineConfigError::Io(format!("read error: {}", e)))?;
        let configs: Vec<StepConfig> = serde_json::from_str(&json)
            .map_err(|e| PipelineConfigError::Serialization(format!("parse error: {}", e)))?;
        Ok(Self::new(configs, default_package))
    }

    pub fn save_to_file(path: &str, configs: &[StepConfig]) -> Result<(), PipelineConfigError> {
        let json = serde_json::to_string_pretty(configs)
            .map_err(|e| PipelineConfigError::Serialization(format!("{}", e)))?;
        fs::write(path, json).map_err(|e| PipelineConfigError::Io(format!("{}", e)))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the configured steps in order against `payload`.
    #[tracing::instrument(name = "pipeline_run", skip(self, payload, invoker))]
    pub async fn run(&self, payload: Payload, invoker: &dyn ActionInvoker) -> PipelineRun {
        let mut state = EngineState::Running;
        let mut current = payload;
        let mut records: Vec<StepRecord> = Vec::new();
        let mut pending: Option<OrchestrateError> = None;

        for step in &self.steps {
            // a catch step behaves like promise .catch(): skipped while
            // healthy, invoked only to recover from a pending failure
            if state == EngineState::Running && step.catch {
                continue;
            }
            let run_as_catch = state == EngineState::Recovering && step.catch;
            if state == EngineState::Recovering && !run_as_catch && !step.is_final {
                continue;
            }

            let outcome = self.invoke_step(step, &current, invoker, &mut records).await;
            match outcome {
                StepOutcome::Ok(next) => {
                    current = next;
                    if run_as_catch {
                        pending = None;
                        state = EngineState::Running;
                    }
                }
                StepOutcome::Stop(next) => {
                    if let Some(next) = next {
                        current = next;
                    }
                    if run_as_catch {
                        pending = None;
                    }
                    state = EngineState::ShortCircuited;
                    break;
                }
                StepOutcome::Fail { error, payload } => {
                    if step.continue_on_error {
                        // proceed as if the step succeeded, using whatever
                        // payload the failing call attached
                        warn!(action = %step.action, "step failed, continuing: {}", error);
                        if let Some(p) = payload {
                            current = p;
                        }
                        continue;
                    }
                    pending = Some(error.with_payload(&current));
                    state = EngineState::Recovering;
                }
                StepOutcome::Invalid(error) => {
                    return PipelineRun {
                        status_code: error.status_code,
                        payload: current,
                        records,
                        error: Some(error),
                    };
                }
            }
        }

        match pending {
            Some(error) => PipelineRun {
                status_code: error.status_code,
                payload: current,
                records,
                error: Some(error),
            },
            None => PipelineRun {
                status_code: 200,
                payload: current,
                records,
                error: None,
            },
        }
    }

    async fn invoke_step(
        &self,
        step: &Step,
        current: &Payload,
        invoker: &dyn ActionInvoker,
        records: &mut Vec<StepRecord>,
    ) -> StepOutcome {
        let mut params = match &step.parameters {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        params.insert("payload".to_string(), current.to_value());

        let started = Utc::now();
        let result = invoker
            .invoke(&step.action, Value::Object(params), InvokeOptions::default())
            .await;
        let finished = Utc::now();

        match result {
            Err(e) => {
                records.push(StepRecord {
                    action: step.action.full_name(),
                    started,
                    finished,
                    status_code: e.status_code,
                });
                StepOutcome::Fail {
                    error: OrchestrateError::step(format!(
                        "action `{}` failed: {}",
                        step.action, e.message
                    )),
                    payload: None,
                }
            }
            Ok(inv) => {
                records.push(StepRecord {
                    action: step.action.full_name(),
                    started,
                    finished,
                    status_code: inv.status_code,
                });
                debug!(action = %step.action, status = inv.status_code, "step finished");
                if inv.status_code == 204 {
                    return StepOutcome::Stop(inv.payload);
                }
                if !inv.is_success() {
                    return StepOutcome::Fail {
                        error: OrchestrateError::step(format!(
                            "action `{}` returned status {}",
                            step.action, inv.status_code
                        )),
                        payload: inv.payload,
                    };
                }
                let Some(next) = inv.payload else {
                    return StepOutcome::Invalid(OrchestrateError::validation(
                        format!("action `{}` returned no payload", step.action),
                        Value::Null,
                    ));
                };
                if let Err(e) = next.validate() {
                    return StepOutcome::Invalid(e);
                }
                StepOutcome::Ok(next)
            }
        }
    }
}
