use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use futures::future::BoxFuture;
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::action::{ActionInvoker, ActionRef, InvokeOptions, Invocation, QualifiedAction};
use crate::error::OrchestrateError;
use crate::payload::Payload;

/// Slash-delimited hierarchical state name, parsed once into segments.
/// `/a/b/c` is a descendant of `/a/b` and `/a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatePath {
    segments: Vec<String>,
}

impl StatePath {
    pub fn parse(s: &str) -> Result<Self, OrchestrateError> {
        let trimmed = s.trim().trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(OrchestrateError::configuration("empty state path"));
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(OrchestrateError::configuration(format!(
                "malformed state path `{}`",
                s
            )));
        }
        Ok(Self { segments })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// All prefixes of this path from the root down to the path itself.
    pub fn chain(&self) -> Vec<StatePath> {
        (1..=self.segments.len())
            .map(|n| StatePath {
                segments: self.segments[..n].to_vec(),
            })
            .collect()
    }

    /// Number of leading segments shared with `other`.
    pub fn common_prefix_len(&self, other: &StatePath) -> usize {
        self.segments
            .iter()
            .zip(&other.segments)
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl TryFrom<String> for StatePath {
    type Error = OrchestrateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StatePath::parse(&value)
    }
}

impl From<StatePath> for String {
    fn from(value: StatePath) -> Self {
        value.to_string()
    }
}

impl JsonSchema for StatePath {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "StatePath".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }
}

/// Per-state configuration: the message handler plus optional enter/exit
/// hooks fired on transitions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StateConfig {
    pub handler: ActionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enter: Option<ActionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ActionRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransitionConfig {
    pub from: StatePath,
    pub to: StatePath,
    pub handler: ActionRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InitialState {
    pub state: StatePath,
    #[serde(default)]
    pub data: Value,
}

fn default_pattern_name() -> String {
    "fsm".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FsmConfig {
    #[serde(default = "default_pattern_name")]
    pub pattern_name: String,
    pub initial: InitialState,
    #[schemars(with = "std::collections::HashMap<String, StateConfig>")]
    pub states: HashMap<StatePath, StateConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhandled: Option<ActionRef>,
}

/// Runtime state persisted at `conversationcontext.patterns.<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FsmRuntime {
    pub state: StatePath,
    #[serde(default)]
    pub data: Value,
    pub since: Since,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Since {
    /// Milliseconds since the epoch at which the state was entered.
    pub timestamp: i64,
}

/// Data-driven state expiry: when a message arrives `ms` after the state was
/// entered, the machine resumes in `goto` (or the initial state) instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutConfig {
    pub ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<StatePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using: Option<Value>,
}

/// Directive a handler (or hook) may attach to its result under the `fsm`
/// key to steer the machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsmDirective {
    #[serde(default)]
    pub goto: Option<StatePath>,
    #[serde(default)]
    pub using: Option<Value>,
    #[serde(default)]
    pub timeout: Option<TimeoutConfig>,
}

#[derive(Debug, Clone)]
struct ResolvedState {
    handler: QualifiedAction,
    enter: Option<QualifiedAction>,
    exit: Option<QualifiedAction>,
}

#[derive(Debug, Clone)]
struct ResolvedTransition {
    from: StatePath,
    to: StatePath,
    handler: QualifiedAction,
}

/// Hierarchical dialog state machine layered on top of the pipeline. One
/// instance per `pattern_name`; multiple machines coexist in one payload's
/// conversation context.
#[derive(Debug, Clone)]
pub struct Fsm {
    pattern_name: String,
    initial_state: StatePath,
    initial_data: Value,
    states: HashMap<StatePath, ResolvedState>,
    transitions: Vec<ResolvedTransition>,
    unhandled: Option<QualifiedAction>,
}

impl Fsm {
    /// Validate the configuration and resolve every action reference.
    /// A state whose ancestor chain has a gap is rejected here, before any
    /// run is attempted.
    pub fn new(config: FsmConfig, default_package: &str) -> Result<Self, OrchestrateError> {
        if config.pattern_name.trim().is_empty() {
            return Err(OrchestrateError::configuration("fsm pattern_name is empty"));
        }
        if config.states.is_empty() {
            return Err(OrchestrateError::configuration(format!(
                "fsm `{}` has no states configured",
                config.pattern_name
            )));
        }
        for state in config.states.keys() {
            for ancestor in state.chain() {
                if !config.states.contains_key(&ancestor) {
                    return Err(OrchestrateError::configuration(format!(
                        "fsm `{}`: state `{}` is missing configured ancestor `{}`",
                        config.pattern_name, state, ancestor
                    )));
                }
            }
        }
        if !config.states.contains_key(&config.initial.state) {
            return Err(OrchestrateError::configuration(format!(
                "fsm `{}`: initial state `{}` is not a configured state",
                config.pattern_name, config.initial.state
            )));
        }
        for t in &config.transitions {
            if !config.states.contains_key(&t.from) || !config.states.contains_key(&t.to) {
                return Err(OrchestrateError::configuration(format!(
                    "fsm `{}`: transition `{}` -> `{}` references an unknown state",
                    config.pattern_name, t.from, t.to
                )));
            }
        }

        let states = config
            .states
            .into_iter()
            .map(|(path, sc)| {
                (
                    path,
                    ResolvedState {
                        handler: sc.handler.qualify(default_package),
                        enter: sc.enter.map(|a| a.qualify(default_package)),
                        exit: sc.exit.map(|a| a.qualify(default_package)),
                    },
                )
            })
            .collect();
        let transitions = config
            .transitions
            .into_iter()
            .map(|t| ResolvedTransition {
                from: t.from,
                to: t.to,
                handler: t.handler.qualify(default_package),
            })
            .collect();

        Ok(Self {
            pattern_name: config.pattern_name,
            initial_state: config.initial.state,
            initial_data: config.initial.data,
            states,
            transitions,
            unhandled: config.unhandled.map(|a| a.qualify(default_package)),
        })
    }

    pub fn pattern_name(&self) -> &str {
        &self.pattern_name
    }

    /// Process one message: resolve the current state (honoring a pending
    /// timeout), invoke its handler, persist the resulting state, and fire
    /// any transition hooks.
    #[tracing::instrument(name = "fsm_run", skip(self, payload, invoker))]
    pub async fn run(
        &self,
        payload: Payload,
        invoker: &dyn ActionInvoker,
    ) -> Result<Invocation, OrchestrateError> {
        let mut payload = payload;

        let prior: Option<FsmRuntime> = match payload.pattern_state(&self.pattern_name) {
            Some(value) => Some(serde_json::from_value(value.clone()).map_err(|e| {
                OrchestrateError::validation(
                    format!(
                        "persisted fsm state for `{}` is malformed: {}",
                        self.pattern_name, e
                    ),
                    value.clone(),
                )
            })?),
            None => None,
        };

        let (mut state, mut data) = match &prior {
            Some(rt) => (rt.state.clone(), rt.data.clone()),
            None => (self.initial_state.clone(), self.initial_data.clone()),
        };

        // timeout re-route, only when resuming and at most once per run
        if let Some(rt) = &prior {
            if let Some(t) = &rt.timeout {
                let elapsed = Utc::now().timestamp_millis() - rt.since.timestamp;
                if elapsed >= t.ms as i64 {
                    state = t.goto.clone().unwrap_or_else(|| self.initial_state.clone());
                    data = t.using.clone().unwrap_or_else(|| self.initial_data.clone());
                    debug!(pattern = %self.pattern_name, state = %state, "state expired, rerouting");
                }
            }
        }

        let entered = state.clone();
        let handler = self
            .states
            .get(&state)
            .ok_or_else(|| {
                OrchestrateError::step(format!(
                    "fsm `{}`: state `{}` is not configured",
                    self.pattern_name, state
                ))
            })?
            .handler
            .clone();

        let (next_payload, directive) = self
            .invoke_validated(&handler, &payload, &data, &state, invoker)
            .await?;
        payload = next_payload;

        let next_state = match directive.goto {
            Some(goto) => {
                if !self.states.contains_key(&goto) {
                    return Err(OrchestrateError::step(format!(
                        "fsm `{}`: goto target `{}` is not a configured state",
                        self.pattern_name, goto
                    )));
                }
                goto
            }
            None => state.clone(),
        };
        let next_data = directive.using.unwrap_or(data);
        let timeout = directive.timeout;

        // the only place runtime state is committed before hooks run;
        // a handler failure above leaves the persisted state untouched
        self.persist(&mut payload, &next_state, &next_data, &timeout);

        if next_state != entered {
            payload = self
                .run_transitions(payload, entered, next_state, next_data, timeout, invoker)
                .await?;
        }

        Ok(Invocation::ok(payload))
    }

    /// Invoke an action with the payload and carried data, enforcing the
    /// result contract: 2xx or 422 with a payload. A 422 escalates to the
    /// configured `unhandled` action exactly once.
    async fn invoke_validated(
        &self,
        action: &QualifiedAction,
        payload: &Payload,
        data: &Value,
        state: &StatePath,
        invoker: &dyn ActionInvoker,
    ) -> Result<(Payload, FsmDirective), OrchestrateError> {
        let mut action = action.clone();
        let mut via_unhandled = false;
        loop {
            let params = json!({"payload": payload.to_value(), "fsm": {"data": data}});
            let inv = invoker
                .invoke(&action, params, InvokeOptions::default())
                .await
                .map_err(|e| {
                    OrchestrateError::step(format!(
                        "fsm `{}`: action `{}` failed in state `{}`: {}",
                        self.pattern_name, action, state, e.message
                    ))
                })?;

            if !inv.is_success() && inv.status_code != 422 {
                return Err(OrchestrateError::step(format!(
                    "fsm `{}`: action `{}` returned status {} in state `{}`",
                    self.pattern_name, action, inv.status_code, state
                )));
            }

            let Some(next_payload) = inv.payload else {
                return Err(OrchestrateError::step(format!(
                    "fsm `{}`: action `{}` returned no payload",
                    self.pattern_name, action
                )));
            };

            if inv.status_code == 422 {
                if via_unhandled {
                    return Err(OrchestrateError::step(format!(
                        "fsm `{}`: unhandled action `{}` did not handle state `{}` either",
                        self.pattern_name, action, state
                    )));
                }
                match &self.unhandled {
                    Some(unhandled) => {
                        action = unhandled.clone();
                        via_unhandled = true;
                        continue;
                    }
                    None => {
                        return Err(OrchestrateError::step(format!(
                            "fsm `{}`: state `{}` did not handle the message and no \
                             unhandled action is configured",
                            self.pattern_name, state
                        )));
                    }
                }
            }
            let directive = match inv.extra.get("fsm") {
                Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                    OrchestrateError::step(format!(
                        "fsm `{}`: action `{}` returned an invalid fsm directive: {}",
                        self.pattern_name, action, e
                    ))
                })?,
                None => FsmDirective::default(),
            };
            return Ok((next_payload, directive));
        }
    }

    fn persist(
        &self,
        payload: &mut Payload,
        state: &StatePath,
        data: &Value,
        timeout: &Option<TimeoutConfig>,
    ) {
        let runtime = FsmRuntime {
            state: state.clone(),
            data: data.clone(),
            since: Since {
                timestamp: Utc::now().timestamp_millis(),
            },
            timeout: timeout.clone(),
        };
        let value = serde_json::to_value(&runtime).unwrap_or(Value::Null);
        payload.set_pattern_state(&self.pattern_name, value);
    }

    /// Fire exit, explicit transition and enter hooks for `from -> to`.
    /// Hooks shared between both paths (common ancestors) are not re-fired.
    /// A hook may itself direct a further `goto`, which re-enters this logic
    /// once the current hook sequence has completed.
    fn run_transitions<'a>(
        &'a self,
        payload: Payload,
        from: StatePath,
        to: StatePath,
        data: Value,
        timeout: Option<TimeoutConfig>,
        invoker: &'a dyn ActionInvoker,
    ) -> BoxFuture<'a, Result<Payload, OrchestrateError>> {
        Box::pin(async move {
            let mut payload = payload;
            let mut data = data;
            let mut timeout = timeout;
            let shared = from.common_prefix_len(&to);
            let mut pending_goto: Option<StatePath> = None;
            let mut dirty = false;

            let apply = |directive: FsmDirective,
                             pending_goto: &mut Option<StatePath>,
                             data: &mut Value,
                             timeout: &mut Option<TimeoutConfig>,
                             dirty: &mut bool| {
                if let Some(goto) = directive.goto {
                    *pending_goto = Some(goto);
                    *dirty = true;
                }
                if let Some(using) = directive.using {
                    *data = using;
                    *dirty = true;
                }
                if let Some(t) = directive.timeout {
                    *timeout = Some(t);
                    *dirty = true;
                }
            };

            // exit hooks: old path, most specific first, stopping above the
            // shared ancestor
            for sp in from.chain().iter().rev() {
                if sp.len() <= shared {
                    break;
                }
                if let Some(cfg) = self.states.get(sp) {
                    if let Some(exit) = &cfg.exit {
                        let (p, d) = self
                            .invoke_validated(exit, &payload, &data, sp, invoker)
                            .await?;
                        payload = p;
                        apply(d, &mut pending_goto, &mut data, &mut timeout, &mut dirty);
                    }
                }
            }

            // explicit transition hooks, in configuration order
            for t in &self.transitions {
                if t.from == from && t.to == to {
                    let (p, d) = self
                        .invoke_validated(&t.handler, &payload, &data, &to, invoker)
                        .await?;
                    payload = p;
                    apply(d, &mut pending_goto, &mut data, &mut timeout, &mut dirty);
                }
            }

            // enter hooks: new path, root down to the new state
            for sp in to.chain().iter() {
                if sp.len() <= shared {
                    continue;
                }
                if let Some(cfg) = self.states.get(sp) {
                    if let Some(enter) = &cfg.enter {
                        let (p, d) = self
                            .invoke_validated(enter, &payload, &data, sp, invoker)
                            .await?;
                        payload = p;
                        apply(d, &mut pending_goto, &mut data, &mut timeout, &mut dirty);
                    }
                }
            }

            let target = match &pending_goto {
                Some(goto) if *goto != to => Some(goto.clone()),
                _ => None,
            };
            if let Some(goto) = &target {
                if !self.states.contains_key(goto) {
                    return Err(OrchestrateError::step(format!(
                        "fsm `{}`: goto target `{}` is not a configured state",
                        self.pattern_name, goto
                    )));
                }
            }
            if dirty {
                let state_now = target.clone().unwrap_or_else(|| to.clone());
                self.persist(&mut payload, &state_now, &data, &timeout);
            }
            if let Some(goto) = target {
                return self
                    .run_transitions(payload, to, goto, data, timeout, invoker)
                    .await;
            }
            Ok(payload)
        })
    }
}
