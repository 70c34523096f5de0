use std::cmp::Ordering;

use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::action::{ActionInvoker, ActionRef, InvokeOptions, Invocation, QualifiedAction};
use crate::error::OrchestrateError;
use crate::payload::Payload;
use crate::pattern::value_at_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// How to rank candidate payloads: the dot-path to a numeric field, the sort
/// direction, and an optional substitute for candidates missing the field.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RatingConfig {
    pub field: String,
    pub sort: SortOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// A named downstream action. Configured as an ordered list so invocation
/// order and tie-breaking are well-defined.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FanoutAction {
    pub name: String,
    pub action: ActionRef,
}

fn default_pattern_name() -> String {
    "fanout".to_string()
}

fn default_fail_on_error() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FanoutConfig {
    #[serde(default = "default_pattern_name")]
    pub pattern_name: String,
    pub rating: RatingConfig,
    pub actions: Vec<FanoutAction>,
    #[serde(default = "default_fail_on_error")]
    pub fail_on_error: bool,
}

/// Fan-out pattern: invoke every configured action concurrently with the
/// same payload, wait for all of them (a join, not a race), and pick exactly
/// one winning payload by rating.
#[derive(Debug, Clone)]
pub struct Fanout {
    pattern_name: String,
    rating: RatingConfig,
    actions: Vec<(String, QualifiedAction)>,
    fail_on_error: bool,
}

impl Fanout {
    pub fn new(config: FanoutConfig, default_package: &str) -> Result<Self, OrchestrateError> {
        if config.pattern_name.trim().is_empty() {
            return Err(OrchestrateError::configuration(
                "fanout pattern_name is empty",
            ));
        }
        if config.rating.field.trim().is_empty() {
            return Err(OrchestrateError::configuration(format!(
                "fanout `{}` has no rating.field configured",
                config.pattern_name
            )));
        }
        if config.actions.is_empty() {
            return Err(OrchestrateError::configuration(format!(
                "fanout `{}` has no actions configured",
                config.pattern_name
            )));
        }
        let actions = config
            .actions
            .into_iter()
            .map(|a| (a.name, a.action.qualify(default_package)))
            .collect();
        Ok(Self {
            pattern_name: config.pattern_name,
            rating: config.rating,
            actions,
            fail_on_error: config.fail_on_error,
        })
    }

    pub fn pattern_name(&self) -> &str {
        &self.pattern_name
    }

    /// Invoke all configured actions concurrently and reduce their results
    /// to a single winner.
    #[tracing::instrument(name = "fanout_run", skip(self, payload, invoker))]
    pub async fn run(
        &self,
        payload: Payload,
        invoker: &dyn ActionInvoker,
    ) -> Result<Invocation, OrchestrateError> {
        let payload_value = payload.to_value();
        let invocations = self.actions.iter().map(|(name, action)| {
            let params = json!({ "payload": payload_value.clone() });
            async move {
                (
                    name.as_str(),
                    invoker.invoke(action, params, InvokeOptions::default()).await,
                )
            }
        });
        // wait for every outcome before deciding anything
        let outcomes = join_all(invocations).await;

        let mut candidates: Vec<(usize, Payload)> = Vec::new();
        for (index, (name, outcome)) in outcomes.into_iter().enumerate() {
            let failure = match outcome {
                Ok(inv) if inv.is_success() => {
                    match inv.payload {
                        Some(p) => {
                            candidates.push((index, p));
                            None
                        }
                        None => Some("returned no payload".to_string()),
                    }
                }
                Ok(inv) => Some(format!("returned status {}", inv.status_code)),
                Err(e) => Some(e.message),
            };
            if let Some(reason) = failure {
                if self.fail_on_error {
                    return Err(OrchestrateError::step(format!(
                        "fanout `{}`: action `{}` {}",
                        self.pattern_name, name, reason
                    )));
                }
                warn!(pattern = %self.pattern_name, action = %name, "dropping candidate: {}", reason);
            }
        }

        let mut rated: Vec<(usize, f64, Payload)> = Vec::new();
        for (index, candidate) in candidates {
            let value = candidate.to_value();
            let rating = value_at_path(&value, &self.rating.field)
                .cloned()
                .or_else(|| self.rating.default_value.clone())
                .and_then(|v| v.as_f64());
            match rating {
                Some(r) => rated.push((index, r, candidate)),
                None => {
                    warn!(
                        pattern = %self.pattern_name,
                        field = %self.rating.field,
                        "candidate {} has no usable rating, discarding", index
                    );
                }
            }
        }

        // stable ascending sort; ties keep invocation order
        rated.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        let winner = match self.rating.sort {
            SortOrder::Asc => rated.into_iter().next(),
            SortOrder::Desc => rated.into_iter().next_back(),
        };
        match winner {
            Some((_, _, winning_payload)) => Ok(Invocation::ok(winning_payload)),
            None => Err(OrchestrateError::exhausted(format!(
                "fanout `{}`: no downstream action returned successfully",
                self.pattern_name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn rated_payload(rating: f64, tag: &str) -> Payload {
        let mut payload = Payload::new("http", "u", Value::Null);
        payload
            .context
            .extras
            .insert("rating".into(), json!(rating));
        payload.context.extras.insert("tag".into(), json!(tag));
        payload
    }

    fn config(sort: SortOrder, actions: &[&str], fail_on_error: bool) -> FanoutConfig {
        FanoutConfig {
            pattern_name: "fanout".into(),
            rating: RatingConfig {
                field: "context.rating".into(),
                sort,
                default_value: None,
            },
            actions: actions
                .iter()
                .map(|a| FanoutAction {
                    name: a.to_string(),
                    action: ActionRef::parse(a).unwrap(),
                })
                .collect(),
            fail_on_error,
        }
    }

    fn registry_with_ratings(entries: &[(&str, f64)]) -> Arc<ActionRegistry> {
        let registry = ActionRegistry::new();
        for (name, rating) in entries {
            let payload = rated_payload(*rating, name);
            registry.register_fn(name, move |_| Ok(Invocation::ok(payload.clone())));
        }
        registry
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = config(SortOrder::Asc, &["a"], true);
        cfg.actions.clear();
        assert!(Fanout::new(cfg, "test").is_err());

        let mut cfg = config(SortOrder::Asc, &["a"], true);
        cfg.rating.field = " ".into();
        assert!(Fanout::new(cfg, "test").is_err());
    }

    #[test]
    fn test_sort_order_serde() {
        let cfg: FanoutConfig = serde_json::from_value(json!({
            "rating": {"field": "context.rating", "sort": "desc"},
            "actions": [{"name": "a", "action": "pkg/a"}]
        }))
        .unwrap();
        assert_eq!(cfg.rating.sort, SortOrder::Desc);
        assert_eq!(cfg.pattern_name, "fanout");
        assert!(cfg.fail_on_error);
        assert!(serde_json::from_value::<FanoutConfig>(json!({
            "rating": {"field": "x", "sort": "sideways"},
            "actions": [{"name": "a", "action": "a"}]
        }))
        .is_err());
    }

    #[tokio::test]
    async fn test_asc_picks_lowest_desc_picks_highest() {
        let registry = registry_with_ratings(&[("a", 1.0), ("b", 2.0)]);

        let fanout = Fanout::new(config(SortOrder::Asc, &["a", "b"], true), "test").unwrap();
        let result = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap();
        assert_eq!(result.payload.unwrap().context.extras["tag"], "a");

        let fanout = Fanout::new(config(SortOrder::Desc, &["a", "b"], true), "test").unwrap();
        let result = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap();
        assert_eq!(result.payload.unwrap().context.extras["tag"], "b");
    }

    #[tokio::test]
    async fn test_fail_on_error_aborts_with_503() {
        let registry = registry_with_ratings(&[("a", 1.0)]);
        registry.register_fn("b", |_| Err(OrchestrateError::step("down")));

        let fanout = Fanout::new(config(SortOrder::Asc, &["a", "b"], true), "test").unwrap();
        let err = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.status_code, 503);
        assert!(err.message.contains("`b`"));
    }

    #[tokio::test]
    async fn test_tolerant_mode_uses_survivors() {
        let registry = registry_with_ratings(&[("a", 5.0)]);
        registry.register_fn("b", |_| Err(OrchestrateError::step("down")));

        let fanout = Fanout::new(config(SortOrder::Desc, &["a", "b"], false), "test").unwrap();
        let result = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap();
        assert_eq!(result.payload.unwrap().context.extras["tag"], "a");
    }

    #[tokio::test]
    async fn test_non_2xx_candidate_is_dropped_when_tolerant() {
        let registry = registry_with_ratings(&[("a", 5.0)]);
        registry.register_fn("b", |_| Ok(Invocation::with_status(500, None)));

        let fanout = Fanout::new(config(SortOrder::Asc, &["a", "b"], false), "test").unwrap();
        let result = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap();
        assert_eq!(result.payload.unwrap().context.extras["tag"], "a");
    }

    #[tokio::test]
    async fn test_no_survivors_is_503() {
        let registry = ActionRegistry::new();
        registry.register_fn("a", |_| Err(OrchestrateError::step("down")));

        let fanout = Fanout::new(config(SortOrder::Asc, &["a"], false), "test").unwrap();
        let err = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.status_code, 503);
        assert!(err.message.contains("no downstream action"));
    }

    #[tokio::test]
    async fn test_default_value_substitutes_missing_rating() {
        let registry = registry_with_ratings(&[("a", 3.0)]);
        // b returns a payload without the rating field
        registry.register_fn("b", |_| {
            let mut p = Payload::new("http", "u", Value::Null);
            p.context.extras.insert("tag".into(), json!("b"));
            Ok(Invocation::ok(p))
        });

        let mut cfg = config(SortOrder::Asc, &["a", "b"], true);
        cfg.rating.default_value = Some(json!(0));
        let fanout = Fanout::new(cfg, "test").unwrap();
        let result = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap();
        // b's substituted 0 beats a's 3 ascending
        assert_eq!(result.payload.unwrap().context.extras["tag"], "b");
    }

    #[tokio::test]
    async fn test_unratable_candidate_without_default_is_discarded() {
        let registry = registry_with_ratings(&[("a", 3.0)]);
        registry.register_fn("b", |_| {
            let mut p = Payload::new("http", "u", Value::Null);
            p.context.extras.insert("tag".into(), json!("b"));
            Ok(Invocation::ok(p))
        });

        let fanout = Fanout::new(config(SortOrder::Asc, &["a", "b"], true), "test").unwrap();
        let result = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap();
        assert_eq!(result.payload.unwrap().context.extras["tag"], "a");
    }

    #[tokio::test]
    async fn test_ties_keep_invocation_order() {
        let registry = registry_with_ratings(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        let fanout =
            Fanout::new(config(SortOrder::Asc, &["a", "b", "c"], true), "test").unwrap();
        let result = fanout
            .run(Payload::new("http", "u", Value::Null), registry.as_ref())
            .await
            .unwrap();
        assert_eq!(result.payload.unwrap().context.extras["tag"], "a");
    }
}
