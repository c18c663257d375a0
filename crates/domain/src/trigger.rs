use apphub_core::{AppError, AppResult, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::event::EventEnvelope;

/// Condition operator used by trigger filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerConditionOperator {
    /// True when the selected value equals the configured value.
    Equals,
    /// True when the selected value does not equal the configured value.
    NotEquals,
    /// True when the selected path resolves to any value.
    Exists,
    /// True when the selected array or string contains the configured value.
    Contains,
}

/// One filter condition over the envelope scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Dot-separated path into `{source, payload, metadata, correlationId, occurredAt}`.
    pub path: String,
    /// Condition operator.
    pub operator: TriggerConditionOperator,
    /// Comparison value for operators that take one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Pure predicate matching envelopes to a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerPredicate {
    /// Conditions that must all pass; an empty list matches every envelope.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TriggerCondition>,
}

impl TriggerPredicate {
    /// Validates condition shapes.
    pub fn validate(&self) -> AppResult<()> {
        for condition in &self.conditions {
            if condition.path.trim().is_empty() {
                return Err(AppError::Validation(
                    "trigger condition path must not be empty".to_owned(),
                ));
            }

            match condition.operator {
                TriggerConditionOperator::Equals
                | TriggerConditionOperator::NotEquals
                | TriggerConditionOperator::Contains => {
                    if condition.value.is_none() {
                        return Err(AppError::Validation(format!(
                            "trigger condition on '{}' requires a comparison value",
                            condition.path
                        )));
                    }
                }
                TriggerConditionOperator::Exists => {
                    if condition.value.is_some() {
                        return Err(AppError::Validation(format!(
                            "trigger condition on '{}' must not carry a value with exists",
                            condition.path
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Evaluates the predicate against an envelope scope.
    #[must_use]
    pub fn matches(&self, scope: &Value) -> bool {
        self.conditions.iter().all(|condition| {
            let selected = value_at_path(scope, condition.path.as_str());
            match condition.operator {
                TriggerConditionOperator::Exists => selected.is_some(),
                TriggerConditionOperator::Equals => selected == condition.value.as_ref(),
                TriggerConditionOperator::NotEquals => selected != condition.value.as_ref(),
                TriggerConditionOperator::Contains => match (selected, condition.value.as_ref()) {
                    (Some(Value::Array(items)), Some(expected)) => items.contains(expected),
                    (Some(Value::String(text)), Some(Value::String(needle))) => {
                        text.contains(needle.as_str())
                    }
                    _ => false,
                },
            }
        })
    }
}

fn value_at_path<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = scope;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }

        current = current.as_object()?.get(segment)?;
    }

    Some(current)
}

/// Per-trigger launch throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerThrottle {
    /// Rolling window length.
    pub window_ms: i64,
    /// Maximum launches inside the window.
    pub max_count: i64,
    /// Optional cap on concurrently active launched runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<i64>,
}

/// Trigger payload carried inside a workflow definition submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTriggerInput {
    /// Event type the trigger listens for.
    pub event_type: String,
    /// Filter predicate.
    #[serde(default)]
    pub predicate: TriggerPredicate,
    /// Template producing run parameters from the envelope scope.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameter_template: Value,
    /// Optional template producing the run key from the envelope scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_key_template: Option<String>,
    /// Optional launch throttle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<TriggerThrottle>,
}

impl EventTriggerInput {
    /// Validates the trigger payload.
    pub fn validate(&self) -> AppResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(AppError::Validation(
                "trigger event_type must not be empty".to_owned(),
            ));
        }

        self.predicate.validate()?;

        if let Some(throttle) = &self.throttle {
            if throttle.window_ms <= 0 {
                return Err(AppError::Validation(
                    "trigger throttle window_ms must be greater than zero".to_owned(),
                ));
            }

            if throttle.max_count <= 0 {
                return Err(AppError::Validation(
                    "trigger throttle max_count must be greater than zero".to_owned(),
                ));
            }

            if let Some(max_concurrency) = throttle.max_concurrency
                && max_concurrency <= 0
            {
                return Err(AppError::Validation(
                    "trigger throttle max_concurrency must be greater than zero".to_owned(),
                ));
            }
        }

        Ok(())
    }
}

/// Persisted event trigger bound to one workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTrigger {
    /// Stable trigger identifier.
    pub id: Uuid,
    /// Workflow definition launched on match.
    pub workflow_definition_id: WorkflowId,
    /// Event type the trigger listens for.
    pub event_type: String,
    /// Filter predicate.
    pub predicate: TriggerPredicate,
    /// Template producing run parameters from the envelope scope.
    pub parameter_template: Value,
    /// Optional template producing the run key from the envelope scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_key_template: Option<String>,
    /// Optional launch throttle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<TriggerThrottle>,
    /// Disabled triggers are skipped during evaluation.
    pub is_enabled: bool,
}

impl EventTrigger {
    /// Creates a validated trigger with a fresh identifier.
    pub fn new(workflow_definition_id: WorkflowId, input: EventTriggerInput) -> AppResult<Self> {
        input.validate()?;

        let EventTriggerInput {
            event_type,
            predicate,
            parameter_template,
            run_key_template,
            throttle,
        } = input;

        Ok(Self {
            id: Uuid::new_v4(),
            workflow_definition_id,
            event_type: event_type.trim().to_owned(),
            predicate,
            parameter_template,
            run_key_template,
            throttle,
            is_enabled: true,
        })
    }
}

/// Builds the evaluation scope a trigger sees for one envelope.
#[must_use]
pub fn envelope_scope(envelope: &EventEnvelope) -> Value {
    json!({
        "id": envelope.id,
        "type": envelope.event_type,
        "source": envelope.source,
        "occurredAt": envelope.occurred_at.to_rfc3339(),
        "payload": envelope.payload,
        "metadata": envelope.metadata.clone().unwrap_or(Value::Null),
        "correlationId": envelope.correlation_id.clone().map_or(Value::Null, Value::String),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use crate::event::{EventEnvelope, EventEnvelopeInput};

    use super::{
        TriggerCondition, TriggerConditionOperator, TriggerPredicate, envelope_scope,
    };

    fn scope() -> serde_json::Value {
        let envelope = EventEnvelope::normalize(EventEnvelopeInput {
            id: "e1".to_owned(),
            event_type: "orders.created".to_owned(),
            source: "shop".to_owned(),
            occurred_at: Utc::now(),
            payload: json!({"orderId": "o-1", "tags": ["eu", "priority"]}),
            correlation_id: Some("corr-9".to_owned()),
            ttl_ms: None,
            metadata: None,
            schema_version: None,
            schema_hash: None,
        });

        let Ok(envelope) = envelope else {
            panic!("envelope must normalize");
        };

        envelope_scope(&envelope)
    }

    #[test]
    fn empty_predicate_matches_everything() {
        assert!(TriggerPredicate::default().matches(&scope()));
    }

    #[test]
    fn equals_condition_selects_payload_paths() {
        let predicate = TriggerPredicate {
            conditions: vec![TriggerCondition {
                path: "payload.orderId".to_owned(),
                operator: TriggerConditionOperator::Equals,
                value: Some(json!("o-1")),
            }],
        };

        assert!(predicate.matches(&scope()));
    }

    #[test]
    fn contains_condition_inspects_arrays() {
        let predicate = TriggerPredicate {
            conditions: vec![TriggerCondition {
                path: "payload.tags".to_owned(),
                operator: TriggerConditionOperator::Contains,
                value: Some(json!("priority")),
            }],
        };

        assert!(predicate.matches(&scope()));
    }

    #[test]
    fn failed_condition_rejects_envelope() {
        let predicate = TriggerPredicate {
            conditions: vec![TriggerCondition {
                path: "source".to_owned(),
                operator: TriggerConditionOperator::NotEquals,
                value: Some(json!("shop")),
            }],
        };

        assert!(!predicate.matches(&scope()));
    }

    #[test]
    fn exists_rejects_a_comparison_value() {
        let predicate = TriggerPredicate {
            conditions: vec![TriggerCondition {
                path: "payload.orderId".to_owned(),
                operator: TriggerConditionOperator::Exists,
                value: Some(json!("o-1")),
            }],
        };

        assert!(predicate.validate().is_err());
    }
}
