use std::sync::Arc;
use std::time::Duration as StdDuration;

use apphub_core::{AppError, truncate_error_message};
use apphub_domain::{
    FanOutTemplate, ServiceHeaderValue, ServiceRequest, TemplateScope, WorkflowStep,
    WorkflowStepKind, merge_parameter_layers, resolve_template_value,
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::workflow_ports::{
    JobRunRequest, JobRunStatus, ServiceHealth, ServiceInvocation, WorkflowRun, WorkflowStepRun,
    WorkflowStepStatus,
};

use super::WorkflowService;

/// Result of one step attempt, including persisted fan-out children.
pub(super) enum StepAttemptOutcome {
    Succeeded {
        result: Value,
        job_run_id: Option<String>,
        child_runs: Vec<WorkflowStepRun>,
    },
    Failed {
        message: String,
        kind: String,
        retryable: bool,
        child_runs: Vec<WorkflowStepRun>,
    },
}

impl StepAttemptOutcome {
    fn from_error(error: &AppError) -> Self {
        Self::Failed {
            message: error.to_string(),
            kind: error.kind().to_owned(),
            retryable: error.is_retryable(),
            child_runs: Vec::new(),
        }
    }
}

impl WorkflowService {
    pub(super) async fn execute_step_attempt(
        &self,
        step: &WorkflowStep,
        run: &WorkflowRun,
        shared: &Value,
        steps_scope: &Value,
    ) -> StepAttemptOutcome {
        let scope = base_scope(run, shared, steps_scope);

        match &step.kind {
            WorkflowStepKind::Job { .. } | WorkflowStepKind::Service { .. } => {
                self.execute_leaf_attempt(step.id.as_str(), &step.kind, step.timeout_ms, run, scope, None)
                    .await
            }
            WorkflowStepKind::FanOut {
                collection,
                template,
                max_items,
                max_concurrency,
                ..
            } => {
                self.execute_fan_out(
                    step,
                    run,
                    scope,
                    collection,
                    template,
                    *max_items,
                    *max_concurrency,
                )
                .await
            }
        }
    }

    async fn execute_leaf_attempt(
        &self,
        step_id: &str,
        kind: &WorkflowStepKind,
        timeout_ms: Option<i64>,
        run: &WorkflowRun,
        mut scope: TemplateScope,
        fanout: Option<(Value, Value)>,
    ) -> StepAttemptOutcome {
        if let Some((fanout_meta, item)) = fanout {
            scope.fanout = Some(fanout_meta);
            scope.item = Some(item);
        }

        match kind {
            WorkflowStepKind::Job { job_slug, parameters, .. } => {
                let merged = merge_parameter_layers(&[&run.parameters, parameters]);
                scope.step = Some(json!({"id": step_id, "parameters": merged}));
                scope.step_parameters = Some(merged.clone());

                let resolved = match resolve_template_value(&merged, &scope.as_value()) {
                    Ok(resolved) => resolved,
                    Err(error) => return StepAttemptOutcome::from_error(&error),
                };

                let request = JobRunRequest {
                    job_slug: job_slug.clone(),
                    run_id: run.id,
                    step_id: step_id.to_owned(),
                    parameters: resolved,
                    timeout_ms,
                };

                let dispatch = self.job_runtime.run_job(request);
                let outcome = match timeout_ms {
                    Some(timeout_ms) => {
                        let deadline = StdDuration::from_millis(u64::try_from(timeout_ms).unwrap_or(0));
                        match tokio::time::timeout(deadline, dispatch).await {
                            Ok(outcome) => outcome,
                            Err(_) => {
                                return StepAttemptOutcome::Failed {
                                    message: format!("step '{step_id}' timed out after {timeout_ms}ms"),
                                    kind: "timeout".to_owned(),
                                    retryable: true,
                                    child_runs: Vec::new(),
                                };
                            }
                        }
                    }
                    None => dispatch.await,
                };

                match outcome {
                    Ok(outcome) if outcome.status == JobRunStatus::Succeeded => {
                        StepAttemptOutcome::Succeeded {
                            result: outcome.result,
                            job_run_id: outcome.job_run_id,
                            child_runs: Vec::new(),
                        }
                    }
                    Ok(outcome) => StepAttemptOutcome::Failed {
                        message: outcome
                            .error_message
                            .unwrap_or_else(|| format!("job '{}' failed", outcome.job_run_id.unwrap_or_default())),
                        kind: "job_failed".to_owned(),
                        retryable: true,
                        child_runs: Vec::new(),
                    },
                    Err(error) => StepAttemptOutcome::from_error(&error),
                }
            }
            WorkflowStepKind::Service {
                service_slug,
                request,
                require_healthy,
                allow_degraded,
                capture_response,
                ..
            } => {
                scope.step = Some(json!({"id": step_id, "parameters": run.parameters}));
                scope.step_parameters = Some(run.parameters.clone());

                self.execute_service_call(
                    step_id,
                    service_slug.as_str(),
                    request,
                    *require_healthy,
                    *allow_degraded,
                    *capture_response,
                    timeout_ms,
                    &scope.as_value(),
                )
                .await
            }
            WorkflowStepKind::FanOut { .. } => StepAttemptOutcome::Failed {
                message: format!("step '{step_id}' nests a fan-out template"),
                kind: "validation".to_owned(),
                retryable: false,
                child_runs: Vec::new(),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_service_call(
        &self,
        step_id: &str,
        service_slug: &str,
        request: &ServiceRequest,
        require_healthy: bool,
        allow_degraded: bool,
        capture_response: bool,
        timeout_ms: Option<i64>,
        scope: &Value,
    ) -> StepAttemptOutcome {
        let service = match self.services.find_service(service_slug).await {
            Ok(Some(service)) => service,
            Ok(None) => {
                return StepAttemptOutcome::Failed {
                    message: format!("service '{service_slug}' is not registered"),
                    kind: "not_found".to_owned(),
                    retryable: false,
                    child_runs: Vec::new(),
                };
            }
            Err(error) => return StepAttemptOutcome::from_error(&error),
        };

        if require_healthy {
            let acceptable = matches!(service.health, ServiceHealth::Healthy)
                || (allow_degraded && matches!(service.health, ServiceHealth::Degraded));
            if !acceptable {
                return StepAttemptOutcome::Failed {
                    message: format!(
                        "service '{service_slug}' is {} and the step requires a healthy target",
                        service.health.as_str()
                    ),
                    kind: "service_unhealthy".to_owned(),
                    retryable: false,
                    child_runs: Vec::new(),
                };
            }
        }

        let invocation = match self.resolve_service_request(request, timeout_ms, scope) {
            Ok(invocation) => invocation,
            Err(error) => return StepAttemptOutcome::from_error(&error),
        };

        let call = self.invoker.invoke(&service, invocation);
        let response = match timeout_ms {
            Some(timeout_ms) => {
                let deadline = StdDuration::from_millis(u64::try_from(timeout_ms).unwrap_or(0));
                match tokio::time::timeout(deadline, call).await {
                    Ok(response) => response,
                    Err(_) => {
                        return StepAttemptOutcome::Failed {
                            message: format!("service call '{step_id}' timed out after {timeout_ms}ms"),
                            kind: "timeout".to_owned(),
                            retryable: true,
                            child_runs: Vec::new(),
                        };
                    }
                }
            }
            None => call.await,
        };

        match response {
            Ok(response) if response.status < 400 => {
                let result = if capture_response {
                    json!({"status": response.status, "body": response.body})
                } else {
                    json!({"status": response.status})
                };

                StepAttemptOutcome::Succeeded {
                    result,
                    job_run_id: None,
                    child_runs: Vec::new(),
                }
            }
            Ok(response) if response.status >= 500 => StepAttemptOutcome::Failed {
                message: format!("service '{service_slug}' responded with status {}", response.status),
                kind: "retryable_external".to_owned(),
                retryable: true,
                child_runs: Vec::new(),
            },
            Ok(response) => StepAttemptOutcome::Failed {
                message: format!("service '{service_slug}' rejected the request with status {}", response.status),
                kind: "validation".to_owned(),
                retryable: false,
                child_runs: Vec::new(),
            },
            Err(error) => StepAttemptOutcome::from_error(&error),
        }
    }

    fn resolve_service_request(
        &self,
        request: &ServiceRequest,
        timeout_ms: Option<i64>,
        scope: &Value,
    ) -> Result<ServiceInvocation, AppError> {
        let path = match resolve_template_value(&Value::String(request.path.clone()), scope)? {
            Value::String(path) => path,
            other => other.to_string(),
        };

        let mut headers = Vec::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let resolved = match value {
                ServiceHeaderValue::Plain(raw) => {
                    match resolve_template_value(&Value::String(raw.clone()), scope)? {
                        Value::String(text) => text,
                        other => other.to_string(),
                    }
                }
                ServiceHeaderValue::Secret { secret } => self.secrets.resolve(secret.as_str())?,
            };
            headers.push((name.clone(), resolved));
        }

        let mut query = Vec::with_capacity(request.query.len());
        for (name, raw) in &request.query {
            let resolved = match resolve_template_value(&Value::String(raw.clone()), scope)? {
                Value::String(text) => text,
                other => other.to_string(),
            };
            query.push((name.clone(), resolved));
        }

        let body = request
            .body
            .as_ref()
            .map(|body| resolve_template_value(body, scope))
            .transpose()?;

        Ok(ServiceInvocation {
            method: request.method.to_ascii_uppercase(),
            path,
            headers,
            query,
            body,
            timeout_ms,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_fan_out(
        &self,
        step: &WorkflowStep,
        run: &WorkflowRun,
        scope: TemplateScope,
        collection: &Value,
        template: &FanOutTemplate,
        max_items: usize,
        max_concurrency: usize,
    ) -> StepAttemptOutcome {
        let resolved = match resolve_template_value(collection, &scope.as_value()) {
            Ok(resolved) => resolved,
            Err(error) => return StepAttemptOutcome::from_error(&error),
        };

        let Value::Array(items) = resolved else {
            return StepAttemptOutcome::Failed {
                message: format!("fan-out step '{}' collection did not resolve to an array", step.id),
                kind: "validation".to_owned(),
                retryable: false,
                child_runs: Vec::new(),
            };
        };

        if items.len() > max_items {
            return StepAttemptOutcome::Failed {
                message: format!(
                    "fan-out step '{}' collection has {} items, more than the configured {max_items}",
                    step.id,
                    items.len()
                ),
                kind: "validation".to_owned(),
                retryable: false,
                child_runs: Vec::new(),
            };
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut children = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let service = self.clone();
            let run = run.clone();
            let scope = scope.clone();
            let template = template.clone();
            let parent_step_id = step.id.clone();
            let timeout_ms = step.timeout_ms;
            let semaphore = semaphore.clone();

            children.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (
                        index,
                        StepAttemptOutcome::Failed {
                            message: "fan-out concurrency governor closed".to_owned(),
                            kind: "fatal_internal".to_owned(),
                            retryable: false,
                            child_runs: Vec::new(),
                        },
                    );
                };

                let child_step_id = format!("{}-{index}", template.id);
                let fanout_meta = json!({
                    "parentStepId": parent_step_id,
                    "templateStepId": template.id,
                    "index": index,
                    "item": item,
                });

                let outcome = service
                    .execute_leaf_attempt(
                        child_step_id.as_str(),
                        &template.kind,
                        timeout_ms,
                        &run,
                        scope,
                        Some((fanout_meta, item.clone())),
                    )
                    .await;

                (index, outcome)
            });
        }

        let mut ordered: Vec<Option<Value>> = Vec::new();
        let mut child_runs = Vec::new();
        let mut first_failure: Option<(String, String, bool)> = None;
        let now = Utc::now();

        while let Some(joined) = children.join_next().await {
            let Ok((index, outcome)) = joined else {
                first_failure.get_or_insert((
                    "fan-out child task join failed".to_owned(),
                    "fatal_internal".to_owned(),
                    false,
                ));
                continue;
            };

            if ordered.len() <= index {
                ordered.resize(index + 1, None);
            }

            let child_step_id = format!("{}-{index}", template.id);
            match outcome {
                StepAttemptOutcome::Succeeded { result, job_run_id, .. } => {
                    child_runs.push(WorkflowStepRun {
                        step_id: child_step_id,
                        parent_step_id: Some(step.id.clone()),
                        status: WorkflowStepStatus::Succeeded,
                        attempt: 1,
                        job_run_id,
                        result: Some(result.clone()),
                        error_message: None,
                        error_kind: None,
                        next_attempt_at: None,
                        started_at: Some(now),
                        completed_at: Some(now),
                    });
                    ordered[index] = Some(result);
                }
                StepAttemptOutcome::Failed { message, kind, retryable, .. } => {
                    child_runs.push(WorkflowStepRun {
                        step_id: child_step_id,
                        parent_step_id: Some(step.id.clone()),
                        status: WorkflowStepStatus::Failed,
                        attempt: 1,
                        job_run_id: None,
                        result: None,
                        error_message: Some(truncate_error_message(message.as_str())),
                        error_kind: Some(kind.clone()),
                        next_attempt_at: None,
                        started_at: Some(now),
                        completed_at: Some(now),
                    });
                    first_failure.get_or_insert((message, kind, retryable));
                }
            }
        }

        child_runs.sort_by(|left, right| left.step_id.cmp(&right.step_id));

        if let Some((message, kind, retryable)) = first_failure {
            return StepAttemptOutcome::Failed {
                message,
                kind,
                retryable,
                child_runs,
            };
        }

        let results: Vec<Value> = ordered
            .into_iter()
            .map(|slot| slot.unwrap_or(Value::Null))
            .collect();

        StepAttemptOutcome::Succeeded {
            result: json!({"items": results}),
            job_run_id: None,
            child_runs,
        }
    }
}

fn base_scope(run: &WorkflowRun, shared: &Value, steps_scope: &Value) -> TemplateScope {
    TemplateScope {
        shared: shared.clone(),
        steps: steps_scope.clone(),
        run: json!({
            "id": run.id.to_string(),
            "parameters": run.parameters,
            "triggeredBy": run.triggered_by.clone().map_or(Value::Null, Value::String),
            "trigger": {
                "type": run.trigger.trigger_type,
                "payload": run.trigger.payload,
            },
        }),
        parameters: run.parameters.clone(),
        step: None,
        step_parameters: None,
        fanout: None,
        item: None,
    }
}
