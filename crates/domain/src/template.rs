use apphub_core::{AppError, AppResult};
use serde_json::{Map, Value};

/// Typed scope visible to every template expression.
///
/// The optional fields are only present while resolving a step or a fan-out
/// child; absent fields are omitted from the scope object entirely.
#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    /// Values stored by earlier steps via `store_result_as` and friends.
    pub shared: Value,
    /// Per-step results keyed by step id.
    pub steps: Value,
    /// Run metadata: `{id, parameters, triggeredBy, trigger}`.
    pub run: Value,
    /// Effective run parameters.
    pub parameters: Value,
    /// Current step metadata: `{id, parameters}`.
    pub step: Option<Value>,
    /// Current step parameters after merging.
    pub step_parameters: Option<Value>,
    /// Fan-out metadata: `{parentStepId, templateStepId, index, item}`.
    pub fanout: Option<Value>,
    /// Current fan-out item.
    pub item: Option<Value>,
}

impl TemplateScope {
    /// Builds the scope object template expressions are evaluated against.
    #[must_use]
    pub fn as_value(&self) -> Value {
        let mut scope = Map::new();
        scope.insert("shared".to_owned(), self.shared.clone());
        scope.insert("steps".to_owned(), self.steps.clone());
        scope.insert("run".to_owned(), self.run.clone());
        scope.insert("parameters".to_owned(), self.parameters.clone());

        if let Some(step) = &self.step {
            scope.insert("step".to_owned(), step.clone());
        }

        if let Some(step_parameters) = &self.step_parameters {
            scope.insert("stepParameters".to_owned(), step_parameters.clone());
        }

        if let Some(fanout) = &self.fanout {
            scope.insert("fanout".to_owned(), fanout.clone());
        }

        if let Some(item) = &self.item {
            scope.insert("item".to_owned(), item.clone());
        }

        Value::Object(scope)
    }
}

enum TemplatePart {
    Literal(String),
    Lookup(String),
}

/// Resolves every template expression inside a JSON value.
///
/// Strings are resolved individually; objects and arrays recurse. Non-string
/// leaves pass through unchanged.
pub fn resolve_template_value(value: &Value, scope: &Value) -> AppResult<Value> {
    match value {
        Value::String(text) => resolve_template_string(text.as_str(), scope),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_template_value(item, scope)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(entries) => {
            let mut resolved = Map::with_capacity(entries.len());
            for (key, entry) in entries {
                resolved.insert(key.clone(), resolve_template_value(entry, scope)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves one template string against a scope.
///
/// A string that is exactly one `{{ expr }}` placeholder resolves to the
/// typed value at that path; embedded placeholders stringify. The legacy
/// `$a.b.c` dotted form is recognized when the whole string is a dotted
/// reference.
pub fn resolve_template_string(input: &str, scope: &Value) -> AppResult<Value> {
    let trimmed = input.trim();
    if let Some(path) = trimmed.strip_prefix('$')
        && !trimmed.contains("{{")
        && !path.is_empty()
        && path.chars().all(|character| !character.is_whitespace())
    {
        return Ok(lookup_path(scope, path).unwrap_or(Value::Null));
    }

    let parts = parse_template(input)?;

    if let [TemplatePart::Lookup(path)] = parts.as_slice() {
        return Ok(lookup_path(scope, path.as_str()).unwrap_or(Value::Null));
    }

    let mut output = String::new();
    for part in &parts {
        match part {
            TemplatePart::Literal(text) => output.push_str(text.as_str()),
            TemplatePart::Lookup(path) => {
                match lookup_path(scope, path.as_str()).unwrap_or(Value::Null) {
                    Value::Null => {}
                    Value::String(text) => output.push_str(text.as_str()),
                    other => output.push_str(other.to_string().as_str()),
                }
            }
        }
    }

    Ok(Value::String(output))
}

fn parse_template(input: &str) -> AppResult<Vec<TemplatePart>> {
    let mut parts = Vec::new();
    let mut remainder = input;

    while let Some(open) = remainder.find("{{") {
        let Some(close) = remainder[open + 2..].find("}}") else {
            return Err(AppError::Validation(format!(
                "template '{input}' has an unterminated placeholder"
            )));
        };

        let literal = &remainder[..open];
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal.to_owned()));
        }

        let expression = remainder[open + 2..open + 2 + close].trim();
        if expression.is_empty() {
            return Err(AppError::Validation(format!(
                "template '{input}' has an empty placeholder"
            )));
        }

        parts.push(TemplatePart::Lookup(expression.to_owned()));
        remainder = &remainder[open + 2 + close + 2..];
    }

    if !remainder.is_empty() {
        parts.push(TemplatePart::Literal(remainder.to_owned()));
    }

    // A placeholder surrounded only by whitespace still resolves typed.
    if parts.len() > 1 {
        let only_lookup_and_blank = parts.iter().all(|part| match part {
            TemplatePart::Lookup(_) => true,
            TemplatePart::Literal(text) => text.trim().is_empty(),
        });
        let lookup_count = parts
            .iter()
            .filter(|part| matches!(part, TemplatePart::Lookup(_)))
            .count();

        if only_lookup_and_blank && lookup_count == 1 {
            parts.retain(|part| matches!(part, TemplatePart::Lookup(_)));
        }
    }

    Ok(parts)
}

fn lookup_path(scope: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = scope.clone();

    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return None;
        }

        // Legacy `.output` reads `.result`; a trailing alias with a `files`
        // array shortcuts to that array.
        if *segment == "output" {
            let object = current.as_object()?;
            let aliased = match object.get("output") {
                Some(value) => value.clone(),
                None => object.get("result")?.clone(),
            };

            let is_last = index == segments.len() - 1;
            if is_last
                && let Some(files) = aliased.as_object().and_then(|entries| entries.get("files"))
                && files.is_array()
            {
                return Some(files.clone());
            }

            current = aliased;
            continue;
        }

        match current {
            Value::Object(ref entries) => {
                current = entries.get(*segment)?.clone();
            }
            Value::Array(ref items) => {
                let position: usize = segment.parse().ok()?;
                current = items.get(position)?.clone();
            }
            _ => return None,
        }
    }

    Some(current)
}

/// Deep-merges parameter layers; later layers win and arrays replace.
#[must_use]
pub fn merge_parameter_layers(layers: &[&Value]) -> Value {
    let mut merged = Value::Null;
    for layer in layers {
        merged = merge_pair(&merged, layer);
    }

    if merged.is_null() { Value::Object(Map::new()) } else { merged }
}

fn merge_pair(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (_, Value::Null) => base.clone(),
        (Value::Object(base_entries), Value::Object(overlay_entries)) => {
            let mut merged = base_entries.clone();
            for (key, overlay_value) in overlay_entries {
                let next = match merged.get(key) {
                    Some(base_value) => merge_pair(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}
