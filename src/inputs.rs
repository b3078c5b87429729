//! Placeholder resolution for step inputs.
//!
//! String values inside a step's `inputs` may embed `{{secrets.<provider>[.<scope>]}}`
//! and `{{steps.<step_id>.<field>[.<field>...]}}`. A string that consists of a single
//! placeholder is replaced by the referenced JSON value as-is; placeholders embedded in
//! longer strings are interpolated as text.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::credentials::{CredentialStore, DEFAULT_SCOPE};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("unknown placeholder '{0}' (expected secrets.* or steps.*)")]
    UnknownNamespace(String),

    #[error("step '{step}' has no output field '{field}'")]
    MissingOutput { step: String, field: String },

    #[error("no secret for provider '{provider}' (scope '{scope}')")]
    MissingSecret { provider: String, scope: String },
}

/// A parsed `{{...}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Secret { provider: String, scope: String },
    StepOutput { step: String, path: Vec<String> },
}

impl Reference {
    fn parse(raw: &str) -> Result<Self, InputError> {
        let trimmed = raw.trim();
        let mut parts = trimmed.split('.').map(str::trim);
        match (parts.next(), parts.next()) {
            (Some("secrets"), Some(provider)) if !provider.is_empty() => {
                let scope = match (parts.next(), parts.next()) {
                    (None, _) => DEFAULT_SCOPE,
                    (Some(scope), None) if !scope.is_empty() => scope,
                    _ => return Err(InputError::UnknownNamespace(trimmed.to_string())),
                };
                Ok(Reference::Secret {
                    provider: provider.to_string(),
                    scope: scope.to_string(),
                })
            }
            (Some("steps"), Some(step)) if !step.is_empty() => {
                let path: Vec<String> = parts.map(str::to_string).collect();
                if path.is_empty() || path.iter().any(String::is_empty) {
                    return Err(InputError::UnknownNamespace(trimmed.to_string()));
                }
                Ok(Reference::StepOutput {
                    step: step.to_string(),
                    path,
                })
            }
            _ => Err(InputError::UnknownNamespace(trimmed.to_string())),
        }
    }
}

/// Values a placeholder can be resolved against.
pub struct ResolveContext<'a> {
    pub outputs: &'a HashMap<String, Value>,
    pub credentials: &'a CredentialStore,
}

/// Collects every reference in `value`, failing on malformed placeholders.
pub fn references(value: &Value) -> Result<Vec<Reference>, InputError> {
    let mut found = Vec::new();
    walk_strings(value, &mut |text| {
        for raw in placeholders(text)? {
            found.push(Reference::parse(raw)?);
        }
        Ok(())
    })?;
    Ok(found)
}

/// Step ids whose outputs `value` refers to.
pub fn step_references(value: &Value) -> Result<Vec<String>, InputError> {
    Ok(references(value)?
        .into_iter()
        .filter_map(|reference| match reference {
            Reference::StepOutput { step, .. } => Some(step),
            Reference::Secret { .. } => None,
        })
        .collect())
}

/// `(provider, scope)` pairs `value` pulls secrets from.
pub fn secret_references(value: &Value) -> Result<Vec<(String, String)>, InputError> {
    Ok(references(value)?
        .into_iter()
        .filter_map(|reference| match reference {
            Reference::Secret { provider, scope } => Some((provider, scope)),
            Reference::StepOutput { .. } => None,
        })
        .collect())
}

/// Produces a copy of `value` with every placeholder substituted.
pub fn resolve(value: &Value, ctx: &ResolveContext<'_>) -> Result<Value, InputError> {
    match value {
        Value::String(text) => resolve_string(text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve(item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(text: &str, ctx: &ResolveContext<'_>) -> Result<Value, InputError> {
    let found = placeholders(text)?;
    if found.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    let whole = text.trim();
    if found.len() == 1 && whole.starts_with(OPEN) && whole.ends_with(CLOSE) {
        return lookup(&Reference::parse(found[0])?, ctx);
    }

    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| InputError::Unterminated(text.to_string()))?;
        let value = lookup(&Reference::parse(&after[..end])?, ctx)?;
        match value {
            Value::String(s) => rendered.push_str(&s),
            other => rendered.push_str(&other.to_string()),
        }
        rest = &after[end + CLOSE.len()..];
    }
    rendered.push_str(rest);
    Ok(Value::String(rendered))
}

fn lookup(reference: &Reference, ctx: &ResolveContext<'_>) -> Result<Value, InputError> {
    match reference {
        Reference::Secret { provider, scope } => ctx
            .credentials
            .get(provider, scope)
            .map(|credential| Value::String(credential.secret().expose().to_string()))
            .map_err(|_| InputError::MissingSecret {
                provider: provider.clone(),
                scope: scope.clone(),
            }),
        Reference::StepOutput { step, path } => {
            let missing = || InputError::MissingOutput {
                step: step.clone(),
                field: path.join("."),
            };
            let mut current = ctx.outputs.get(step).ok_or_else(missing)?;
            for segment in path {
                current = match current {
                    Value::Object(map) => map.get(segment),
                    Value::Array(items) => segment
                        .parse::<usize>()
                        .ok()
                        .and_then(|index| items.get(index)),
                    _ => None,
                }
                .ok_or_else(missing)?;
            }
            Ok(current.clone())
        }
    }
}

fn placeholders(text: &str) -> Result<Vec<&str>, InputError> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| InputError::Unterminated(text.to_string()))?;
        found.push(&after[..end]);
        rest = &after[end + CLOSE.len()..];
    }
    Ok(found)
}

fn walk_strings<F>(value: &Value, visit: &mut F) -> Result<(), InputError>
where
    F: FnMut(&str) -> Result<(), InputError>,
{
    match value {
        Value::String(text) => visit(text),
        Value::Array(items) => items.iter().try_for_each(|item| walk_strings(item, visit)),
        Value::Object(map) => map.values().try_for_each(|item| walk_strings(item, visit)),
        _ => Ok(()),
    }
}
