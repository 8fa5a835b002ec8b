//! Variable substitution engine for templates

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use super::TemplateError;

/// Output of a render: the substituted value and every placeholder that had
/// no matching variable. Unresolved placeholders are left in place verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub value: Value,
    pub missing: BTreeSet<String>,
}

impl Rendered {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Substitute `{{variable}}` placeholders in every string of a JSON value,
/// object keys included.
pub fn substitute_variables(template: &Value, variables: &Value) -> Result<Rendered, TemplateError> {
    let vars = match variables {
        Value::Object(map) => map,
        Value::Null => return Ok(render_value(template, &Map::new())),
        _ => return Err(TemplateError::VariablesNotObject),
    };

    Ok(render_value(template, vars))
}

/// Merge `overrides` over `base`; both must be objects (null counts as empty).
pub fn merge_variables(base: &Value, overrides: &Value) -> Result<Value, TemplateError> {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(TemplateError::VariablesNotObject),
    };
    match overrides {
        Value::Object(map) => {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        _ => return Err(TemplateError::VariablesNotObject),
    }
    Ok(Value::Object(merged))
}

pub fn render_value(template: &Value, variables: &Map<String, Value>) -> Rendered {
    let mut missing = BTreeSet::new();
    let value = substitute_value(template, variables, &mut missing);
    Rendered { value, missing }
}

pub fn render_str(template: &str, variables: &Map<String, Value>) -> (String, BTreeSet<String>) {
    let mut missing = BTreeSet::new();
    let rendered = substitute_string(template, variables, &mut missing);
    (rendered, missing)
}

fn substitute_value(
    value: &Value,
    variables: &Map<String, Value>,
    missing: &mut BTreeSet<String>,
) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_string(s, variables, missing)),
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|v| substitute_value(v, variables, missing))
                .collect(),
        ),
        Value::Object(obj) => {
            let mut rendered = Map::new();
            for (key, val) in obj {
                let rendered_key = substitute_string(key, variables, missing);
                rendered.insert(rendered_key, substitute_value(val, variables, missing));
            }
            Value::Object(rendered)
        }
        // Numbers, booleans, null are passed through as-is
        _ => value.clone(),
    }
}

// Single left-to-right pass, so substituted text is never rescanned and a
// value containing "{{x}}" cannot trigger a second substitution.
fn substitute_string(
    template: &str,
    variables: &Map<String, Value>,
    missing: &mut BTreeSet<String>,
) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };

        result.push_str(&rest[..start]);
        let raw = &after_open[..end];
        let name = raw.trim();

        match variables.get(name) {
            Some(value) if !name.is_empty() => result.push_str(&display_value(value)),
            _ => {
                if !name.is_empty() {
                    missing.insert(name.to_string());
                }
                result.push_str("{{");
                result.push_str(raw);
                result.push_str("}}");
            }
        }

        rest = &after_open[end + 2..];
    }

    result.push_str(rest);
    result
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        // For arrays and objects, use JSON representation
        _ => value.to_string(),
    }
}
