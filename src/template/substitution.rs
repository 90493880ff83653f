//! Variable substitution engine for templates

use serde_json::{Map, Value};

/// Build the variable set for a message payload.
///
/// The whole payload is always available as `{{message}}`. When the payload
/// is an object, each of its fields is available under its own name too.
pub fn variables_for(data: &Value) -> Map<String, Value> {
    let mut vars = Map::new();
    if let Value::Object(fields) = data {
        for (key, value) in fields {
            vars.insert(key.clone(), value.clone());
        }
    }
    vars.entry("message").or_insert_with(|| data.clone());
    vars
}

/// Replace every `{{name}}` placeholder in `template` with its variable.
///
/// The template is scanned once, left to right. Substituted values are never
/// scanned again, so a value that itself contains `{{other}}` is emitted as
/// written. `escape` is applied to each substituted value, not to the
/// template text.
pub fn substitute_variables(
    template: &str,
    variables: &Map<String, Value>,
    escape: fn(&str) -> String,
) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];

        let value = after_open
            .find("}}")
            .and_then(|close| variables.get(&after_open[..close]).map(|v| (close, v)));

        match value {
            Some((close, value)) => {
                result.push_str(&escape(&render_value(value)));
                rest = &after_open[close + 2..];
            }
            None => {
                result.push_str("{{");
                rest = after_open;
            }
        }
    }

    result.push_str(rest);
    result
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        // For arrays and objects, use JSON representation
        _ => value.to_string(),
    }
}

/// Escape text for inclusion in an HTML body
pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub(crate) fn no_escape(raw: &str) -> String {
    raw.to_string()
}
