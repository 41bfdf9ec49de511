//! Rendering of the rule mapping for `show`.

use crossterm::style::Stylize;
use serde_json::Value;
use tcshape_shared::RuleMapping;
use tcshape_shared::errors::TcshapeResult;

const INDENT: &str = "    ";

/// Pretty JSON of the mapping, optionally colorized for a terminal.
pub fn render_json(mapping: &RuleMapping, color: bool) -> TcshapeResult<String> {
    if !color {
        return Ok(serde_json::to_string_pretty(mapping)?);
    }
    let value = serde_json::to_value(mapping)?;
    let mut out = String::new();
    write_colored(&value, 0, &mut out);
    Ok(out)
}

fn quoted(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

fn write_colored(value: &Value, depth: usize, out: &mut String) {
    match value {
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Object(map) => {
            out.push_str("{\n");
            for (i, (key, child)) in map.iter().enumerate() {
                out.push_str(&INDENT.repeat(depth + 1));
                out.push_str(&quoted(key).blue().bold().to_string());
                out.push_str(": ");
                write_colored(child, depth + 1, out);
                if i + 1 < map.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&INDENT.repeat(depth));
            out.push('}');
        }
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(items) => {
            out.push_str("[\n");
            for (i, child) in items.iter().enumerate() {
                out.push_str(&INDENT.repeat(depth + 1));
                write_colored(child, depth + 1, out);
                if i + 1 < items.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&INDENT.repeat(depth));
            out.push(']');
        }
        Value::String(s) => out.push_str(&quoted(s).green().to_string()),
        Value::Number(n) => out.push_str(&n.to_string().magenta().to_string()),
        Value::Bool(_) | Value::Null => out.push_str(&value.to_string().yellow().to_string()),
    }
}
