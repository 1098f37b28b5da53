//! Key casing between the host (snake_case) and sandbox (camelCase) documents.

use serde_json::{Map, Value};

/// `max_tool_iterations` -> `maxToolIterations`.
pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for (i, c) in key.chars().enumerate() {
        if c == '_' && i > 0 {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    if upper_next {
        out.push('_');
    }
    out
}

/// `maxToolIterations` -> `max_tool_iterations`.
pub fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn rewrite_keys(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(f(k), rewrite_keys(v, f));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_keys(v, f)).collect()),
        other => other.clone(),
    }
}

/// Recursively rewrite every object key to camelCase (objects inside arrays included).
pub fn keys_to_sandbox_casing(value: &Value) -> Value {
    rewrite_keys(value, &to_camel_case)
}

/// Recursively rewrite every object key to snake_case.
pub fn keys_to_host_casing(value: &Value) -> Value {
    rewrite_keys(value, &to_snake_case)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_conversion() {
        assert_eq!(to_camel_case("api_key"), "apiKey");
        assert_eq!(to_camel_case("max_tool_iterations"), "maxToolIterations");
        assert_eq!(to_camel_case("model"), "model");
        assert_eq!(to_snake_case("apiKey"), "api_key");
        assert_eq!(to_snake_case("allowFrom"), "allow_from");
        assert_eq!(to_snake_case("model"), "model");
    }

    #[test]
    fn test_recursive_rewrite_includes_arrays() {
        let host = json!({
            "web_search": {"api_key": "k", "max_results": 5},
            "allow_list": [{"chat_id": "1"}, "plain"],
        });
        let sandbox = keys_to_sandbox_casing(&host);
        assert_eq!(
            sandbox,
            json!({
                "webSearch": {"apiKey": "k", "maxResults": 5},
                "allowList": [{"chatId": "1"}, "plain"],
            })
        );
        assert_eq!(keys_to_host_casing(&sandbox), host);
    }

    #[test]
    fn test_values_untouched() {
        let v = json!({"model": "anthropic/claude_sonnet", "n": null});
        assert_eq!(keys_to_sandbox_casing(&v), v);
    }
}
