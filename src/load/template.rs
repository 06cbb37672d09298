use serde_json::{Map, Value};

const NAME: &str = "{#name}";
const DEVICE_ID: &str = "{#deviceId}";
const DEVICE_IDS: &str = "{#deviceIds}";
const REQUEST_ID: &str = "{#requestId}";

/// Values substituted into a message template on each tick.
#[derive(Clone, Copy, Debug)]
pub struct Placeholders<'a> {
    pub name: &'a str,
    pub device_id: Option<&'a str>,
    pub device_ids: &'a [String],
    pub request_id: u64,
}

/// Renders `template`, replacing placeholder tokens in every string.
///
/// A string that is exactly `{#deviceIds}` becomes an array, and one that is
/// exactly `{#requestId}` becomes a number; elsewhere tokens are replaced
/// textually.
pub fn render(template: &Value, with: &Placeholders<'_>) -> Value {
    match template {
        Value::String(s) => render_str(s, with),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, with)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, with)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

fn render_str(s: &str, with: &Placeholders<'_>) -> Value {
    match s {
        DEVICE_IDS => return Value::from(with.device_ids.to_vec()),
        REQUEST_ID => return Value::from(with.request_id),
        _ => {}
    }

    if !s.contains("{#") {
        return Value::from(s);
    }

    let rendered = s
        .replace(NAME, with.name)
        .replace(DEVICE_ID, with.device_id.unwrap_or_default())
        .replace(DEVICE_IDS, &with.device_ids.join(","))
        .replace(REQUEST_ID, &with.request_id.to_string());

    Value::from(rendered)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn replaces_tokens_recursively() {
        let devices = vec!["d1".to_string(), "d2".to_string()];
        let with = Placeholders {
            name: "go",
            device_id: Some("d1"),
            device_ids: &devices,
            request_id: 42,
        };

        let template = json!({
            "deviceId": "{#deviceId}",
            "command": { "command": "{#name}", "parameters": { "tag": "{#name}-{#requestId}" } },
            "targets": "{#deviceIds}",
            "seq": "{#requestId}",
            "fixed": 5
        });

        assert_eq!(
            render(&template, &with),
            json!({
                "deviceId": "d1",
                "command": { "command": "go", "parameters": { "tag": "go-42" } },
                "targets": ["d1", "d2"],
                "seq": 42,
                "fixed": 5
            })
        );
    }
}
