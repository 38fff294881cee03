//
// Copyright 2024-2025 Digium, Inc.
// SPDX-License-Identifier: MIT
//

//! Wire formatting helpers shared by the signaling channel.

use serde_json::Value;

/// Client-side ceiling on the UTF-8 encoded size of a request body.
/// Over-size requests fail locally without transmission.
pub const BODY_SIZE_LIMIT: usize = 20_000;

/// Substitute `{name}` placeholders in a path template.
///
/// Unmatched placeholders are left in place so a bad call site shows
/// up in server logs rather than silently hitting a different route.
pub fn expand_path(template: &str, params: &[(&str, &str)]) -> String {
    let mut path = template.to_string();
    for (name, value) in params {
        path = path.replace(&format!("{{{}}}", name), value);
    }
    path
}

/// Serialize query parameters for GET and DELETE frames.
///
/// Scalars become `k=v`; arrays are joined with commas (`k=v1,v2`);
/// objects and nulls are skipped entirely.
pub fn to_query(params: &Value) -> String {
    let Some(map) = params.as_object() else {
        return String::new();
    };
    let mut parts = Vec::new();
    for (key, value) in map {
        match value {
            Value::Null | Value::Object(_) => continue,
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .filter_map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                parts.push(format!("{}={}", key, joined));
            }
            _ => {
                if let Some(s) = scalar_to_string(value) {
                    parts.push(format!("{}={}", key, s));
                }
            }
        }
    }
    parts.join("&")
}

/// Append a serialized query to a path, if there is one.
pub fn with_query(path: &str, params: &Value) -> String {
    let query = to_query(params);
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// UTF-8 encoded size of a JSON body as it would go on the wire.
pub fn body_size(body: &Value) -> usize {
    serde_json::to_string(body).map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn expand_path_substitutes_placeholders() {
        assert_eq!(
            expand_path("/v1/channels/{id}/subscribers/", &[("id", "room-9")]),
            "/v1/channels/room-9/subscribers/"
        );
        assert_eq!(
            expand_path("/v1/conferences/{id}/participants/{endpointId}", &[
                ("id", "c1"),
                ("endpointId", "alice"),
            ]),
            "/v1/conferences/c1/participants/alice"
        );
    }

    #[test]
    fn query_serialization_joins_arrays_and_skips_objects() {
        let query = to_query(&json!({
            "limit": 50,
            "before": "msg-17",
            "groups": ["g1", "g2"],
            "nested": {"skipped": true},
            "missing": null,
        }));
        assert_eq!(query, "before=msg-17&groups=g1,g2&limit=50");
    }

    #[test]
    fn with_query_leaves_bare_path_alone() {
        assert_eq!(with_query("/v1/turn", &json!({})), "/v1/turn");
        assert_eq!(
            with_query("/v1/turn", &json!({"service": "turn"})),
            "/v1/turn?service=turn"
        );
    }

    #[test]
    fn body_size_counts_utf8_bytes() {
        assert_eq!(body_size(&json!({"a": "b"})), r#"{"a":"b"}"#.len());
        // Multibyte characters count encoded, not as chars.
        let size = body_size(&json!({"msg": "héllo"}));
        assert!(size > r#"{"msg":"hello"}"#.len());
    }
}
