//! Best-effort recovery of JSON values from free-form model output.
//!
//! The vision and text models are told to answer with a single JSON value,
//! but they regularly prepend commentary, emit several objects back to back,
//! or nest their real answer as a serialized string under a wrapper field.
//! Nothing in this module returns an error: recovery degrades to an empty
//! list or to a mapping that carries the raw text forward.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Marker the vision model emits ahead of its answer.
pub const LEADING_MARKER: &str = "thought\n";

/// Key whose sole presence marks a mapping as an envelope around serialized JSON.
pub const DEFAULT_WRAPPER_KEY: &str = "raw_response";

/// Key under which unparsable text is carried forward.
pub const DEFAULT_FALLBACK_KEY: &str = "analysis";

pub type JsonMap = Map<String, Value>;

fn strip_marker(text: &str) -> &str {
    text.strip_prefix(LEADING_MARKER).unwrap_or(text)
}

/// Drop everything before the first `{` or `[`. Text without either becomes empty.
fn strip_to_first_bracket(text: &str) -> &str {
    match text.find(|c: char| c == '{' || c == '[') {
        Some(start) => &text[start..],
        None => "",
    }
}

/// Parse `candidate`, accepting only objects and arrays.
fn parse_structured(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// Narrow `text` to the span most likely to hold the JSON answer.
///
/// Strips the leading marker, everything before the first opening bracket,
/// and everything after the last closing bracket of the same kind as the
/// opener the span starts with. The result may still be invalid JSON.
pub fn extract_json_span(text: &str) -> String {
    if text.is_empty() {
        return "{}".to_string();
    }

    let span = strip_to_first_bracket(strip_marker(text.trim())).trim();
    let closer = match span.chars().next() {
        Some('{') => '}',
        Some('[') => ']',
        _ => return span.to_string(),
    };

    match span.rfind(closer) {
        Some(end) => span[..=end].trim().to_string(),
        None => span.to_string(),
    }
}

/// Try increasingly aggressive trims until one parses as an object or array.
pub fn parse_strict(text: &str) -> Option<Value> {
    let text = strip_marker(text.trim()).trim();
    if text.is_empty() {
        return None;
    }

    parse_structured(text)
        .or_else(|| parse_structured(strip_to_first_bracket(text).trim()))
        .or_else(|| parse_structured(&extract_json_span(text)))
}

/// Find the first `[ {...} ]` run, matching lazily up to the first `}` that
/// is followed (after whitespace) by `]`.
///
/// Only the first `[` that opens onto a `{` is tried: any later one sees a
/// subset of the same closers.
fn find_object_array(text: &str) -> Option<&str> {
    let start = text
        .match_indices('[')
        .map(|(i, _)| i)
        .find(|&i| text[i + 1..].trim_start().starts_with('{'))?;

    let mut search = text.len() - text[start + 1..].trim_start().len() + 1;
    while let Some(rel) = text[search..].find('}') {
        let close = search + rel;
        let rest = text[close + 1..].trim_start();
        if rest.starts_with(']') {
            let end = text.len() - rest.len();
            return Some(&text[start..=end]);
        }
        search = close + 1;
    }
    None
}

/// Offset of the matching `}` for every `{` that closes, indexed by the
/// offset of the `{`.
fn match_braces(text: &str) -> Vec<Option<usize>> {
    let mut closes = vec![None; text.len()];
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, byte) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            // Quotes in surrounding prose are not JSON strings.
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    closes[start] = Some(i);
                }
            }
            _ => {}
        }
    }
    closes
}

/// Every outermost balanced `{...}` substring, in order.
///
/// A `{` that never closes is stepped over, so a stray brace in prose does
/// not hide the objects after it.
fn balanced_objects(text: &str) -> Vec<&str> {
    let closes = match_braces(text);
    let mut spans = Vec::new();
    let mut i = 0;

    while i < closes.len() {
        match closes[i] {
            Some(end) => {
                spans.push(&text[i..=end]);
                i = end + 1;
            }
            None => i += 1,
        }
    }
    spans
}

/// The mappings a flattened value contributes to a list result.
fn mappings_of(value: Value) -> Vec<JsonMap> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(map) if !map.is_empty() => vec![map],
        _ => Vec::new(),
    }
}

/// Recovery settings: which key marks a wrapper envelope and which key
/// carries unparsable text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseRecovery {
    pub wrapper_key: String,
    pub fallback_key: String,
}

impl Default for ResponseRecovery {
    fn default() -> Self {
        Self {
            wrapper_key: DEFAULT_WRAPPER_KEY.to_string(),
            fallback_key: DEFAULT_FALLBACK_KEY.to_string(),
        }
    }
}

impl ResponseRecovery {
    pub fn new(wrapper_key: impl Into<String>, fallback_key: impl Into<String>) -> Self {
        Self {
            wrapper_key: wrapper_key.into(),
            fallback_key: fallback_key.into(),
        }
    }

    /// Unwrap sole-key wrapper envelopes and splice nested arrays.
    ///
    /// A mapping whose only key is the wrapper key has its string value
    /// decoded and flattened in its place; if the value does not decode, the
    /// mapping is kept as is. Array elements that flatten to arrays are
    /// spliced into the parent. Idempotent.
    pub fn flatten(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => self.flatten_object(map),
            Value::Array(items) => {
                let mut flattened = Vec::with_capacity(items.len());
                for item in items {
                    match self.flatten(item) {
                        Value::Array(inner) => flattened.extend(inner),
                        other => flattened.push(other),
                    }
                }
                Value::Array(flattened)
            }
            scalar => scalar,
        }
    }

    fn flatten_object(&self, map: JsonMap) -> Value {
        if map.len() == 1 {
            if let Some(Value::String(encoded)) = map.get(&self.wrapper_key) {
                let decoded = serde_json::from_str::<Value>(encoded);
                return match decoded {
                    Ok(inner) => self.flatten(inner),
                    Err(_) => Value::Object(map),
                };
            }
        }

        Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, self.flatten(value)))
                .collect(),
        )
    }

    /// Recover a list of mappings (medicines, lab tests, ...).
    ///
    /// Prefers one well-formed parse; falls back to the first bracketed array
    /// of objects, then to every balanced object in the text.
    pub fn recover_list(&self, text: &str) -> Vec<JsonMap> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        if let Some(parsed) = parse_strict(text) {
            let items = mappings_of(self.flatten(parsed));
            if !items.is_empty() {
                return items;
            }
        }

        if let Some(array) = find_object_array(text) {
            if let Some(parsed @ Value::Array(_)) = parse_structured(array) {
                let items = mappings_of(self.flatten(parsed));
                if !items.is_empty() {
                    debug!("Recovered {} items from embedded array", items.len());
                    return items;
                }
            }
        }

        let salvaged: Vec<JsonMap> = balanced_objects(text)
            .into_iter()
            .filter_map(parse_structured)
            .filter_map(|value| match self.flatten(value) {
                Value::Object(map) if !map.is_empty() => Some(map),
                _ => None,
            })
            .collect();

        if !salvaged.is_empty() {
            debug!("Salvaged {} standalone objects", salvaged.len());
        }
        salvaged
    }

    /// Recover a single mapping, degrading to the raw text under the
    /// fallback key when no mapping can be recovered.
    pub fn recover_object(&self, text: &str) -> JsonMap {
        match parse_strict(text).map(|value| self.flatten(value)) {
            Some(Value::Object(map)) => map,
            _ => self.fallback(text),
        }
    }

    /// The degraded result carrying `text` under the fallback key.
    pub fn fallback(&self, text: &str) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert(self.fallback_key.clone(), Value::String(text.to_string()));
        map
    }
}

/// [`ResponseRecovery::flatten`] with the default wrapper key.
pub fn flatten(value: Value) -> Value {
    ResponseRecovery::default().flatten(value)
}

/// [`ResponseRecovery::recover_list`] with the default keys.
pub fn recover_list(text: &str) -> Vec<JsonMap> {
    ResponseRecovery::default().recover_list(text)
}

/// [`ResponseRecovery::recover_object`] with the default keys.
pub fn recover_object(text: &str) -> JsonMap {
    ResponseRecovery::default().recover_object(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn as_values(items: Vec<JsonMap>) -> Vec<Value> {
        items.into_iter().map(Value::Object).collect()
    }

    #[test]
    fn test_extract_span_empty_input() {
        assert_eq!(extract_json_span(""), "{}");
    }

    #[test]
    fn test_extract_span_strips_marker_and_prose() {
        let text = "thought\nLet me look at this.\n{\"a\": 1}\nHope that helps!";
        assert_eq!(extract_json_span(text), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_span_array_keeps_closing_bracket() {
        let text = "Result: [{\"a\": 1}, {\"b\": 2}] done";
        assert_eq!(extract_json_span(text), "[{\"a\": 1}, {\"b\": 2}]");
    }

    #[test]
    fn test_extract_span_without_brackets() {
        assert_eq!(extract_json_span("no json here"), "");
        assert_eq!(extract_json_span("   "), "");
    }

    #[test]
    fn test_extract_span_unclosed_object_left_as_is() {
        assert_eq!(extract_json_span("x {\"a\": 1"), "{\"a\": 1");
    }

    #[test]
    fn test_parse_strict_direct() {
        assert_eq!(parse_strict(r#"{"a": 1}"#), Some(json!({"a": 1})));
        assert_eq!(parse_strict("[1, 2]"), Some(json!([1, 2])));
    }

    #[test]
    fn test_parse_strict_with_marker() {
        assert_eq!(
            parse_strict("thought\n{\"priority\": \"RED\"}"),
            Some(json!({"priority": "RED"}))
        );
    }

    #[test]
    fn test_parse_strict_with_prefix_and_suffix() {
        let text = "Sure! Here you go:\n```json\n{\"a\": [1, 2]}\n```";
        assert_eq!(parse_strict(text), Some(json!({"a": [1, 2]})));
    }

    #[test]
    fn test_parse_strict_rejects_scalars_and_prose() {
        assert_eq!(parse_strict("42"), None);
        assert_eq!(parse_strict("\"text\""), None);
        assert_eq!(parse_strict("plain prose"), None);
        assert_eq!(parse_strict(""), None);
    }

    #[test]
    fn test_flatten_unwraps_sole_wrapper() {
        let value = json!({"raw_response": "{\"a\":1}"});
        assert_eq!(flatten(value), json!({"a": 1}));
    }

    #[test]
    fn test_flatten_keeps_wrapper_with_siblings() {
        let value = json!({"raw_response": "{\"a\":1}", "b": 2});
        assert_eq!(flatten(value.clone()), value);
    }

    #[test]
    fn test_flatten_keeps_undecodable_wrapper() {
        let value = json!({"raw_response": "not json"});
        assert_eq!(flatten(value.clone()), value);
    }

    #[test]
    fn test_flatten_nested_wrappers() {
        let inner = json!({"raw_response": "{\"dose\": \"5mg\"}"}).to_string();
        let value = json!({"raw_response": inner});
        assert_eq!(flatten(value), json!({"dose": "5mg"}));
    }

    #[test]
    fn test_flatten_splices_unwrapped_arrays() {
        let value = json!([
            {"name": "A"},
            {"raw_response": "[{\"name\": \"B\"}, {\"name\": \"C\"}]"}
        ]);
        assert_eq!(
            flatten(value),
            json!([{"name": "A"}, {"name": "B"}, {"name": "C"}])
        );
    }

    #[test]
    fn test_flatten_recurses_into_values() {
        let value = json!({"report": {"raw_response": "{\"ok\": true}"}, "n": 3});
        assert_eq!(flatten(value), json!({"report": {"ok": true}, "n": 3}));
    }

    #[test]
    fn test_flatten_custom_wrapper_key() {
        let recovery = ResponseRecovery::new("payload", "text");
        let value = json!({"payload": "{\"a\": 1}"});
        assert_eq!(recovery.flatten(value), json!({"a": 1}));
        let untouched = json!({"raw_response": "{\"a\": 1}"});
        assert_eq!(recovery.flatten(untouched.clone()), untouched);
    }

    #[test]
    fn test_recover_list_empty_and_prose() {
        assert!(recover_list("").is_empty());
        assert!(recover_list("   \n ").is_empty());
        assert!(recover_list("not json at all").is_empty());
    }

    #[test]
    fn test_recover_list_array() {
        let items = recover_list(r#"[{"name":"Paracetamol"},{"name":"Ibuprofen"}]"#);
        assert_eq!(
            as_values(items),
            vec![json!({"name": "Paracetamol"}), json!({"name": "Ibuprofen"})]
        );
    }

    #[test]
    fn test_recover_list_single_object() {
        let items = recover_list(r#"{"name":"Metformin","dose":"500mg"}"#);
        assert_eq!(as_values(items), vec![json!({"name": "Metformin", "dose": "500mg"})]);
    }

    #[test]
    fn test_recover_list_adjacent_objects() {
        let items = recover_list(r#"{"name":"Paracetamol"} {"name":"Ibuprofen"}"#);
        assert_eq!(
            as_values(items),
            vec![json!({"name": "Paracetamol"}), json!({"name": "Ibuprofen"})]
        );
    }

    #[test]
    fn test_recover_list_embedded_array_with_trailing_object() {
        let text = r#"Found these: [{"test": "Hb", "value": "11"}] and also {"note": "fasting"}"#;
        let items = recover_list(text);
        assert_eq!(as_values(items), vec![json!({"test": "Hb", "value": "11"})]);
    }

    #[test]
    fn test_recover_list_prefers_embedded_array_over_salvage() {
        let items = recover_list(r#"{oops [{"a":1}] {"b":2}"#);
        assert_eq!(as_values(items), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_find_object_array_skips_plain_arrays() {
        let text = r#"codes [1, 2] then [ {"a": 1} ] tail"#;
        assert_eq!(find_object_array(text), Some(r#"[ {"a": 1} ]"#));
        assert_eq!(find_object_array(r#"[{"a": 1}"#), None);
    }

    #[test]
    fn test_recover_list_salvages_deeply_nested_objects() {
        let text = r#"1. {"name": "A", "meta": {"form": {"kind": "tablet"}}}
2. {"name": "B"}"#;
        let items = recover_list(text);
        assert_eq!(
            as_values(items),
            vec![
                json!({"name": "A", "meta": {"form": {"kind": "tablet"}}}),
                json!({"name": "B"})
            ]
        );
    }

    #[test]
    fn test_recover_list_ignores_braces_inside_strings() {
        let text = r#"{"name": "odd } name"} then {"name": "B {"}"#;
        let items = recover_list(text);
        assert_eq!(
            as_values(items),
            vec![json!({"name": "odd } name"}), json!({"name": "B {"})]
        );
    }

    #[test]
    fn test_recover_list_skips_stray_open_brace() {
        let text = r#"Use { with care. {"name": "A"}"#;
        let items = recover_list(text);
        assert_eq!(as_values(items), vec![json!({"name": "A"})]);
    }

    #[test]
    fn test_recover_list_object_inside_unclosed_brace() {
        let text = r#"Note { see {"name": "A"} and {"name": "B"}"#;
        let items = recover_list(text);
        assert_eq!(as_values(items), vec![json!({"name": "A"}), json!({"name": "B"})]);
    }

    #[test]
    fn test_recover_list_many_unclosed_braces() {
        let text = format!("Note: {} end {{\"name\": \"A\"}}", "{".repeat(200_000));
        let items = recover_list(&text);
        assert_eq!(as_values(items), vec![json!({"name": "A"})]);

        let pairs = "[{".repeat(100_000);
        assert!(recover_list(&pairs).is_empty());
    }

    #[test]
    fn test_recover_list_drops_empty_and_invalid_objects() {
        let text = r#"{} {not json} {"name": "A"}"#;
        let items = recover_list(text);
        assert_eq!(as_values(items), vec![json!({"name": "A"})]);
    }

    #[test]
    fn test_recover_list_unwraps_wrapper() {
        let text = json!({"raw_response": "[{\"name\": \"A\"}, {\"name\": \"B\"}]"}).to_string();
        let items = recover_list(&text);
        assert_eq!(as_values(items), vec![json!({"name": "A"}), json!({"name": "B"})]);
    }

    #[test]
    fn test_recover_object_with_marker() {
        let map = recover_object("thought\n{\"priority\":\"RED\",\"reason\":\"...\"}");
        assert_eq!(map.len(), 2);
        assert_eq!(map["priority"], json!("RED"));
        assert_eq!(map["reason"], json!("..."));
    }

    #[test]
    fn test_recover_object_prose_fallback() {
        let map = recover_object("plain prose, no JSON");
        assert_eq!(map.len(), 1);
        assert_eq!(map[DEFAULT_FALLBACK_KEY], json!("plain prose, no JSON"));
    }

    #[test]
    fn test_recover_object_array_falls_back_to_raw_text() {
        let text = r#"[{"a": 1}]"#;
        let map = recover_object(text);
        assert_eq!(map[DEFAULT_FALLBACK_KEY], json!(text));
    }

    #[test]
    fn test_recover_object_custom_fallback_key() {
        let recovery = ResponseRecovery::new(DEFAULT_WRAPPER_KEY, "raw_text");
        let map = recovery.recover_object("nothing here");
        assert_eq!(map["raw_text"], json!("nothing here"));
    }

    fn object_of(values: impl Strategy<Value = Value>) -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z]{1,6}", values, 0..5)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    }

    /// Arbitrary JSON without floats (which need not survive a text round
    /// trip exactly), without directly nested arrays, and with keys that can
    /// never collide with the wrapper key.
    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            ".{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            let element = prop_oneof![
                object_of(inner.clone()),
                inner.clone().prop_filter("no nested arrays", |v| !v.is_array()),
            ];
            prop_oneof![
                object_of(inner),
                prop::collection::vec(element, 0..5).prop_map(Value::Array),
            ]
        })
    }

    /// Arbitrary JSON including arrays directly inside arrays.
    fn any_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            ".{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                object_of(inner.clone()),
                prop::collection::vec(inner, 0..5).prop_map(Value::Array),
            ]
        })
    }

    fn json_object() -> impl Strategy<Value = JsonMap> {
        prop::collection::btree_map("[a-z]{1,6}", json_value(), 0..6)
            .prop_map(|map| map.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_extract_span_never_panics(text in "\\PC{0,64}") {
            let _ = extract_json_span(&text);
            let _ = parse_strict(&text);
            let _ = recover_list(&text);
        }

        #[test]
        fn prop_recover_object_never_empty_for_prose(text in "[a-zA-Z ,.]{1,64}") {
            let map = recover_object(&text);
            prop_assert_eq!(map.get(DEFAULT_FALLBACK_KEY), Some(&Value::String(text.clone())));
        }

        #[test]
        fn prop_flatten_idempotent(value in any_json()) {
            let once = flatten(value);
            prop_assert_eq!(flatten(once.clone()), once);
        }

        #[test]
        fn prop_flatten_idempotent_with_wrappers(inner in json_object()) {
            let mut wrapped = JsonMap::new();
            wrapped.insert(
                DEFAULT_WRAPPER_KEY.to_string(),
                Value::String(Value::Object(inner).to_string()),
            );
            let once = flatten(Value::Object(wrapped));
            prop_assert_eq!(flatten(once.clone()), once);
        }

        #[test]
        fn prop_recover_object_round_trip(map in json_object()) {
            let text = Value::Object(map.clone()).to_string();
            prop_assert_eq!(recover_object(&text), map);
        }

        #[test]
        fn prop_recover_list_round_trip(items in prop::collection::vec(json_object(), 1..5)) {
            let text = Value::Array(items.iter().cloned().map(Value::Object).collect()).to_string();
            prop_assert_eq!(recover_list(&text), items);
        }
    }
}
