//! Tagged value type for message data and metadata
//!
//! Replaces untyped `Map<String, Any>` payloads with a closed set of
//! variants: null, int, long, double, bool, string, list, and map. All
//! serialization paths go through JSON; [`canonical_json`] is the single
//! canonical encoder (sorted keys, stable numeric rendering) used for
//! idempotency fingerprints, so equal values always hash equally.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single typed value held in message `data`/`metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "serde_json::Value", from = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of `Int` or `Long`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i as i64),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    /// Numeric view of any numeric variant
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Long(l) => Some(*l as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Map-member access; `None` for non-map values or missing keys
    pub fn get_key(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// List-index access; `None` for non-lists or out-of-range indices
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.as_list().and_then(|items| items.get(index))
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Long(l) => serde_json::Value::from(l),
            Value::Double(d) => serde_json::Number::from_f64(d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                        Value::Int(i as i32)
                    } else {
                        Value::Long(i)
                    }
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Value::Long(l)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl<V: Into<Value>> FromIterator<(String, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Value::Map(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// Canonical JSON rendering: object keys sorted, numerics rendered stably
///
/// This is the only encoder idempotency fingerprints may use.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Long(l) => out.push_str(&l.to_string()),
        Value::Double(d) => match serde_json::Number::from_f64(*d) {
            Some(n) => out.push_str(&n.to_string()),
            None => out.push_str("null"),
        },
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"))
        }
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Map(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Canonical rendering of a whole data map (sorted keys)
pub fn canonical_json_map(map: &HashMap<String, Value>) -> String {
    canonical_json(&Value::Map(map.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_json_number_splits_int_and_long() {
        let small: Value = serde_json::json!(42).into();
        assert_eq!(small, Value::Int(42));

        let big: Value = serde_json::json!(5_000_000_000i64).into();
        assert_eq!(big, Value::Long(5_000_000_000));

        let frac: Value = serde_json::json!(1.5).into();
        assert_eq!(frac, Value::Double(1.5));
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::Int(7).as_i64(), Some(7));
        assert_eq!(Value::Long(7).as_i64(), Some(7));
        assert_eq!(Value::Double(7.5).as_i64(), None);
        assert_eq!(Value::Double(7.5).as_f64(), Some(7.5));
        assert_eq!(Value::Int(7).as_f64(), Some(7.0));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value: Value = [
            ("zebra".to_string(), Value::Int(1)),
            ("alpha".to_string(), Value::Int(2)),
            ("mid".to_string(), Value::Null),
        ]
        .into_iter()
        .collect();

        assert_eq!(canonical_json(&value), r#"{"alpha":2,"mid":null,"zebra":1}"#);
    }

    #[test]
    fn test_canonical_json_is_stable_across_equal_numerics() {
        // Int and Long carrying the same value render identically.
        assert_eq!(canonical_json(&Value::Int(5)), canonical_json(&Value::Long(5)));
    }

    #[test]
    fn test_canonical_json_nested() {
        let value: Value = [(
            "items".to_string(),
            Value::List(vec![
                Value::String("a".into()),
                [("k".to_string(), Value::Bool(true))].into_iter().collect(),
            ]),
        )]
        .into_iter()
        .collect();

        assert_eq!(canonical_json(&value), r#"{"items":["a",{"k":true}]}"#);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::Int),
            ((i32::MAX as i64 + 1)..i64::MAX).prop_map(Value::Long),
            (-1e9f64..1e9f64).prop_map(Value::Double),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                prop::collection::hash_map("[a-z]{1,4}", inner, 0..4).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_json_round_trip(value in arb_value()) {
            let json: serde_json::Value = value.clone().into();
            let back: Value = json.into();
            prop_assert_eq!(back, value);
        }

        #[test]
        fn prop_canonical_json_parses(value in arb_value()) {
            let rendered = canonical_json(&value);
            let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
            let back: Value = parsed.into();
            prop_assert_eq!(back, value);
        }
    }
}
