use std::collections::HashMap;

use base64::Engine;
use serde_json::Value as Json;
use weft_bus::ValueMap;

use crate::proto::{value::Kind, Value as ProtoValue};

/// Encode a JSON value into the narrowest wire tag that represents it
/// faithfully: booleans, 64-bit integers, doubles, and strings get their
/// scalar tags; everything else (null, arrays, objects, out-of-range
/// numbers) rides the `json` tag.
pub fn encode_value(value: &Json) -> ProtoValue {
    let kind = match value {
        Json::Bool(b) => Kind::B(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::I64(i)
            } else if n.is_u64() {
                // Preserves u64 precision f64 would lose.
                Kind::Json(n.to_string())
            } else {
                Kind::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Kind::S(s.clone()),
        other => Kind::Json(other.to_string()),
    };
    ProtoValue { kind: Some(kind) }
}

/// Decode a wire value. The `json` tag is parsed leniently: malformed
/// documents fall back to the raw string rather than failing the call.
/// Binary payloads decode to their base64 text form.
pub fn decode_value(value: ProtoValue) -> Json {
    match value.kind {
        None => Json::Null,
        Some(Kind::B(b)) => Json::Bool(b),
        Some(Kind::I64(i)) => Json::from(i),
        Some(Kind::F64(f)) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Some(Kind::S(s)) => Json::String(s),
        Some(Kind::Bin(bytes)) => {
            Json::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        Some(Kind::Json(raw)) => serde_json::from_str(&raw).unwrap_or(Json::String(raw)),
    }
}

pub fn encode_map(map: &ValueMap) -> HashMap<String, ProtoValue> {
    map.iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect()
}

pub fn decode_map(map: HashMap<String, ProtoValue>) -> ValueMap {
    map.into_iter()
        .map(|(k, v)| (k, decode_value(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(value: Json) -> Json {
        decode_value(encode_value(&value))
    }

    #[test]
    fn scalars_use_scalar_tags() {
        assert!(matches!(
            encode_value(&json!(true)).kind,
            Some(Kind::B(true))
        ));
        assert!(matches!(encode_value(&json!(42)).kind, Some(Kind::I64(42))));
        assert!(matches!(encode_value(&json!(1.5)).kind, Some(Kind::F64(_))));
        assert!(matches!(encode_value(&json!("hi")).kind, Some(Kind::S(_))));
    }

    #[test]
    fn structures_ride_the_json_tag() {
        assert!(matches!(
            encode_value(&json!({"a": 1})).kind,
            Some(Kind::Json(_))
        ));
        assert!(matches!(
            encode_value(&json!([1, 2])).kind,
            Some(Kind::Json(_))
        ));
        assert!(matches!(encode_value(&json!(null)).kind, Some(Kind::Json(_))));
    }

    #[test]
    fn round_trips_preserve_values() {
        for value in [
            json!(true),
            json!(-7),
            json!(2.25),
            json!("text"),
            json!(null),
            json!([1, "two", {"three": 3}]),
            json!({"nested": {"deep": [true, null]}}),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn large_u64_survives_via_json_tag() {
        let big = u64::MAX;
        assert_eq!(round_trip(json!(big)), json!(big));
    }

    #[test]
    fn malformed_json_decodes_to_raw_string() {
        let value = ProtoValue {
            kind: Some(Kind::Json("{not json".to_string())),
        };
        assert_eq!(decode_value(value), json!("{not json"));
    }

    #[test]
    fn missing_kind_is_null() {
        assert_eq!(decode_value(ProtoValue { kind: None }), Json::Null);
    }

    #[test]
    fn bytes_decode_to_base64() {
        let value = ProtoValue {
            kind: Some(Kind::Bin(vec![0xde, 0xad, 0xbe, 0xef])),
        };
        assert_eq!(decode_value(value), json!("3q2+7w=="));
    }

    #[test]
    fn maps_round_trip() {
        let mut map = ValueMap::new();
        map.insert("s".into(), json!("x"));
        map.insert("n".into(), json!(3));
        map.insert("o".into(), json!({"k": true}));
        assert_eq!(decode_map(encode_map(&map)), map);
    }
}
