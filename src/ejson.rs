use base64::engine::{general_purpose::STANDARD, Engine};
use bson::{Bson, Document};
use serde_json::{json, Map, Number, Value};
use tracing::warn;

/// Relaxed Extended JSON, as printed for aggregation results.
pub fn into_ejson(bson: Bson) -> Value {
    match bson {
        // Extended JSON wrappers.
        Bson::Binary(v) => json!({
            "$binary": {
                "base64": STANDARD.encode(v.bytes),
                "subType": format!("{:02x}", u8::from(v.subtype)),
            }
        }),
        Bson::DateTime(v) => json!({ "$date": { "$numberLong": v.timestamp_millis().to_string() } }),
        Bson::Decimal128(v) => json!({ "$numberDecimal": v.to_string() }),
        Bson::Double(v) if v.is_nan() => json!({ "$numberDouble": "NaN" }),
        Bson::Double(v) if v.is_infinite() => {
            json!({ "$numberDouble": if v.is_sign_positive() { "Infinity" } else { "-Infinity" } })
        }
        Bson::MaxKey => json!({ "$maxKey": 1 }),
        Bson::MinKey => json!({ "$minKey": 1 }),
        Bson::ObjectId(v) => json!({ "$oid": v.to_hex() }),
        Bson::RegularExpression(v) => json!({
            "$regularExpression": { "pattern": v.pattern, "options": v.options }
        }),
        Bson::Timestamp(v) => json!({ "$timestamp": { "t": v.time, "i": v.increment } }),

        // Standard JSON serialization.
        Bson::Array(v) => Value::Array(v.into_iter().map(into_ejson).collect()),
        Bson::Boolean(v) => Value::Bool(v),
        Bson::Document(v) => Value::Object(into_ejson_document(v)),
        Bson::Double(v) => Number::from_f64(v).map_or(Value::Null, Value::Number),
        Bson::Int32(v) => Value::Number(Number::from(v)),
        Bson::Int64(v) => Value::Number(Number::from(v)),
        Bson::Null => Value::Null,
        Bson::String(v) => Value::String(v),

        // Replace everything else with `null`s.
        v => {
            warn!(element_type = ?v.element_type(), "unsupported BSON value replaced with null");
            Value::Null
        }
    }
}

pub fn into_ejson_document(document: Document) -> Map<String, Value> {
    document
        .into_iter()
        .map(|(k, v)| (k, into_ejson(v)))
        .collect()
}
