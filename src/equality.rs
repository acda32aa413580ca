//! Deep structural equality over JSON values
//!
//! Numbers compare by value regardless of integer/float representation, so a
//! variant returning `2.0` matches an expected `2`. Two integers compare
//! exactly, even beyond 2^53. Arrays compare length first,
//! then element-wise; objects compare key count first, then per-key values.
//! Values of different JSON types are never equal.

use serde_json::Value;

pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => x == y,
            }
        }
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, l)| y.get(key).map_or(false, |r| deep_equal(l, r)))
        }
        _ => false,
    }
}
