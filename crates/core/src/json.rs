//! JSON representation of values
//!
//! The repr used for diagnostics and data exchange:
//!
//! - `nil` → `null`, bools and numbers verbatim (floats in shortest
//!   round-trip form), strings JSON-escaped
//! - arrays and maps recursively (map keys are strings already)
//! - `ok(v)` → `{"ok": v}`, `err(e)` → `{"err": e}`
//! - `some(v)` → `{"some": v}`, `none` → `{"none": true}`
//! - structs → an object of their fields
//! - enums → `{variant_name: payload}` or `{variant_name: true}`
//! - bytes → base64 string, vectors → array of numbers
//! - pids → `{"pid": n}`, functions/closures → `{"function": index}`
//!
//! Parsing is the inverse on the plain-data subset: nil, bool, number,
//! string, array, object-as-map. `value → json → parse → value` is
//! identity there; the tagged encodings parse back as plain maps.
//!
//! Non-finite floats have no JSON number form and render as `null`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::containers::{self, OpError};
use crate::map::RawMap;
use crate::strings::BlocString;
use crate::value::{ObjPayload, Value};

/// Failure to build a value from JSON text
#[derive(Debug)]
pub enum JsonError {
    Parse(serde_json::Error),
    Op(OpError),
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonError::Parse(e) => write!(f, "invalid JSON: {e}"),
            JsonError::Op(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for JsonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JsonError::Parse(e) => Some(e),
            JsonError::Op(e) => Some(e),
        }
    }
}

impl From<OpError> for JsonError {
    fn from(e: OpError) -> Self {
        JsonError::Op(e)
    }
}

/// Render a value as a `serde_json` tree
pub fn to_json(v: Value) -> Json {
    match v {
        Value::Nil => Json::Null,
        Value::Bool(b) => Json::Bool(b),
        Value::Int(n) => Json::Number(n.into()),
        Value::Float(f) => Number::from_f64(f).map_or(Json::Null, Json::Number),
        Value::Pid(p) => {
            let mut obj = JsonMap::new();
            obj.insert("pid".to_string(), Json::Number(p.into()));
            Json::Object(obj)
        }
        // Safety: the caller holds a live reference to the whole graph
        Value::Obj(r) => match unsafe { r.as_obj().payload() } {
            ObjPayload::Str(s) => Json::String(s.as_str().to_string()),
            ObjPayload::Bytes(b) => Json::String(BASE64.encode(b)),
            ObjPayload::Vector(x) => Json::Array(
                x.iter()
                    .map(|&f| Number::from_f64(f).map_or(Json::Null, Json::Number))
                    .collect(),
            ),
            ObjPayload::Array(items) => Json::Array(items.iter().map(|&v| to_json(v)).collect()),
            ObjPayload::Map(table) => {
                let mut obj = JsonMap::new();
                for entry in table.entries() {
                    obj.insert(entry.key.as_str().to_string(), to_json(entry.value));
                }
                Json::Object(obj)
            }
            ObjPayload::Function(f) => {
                let mut obj = JsonMap::new();
                obj.insert("function".to_string(), Json::Number(f.fn_index.into()));
                Json::Object(obj)
            }
            ObjPayload::Closure(c) => {
                let mut obj = JsonMap::new();
                obj.insert("function".to_string(), Json::Number(c.fn_index.into()));
                Json::Object(obj)
            }
            ObjPayload::Struct(s) => {
                let mut obj = JsonMap::new();
                for (name, fv) in &s.fields {
                    obj.insert(name.clone(), to_json(*fv));
                }
                Json::Object(obj)
            }
            ObjPayload::Enum(e) => {
                let mut obj = JsonMap::new();
                let payload = match e.payload {
                    Some(p) => to_json(p),
                    None => Json::Bool(true),
                };
                obj.insert(e.variant.clone(), payload);
                Json::Object(obj)
            }
            ObjPayload::Opt(inner) => {
                let mut obj = JsonMap::new();
                match inner {
                    Some(p) => obj.insert("some".to_string(), to_json(*p)),
                    None => obj.insert("none".to_string(), Json::Bool(true)),
                };
                Json::Object(obj)
            }
            ObjPayload::Res(res) => {
                let mut obj = JsonMap::new();
                let key = if res.is_ok { "ok" } else { "err" };
                obj.insert(key.to_string(), to_json(res.inner));
                Json::Object(obj)
            }
            ObjPayload::Freed => Json::Null,
        },
    }
}

/// Compact JSON text of a value
pub fn to_json_string(v: Value) -> String {
    to_json(v).to_string()
}

/// Build a value from a `serde_json` tree on the current heap. Objects
/// become maps; there is no re-tagging of the composite encodings.
pub fn from_json(j: &Json) -> Result<Value, OpError> {
    match j {
        Json::Null => Ok(Value::Nil),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Json::String(s) => containers::string_new(s),
        Json::Array(items) => {
            let mut arr = containers::array_new()?;
            for item in items {
                let v = from_json(item)?;
                arr = containers::array_push(arr, v)?;
            }
            Ok(arr)
        }
        Json::Object(obj) => {
            let mut table = RawMap::new();
            for (k, item) in obj {
                let v = from_json(item)?;
                if let Some(old) = table.insert(BlocString::new(k.as_str()), v) {
                    crate::value::release(old);
                }
            }
            crate::heap::with(|h| h.alloc(ObjPayload::Map(table))).ok_or(OpError::NoHeap)
        }
    }
}

/// Parse JSON text into a value on the current heap
pub fn parse(text: &str) -> Result<Value, JsonError> {
    let tree: Json = serde_json::from_str(text).map_err(JsonError::Parse)?;
    Ok(from_json(&tree)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{array_new, array_push, map_new, map_set, string_new};
    use crate::heap::{DEFAULT_MAX_HEAP, Heap, install};
    use crate::value::{release, value_eq};

    fn run(f: impl FnOnce()) {
        let mut heap = Heap::new(DEFAULT_MAX_HEAP);
        let _guard = install(&mut heap);
        f();
    }

    #[test]
    fn test_immediates() {
        assert_eq!(to_json_string(Value::Nil), "null");
        assert_eq!(to_json_string(Value::Bool(true)), "true");
        assert_eq!(to_json_string(Value::Int(-42)), "-42");
        assert_eq!(to_json_string(Value::Float(1.5)), "1.5");
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert_eq!(to_json_string(Value::Float(f64::NAN)), "null");
        assert_eq!(to_json_string(Value::Float(f64::INFINITY)), "null");
    }

    #[test]
    fn test_string_escaping() {
        run(|| {
            let s = string_new("line\none \"two\"\u{1}").expect("alloc");
            assert_eq!(to_json_string(s), "\"line\\none \\\"two\\\"\\u0001\"");
            release(s);
        });
    }

    #[test]
    fn test_array_and_map() {
        run(|| {
            let arr = array_push(array_new().expect("alloc"), Value::Int(1)).expect("push");
            let arr = array_push(arr, Value::Bool(false)).expect("push");
            assert_eq!(to_json_string(arr), "[1,false]");

            let m = map_set(
                map_new().expect("alloc"),
                &BlocString::new("x"),
                Value::Int(7),
            )
            .expect("set");
            assert_eq!(to_json_string(m), r#"{"x":7}"#);
            release(arr);
            release(m);
        });
    }

    #[test]
    fn test_option_result_encodings() {
        run(|| {
            let some = containers::some_new(Value::Int(1)).expect("alloc");
            let none = containers::none_new().expect("alloc");
            let ok = containers::ok_new(Value::Int(2)).expect("alloc");
            let err = containers::err_new(Value::Int(3)).expect("alloc");
            assert_eq!(to_json_string(some), r#"{"some":1}"#);
            assert_eq!(to_json_string(none), r#"{"none":true}"#);
            assert_eq!(to_json_string(ok), r#"{"ok":2}"#);
            assert_eq!(to_json_string(err), r#"{"err":3}"#);
            for v in [some, none, ok, err] {
                release(v);
            }
        });
    }

    #[test]
    fn test_struct_and_enum_encodings() {
        run(|| {
            let s = containers::struct_new(
                "Point",
                vec![("x".to_string(), Value::Int(1)), ("y".to_string(), Value::Int(2))],
            )
            .expect("alloc");
            assert_eq!(to_json_string(s), r#"{"x":1,"y":2}"#);

            let bare = containers::enum_new("Color", "red", None).expect("alloc");
            assert_eq!(to_json_string(bare), r#"{"red":true}"#);
            let payload = containers::enum_new("Shape", "circle", Some(Value::Int(5)))
                .expect("alloc");
            assert_eq!(to_json_string(payload), r#"{"circle":5}"#);
            for v in [s, bare, payload] {
                release(v);
            }
        });
    }

    #[test]
    fn test_bytes_base64() {
        run(|| {
            let b = containers::bytes_new(vec![1, 2, 254]).expect("alloc");
            assert_eq!(to_json_string(b), format!("{:?}", BASE64.encode([1u8, 2, 254])));
            release(b);
        });
    }

    #[test]
    fn test_round_trip_plain_data() {
        run(|| {
            let text = r#"{"name":"probe","counts":[1,2,3],"live":true,"ratio":0.5,"gone":null}"#;
            let v = parse(text).expect("parse");
            let back = parse(&to_json_string(v)).expect("reparse");
            assert!(value_eq(v, back));
            release(v);
            release(back);
        });
    }

    #[test]
    fn test_parse_rejects_garbage() {
        run(|| {
            assert!(matches!(parse("{nope"), Err(JsonError::Parse(_))));
        });
    }

    #[test]
    fn test_parse_without_heap_fails() {
        assert!(matches!(parse(r#"{"a":1}"#), Err(JsonError::Op(OpError::NoHeap))));
    }
}
