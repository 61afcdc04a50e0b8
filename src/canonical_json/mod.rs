// =============================================================================
// Matrixon Matrix NextServer - Canonical JSON Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Deterministic JSON encoding for signing and hashing. Objects serialize
//   with keys in Unicode code point order, without whitespace and with
//   minimal escaping, so equal values always produce byte-identical output
//   and signatures survive re-serialization on any honest implementation.
//
// =============================================================================

use std::{collections::BTreeMap, fmt};

use serde::{
    de::{self, MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeSeq},
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::{Error, Result};

/// Largest integer magnitude representable losslessly in every JSON
/// implementation (2^53 - 1).
pub const MAX_CANONICAL_INT: i64 = 9_007_199_254_740_991;

/// A JSON object with canonically ordered keys.
pub type CanonicalJsonObject = BTreeMap<String, CanonicalJsonValue>;

/// A JSON value restricted to the canonical grammar.
///
/// Numbers with an integral value are always held as [`Integer`]; a `2.0`
/// cannot exist distinct from `2`, which keeps the encoding bijective with
/// the underlying value.
///
/// [`Integer`]: CanonicalJsonValue::Integer
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalJsonValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<CanonicalJsonValue>),
    Object(CanonicalJsonObject),
}

impl CanonicalJsonValue {
    /// Parse canonical JSON from text, rejecting duplicate object keys.
    pub fn from_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| Error::InvalidJson(e.to_string()))
    }

    /// Encode as the canonical byte sequence.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("canonical value serialization never fails")
    }

    pub fn as_object(&self) -> Option<&CanonicalJsonObject> {
        match self {
            CanonicalJsonValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut CanonicalJsonObject> {
        match self {
            CanonicalJsonValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CanonicalJsonValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            CanonicalJsonValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CanonicalJsonValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<CanonicalJsonValue>> {
        match self {
            CanonicalJsonValue::Array(a) => Some(a),
            _ => None,
        }
    }

    fn integer_from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::invalid_json("NaN and infinities are not valid JSON"));
        }
        if value.fract() == 0.0 && value.abs() <= MAX_CANONICAL_INT as f64 {
            Ok(CanonicalJsonValue::Integer(value as i64))
        } else {
            Ok(CanonicalJsonValue::Float(value))
        }
    }
}

/// Encode a canonical object as its byte sequence.
pub fn to_canonical_bytes(object: &CanonicalJsonObject) -> Vec<u8> {
    serde_json::to_vec(&CanonicalObjectRef(object))
        .expect("canonical object serialization never fails")
}

/// Encode a canonical object as a string.
pub fn to_canonical_string(object: &CanonicalJsonObject) -> String {
    String::from_utf8(to_canonical_bytes(object)).expect("canonical JSON is valid UTF-8")
}

// Borrowed serializer wrapper so encoding an object does not clone it.
struct CanonicalObjectRef<'a>(&'a CanonicalJsonObject);

impl Serialize for CanonicalObjectRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Convert any serializable value into the canonical grammar.
pub fn to_canonical_value<T: Serialize>(value: T) -> Result<CanonicalJsonValue> {
    let json = serde_json::to_value(value).map_err(|e| Error::InvalidJson(e.to_string()))?;
    CanonicalJsonValue::try_from(json)
}

/// Convert a serializable value into a canonical object, failing if it is not
/// a JSON object.
pub fn to_canonical_object<T: Serialize>(value: T) -> Result<CanonicalJsonObject> {
    match to_canonical_value(value)? {
        CanonicalJsonValue::Object(o) => Ok(o),
        _ => Err(Error::invalid_json("expected a JSON object")),
    }
}

/// Convert a `serde_json` map into a canonical object.
pub fn try_from_json_map(
    map: serde_json::Map<String, serde_json::Value>,
) -> Result<CanonicalJsonObject> {
    map.into_iter()
        .map(|(k, v)| Ok((k, CanonicalJsonValue::try_from(v)?)))
        .collect()
}

impl TryFrom<serde_json::Value> for CanonicalJsonValue {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        Ok(match value {
            serde_json::Value::Null => CanonicalJsonValue::Null,
            serde_json::Value::Bool(b) => CanonicalJsonValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if !(-MAX_CANONICAL_INT..=MAX_CANONICAL_INT).contains(&i) {
                        return Err(Error::invalid_json(format!(
                            "integer {i} outside the canonical range"
                        )));
                    }
                    CanonicalJsonValue::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    if u > MAX_CANONICAL_INT as u64 {
                        return Err(Error::invalid_json(format!(
                            "integer {u} outside the canonical range"
                        )));
                    }
                    CanonicalJsonValue::Integer(u as i64)
                } else if let Some(f) = n.as_f64() {
                    CanonicalJsonValue::integer_from_f64(f)?
                } else {
                    return Err(Error::invalid_json("unrepresentable JSON number"));
                }
            }
            serde_json::Value::String(s) => CanonicalJsonValue::String(s),
            serde_json::Value::Array(values) => CanonicalJsonValue::Array(
                values
                    .into_iter()
                    .map(CanonicalJsonValue::try_from)
                    .collect::<Result<_>>()?,
            ),
            serde_json::Value::Object(map) => CanonicalJsonValue::Object(try_from_json_map(map)?),
        })
    }
}

impl From<CanonicalJsonValue> for serde_json::Value {
    fn from(value: CanonicalJsonValue) -> Self {
        match value {
            CanonicalJsonValue::Null => serde_json::Value::Null,
            CanonicalJsonValue::Bool(b) => serde_json::Value::Bool(b),
            CanonicalJsonValue::Integer(i) => serde_json::Value::from(i),
            CanonicalJsonValue::Float(f) => {
                serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            CanonicalJsonValue::String(s) => serde_json::Value::String(s),
            CanonicalJsonValue::Array(values) => {
                serde_json::Value::Array(values.into_iter().map(Into::into).collect())
            }
            CanonicalJsonValue::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<bool> for CanonicalJsonValue {
    fn from(value: bool) -> Self {
        CanonicalJsonValue::Bool(value)
    }
}

impl From<i64> for CanonicalJsonValue {
    fn from(value: i64) -> Self {
        CanonicalJsonValue::Integer(value)
    }
}

impl From<&str> for CanonicalJsonValue {
    fn from(value: &str) -> Self {
        CanonicalJsonValue::String(value.to_owned())
    }
}

impl From<String> for CanonicalJsonValue {
    fn from(value: String) -> Self {
        CanonicalJsonValue::String(value)
    }
}

impl fmt::Display for CanonicalJsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded =
            serde_json::to_string(self).expect("canonical value serialization never fails");
        f.write_str(&encoded)
    }
}

impl Serialize for CanonicalJsonValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CanonicalJsonValue::Null => serializer.serialize_unit(),
            CanonicalJsonValue::Bool(b) => serializer.serialize_bool(*b),
            CanonicalJsonValue::Integer(i) => serializer.serialize_i64(*i),
            CanonicalJsonValue::Float(f) => serializer.serialize_f64(*f),
            CanonicalJsonValue::String(s) => serializer.serialize_str(s),
            CanonicalJsonValue::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            CanonicalJsonValue::Object(map) => {
                let mut obj = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    obj.serialize_entry(key, value)?;
                }
                obj.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for CanonicalJsonValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct CanonicalVisitor;

        impl<'de> Visitor<'de> for CanonicalVisitor {
            type Value = CanonicalJsonValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a canonical JSON value")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(CanonicalJsonValue::Null)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Self::Value, E> {
                Ok(CanonicalJsonValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if !(-MAX_CANONICAL_INT..=MAX_CANONICAL_INT).contains(&v) {
                    return Err(E::custom(format!("integer {v} outside the canonical range")));
                }
                Ok(CanonicalJsonValue::Integer(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                if v > MAX_CANONICAL_INT as u64 {
                    return Err(E::custom(format!("integer {v} outside the canonical range")));
                }
                Ok(CanonicalJsonValue::Integer(v as i64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
                CanonicalJsonValue::integer_from_f64(v).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Ok(CanonicalJsonValue::String(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Self::Value, E> {
                Ok(CanonicalJsonValue::String(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element()? {
                    values.push(value);
                }
                Ok(CanonicalJsonValue::Array(values))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut object = CanonicalJsonObject::new();
                while let Some(key) = map.next_key::<String>()? {
                    let value = map.next_value::<CanonicalJsonValue>()?;
                    if object.insert(key.clone(), value).is_some() {
                        return Err(de::Error::custom(format!("duplicate key `{key}`")));
                    }
                }
                Ok(CanonicalJsonValue::Object(object))
            }
        }

        deserializer.deserialize_any(CanonicalVisitor)
    }
}
