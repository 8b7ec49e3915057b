//! Tagged values: the engine-neutral form of anything that crosses the
//! host/script boundary.
//!
//! A `TaggedValue` owns its payload outright. Handing one to the engine (or
//! returning one to the host) moves it, so every heap payload is released
//! exactly once, by whichever side holds it last.

use serde::{Deserialize, Serialize};

/// Stable numeric tag for each kind of value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ValueKind {
    Null = 0,
    Boolean = 1,
    Integer = 2,
    Number = 3,
    String = 4,
    Date = 5,
    Array = 6,
    Managed = 7,
    Error = 8,
}

/// A value crossing the boundary.
///
/// Strings and error messages are UTF-16 code units with an explicit length,
/// so embedded NUL survives the trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaggedValue {
    Null,
    Boolean(bool),
    Integer(i32),
    Number(f64),
    String(Vec<u16>),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Array(Vec<TaggedValue>),
    /// Opaque index into the host object table. Never an address.
    Managed(u32),
    /// A human-readable failure message. Empty when the engine handed back a
    /// value of a type the bridge does not marshal.
    Error(Vec<u16>),
}

impl TaggedValue {
    pub fn string(s: &str) -> Self {
        TaggedValue::String(utf16(s))
    }

    pub fn error(message: &str) -> Self {
        TaggedValue::Error(utf16(message))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            TaggedValue::Null => ValueKind::Null,
            TaggedValue::Boolean(_) => ValueKind::Boolean,
            TaggedValue::Integer(_) => ValueKind::Integer,
            TaggedValue::Number(_) => ValueKind::Number,
            TaggedValue::String(_) => ValueKind::String,
            TaggedValue::Date(_) => ValueKind::Date,
            TaggedValue::Array(_) => ValueKind::Array,
            TaggedValue::Managed(_) => ValueKind::Managed,
            TaggedValue::Error(_) => ValueKind::Error,
        }
    }

    /// Code-unit count for String/Error, element count for Array, 0 otherwise.
    pub fn len(&self) -> usize {
        match self {
            TaggedValue::String(units) | TaggedValue::Error(units) => units.len(),
            TaggedValue::Array(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every operation that can fail reports it through this kind; check it
    /// before treating the payload as a result.
    pub fn is_error(&self) -> bool {
        matches!(self, TaggedValue::Error(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TaggedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TaggedValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric payload of Integer, Number and Date values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TaggedValue::Integer(i) => Some(f64::from(*i)),
            TaggedValue::Number(n) | TaggedValue::Date(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[TaggedValue]> {
        match self {
            TaggedValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<u32> {
        match self {
            TaggedValue::Managed(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Raw code units of a String or Error payload.
    pub fn code_units(&self) -> Option<&[u16]> {
        match self {
            TaggedValue::String(units) | TaggedValue::Error(units) => Some(units),
            _ => None,
        }
    }

    /// String or Error payload decoded for display. Unpaired surrogates become
    /// U+FFFD.
    pub fn to_string_lossy(&self) -> Option<String> {
        self.code_units().map(String::from_utf16_lossy)
    }
}

impl From<bool> for TaggedValue {
    fn from(b: bool) -> Self {
        TaggedValue::Boolean(b)
    }
}

impl From<i32> for TaggedValue {
    fn from(i: i32) -> Self {
        TaggedValue::Integer(i)
    }
}

impl From<f64> for TaggedValue {
    fn from(n: f64) -> Self {
        TaggedValue::Number(n)
    }
}

impl From<&str> for TaggedValue {
    fn from(s: &str) -> Self {
        TaggedValue::string(s)
    }
}

impl From<Vec<TaggedValue>> for TaggedValue {
    fn from(items: Vec<TaggedValue>) -> Self {
        TaggedValue::Array(items)
    }
}

/// Encode a Rust string as UTF-16 code units.
pub fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_tracks_payload() {
        assert_eq!(TaggedValue::string("héllo").len(), 5);
        assert_eq!(TaggedValue::string("😀").len(), 2);
        assert_eq!(TaggedValue::Array(vec![TaggedValue::Null; 3]).len(), 3);
        assert_eq!(TaggedValue::Integer(7).len(), 0);
        assert!(TaggedValue::Array(Vec::new()).is_empty());
    }

    #[test]
    fn embedded_nul_survives() {
        let v = TaggedValue::String(vec![0x61, 0x00, 0x62]);
        assert_eq!(v.len(), 3);
        assert_eq!(v.to_string_lossy().as_deref(), Some("a\0b"));
    }

    #[test]
    fn error_is_string_shaped_but_tagged() {
        let err = TaggedValue::error("boom");
        let s = TaggedValue::string("boom");
        assert_eq!(err.code_units(), s.code_units());
        assert!(err.is_error());
        assert!(!s.is_error());
        assert_eq!(err.kind(), ValueKind::Error);
        assert_eq!(ValueKind::Error as i32, 8);
    }

    #[test]
    fn serde_uses_kind_tag() {
        let v = TaggedValue::Array(vec![TaggedValue::Integer(1), TaggedValue::Null]);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "array",
                "value": [{ "kind": "integer", "value": 1 }, { "kind": "null" }]
            })
        );
        let back: TaggedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
