//! Typed preference values and their wire codec.
//!
//! Every stored entry is a `(key, type, value)` triple. The value
//! travels as text: booleans as the literals `true`/`false`, numerics
//! as canonical decimal, strings unchanged, string sets as a JSON
//! array. JSON was chosen over a delimiter-escaped scheme because it
//! is immune to embedded `;`, `\` and quote characters without any
//! custom escaping.
//!
//! Round-trip law: `decode(encode(v), v.pref_type()) == v` for every
//! value, including the empty set (`"[]"`) and the empty string.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Type tag for a stored preference entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrefType {
    Bool = 1,
    Int = 2,
    Long = 3,
    Float = 4,
    String = 5,
    StringSet = 6,
}

impl PrefType {
    /// Stable textual tag, used in storage rows and diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            PrefType::Bool => "bool",
            PrefType::Int => "int",
            PrefType::Long => "long",
            PrefType::Float => "float",
            PrefType::String => "string",
            PrefType::StringSet => "string_set",
        }
    }

    /// Parse a textual tag back into a type.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "bool" => Some(PrefType::Bool),
            "int" => Some(PrefType::Int),
            "long" => Some(PrefType::Long),
            "float" => Some(PrefType::Float),
            "string" => Some(PrefType::String),
            "string_set" => Some(PrefType::StringSet),
            _ => None,
        }
    }

    /// Single-byte tag for compact storage rows.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`PrefType::to_u8`].
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PrefType::Bool),
            2 => Some(PrefType::Int),
            3 => Some(PrefType::Long),
            4 => Some(PrefType::Float),
            5 => Some(PrefType::String),
            6 => Some(PrefType::StringSet),
            _ => None,
        }
    }
}

impl fmt::Display for PrefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A typed preference value.
///
/// The runtime representation always matches the tag; an absent key is
/// "unset" and is represented by the absence of an entry, never by a
/// stored null.
#[derive(Debug, Clone, PartialEq)]
pub enum PrefValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    String(String),
    StringSet(BTreeSet<String>),
}

impl PrefValue {
    /// The type tag matching this value's runtime representation.
    pub fn pref_type(&self) -> PrefType {
        match self {
            PrefValue::Bool(_) => PrefType::Bool,
            PrefValue::Int(_) => PrefType::Int,
            PrefValue::Long(_) => PrefType::Long,
            PrefValue::Float(_) => PrefType::Float,
            PrefValue::String(_) => PrefType::String,
            PrefValue::StringSet(_) => PrefType::StringSet,
        }
    }

    /// Encode to the wire text for this value's type.
    ///
    /// Floats use Rust's shortest round-trip formatting, so decoding
    /// the result always reproduces the original bits.
    pub fn encode(&self) -> String {
        match self {
            PrefValue::Bool(v) => v.to_string(),
            PrefValue::Int(v) => v.to_string(),
            PrefValue::Long(v) => v.to_string(),
            PrefValue::Float(v) => v.to_string(),
            PrefValue::String(v) => v.clone(),
            // BTreeSet iterates sorted, so the encoding is canonical.
            PrefValue::StringSet(v) => {
                serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }

    /// Decode wire text under the given type tag.
    ///
    /// Total only for well-formed input. Booleans accept exactly
    /// `true`/`false`; numerics must parse in full; string sets must be
    /// a JSON array of strings.
    pub fn decode(wire: &str, pref_type: PrefType) -> Result<Self, FormatError> {
        match pref_type {
            PrefType::Bool => match wire {
                "true" => Ok(PrefValue::Bool(true)),
                "false" => Ok(PrefValue::Bool(false)),
                _ => Err(FormatError::InvalidBool(wire.to_string())),
            },
            PrefType::Int => wire
                .parse::<i32>()
                .map(PrefValue::Int)
                .map_err(|_| FormatError::InvalidInt(wire.to_string())),
            PrefType::Long => wire
                .parse::<i64>()
                .map(PrefValue::Long)
                .map_err(|_| FormatError::InvalidLong(wire.to_string())),
            PrefType::Float => wire
                .parse::<f32>()
                .map(PrefValue::Float)
                .map_err(|_| FormatError::InvalidFloat(wire.to_string())),
            PrefType::String => Ok(PrefValue::String(wire.to_string())),
            PrefType::StringSet => serde_json::from_str::<BTreeSet<String>>(wire)
                .map(PrefValue::StringSet)
                .map_err(|e| FormatError::InvalidSet(e.to_string())),
        }
    }
}

impl From<bool> for PrefValue {
    fn from(v: bool) -> Self {
        PrefValue::Bool(v)
    }
}

impl From<i32> for PrefValue {
    fn from(v: i32) -> Self {
        PrefValue::Int(v)
    }
}

impl From<i64> for PrefValue {
    fn from(v: i64) -> Self {
        PrefValue::Long(v)
    }
}

impl From<f32> for PrefValue {
    fn from(v: f32) -> Self {
        PrefValue::Float(v)
    }
}

impl From<&str> for PrefValue {
    fn from(v: &str) -> Self {
        PrefValue::String(v.to_string())
    }
}

impl From<String> for PrefValue {
    fn from(v: String) -> Self {
        PrefValue::String(v)
    }
}

impl From<BTreeSet<String>> for PrefValue {
    fn from(v: BTreeSet<String>) -> Self {
        PrefValue::StringSet(v)
    }
}

/// A wire string failed to decode under its declared type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatError {
    InvalidBool(String),
    InvalidInt(String),
    InvalidLong(String),
    InvalidFloat(String),
    InvalidSet(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::InvalidBool(v) => write!(f, "not a boolean literal: {v:?}"),
            FormatError::InvalidInt(v) => write!(f, "not a 32-bit integer: {v:?}"),
            FormatError::InvalidLong(v) => write!(f, "not a 64-bit integer: {v:?}"),
            FormatError::InvalidFloat(v) => write!(f, "not a float: {v:?}"),
            FormatError::InvalidSet(e) => write!(f, "not a JSON string array: {e}"),
        }
    }
}

impl std::error::Error for FormatError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn roundtrip(value: PrefValue) {
        let wire = value.encode();
        let decoded = PrefValue::decode(&wire, value.pref_type()).unwrap();
        assert_eq!(decoded, value, "wire was {wire:?}");
    }

    #[test]
    fn test_bool_roundtrip() {
        roundtrip(PrefValue::Bool(true));
        roundtrip(PrefValue::Bool(false));
    }

    #[test]
    fn test_int_roundtrip() {
        roundtrip(PrefValue::Int(0));
        roundtrip(PrefValue::Int(-42));
        roundtrip(PrefValue::Int(i32::MAX));
        roundtrip(PrefValue::Int(i32::MIN));
    }

    #[test]
    fn test_long_roundtrip() {
        roundtrip(PrefValue::Long(0));
        roundtrip(PrefValue::Long(i64::MAX));
        roundtrip(PrefValue::Long(i64::MIN));
    }

    #[test]
    fn test_float_roundtrip() {
        roundtrip(PrefValue::Float(0.0));
        roundtrip(PrefValue::Float(1.5));
        roundtrip(PrefValue::Float(-3.25));
        roundtrip(PrefValue::Float(f32::MAX));
        roundtrip(PrefValue::Float(f32::MIN_POSITIVE));
        // 0.1 has no exact binary representation; shortest round-trip
        // formatting must still reproduce the same bits.
        roundtrip(PrefValue::Float(0.1));
    }

    #[test]
    fn test_string_roundtrip() {
        roundtrip(PrefValue::String(String::new()));
        roundtrip(PrefValue::String("plain".to_string()));
        roundtrip(PrefValue::String("semi;colons;everywhere".to_string()));
        roundtrip(PrefValue::String(r"back\slash\".to_string()));
        roundtrip(PrefValue::String(r#"quo"tes'and`ticks"#.to_string()));
        roundtrip(PrefValue::String("line\nbreak\tand tab".to_string()));
        roundtrip(PrefValue::String("ünïcödé ✓".to_string()));
    }

    #[test]
    fn test_string_set_roundtrip() {
        roundtrip(PrefValue::StringSet(BTreeSet::new()));
        roundtrip(PrefValue::StringSet(set(&["a", "b", "c"])));
        roundtrip(PrefValue::StringSet(set(&["semi;colon", r"back\slash", r#""quoted""#])));
        roundtrip(PrefValue::StringSet(set(&[""])));
    }

    #[test]
    fn test_empty_set_encodes_as_json_array() {
        assert_eq!(PrefValue::StringSet(BTreeSet::new()).encode(), "[]");
    }

    #[test]
    fn test_bool_decode_is_strict() {
        assert!(PrefValue::decode("True", PrefType::Bool).is_err());
        assert!(PrefValue::decode("1", PrefType::Bool).is_err());
        assert!(PrefValue::decode("", PrefType::Bool).is_err());
        assert!(PrefValue::decode("yes", PrefType::Bool).is_err());
    }

    #[test]
    fn test_numeric_decode_rejects_garbage() {
        assert!(PrefValue::decode("1.5", PrefType::Int).is_err());
        assert!(PrefValue::decode("0x10", PrefType::Int).is_err());
        assert!(PrefValue::decode("", PrefType::Long).is_err());
        assert!(PrefValue::decode("12345678901234567890123", PrefType::Long).is_err());
        assert!(PrefValue::decode("1,5", PrefType::Float).is_err());
    }

    #[test]
    fn test_set_decode_rejects_malformed_json() {
        assert!(PrefValue::decode("not json", PrefType::StringSet).is_err());
        assert!(PrefValue::decode("[1, 2]", PrefType::StringSet).is_err());
        assert!(PrefValue::decode("{\"a\": 1}", PrefType::StringSet).is_err());
        assert!(PrefValue::decode("[\"unterminated", PrefType::StringSet).is_err());
    }

    #[test]
    fn test_decode_under_wrong_tag_fails_rather_than_lies() {
        // "true" is a perfectly fine string, but not an int.
        assert!(PrefValue::decode("true", PrefType::Int).is_err());
        // And an int wire decodes as a string without loss.
        assert_eq!(
            PrefValue::decode("42", PrefType::String).unwrap(),
            PrefValue::String("42".to_string())
        );
    }

    #[test]
    fn test_pref_type_tags() {
        for t in [
            PrefType::Bool,
            PrefType::Int,
            PrefType::Long,
            PrefType::Float,
            PrefType::String,
            PrefType::StringSet,
        ] {
            assert_eq!(PrefType::from_tag(t.tag()), Some(t));
            assert_eq!(PrefType::from_u8(t.to_u8()), Some(t));
        }
        assert_eq!(PrefType::from_tag("double"), None);
        assert_eq!(PrefType::from_u8(0), None);
        assert_eq!(PrefType::from_u8(7), None);
    }

    #[test]
    fn test_value_type_matches_tag() {
        assert_eq!(PrefValue::Bool(true).pref_type(), PrefType::Bool);
        assert_eq!(PrefValue::Int(1).pref_type(), PrefType::Int);
        assert_eq!(PrefValue::Long(1).pref_type(), PrefType::Long);
        assert_eq!(PrefValue::Float(1.0).pref_type(), PrefType::Float);
        assert_eq!(PrefValue::String("x".into()).pref_type(), PrefType::String);
        assert_eq!(
            PrefValue::StringSet(BTreeSet::new()).pref_type(),
            PrefType::StringSet
        );
    }

    #[test]
    fn test_from_conversions() {
        assert_eq!(PrefValue::from(true), PrefValue::Bool(true));
        assert_eq!(PrefValue::from(5i32), PrefValue::Int(5));
        assert_eq!(PrefValue::from(5i64), PrefValue::Long(5));
        assert_eq!(PrefValue::from(5.0f32), PrefValue::Float(5.0));
        assert_eq!(PrefValue::from("s"), PrefValue::String("s".to_string()));
        assert_eq!(
            PrefValue::from(set(&["a"])),
            PrefValue::StringSet(set(&["a"]))
        );
    }

    #[test]
    fn test_format_error_display() {
        let err = PrefValue::decode("nope", PrefType::Bool).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
