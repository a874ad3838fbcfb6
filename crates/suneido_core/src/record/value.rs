//! Packed field values.
//!
//! Every field of a [`Record`](super::Record) is a packed value whose raw
//! bytes sort in value order:
//!
//! | Bytes | Value |
//! |---|---|
//! | empty | `""` |
//! | `00` | `false` |
//! | `01` | `true` |
//! | `03` + 8 bytes big-endian, sign bit flipped | integer |
//! | `04` + UTF-8 | string |
//!
//! Integers therefore sort before non-empty strings, and negative integers
//! before positive ones.

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Tag for `false`.
pub const PACK_FALSE: u8 = 0x00;
/// Tag for `true`.
pub const PACK_TRUE: u8 = 0x01;
/// Tag for integers.
pub const PACK_INT: u8 = 0x03;
/// Tag for non-empty strings.
pub const PACK_STRING: u8 = 0x04;

const SIGN_FLIP: u64 = 1 << 63;

/// An unpacked field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// String. The empty string packs to zero bytes.
    Str(String),
}

impl Value {
    /// Packs the value into its sortable byte form.
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        match self {
            Self::Bool(false) => vec![PACK_FALSE],
            Self::Bool(true) => vec![PACK_TRUE],
            Self::Int(n) => pack_int(*n),
            Self::Str(s) => pack_string(s),
        }
    }

    /// Unpacks a field.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for an unknown tag, a short integer or invalid UTF-8.
    pub fn unpack(data: &[u8]) -> CoreResult<Self> {
        let Some((&tag, rest)) = data.split_first() else {
            return Ok(Self::Str(String::new()));
        };
        match tag {
            PACK_FALSE if rest.is_empty() => Ok(Self::Bool(false)),
            PACK_TRUE if rest.is_empty() => Ok(Self::Bool(true)),
            PACK_INT => unpack_int(data).map(Self::Int),
            PACK_STRING => unpack_string(data).map(Self::Str),
            _ => Err(CoreError::invalid_format(format!(
                "unknown packed value tag {tag:#04x}"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Packs an integer.
#[must_use]
pub fn pack_int(n: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(PACK_INT);
    buf.extend_from_slice(&((n as u64) ^ SIGN_FLIP).to_be_bytes());
    buf
}

/// Packs a string.
#[must_use]
pub fn pack_string(s: &str) -> Vec<u8> {
    if s.is_empty() {
        return Vec::new();
    }
    let mut buf = Vec::with_capacity(1 + s.len());
    buf.push(PACK_STRING);
    buf.extend_from_slice(s.as_bytes());
    buf
}

/// Unpacks an integer field.
///
/// # Errors
///
/// Returns `InvalidFormat` if the field is not a packed integer.
pub fn unpack_int(data: &[u8]) -> CoreResult<i64> {
    match data {
        [PACK_INT, rest @ ..] if rest.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(rest);
            Ok((u64::from_be_bytes(raw) ^ SIGN_FLIP) as i64)
        }
        _ => Err(CoreError::invalid_format("field is not an integer")),
    }
}

/// Unpacks a string field. The empty field is the empty string.
///
/// # Errors
///
/// Returns `InvalidFormat` if the field is not a packed string.
pub fn unpack_string(data: &[u8]) -> CoreResult<String> {
    match data {
        [] => Ok(String::new()),
        [PACK_STRING, rest @ ..] => String::from_utf8(rest.to_vec())
            .map_err(|_| CoreError::invalid_format("string field is not UTF-8")),
        _ => Err(CoreError::invalid_format("field is not a string")),
    }
}
