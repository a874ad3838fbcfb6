//! Immutable field tuples.
//!
//! A record is an ordered sequence of packed fields with O(1) positional
//! access:
//!
//! ```text
//! +----------+-------------------------------+------------+
//! | nfields  | offsets (nfields + 1)         | field data |
//! | u16 LE   | u32 LE, relative to the start |            |
//! +----------+-------------------------------+------------+
//! ```
//!
//! The last offset is the record length. Records wrap [`Bytes`], so a record
//! read out of a B-tree node or a Data block shares the underlying buffer.
//!
//! ## Ordering
//!
//! Records compare field by field as raw bytes; a proper prefix sorts before
//! any extension of it. Because packed values sort in value order this is
//! also value order.

mod value;

pub use value::{pack_int, pack_string, unpack_int, unpack_string, Value};

use crate::error::{CoreError, CoreResult};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// A field that sorts after every packed value.
const MAX_FIELD: &[u8] = &[0xFF];

/// An immutable record.
#[derive(Clone)]
pub struct Record {
    data: Bytes,
}

impl Record {
    /// Returns the record with no fields.
    #[must_use]
    pub fn empty() -> Self {
        RecordBuilder::new().build()
    }

    /// Wraps packed bytes, validating the header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the offsets are inconsistent with the length.
    pub fn from_bytes(data: Bytes) -> CoreResult<Self> {
        if data.len() < 2 {
            return Err(CoreError::invalid_format("record shorter than its header"));
        }
        let n = u16::from_le_bytes([data[0], data[1]]) as usize;
        let header = 2 + 4 * (n + 1);
        if data.len() < header {
            return Err(CoreError::invalid_format(format!(
                "record with {n} fields is only {} bytes",
                data.len()
            )));
        }
        let mut prev = header;
        for i in 0..=n {
            let off = read_u32(&data, 2 + 4 * i) as usize;
            if (i == 0 && off != header) || off < prev || off > data.len() {
                return Err(CoreError::invalid_format(format!(
                    "record offset {i} out of order"
                )));
            }
            prev = off;
        }
        if prev != data.len() {
            return Err(CoreError::invalid_format("record length mismatch"));
        }
        Ok(Self { data })
    }

    /// Builds a record from values.
    #[must_use]
    pub fn from_values(values: &[Value]) -> Self {
        let mut builder = RecordBuilder::new();
        for v in values {
            builder.add_value(v);
        }
        builder.build()
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        u16::from_le_bytes([self.data[0], self.data[1]]) as usize
    }

    /// Returns true if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packed size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The packed bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Raw field `i`. Fields past the end read as empty.
    #[must_use]
    pub fn get(&self, i: usize) -> &[u8] {
        if i >= self.len() {
            return &[];
        }
        let start = read_u32(&self.data, 2 + 4 * i) as usize;
        let end = read_u32(&self.data, 2 + 4 * (i + 1)) as usize;
        &self.data[start..end]
    }

    /// Field `i` unpacked.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the field is not a valid packed value.
    pub fn get_value(&self, i: usize) -> CoreResult<Value> {
        Value::unpack(self.get(i))
    }

    /// Field `i` as a string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the field is not a string.
    pub fn get_string(&self, i: usize) -> CoreResult<String> {
        unpack_string(self.get(i))
    }

    /// Field `i` as an integer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the field is not an integer.
    pub fn get_int(&self, i: usize) -> CoreResult<i64> {
        unpack_int(self.get(i))
    }

    /// Iterates over the raw fields.
    pub fn fields(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Builds the record of the given fields, in the given order.
    #[must_use]
    pub fn project(&self, fields: &[usize]) -> Self {
        let mut builder = RecordBuilder::new();
        for &f in fields {
            builder.add_raw(self.get(f));
        }
        builder.build()
    }

    /// Returns the record cut down to its first `n` fields.
    #[must_use]
    pub fn truncate(&self, n: usize) -> Self {
        if n >= self.len() {
            return self.clone();
        }
        let mut builder = RecordBuilder::new();
        for i in 0..n {
            builder.add_raw(self.get(i));
        }
        builder.build()
    }

    /// Returns a record that sorts after every record starting with `self`.
    #[must_use]
    pub fn prefix_upper_bound(&self) -> Self {
        let mut builder = RecordBuilder::new();
        for f in self.fields() {
            builder.add_raw(f);
        }
        builder.add_raw(MAX_FIELD);
        builder.build()
    }

    /// Returns true if every field of `prefix` equals the same field of `self`.
    #[must_use]
    pub fn starts_with(&self, prefix: &Record) -> bool {
        prefix.len() <= self.len() && (0..prefix.len()).all(|i| self.get(i) == prefix.get(i))
    }

    /// Returns true if every field is empty.
    #[must_use]
    pub fn all_empty(&self) -> bool {
        self.fields().all(<[u8]>::is_empty)
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        let n = self.len().min(other.len());
        for i in 0..n {
            match self.get(i).cmp(other.get(i)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match Value::unpack(field) {
                Ok(v) => write!(f, "{v}")?,
                Err(_) => write!(f, "{field:02x?}")?,
            }
        }
        write!(f, "]")
    }
}

/// Assembles a record field by field.
///
/// ```rust
/// use suneido_core::record::RecordBuilder;
///
/// let rec = RecordBuilder::new().int(1).string("Acme").build();
/// assert_eq!(rec.get_int(0).unwrap(), 1);
/// assert_eq!(rec.get_string(1).unwrap(), "Acme");
/// ```
#[derive(Debug, Default, Clone)]
pub struct RecordBuilder {
    fields: Vec<Vec<u8>>,
}

impl RecordBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw packed field.
    pub fn add_raw(&mut self, field: &[u8]) -> &mut Self {
        self.fields.push(field.to_vec());
        self
    }

    /// Appends a value.
    pub fn add_value(&mut self, value: &Value) -> &mut Self {
        self.fields.push(value.pack());
        self
    }

    /// Appends an integer field.
    #[must_use]
    pub fn int(mut self, n: i64) -> Self {
        self.fields.push(pack_int(n));
        self
    }

    /// Appends a string field.
    #[must_use]
    pub fn string(mut self, s: &str) -> Self {
        self.fields.push(pack_string(s));
        self
    }

    /// Appends a boolean field.
    #[must_use]
    pub fn boolean(mut self, b: bool) -> Self {
        self.fields.push(Value::Bool(b).pack());
        self
    }

    /// Appends an empty field.
    #[must_use]
    pub fn empty(mut self) -> Self {
        self.fields.push(Vec::new());
        self
    }

    /// Packs the fields.
    #[must_use]
    pub fn build(&self) -> Record {
        let n = self.fields.len();
        let header = 2 + 4 * (n + 1);
        let total = header + self.fields.iter().map(Vec::len).sum::<usize>();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
        let mut off = header;
        buf.extend_from_slice(&(off as u32).to_le_bytes());
        for f in &self.fields {
            off += f.len();
            buf.extend_from_slice(&(off as u32).to_le_bytes());
        }
        for f in &self.fields {
            buf.extend_from_slice(f);
        }
        Record {
            data: Bytes::from(buf),
        }
    }
}
