//! Block layout and typed payloads.
//!
//! Every block is 8-byte aligned:
//!
//! ```text
//! +-----+-------+-------------+---------+-----------+-----------+----------+
//! | tag | 0 0 0 | payload_len | payload | zero pad  | total_len | checksum |
//! | u8  |       | u32 LE      |         | to 8      | u32 LE    | u32 LE   |
//! +-----+-------+-------------+---------+-----------+-----------+----------+
//! ```
//!
//! The trailer lets a reader walk the file backwards. Only Commit blocks
//! carry a meaningful checksum; other blocks store zero.

use crate::checksum::Checksum;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::schema::{INDEXES_TABLE, TABLES_TABLE};
use crate::types::{Address, TableNum};
use bytes::Bytes;

/// Size of the tag and payload length prefix.
pub const BLOCK_HEADER_SIZE: u64 = 8;

/// Size of the total length and checksum suffix.
pub const BLOCK_TRAILER_SIZE: u64 = 8;

/// Alignment of every block.
pub const ALIGN: u64 = 8;

/// Rounds `n` up to the block alignment.
#[must_use]
pub const fn align(n: u64) -> u64 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Total on-disk size of a block with a payload of `payload_len` bytes.
#[must_use]
pub const fn block_size(payload_len: u64) -> u64 {
    BLOCK_HEADER_SIZE + align(payload_len) + BLOCK_TRAILER_SIZE
}

/// Type of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    /// A table row: `table u32 LE | record`.
    Data = 1,
    /// A transaction commit.
    Commit = 2,
    /// A startup or clean shutdown marker.
    Session = 3,
    /// A B-tree or trie node.
    Other = 4,
}

impl BlockType {
    /// Converts a byte to a block type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Commit),
            3 => Some(Self::Session),
            4 => Some(Self::Other),
            _ => None,
        }
    }

    /// Converts the block type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A block read from storage.
#[derive(Debug, Clone)]
pub struct Block {
    /// Address of the block header.
    pub adr: Address,
    /// Block type.
    pub block_type: BlockType,
    /// Payload without padding.
    pub payload: Bytes,
    /// Trailer checksum.
    pub checksum: u32,
}

impl Block {
    /// Total on-disk size including header, padding and trailer.
    #[must_use]
    pub fn size(&self) -> u64 {
        block_size(self.payload.len() as u64)
    }

    /// Address just past this block.
    #[must_use]
    pub fn end(&self) -> Address {
        Address(self.adr.0 + self.size())
    }

    /// Decodes a Data payload.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if this is not a well-formed Data block.
    pub fn data(&self) -> CoreResult<(TableNum, Record)> {
        if self.block_type != BlockType::Data {
            return Err(CoreError::corrupted(self.adr.0, "expected a data block"));
        }
        decode_data(&self.payload).map_err(|e| CoreError::corrupted(self.adr.0, e.to_string()))
    }

    /// Decodes a Commit payload.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if this is not a well-formed Commit block.
    pub fn commit(&self) -> CoreResult<CommitInfo> {
        if self.block_type != BlockType::Commit {
            return Err(CoreError::corrupted(self.adr.0, "expected a commit block"));
        }
        CommitInfo::decode(&self.payload)
            .map_err(|e| CoreError::corrupted(self.adr.0, e.to_string()))
    }

    /// Decodes a Session payload.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if this is not a well-formed Session block.
    pub fn session(&self) -> CoreResult<SessionInfo> {
        if self.block_type != BlockType::Session {
            return Err(CoreError::corrupted(self.adr.0, "expected a session block"));
        }
        SessionInfo::decode(&self.payload)
            .map_err(|e| CoreError::corrupted(self.adr.0, e.to_string()))
    }
}

/// Encodes a Data payload.
#[must_use]
pub fn encode_data(table: TableNum, record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + record.size());
    buf.extend_from_slice(&table.to_le_bytes());
    buf.extend_from_slice(record.as_bytes());
    buf
}

/// Decodes a Data payload into its table number and record.
///
/// # Errors
///
/// Returns `InvalidFormat` if the payload is too short or the record is invalid.
pub fn decode_data(payload: &Bytes) -> CoreResult<(TableNum, Record)> {
    if payload.len() < 4 {
        return Err(CoreError::invalid_format("data payload too short"));
    }
    let table = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let record = Record::from_bytes(payload.slice(4..))?;
    Ok((table, record))
}

/// Returns true if rows of `table` feed the commit checksum.
///
/// Rows of `tables` and `indexes` are excluded because recovery regenerates
/// them.
#[must_use]
pub fn feeds_checksum(table: TableNum) -> bool {
    table != TABLES_TABLE && table != INDEXES_TABLE
}

/// Feeds a Data payload into a commit checksum if its table participates.
pub fn feed_data(ck: &mut Checksum, payload: &[u8]) {
    if payload.len() < 4 {
        ck.update(payload);
        return;
    }
    let table = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if feeds_checksum(table) {
        ck.update(payload);
    }
}

/// Contents of a Commit block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitInfo {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Address of the metadata trie root after this commit.
    pub dbinfo: Address,
    /// Data blocks created by the transaction.
    pub creates: Vec<Address>,
    /// Data blocks deleted by the transaction.
    pub deletes: Vec<Address>,
}

impl CommitInfo {
    /// Encodes the commit payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(24 + 8 * (self.creates.len() + self.deletes.len()));
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.dbinfo.0.to_le_bytes());
        buf.extend_from_slice(&(self.creates.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.deletes.len() as u32).to_le_bytes());
        for adr in self.creates.iter().chain(&self.deletes) {
            buf.extend_from_slice(&adr.0.to_le_bytes());
        }
        buf
    }

    /// Decodes a commit payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the lengths do not match the payload.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        if payload.len() < 24 {
            return Err(CoreError::invalid_format("commit payload too short"));
        }
        let timestamp = read_u64(payload, 0);
        let dbinfo = Address(read_u64(payload, 8));
        let ncreates = u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]);
        let ndeletes = u32::from_le_bytes([payload[20], payload[21], payload[22], payload[23]]);
        let n = ncreates as usize + ndeletes as usize;
        if payload.len() != 24 + 8 * n {
            return Err(CoreError::invalid_format(format!(
                "commit lists {n} addresses in {} bytes",
                payload.len()
            )));
        }
        let adrs: Vec<Address> = (0..n).map(|i| Address(read_u64(payload, 24 + 8 * i))).collect();
        let (creates, deletes) = adrs.split_at(ncreates as usize);
        Ok(Self {
            timestamp,
            dbinfo,
            creates: creates.to_vec(),
            deletes: deletes.to_vec(),
        })
    }
}

/// Kind of Session marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionKind {
    /// Written when a database is opened for writing.
    Startup = 0,
    /// Written on clean close.
    Shutdown = 1,
}

/// Contents of a Session block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Startup or shutdown.
    pub kind: SessionKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl SessionInfo {
    /// Creates a marker stamped with the current time.
    #[must_use]
    pub fn now(kind: SessionKind) -> Self {
        Self {
            kind,
            timestamp: now_millis(),
        }
    }

    /// Encodes the session payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Decodes a session payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a wrong length or unknown kind.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        if payload.len() != 9 {
            return Err(CoreError::invalid_format("session payload must be 9 bytes"));
        }
        let kind = match payload[0] {
            0 => SessionKind::Startup,
            1 => SessionKind::Shutdown,
            k => {
                return Err(CoreError::invalid_format(format!(
                    "unknown session kind {k}"
                )))
            }
        };
        Ok(Self {
            kind,
            timestamp: read_u64(payload, 1),
        })
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;

    #[test]
    fn block_sizes_are_aligned() {
        assert_eq!(block_size(0), 16);
        assert_eq!(block_size(1), 24);
        assert_eq!(block_size(8), 24);
        assert_eq!(block_size(9), 32);
    }

    #[test]
    fn commit_round_trip() {
        let info = CommitInfo {
            timestamp: 1_700_000_000_000,
            dbinfo: Address(4096),
            creates: vec![Address(8), Address(40)],
            deletes: vec![Address(16)],
        };
        let decoded = CommitInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn commit_rejects_bad_counts() {
        let mut payload = CommitInfo::default().encode();
        payload[16] = 3;
        assert!(CommitInfo::decode(&payload).is_err());
    }

    #[test]
    fn data_payload() {
        let rec = RecordBuilder::new().int(1).string("a").build();
        let payload = Bytes::from(encode_data(7, &rec));
        let (table, decoded) = decode_data(&payload).unwrap();
        assert_eq!(table, 7);
        assert_eq!(decoded, rec);
    }

    #[test]
    fn system_rows_skip_checksum() {
        let rec = RecordBuilder::new().int(1).build();
        let mut ck = Checksum::new();
        feed_data(&mut ck, &encode_data(TABLES_TABLE, &rec));
        feed_data(&mut ck, &encode_data(INDEXES_TABLE, &rec));
        assert!(ck.is_empty());
        feed_data(&mut ck, &encode_data(5, &rec));
        assert!(!ck.is_empty());
    }

    #[test]
    fn session_round_trip() {
        let s = SessionInfo::now(SessionKind::Shutdown);
        assert_eq!(SessionInfo::decode(&s.encode()).unwrap(), s);
        assert!(SessionInfo::decode(&[9; 9]).is_err());
    }
}
