//! Order-independent table checksum.
//!
//! Each row is hashed with SHA-256 over the canonical encoding of its
//! values ([`Value::encode_into`]). The 32-byte digest is split into four
//! little-endian `u64` lanes which are added, wrapping, into the running
//! total. Addition commutes, so the result does not depend on the order in
//! which rows are read, and the row count is carried alongside.

use crate::types::{Row, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Running checksum over a multiset of rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableChecksum {
    /// Rows folded in
    pub rows: u64,
    /// Lane-wise wrapping sums of the row digests
    pub lanes: [u64; 4],
}

/// SHA-256 of one row's canonical encoding
#[must_use]
pub fn row_digest(row: &[Value]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(16 * row.len() + 8);
    buf.extend_from_slice(&(row.len() as u64).to_le_bytes());
    for value in row {
        value.encode_into(&mut buf);
    }
    Sha256::digest(&buf).into()
}

impl TableChecksum {
    /// Empty checksum
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum of a set of rows
    pub fn of_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut sum = Self::new();
        for row in rows {
            sum.add_row(row);
        }
        sum
    }

    /// Fold one row in
    pub fn add_row(&mut self, row: &[Value]) {
        let digest = row_digest(row);
        for (lane, chunk) in self.lanes.iter_mut().zip(digest.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *lane = lane.wrapping_add(u64::from_le_bytes(word));
        }
        self.rows += 1;
    }

    /// Combine with a checksum computed over a disjoint set of rows
    pub fn merge(&mut self, other: &TableChecksum) {
        for (lane, o) in self.lanes.iter_mut().zip(other.lanes) {
            *lane = lane.wrapping_add(o);
        }
        self.rows += other.rows;
    }

    /// Hex rendering of the lanes
    #[must_use]
    pub fn digest_hex(&self) -> String {
        let bytes: Vec<u8> = self.lanes.iter().flat_map(|l| l.to_le_bytes()).collect();
        hex::encode(bytes)
    }
}

impl fmt::Display for TableChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rows, &self.digest_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, name: &str) -> Row {
        vec![Value::Int(id), Value::from(name)]
    }

    #[test]
    fn test_order_independent() {
        let rows = vec![row(1, "a"), row(2, "b"), row(3, "c")];
        let reversed: Vec<Row> = rows.iter().rev().cloned().collect();
        assert_eq!(TableChecksum::of_rows(&rows), TableChecksum::of_rows(&reversed));
    }

    #[test]
    fn test_detects_changed_value() {
        let a = TableChecksum::of_rows(&vec![row(1, "a"), row(2, "b")]);
        let b = TableChecksum::of_rows(&vec![row(1, "a"), row(2, "B")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_detects_duplicate_row() {
        let once = TableChecksum::of_rows(&vec![row(1, "a")]);
        let twice = TableChecksum::of_rows(&vec![row(1, "a"), row(1, "a")]);
        assert_ne!(once, twice);
        assert_eq!(twice.rows, 2);
    }

    #[test]
    fn test_encoding_is_length_prefixed() {
        // "ab" + "c" must not collide with "a" + "bc"
        let left = vec![Value::from("ab"), Value::from("c")];
        let right = vec![Value::from("a"), Value::from("bc")];
        assert_ne!(row_digest(&left), row_digest(&right));
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let rows = vec![row(1, "a"), row(2, "b"), row(3, "c"), row(4, "d")];
        let mut left = TableChecksum::of_rows(&rows[..2]);
        let right = TableChecksum::of_rows(&rows[2..]);
        left.merge(&right);
        assert_eq!(left, TableChecksum::of_rows(&rows));
    }
}
