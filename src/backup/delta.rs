//! Byte-range delta codec for synthetic-full construction
//!
//! Simple common-prefix/common-suffix encoding: the region between the
//! shared prefix and suffix is carried verbatim as an insert.

use serde::{Deserialize, Serialize};

/// One delta operation over byte ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DeltaOp {
    /// Copy `length` bytes from `offset` in the old data
    Copy { offset: usize, length: usize },
    /// Insert literal bytes
    Insert {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
}

/// Delta between two byte sequences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub old_size: usize,
    pub new_size: usize,
    pub operations: Vec<DeltaOp>,
}

/// Compute the delta transforming `old_data` into `new_data`.
pub fn create_delta(old_data: &[u8], new_data: &[u8]) -> Delta {
    let old_len = old_data.len();
    let new_len = new_data.len();

    let mut common_prefix = 0;
    while common_prefix < old_len.min(new_len)
        && old_data[common_prefix] == new_data[common_prefix]
    {
        common_prefix += 1;
    }

    let mut common_suffix = 0;
    while common_suffix < (old_len - common_prefix).min(new_len - common_prefix)
        && old_data[old_len - 1 - common_suffix] == new_data[new_len - 1 - common_suffix]
    {
        common_suffix += 1;
    }

    let mut operations = Vec::new();
    if common_prefix > 0 {
        operations.push(DeltaOp::Copy {
            offset: 0,
            length: common_prefix,
        });
    }

    let middle = &new_data[common_prefix..new_len - common_suffix];
    if !middle.is_empty() {
        operations.push(DeltaOp::Insert {
            data: middle.to_vec(),
        });
    }

    if common_suffix > 0 {
        operations.push(DeltaOp::Copy {
            offset: old_len - common_suffix,
            length: common_suffix,
        });
    }

    Delta {
        old_size: old_len,
        new_size: new_len,
        operations,
    }
}

/// Apply a delta to reconstruct the new data.
pub fn apply_delta(old_data: &[u8], delta: &Delta) -> Vec<u8> {
    let mut result = Vec::with_capacity(delta.new_size);

    for op in &delta.operations {
        match op {
            DeltaOp::Copy { offset, length } => {
                let end = (offset + length).min(old_data.len());
                result.extend_from_slice(&old_data[*offset..end]);
            }
            DeltaOp::Insert { data } => result.extend_from_slice(data),
        }
    }

    result
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_edit_in_middle() {
        let old = b"the quick brown fox jumps over the lazy dog";
        let new = b"the quick red fox jumps over the lazy dog";

        let delta = create_delta(old, new);
        assert_eq!(apply_delta(old, &delta), new);
    }

    #[test]
    fn test_roundtrip_identical() {
        let data = b"unchanged";
        let delta = create_delta(data, data);
        assert_eq!(apply_delta(data, &delta), data);
        // A single copy spanning the whole input.
        assert_eq!(delta.operations.len(), 1);
    }

    #[test]
    fn test_roundtrip_empty_cases() {
        let delta = create_delta(b"", b"created from nothing");
        assert_eq!(apply_delta(b"", &delta), b"created from nothing");

        let delta = create_delta(b"everything removed", b"");
        assert!(apply_delta(b"everything removed", &delta).is_empty());
    }

    #[test]
    fn test_roundtrip_append_and_prepend() {
        let old = b"core";
        let grown = b"prefix core suffix";
        let delta = create_delta(old, grown);
        assert_eq!(apply_delta(old, &delta), grown);
    }

    #[test]
    fn test_serialized_form_roundtrips() {
        let delta = create_delta(b"abc def", b"abc XYZ def");
        let json = serde_json::to_string(&delta).unwrap();
        let parsed: Delta = serde_json::from_str(&json).unwrap();
        assert_eq!(apply_delta(b"abc def", &parsed), b"abc XYZ def");
    }
}
