/*!
Block-matching binary diff over canonical state encodings.

A patch is a sequence of `Copy` (range of the base bytes) and `Insert`
(literal bytes) operations. The base is indexed in fixed-size blocks; the
target is scanned byte by byte and every block hit is extended in both
directions before it is emitted as a copy.

Computing a diff needs the `binary-diff` feature. Applying one does not, so
records written by a build that had the codec stay readable.
*/

use crate::{PersistError, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

#[cfg(feature = "binary-diff")]
use std::collections::HashMap;

/// Block size used to index the base
#[cfg(feature = "binary-diff")]
const BLOCK_SIZE: usize = 16;

const OP_COPY: u8 = 0;
const OP_INSERT: u8 = 1;

/// One patch instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    Copy { offset: usize, len: usize },
    Insert(Vec<u8>),
}

/// Binary patch carried by binary-strategy delta records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryPatch {
    /// Checksum of the canonical base encoding the patch was computed against
    pub base_checksum: String,
    /// Checksum of the canonical target encoding
    pub target_checksum: String,
    /// Length of the target encoding
    pub target_len: u64,
    /// Encoded operations
    #[serde(with = "base64_bytes")]
    pub ops: Vec<u8>,
}

impl BinaryPatch {
    /// Decode the operation stream
    pub fn operations(&self) -> Result<Vec<PatchOp>> {
        decode_ops(&self.ops)
    }
}

/// True when this build can compute binary diffs
pub fn codec_available() -> bool {
    cfg!(feature = "binary-diff")
}

/// Compute the copy/insert operations turning `old` into `new`
#[cfg(feature = "binary-diff")]
pub fn diff(old: &[u8], new: &[u8]) -> Vec<PatchOp> {
    let mut index: HashMap<&[u8], usize> = HashMap::new();
    let mut offset = 0;
    while offset + BLOCK_SIZE <= old.len() {
        index.entry(&old[offset..offset + BLOCK_SIZE]).or_insert(offset);
        offset += BLOCK_SIZE;
    }

    let mut ops = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i + BLOCK_SIZE <= new.len() {
        let Some(&hit) = index.get(&new[i..i + BLOCK_SIZE]) else {
            i += 1;
            continue;
        };

        let mut start_new = i;
        let mut start_old = hit;
        while start_new > literal_start && start_old > 0 && new[start_new - 1] == old[start_old - 1]
        {
            start_new -= 1;
            start_old -= 1;
        }

        let mut len = i + BLOCK_SIZE - start_new;
        while start_new + len < new.len()
            && start_old + len < old.len()
            && new[start_new + len] == old[start_old + len]
        {
            len += 1;
        }

        if start_new > literal_start {
            ops.push(PatchOp::Insert(new[literal_start..start_new].to_vec()));
        }
        ops.push(PatchOp::Copy {
            offset: start_old,
            len,
        });

        i = start_new + len;
        literal_start = i;
    }

    if literal_start < new.len() {
        ops.push(PatchOp::Insert(new[literal_start..].to_vec()));
    }
    ops
}

/// Rebuild the target bytes from the base and a list of operations
pub fn apply(old: &[u8], ops: &[PatchOp]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(old.len());
    for op in ops {
        match op {
            PatchOp::Copy { offset, len } => {
                let end = offset
                    .checked_add(*len)
                    .filter(|end| *end <= old.len())
                    .ok_or_else(|| {
                        PersistError::delta(format!(
                            "patch copies {len} bytes at {offset} past base of {} bytes",
                            old.len()
                        ))
                    })?;
                out.extend_from_slice(&old[*offset..end]);
            }
            PatchOp::Insert(bytes) => out.extend_from_slice(bytes),
        }
    }
    Ok(out)
}

/// Encode operations as `tag | varint fields | literal bytes`
pub fn encode_ops(ops: &[PatchOp]) -> Vec<u8> {
    let mut buf = Vec::new();
    for op in ops {
        match op {
            PatchOp::Copy { offset, len } => {
                buf.put_u8(OP_COPY);
                put_varint(&mut buf, *offset as u64);
                put_varint(&mut buf, *len as u64);
            }
            PatchOp::Insert(bytes) => {
                buf.put_u8(OP_INSERT);
                put_varint(&mut buf, bytes.len() as u64);
                buf.put_slice(bytes);
            }
        }
    }
    buf
}

/// Decode an operation stream written by [`encode_ops`]
pub fn decode_ops(mut data: &[u8]) -> Result<Vec<PatchOp>> {
    let mut ops = Vec::new();
    while data.has_remaining() {
        match data.get_u8() {
            OP_COPY => {
                let offset = get_varint(&mut data)? as usize;
                let len = get_varint(&mut data)? as usize;
                ops.push(PatchOp::Copy { offset, len });
            }
            OP_INSERT => {
                let len = get_varint(&mut data)? as usize;
                if data.remaining() < len {
                    return Err(PersistError::delta("truncated insert in binary patch"));
                }
                ops.push(PatchOp::Insert(data[..len].to_vec()));
                data.advance(len);
            }
            tag => {
                return Err(PersistError::delta(format!(
                    "unknown binary patch op tag {tag}"
                )))
            }
        }
    }
    Ok(ops)
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(data: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        if !data.has_remaining() {
            return Err(PersistError::delta("truncated varint in binary patch"));
        }
        let byte = data.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(PersistError::delta("varint overflow in binary patch"));
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
