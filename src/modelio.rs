//! Serialization of materialized nodes.
//!
//! # Record Format
//!
//! One node is written as a self-describing, big-endian record:
//!
//! ```text
//! ┌─────────────┬────────────┬────────────┬──────────────────┬──────────────────────────┐
//! │ magic (u32) │ tag (u32)  │ ndim (u32) │ [usize; ndim]    │ payload                  │
//! │ 0x00075321  │ dtype tag  │            │ extents          │ numel × dtype size bytes │
//! └─────────────┴────────────┴────────────┴──────────────────┴──────────────────────────┘
//! ```
//!
//! - element tags: `Int32 = 0`, `Int64 = 1`, `Float32 = 2`, `Float64 = 3`
//! - extents use the platform word size
//! - the payload is the flattened, row-major result in the declared type
//!
//! A file written by [`save_nodes`] is a plain concatenation of records.
//!
//! Corrupted input is not an error: [`deserialize`] logs a warning and
//! returns `None`, so callers can fall back to something else.
//!
//! # Example
//!
//! ```rust
//! use briny_graph::prelude::*;
//! use briny_graph::modelio::{deserialize, serialize};
//!
//! let mut s = Session::new();
//! let a = s.create(&[1i32, 2, 3, 4], &[2, 2]).unwrap();
//! let bytes = serialize(&mut s, a).unwrap();
//! let b = deserialize(&mut s, &bytes).unwrap();
//! assert_eq!(s.read::<i32>(b).unwrap(), vec![1, 2, 3, 4]);
//! ```

use crate::error::Result;
use crate::graph::NodeId;
use crate::graph::shape::numel;
use crate::session::Session;
use crate::tensors::{Buffer, DType, Element};
use briny::prelude::*;
use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

/// Leading word of every record.
pub const MAGIC: u32 = 0x75321;

const WORD: usize = std::mem::size_of::<usize>();

/// A decoded record that has not been checked yet.
struct PackedNode {
    shape: Vec<usize>,
    buffer: Buffer,
}

impl Validate for PackedNode {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(ValidationError);
        }
        if self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(ValidationError);
        }
        if numel(&self.shape) != self.buffer.len() {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn write_payload<T: Element>(data: &[T], out: &mut Vec<u8>) {
    for &v in data {
        v.write_be(out);
    }
}

fn read_payload<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DTYPE.size())
        .map(T::read_be)
        .collect()
}

/// Executes `id` and encodes its shape, type and result as one record.
pub fn serialize(session: &mut Session, id: NodeId) -> Result<Vec<u8>> {
    session.execute(id)?;
    let node = session.graph.node(id)?;
    let mut out = Vec::with_capacity(12 + node.shape.len() * WORD + node.numel() * node.dtype.size());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&node.dtype.tag().to_be_bytes());
    out.extend_from_slice(&(node.shape.len() as u32).to_be_bytes());
    for &d in &node.shape {
        out.extend_from_slice(&d.to_be_bytes());
    }
    match &node.result {
        Some(Buffer::Int32(v)) => write_payload(v, &mut out),
        Some(Buffer::Int64(v)) => write_payload(v, &mut out),
        Some(Buffer::Float32(v)) => write_payload(v, &mut out),
        Some(Buffer::Float64(v)) => write_payload(v, &mut out),
        None => {
            return Err(crate::error::GraphError::Backend(format!(
                "{id:?} was not materialized"
            )));
        }
    }
    Ok(out)
}

/// Splits a 4-byte big-endian word off the front of `bytes`.
fn take_u32(bytes: &mut &[u8]) -> Option<u32> {
    let (head, rest) = bytes.split_first_chunk::<4>()?;
    *bytes = rest;
    Some(u32::from_be_bytes(*head))
}

fn take_usize(bytes: &mut &[u8]) -> Option<usize> {
    let (head, rest) = bytes.split_first_chunk::<WORD>()?;
    *bytes = rest;
    Some(usize::from_be_bytes(*head))
}

/// Decodes one record from the front of `bytes`, returning it with the
/// number of bytes consumed.
fn decode(bytes: &[u8]) -> Option<(PackedNode, usize)> {
    let mut rest = bytes;
    if take_u32(&mut rest)? != MAGIC {
        log::warn!("serialized node does not start with the expected magic");
        return None;
    }
    let Some(dtype) = take_u32(&mut rest).and_then(DType::from_tag) else {
        log::warn!("serialized node has an unknown element type");
        return None;
    };
    let ndim = take_u32(&mut rest)? as usize;
    if ndim.checked_mul(WORD).is_none_or(|n| n > rest.len()) {
        log::warn!("serialized node is truncated");
        return None;
    }
    let shape: Vec<usize> = (0..ndim).map(|_| take_usize(&mut rest)).collect::<Option<_>>()?;
    let bytes_needed = shape
        .iter()
        .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
        .filter(|&n| n <= rest.len());
    let Some(payload_len) = bytes_needed else {
        log::warn!("serialized node payload is truncated");
        return None;
    };
    let payload = &rest[..payload_len];
    let buffer = match dtype {
        DType::Int32 => Buffer::Int32(read_payload(payload)),
        DType::Int64 => Buffer::Int64(read_payload(payload)),
        DType::Float32 => Buffer::Float32(read_payload(payload)),
        DType::Float64 => Buffer::Float64(read_payload(payload)),
    };
    let consumed = bytes.len() - rest.len() + payload_len;
    Some((PackedNode { shape, buffer }, consumed))
}

fn insert(session: &mut Session, packed: PackedNode) -> Option<NodeId> {
    let trusted = match TrustedData::new(packed) {
        Ok(t) => t,
        Err(_) => {
            log::warn!("serialized node failed validation");
            return None;
        }
    };
    let packed = trusted.into_inner();
    match session.create_buffer(packed.buffer, &packed.shape) {
        Ok(id) => Some(id),
        Err(err) => {
            log::warn!("could not restore serialized node: {err}");
            None
        }
    }
}

/// Restores a node written by [`serialize`] as a new store node.
///
/// Returns `None` (with a warning) on a wrong magic, unknown type tag or
/// truncated payload.
pub fn deserialize(session: &mut Session, bytes: &[u8]) -> Option<NodeId> {
    let (packed, _) = decode(bytes)?;
    insert(session, packed)
}

/// Writes the records of `nodes` back to back into `path`.
pub fn save_nodes(session: &mut Session, path: &str, nodes: &[NodeId]) -> std::result::Result<(), Box<dyn Error>> {
    let mut file = BufWriter::new(File::create(path)?);
    for &id in nodes {
        file.write_all(&serialize(session, id)?)?;
    }
    file.flush()?;
    Ok(())
}

/// Reads every record in `path` into new store nodes, in file order.
///
/// Stops at the first corrupted record and returns what was restored before it.
pub fn load_nodes(session: &mut Session, path: &str) -> std::result::Result<Vec<NodeId>, Box<dyn Error>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    let mut rest = bytes.as_slice();
    let mut nodes = Vec::new();
    while !rest.is_empty() {
        let Some((packed, used)) = decode(rest) else {
            break;
        };
        let Some(id) = insert(session, packed) else {
            break;
        };
        nodes.push(id);
        rest = &rest[used..];
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut s = Session::new();
        let a = s.create(&[7i64], &[1]).unwrap();
        let bytes = serialize(&mut s, a).unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x07, 0x53, 0x21]);
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_be_bytes());
        assert_eq!(&bytes[12..12 + WORD], &1usize.to_be_bytes());
        assert_eq!(&bytes[12 + WORD..], &7i64.to_be_bytes());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let mut s = Session::new();
        let a = s.create(&[1.0f32, 2.0], &[2]).unwrap();
        let bytes = serialize(&mut s, a).unwrap();
        assert_eq!(deserialize(&mut s, &bytes[..bytes.len() - 1]), None);
        assert_eq!(deserialize(&mut s, &bytes[..6]), None);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut s = Session::new();
        let a = s.create(&[1i32], &[1]).unwrap();
        let mut bytes = serialize(&mut s, a).unwrap();
        bytes[7] = 9;
        assert_eq!(deserialize(&mut s, &bytes), None);
    }
}
