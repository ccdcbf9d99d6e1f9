//! Byte encoding of values so they can be moved between ranks.
//!
//! One kind byte followed by the little-endian payload. Arrays carry their
//! element size and count and then the elements, gathered contiguously.

use super::{Array, Value};
use crate::{
    abi::{KIND_ARRAY, KIND_DOUBLE, KIND_FLOAT, KIND_INT, KIND_POINTER, KIND_SIZE_T},
    comm::{CommError, Communicator, Rank, Tag},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Pointers are only meaningful inside one process")]
    Pointer,
    #[error("Encoded value is truncated")]
    Truncated,
    #[error("Unknown value kind {0}")]
    UnknownKind(u8),
    #[error(transparent)]
    Comm(#[from] CommError),
}

/// # Safety
/// Array values must point to memory valid for their strided extent.
pub unsafe fn encode(value: &Value) -> Result<Vec<u8>, WireError> {
    let mut bytes = Vec::new();
    match value {
        Value::Int(v) => {
            bytes.push(KIND_INT);
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Value::SizeT(v) => {
            bytes.push(KIND_SIZE_T);
            bytes.extend_from_slice(&(*v as u64).to_le_bytes());
        }
        Value::Float(v) => {
            bytes.push(KIND_FLOAT);
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Value::Double(v) => {
            bytes.push(KIND_DOUBLE);
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Value::Pointer(_) => return Err(WireError::Pointer),
        Value::Array(array) => {
            bytes.push(KIND_ARRAY);
            bytes.extend_from_slice(&(array.type_size() as u64).to_le_bytes());
            bytes.extend_from_slice(&(array.count() as u64).to_le_bytes());
            bytes.extend_from_slice(&array.gather());
        }
    }

    Ok(bytes)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        if self.bytes.len() < N {
            return Err(WireError::Truncated);
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;

        let mut raw = [0u8; N];
        raw.copy_from_slice(head);
        Ok(raw)
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.take::<8>().map(u64::from_le_bytes)
    }
}

/// Arrays are decoded into owned storage.
pub fn decode(bytes: &[u8]) -> Result<Value, WireError> {
    let (&kind, rest) = bytes.split_first().ok_or(WireError::Truncated)?;
    let mut reader = Reader { bytes: rest };

    Ok(match kind {
        KIND_INT => Value::Int(i32::from_le_bytes(reader.take()?)),
        KIND_SIZE_T => Value::SizeT(reader.u64()? as usize),
        KIND_FLOAT => Value::Float(f32::from_le_bytes(reader.take()?)),
        KIND_DOUBLE => Value::Double(f64::from_le_bytes(reader.take()?)),
        KIND_POINTER => return Err(WireError::Pointer),
        KIND_ARRAY => {
            let type_size = reader.u64()? as usize;
            let count = reader.u64()? as usize;
            let length = type_size.checked_mul(count).ok_or(WireError::Truncated)?;
            if reader.bytes.len() != length {
                return Err(WireError::Truncated);
            }
            Value::Array(Array::from_bytes(reader.bytes.into(), type_size, count))
        }
        other => return Err(WireError::UnknownKind(other)),
    })
}

/// # Safety
/// As for [`encode`].
pub unsafe fn send_value<C: Communicator>(comm: &C, dest: Rank, tag: Tag, value: &Value) -> Result<(), WireError> {
    let bytes = encode(value)?;
    comm.send(dest, tag, &bytes)?;

    Ok(())
}

pub fn recv_value<C: Communicator>(comm: &C, source: Option<Rank>, tag: Option<Tag>) -> Result<Value, WireError> {
    let (bytes, _) = comm.recv(source, tag)?;

    decode(&bytes)
}
