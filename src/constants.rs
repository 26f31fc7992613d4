//! Constant pool loader, per spec §4.1 and §6.
//!
//! Parses the header section of the byte buffer (`constant_count:u8` then
//! that many tagged entries) into a `Vec<Value>` and returns the offset of
//! the first instruction byte. Any truncation or unknown tag is `Decode`.

use crate::error::{VmError, VmResult};
use crate::intern::StringInterner;
use crate::value::Value;

const CONST_INT: u8 = 0;
const CONST_NUM: u8 = 1;
const CONST_STR: u8 = 2;

pub const MAX_CONSTANTS: usize = 256;

/// Consumes the header prefix of `bytes`, interning any string constants
/// through `interner`. Returns the loaded pool and the offset of the byte
/// immediately following the header (where instructions begin).
pub fn load(bytes: &[u8], interner: &mut StringInterner) -> VmResult<(Vec<Value>, usize)> {
    let mut offset = 0usize;
    let count = read_u8(bytes, offset)? as usize;
    offset += 1;

    let mut pool = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = read_u8(bytes, offset)?;
        offset += 1;
        let value = match tag {
            CONST_INT => {
                let v = read_i32(bytes, offset)?;
                offset += 4;
                Value::Int(v)
            }
            CONST_NUM => {
                let v = read_f64(bytes, offset)?;
                offset += 8;
                Value::Num(v)
            }
            CONST_STR => {
                let len = read_u8(bytes, offset)? as usize;
                offset += 1;
                let raw = read_slice(bytes, offset, len)?;
                offset += len;
                Value::Obj(interner.intern(raw))
            }
            other => {
                return Err(VmError::decode(offset - 1, format!("unknown constant tag {}", other)))
            }
        };
        pool.push(value);
    }
    Ok((pool, offset))
}

fn read_u8(bytes: &[u8], offset: usize) -> VmResult<u8> {
    bytes
        .get(offset)
        .copied()
        .ok_or_else(|| VmError::decode(offset, "truncated buffer reading u8"))
}

fn read_slice(bytes: &[u8], offset: usize, len: usize) -> VmResult<&[u8]> {
    bytes
        .get(offset..offset + len)
        .ok_or_else(|| VmError::decode(offset, "truncated buffer reading string payload"))
}

fn read_i32(bytes: &[u8], offset: usize) -> VmResult<i32> {
    let raw = read_slice(bytes, offset, 4)?;
    let arr: [u8; 4] = raw.try_into().unwrap();
    Ok(i32::from_le_bytes(arr))
}

fn read_f64(bytes: &[u8], offset: usize) -> VmResult<f64> {
    let raw = read_slice(bytes, offset, 8)?;
    let arr: [u8; 8] = raw.try_into().unwrap();
    Ok(f64::from_le_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_mixed_constants() {
        let mut bytes = vec![3u8];
        bytes.push(CONST_INT);
        bytes.extend_from_slice(&42i32.to_le_bytes());
        bytes.push(CONST_NUM);
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        bytes.push(CONST_STR);
        bytes.push(5);
        bytes.extend_from_slice(b"hello");

        let mut interner = StringInterner::new();
        let (pool, offset) = load(&bytes, &mut interner).unwrap();
        assert_eq!(pool.len(), 3);
        assert!(matches!(pool[0], Value::Int(42)));
        assert!(matches!(pool[1], Value::Num(n) if (n - 1.5).abs() < 1e-12));
        assert_eq!(pool[2].print(), "hello");
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn truncated_buffer_is_decode_error() {
        let bytes = vec![1u8, CONST_INT, 1, 2];
        let mut interner = StringInterner::new();
        assert!(matches!(load(&bytes, &mut interner), Err(VmError::Decode { .. })));
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let bytes = vec![1u8, 9];
        let mut interner = StringInterner::new();
        assert!(matches!(load(&bytes, &mut interner), Err(VmError::Decode { .. })));
    }
}
