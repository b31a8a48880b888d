//! Bounded little-endian field extraction.
//!
//! All on-disk VMDK metadata is little-endian. These helpers replace the
//! open-coded `u32::from_le_bytes([data[0], data[1], ...])` blocks with
//! range-checked reads so header parsing cannot index past a short buffer.

use crate::error::{Error, Result};

fn field<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    let end = offset.checked_add(N).ok_or_else(|| {
        Error::invalid_argument(format!("field offset {} overflows", offset))
    })?;
    if end > data.len() {
        return Err(Error::invalid_argument(format!(
            "field at {}..{} exceeds buffer of {} bytes",
            offset,
            end,
            data.len()
        )));
    }
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&data[offset..end]);
    Ok(bytes)
}

/// Read a little-endian u16 at `offset`.
pub fn le_u16(data: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(field(data, offset)?))
}

/// Read a little-endian u32 at `offset`.
pub fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(field(data, offset)?))
}

/// Read a little-endian u64 at `offset`.
pub fn le_u64(data: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(field(data, offset)?))
}

/// Read a single byte at `offset`.
pub fn u8_at(data: &[u8], offset: usize) -> Result<u8> {
    Ok(field::<1>(data, offset)?[0])
}
