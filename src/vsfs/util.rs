use super::{Error, Result, NAME_LEN};
use std::time::{self, SystemTime};

pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Encodes `name` into a fixed-width, NUL-terminated directory entry field.
/// Longer names keep their first `NAME_LEN - 1` bytes.
pub fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut field = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_LEN - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

pub fn decode_name(field: &[u8; NAME_LEN]) -> String {
    let len = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&field[..len]).into_owned()
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') || name.contains('/') {
        return Err(Error::InvalidName(name.to_string()));
    }

    Ok(())
}
