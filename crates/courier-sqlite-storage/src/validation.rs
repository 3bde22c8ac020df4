//! Input validation constants and utilities for SQLite storage.
//!
//! These limits prevent unbounded input from causing disk and CPU exhaustion.

use crate::error::Error;

/// Maximum size for a serialized body (2 MB)
pub const MAX_BODY_JSON_SIZE: usize = 2 * 1024 * 1024;

/// Maximum length for a server GUID (128 bytes)
pub const MAX_SERVER_GUID_LENGTH: usize = 128;

/// Validate that a byte slice does not exceed the specified maximum size.
#[inline]
pub fn validate_size(data: &[u8], max_size: usize, field_name: &str) -> Result<(), Error> {
    if data.len() > max_size {
        return Err(Error::Validation {
            field_name: field_name.to_string(),
            max_size,
            actual_size: data.len(),
        });
    }
    Ok(())
}

/// Validate that a string does not exceed the specified maximum length in bytes.
///
/// Note: This validates UTF-8 byte length, not Unicode character count.
#[inline]
pub fn validate_string_length(s: &str, max_length: usize, field_name: &str) -> Result<(), Error> {
    validate_size(s.as_bytes(), max_length, field_name)
}
