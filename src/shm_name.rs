// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX object names for ring buffers.
// A ring called `foo` lives at `/foo`; names longer than the platform limit
// are shortened to a readable prefix plus a 64-bit FNV-1a hash of the full
// name so distinct long names stay distinct.

use crate::error::{Error, ErrorCode, Result};

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Longest POSIX object name accepted, including the leading `/`.
///
/// macOS caps `shm_open` names at `PSHMNAMLEN` (31); Linux at `NAME_MAX`.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 255;

// '_' + 16 hex digits
const HASH_SUFFIX_LEN: usize = 17;

/// Map a ring name to its POSIX object name.
///
/// Rejects empty names and names with an interior `/`, which `shm_open`
/// does not accept portably.
pub fn make_shm_name(name: &str) -> Result<String> {
    let body = name.strip_prefix('/').unwrap_or(name);
    if body.is_empty() {
        return Err(Error::with_context(ErrorCode::InvalidArgument, "empty shm name"));
    }
    if body.contains('/') || body.contains('\0') {
        return Err(Error::with_context(ErrorCode::InvalidArgument, "shm name contains '/' or NUL"));
    }

    if body.len() < SHM_NAME_MAX {
        return Ok(format!("/{body}"));
    }

    let hash = fnv1a_64(body.as_bytes());
    // Leave room for the leading '/' and the hash suffix; cut on a char
    // boundary so the prefix stays valid UTF-8.
    let mut take = SHM_NAME_MAX - 1 - HASH_SUFFIX_LEN;
    while !body.is_char_boundary(take) {
        take -= 1;
    }
    Ok(format!("/{}_{hash:016x}", &body[..take]))
}
