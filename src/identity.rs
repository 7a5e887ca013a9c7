// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lookup of the privileged daemon account.

use std::path::PathBuf;

/// Resolves the uid the trace daemon runs as, if the host has one.
pub trait DaemonIdentityResolver: Send + Sync {
    fn resolve(&self) -> Option<u32>;
}

/// Always answers with a fixed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedIdentity(pub Option<u32>);

impl DaemonIdentityResolver for FixedIdentity {
    fn resolve(&self) -> Option<u32> {
        self.0
    }
}

/// Default device node whose presence marks a typed-memory capable host.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/typedshm";

/// Default account name of the daemon.
pub const DEFAULT_DAEMON_ACCOUNT: &str = "typed_memory_daemon";

/// Resolves the daemon uid from the passwd database.
///
/// The lookup only happens when `device` exists; hosts without it have no
/// privileged daemon and resolve to `None`.
#[derive(Debug, Clone)]
pub struct PasswdIdentityResolver {
    device: PathBuf,
    account: String,
}

impl PasswdIdentityResolver {
    pub fn new(device: impl Into<PathBuf>, account: &str) -> Self {
        Self { device: device.into(), account: account.to_owned() }
    }
}

impl Default for PasswdIdentityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_PATH, DEFAULT_DAEMON_ACCOUNT)
    }
}

impl DaemonIdentityResolver for PasswdIdentityResolver {
    fn resolve(&self) -> Option<u32> {
        if let Err(e) = std::fs::metadata(&self.device) {
            tracing::debug!(device = %self.device.display(), error = %e, "no daemon device");
            return None;
        }
        lookup_uid(&self.account)
    }
}

#[cfg(unix)]
fn lookup_uid(account: &str) -> Option<u32> {
    use std::ffi::CString;

    let c_account = CString::new(account).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 1024];

    loop {
        let rc = unsafe {
            libc::getpwnam_r(c_account.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        match rc {
            0 if result.is_null() => {
                tracing::warn!(account, "daemon account not found");
                return None;
            }
            0 => return Some(pwd.pw_uid),
            libc::ERANGE if buf.len() < (1 << 20) => {
                let len = buf.len() * 2;
                buf.resize(len, 0);
            }
            errno => {
                tracing::error!(
                    account,
                    error = %std::io::Error::from_raw_os_error(errno),
                    "passwd lookup failed"
                );
                return None;
            }
        }
    }
}

#[cfg(not(unix))]
fn lookup_uid(_account: &str) -> Option<u32> {
    None
}
