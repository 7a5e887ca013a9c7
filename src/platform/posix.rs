// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory provider: shm_open + ftruncate + fstat + mmap.
//
// Objects are never unlinked implicitly. A ring outlives the process that
// created it and is removed only through `SharedMemoryProvider::remove`.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{Error, ErrorCode, Result};
use crate::shm::{MappedRegion, SharedMemoryProvider};
use crate::shm_name;

/// Default object permissions: owner and group read/write.
pub const DEFAULT_PERMS: libc::mode_t = 0o660;

fn c_name(name: &str) -> Result<(String, CString)> {
    let posix_name = shm_name::make_shm_name(name)?;
    let c = CString::new(posix_name.as_bytes())
        .map_err(|_| Error::with_context(ErrorCode::InvalidArgument, "shm name contains NUL"))?;
    Ok((posix_name, c))
}

fn fstat_size(fd: i32) -> Result<usize> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(Error::from_io(
            ErrorCode::SharedMemorySizeQueryFailure,
            io::Error::last_os_error(),
        ));
    }
    usize::try_from(st.st_size)
        .map_err(|_| Error::with_context(ErrorCode::SharedMemorySizeQueryFailure, "negative object size"))
}

/// Pin the object at `size` bytes.
///
/// Where the kernel supports file seals the object is sealed against growing
/// and shrinking. Named POSIX objects on Linux are created without sealing
/// support (`EPERM`); for those, and on platforms without seals, the size is
/// re-read and must equal `size`. Every later open re-validates the size
/// against the ring header, which catches any resize that happens anyway.
fn seal(fd: i32, size: usize) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let seals = libc::F_SEAL_GROW | libc::F_SEAL_SHRINK;
        if unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, seals) } != 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EINVAL) => {}
                _ => return Err(Error::from_io(ErrorCode::SharedMemorySealFailure, err)),
            }
        }
    }
    if fstat_size(fd)? != size {
        return Err(Error::with_context(
            ErrorCode::SharedMemorySealFailure,
            "object size changed during creation",
        ));
    }
    Ok(())
}

fn map(fd: i32, size: usize) -> Result<*mut u8> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(Error::from_io(ErrorCode::SharedMemoryMapFailure, io::Error::last_os_error()));
    }
    Ok(mem as *mut u8)
}

// ---------------------------------------------------------------------------
// PosixRegion
// ---------------------------------------------------------------------------

/// A mapped POSIX shared memory object. Unmaps and closes on drop.
pub struct PosixRegion {
    mem: *mut u8,
    size: usize,
    fd: i32,
    name: String,
}

// Safety: the mapping is process-shared by design.
unsafe impl Send for PosixRegion {}
unsafe impl Sync for PosixRegion {}

impl MappedRegion for PosixRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.mem
    }

    fn len(&self) -> usize {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> Option<i32> {
        Some(self.fd)
    }
}

impl Drop for PosixRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

// ---------------------------------------------------------------------------
// PosixShm
// ---------------------------------------------------------------------------

/// Shared memory provider backed by `shm_open`.
#[derive(Debug, Clone)]
pub struct PosixShm {
    perms: libc::mode_t,
}

impl PosixShm {
    pub fn new() -> Self {
        Self { perms: DEFAULT_PERMS }
    }

    /// Use `perms` for newly created objects.
    pub fn with_permissions(perms: libc::mode_t) -> Self {
        Self { perms }
    }

    fn unlink(c_name: &CString) {
        unsafe { libc::shm_unlink(c_name.as_ptr()) };
    }
}

impl Default for PosixShm {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMemoryProvider for PosixShm {
    fn create(&self, name: &str, size: usize) -> Result<Box<dyn MappedRegion>> {
        if size == 0 {
            return Err(Error::with_context(ErrorCode::InvalidArgument, "zero-sized object"));
        }
        let len = libc::off_t::try_from(size)
            .map_err(|_| Error::with_context(ErrorCode::InvalidArgument, "object too large"))?;
        let (posix_name, c_name) = c_name(name)?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                self.perms as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(Error::from_io(
                ErrorCode::SharedMemoryCreationFailure,
                io::Error::last_os_error(),
            ));
        }
        // The umask may have stripped bits from the requested mode.
        unsafe { libc::fchmod(fd, self.perms) };

        // From here on a failure must not leave a half-built object behind.
        let result = (|| {
            if unsafe { libc::ftruncate(fd, len) } != 0 {
                return Err(Error::from_io(
                    ErrorCode::SharedMemoryCreationFailure,
                    io::Error::last_os_error(),
                ));
            }
            seal(fd, size)?;
            map(fd, size)
        })();

        match result {
            Ok(mem) => {
                tracing::debug!(name = %posix_name, size, "created shm object");
                Ok(Box::new(PosixRegion { mem, size, fd, name: posix_name }))
            }
            Err(e) => {
                tracing::error!(name = %posix_name, error = %e, "shm object creation failed");
                unsafe { libc::close(fd) };
                Self::unlink(&c_name);
                Err(e)
            }
        }
    }

    fn open(&self, name: &str) -> Result<Box<dyn MappedRegion>> {
        let (posix_name, c_name) = c_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd == -1 {
            return Err(Error::from_io(
                ErrorCode::SharedMemoryHandleOpenFailure,
                io::Error::last_os_error(),
            ));
        }

        let mapped = fstat_size(fd).and_then(|size| {
            if size == 0 {
                // Creator has not sized the object yet.
                return Err(Error::with_context(ErrorCode::NotInitialized, "object has zero size"));
            }
            map(fd, size).map(|mem| (mem, size))
        });

        match mapped {
            Ok((mem, size)) => Ok(Box::new(PosixRegion { mem, size, fd, name: posix_name })),
            Err(e) => {
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        let (_, c_name) = c_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(Error::from_io(ErrorCode::SharedMemoryHandleOpenFailure, err));
            }
        }
        Ok(())
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(prefix: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_posix_{n}_{}", std::process::id())
    }

    #[test]
    fn create_open_share_memory() {
        let shm = PosixShm::new();
        let name = unique_name("share");
        let a = shm.create(&name, 4096).unwrap();
        let b = shm.open(&name).unwrap();
        assert_eq!(b.len(), 4096);
        unsafe { *a.as_ptr().add(10) = 0x5a };
        assert_eq!(unsafe { *b.as_ptr().add(10) }, 0x5a);
        assert!(a.raw_fd().is_some());
        shm.remove(&name).unwrap();
    }

    #[test]
    fn exclusive_create() {
        let shm = PosixShm::new();
        let name = unique_name("excl");
        let _a = shm.create(&name, 128).unwrap();
        let err = shm.create(&name, 128).err().unwrap();
        assert_eq!(err.code(), ErrorCode::SharedMemoryCreationFailure);
        assert_eq!(err.os_error().map(|e| e.kind()), Some(io::ErrorKind::AlreadyExists));
        shm.remove(&name).unwrap();
    }

    #[test]
    fn open_missing_is_fatal() {
        let shm = PosixShm::new();
        let err = shm.open(&unique_name("missing")).err().unwrap();
        assert_eq!(err.code(), ErrorCode::SharedMemoryHandleOpenFailure);
        assert!(err.is_fatal());
    }

    #[test]
    fn remove_missing_is_ok() {
        PosixShm::new().remove(&unique_name("gone")).unwrap();
    }
}
