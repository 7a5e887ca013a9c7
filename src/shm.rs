// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory capability consumed by the ring buffer.
//
// A provider creates (sized and sealed) or opens a named object and hands back
// a mapped region. The POSIX provider lives in `platform::posix`; `HeapShm`
// keeps objects in process memory for tests and single-process pipelines.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorCode, Result};

/// Alignment every provider must guarantee for the start of a region.
pub const REGION_ALIGN: usize = 64;

/// A mapped view of a shared memory object.
pub trait MappedRegion: Send + Sync {
    /// Start of the mapping.
    fn as_ptr(&self) -> *mut u8;

    /// Size of the object as reported by the object itself (not the size the
    /// caller asked for).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name the object was created or opened under.
    fn name(&self) -> &str;

    /// Descriptor backing the mapping, where the platform has one.
    fn raw_fd(&self) -> Option<i32> {
        None
    }
}

impl std::fmt::Debug for dyn MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("name", &self.name())
            .field("len", &self.len())
            .finish()
    }
}

/// Creates, opens and removes named shared memory objects.
pub trait SharedMemoryProvider: Send + Sync {
    /// Create a new object of exactly `size` bytes, seal it against resizing
    /// and map it. Fails if the object already exists.
    fn create(&self, name: &str, size: usize) -> Result<Box<dyn MappedRegion>>;

    /// Map an existing object at its current size.
    fn open(&self, name: &str) -> Result<Box<dyn MappedRegion>>;

    /// Remove the name. Existing mappings stay valid.
    fn remove(&self, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HeapShm: process-local provider
// ---------------------------------------------------------------------------

struct HeapObject {
    ptr: *mut u8,
    layout: Layout,
}

// Safety: the buffer is plain memory; synchronisation is done by its users.
unsafe impl Send for HeapObject {}
unsafe impl Sync for HeapObject {}

impl HeapObject {
    fn alloc(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|_| Error::with_context(ErrorCode::InvalidArgument, "region size"))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::from_io(
                ErrorCode::SharedMemoryCreationFailure,
                io::Error::from(io::ErrorKind::OutOfMemory),
            ));
        }
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapObject {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

struct HeapRegion {
    object: Arc<HeapObject>,
    name: String,
}

impl MappedRegion for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.object.ptr
    }

    fn len(&self) -> usize {
        self.object.layout.size()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-process shared memory: every region opened under the same name by the
/// same `HeapShm` aliases the same buffer.
#[derive(Default)]
pub struct HeapShm {
    objects: Mutex<HashMap<String, Arc<HeapObject>>>,
}

impl HeapShm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the object behind `name` with one of `size` bytes, keeping the
    /// common prefix. Mirrors an external `ftruncate` on an unsealed object;
    /// regions opened earlier keep the old buffer.
    pub fn truncate(&self, name: &str, size: usize) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let old = objects
            .get(name)
            .ok_or(Error::with_context(ErrorCode::SharedMemoryHandleOpenFailure, "no such object"))?;
        let new = HeapObject::alloc(size)?;
        let keep = old.layout.size().min(size);
        unsafe { std::ptr::copy_nonoverlapping(old.ptr, new.ptr, keep) };
        objects.insert(name.to_owned(), Arc::new(new));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(name)
    }
}

impl SharedMemoryProvider for HeapShm {
    fn create(&self, name: &str, size: usize) -> Result<Box<dyn MappedRegion>> {
        if name.is_empty() || size == 0 {
            return Err(Error::with_context(ErrorCode::InvalidArgument, "empty name or zero size"));
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(name) {
            return Err(Error::from_io(
                ErrorCode::SharedMemoryCreationFailure,
                io::Error::from(io::ErrorKind::AlreadyExists),
            ));
        }
        let object = Arc::new(HeapObject::alloc(size)?);
        objects.insert(name.to_owned(), Arc::clone(&object));
        Ok(Box::new(HeapRegion { object, name: name.to_owned() }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn MappedRegion>> {
        let objects = self.objects.lock().unwrap();
        let object = objects.get(name).cloned().ok_or(Error::from_io(
            ErrorCode::SharedMemoryHandleOpenFailure,
            io::Error::from(io::ErrorKind::NotFound),
        ))?;
        Ok(Box::new(HeapRegion { object, name: name.to_owned() }))
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }
}
