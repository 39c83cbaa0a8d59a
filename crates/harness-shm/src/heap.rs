//! In-process segment namespace.
//!
//! Mirrors the System V model (integer keys, integer ids, create-or-attach,
//! remove-while-attached) with heap allocations, so a driver and a processor
//! can share "segments" inside one process.

use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

/// A zeroed heap allocation shared by every region attached to it.
pub(crate) struct HeapSegment {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: like a System V segment, the bytes are shared raw memory; callers
// serialize access through the request/response protocol.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

impl HeapSegment {
    fn new_zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u8;
        // SAFETY: Box::into_raw never returns null.
        let base = unsafe { NonNull::new_unchecked(raw) };
        Self { base, len }
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        // SAFETY: reconstructs the exact boxed slice leaked in new_zeroed.
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}

#[derive(Default)]
struct Table {
    next_id: i32,
    by_key: HashMap<i32, i32>,
    segments: HashMap<i32, Arc<HeapSegment>>,
}

impl Table {
    fn insert(&mut self, size: usize) -> i32 {
        self.next_id += 1;
        let id = self.next_id;
        self.segments
            .insert(id, Arc::new(HeapSegment::new_zeroed(size)));
        id
    }
}

/// Shared table of heap segments. Clones refer to the same table.
#[derive(Clone, Default)]
pub struct HeapNamespace {
    table: Arc<Mutex<Table>>,
}

impl std::fmt::Debug for HeapNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("HeapNamespace")
            .field("segments", &table.segments.len())
            .finish_non_exhaustive()
    }
}

impl HeapNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// `shmget` equivalent: resolve `key` to an id, creating it if asked.
    pub(crate) fn get(&self, key: i32, size: usize, create: bool) -> io::Result<i32> {
        let mut table = self.table.lock();
        if let Some(&id) = table.by_key.get(&key) {
            return match table.segments.get(&id) {
                Some(segment) if size <= segment.len() => Ok(id),
                _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            };
        }
        if !create {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let id = table.insert(size);
        table.by_key.insert(key, id);
        Ok(id)
    }

    pub(crate) fn create_private(&self, size: usize) -> i32 {
        self.table.lock().insert(size)
    }

    /// `shmat` equivalent.
    pub(crate) fn attach(&self, id: i32) -> io::Result<Arc<HeapSegment>> {
        self.table
            .lock()
            .segments
            .get(&id)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    /// `IPC_RMID` equivalent. Existing attachments stay valid until dropped.
    pub(crate) fn remove(&self, id: i32) -> io::Result<()> {
        let mut table = self.table.lock();
        if table.segments.remove(&id).is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        table.by_key.retain(|_, v| *v != id);
        Ok(())
    }

    /// Whether segment `id` still exists (has not been removed).
    pub fn contains(&self, id: i32) -> bool {
        self.table.lock().segments.contains_key(&id)
    }

    /// Id currently registered under `key`, if any.
    pub fn lookup(&self, key: i32) -> Option<i32> {
        self.table.lock().by_key.get(&key).copied()
    }

    /// Number of live segments.
    pub fn len(&self) -> usize {
        self.table.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
