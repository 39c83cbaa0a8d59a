//! Thin wrappers over the System V shared-memory calls.

use std::io;
use std::ptr::{self, NonNull};

/// Permission bits for segments we create: read/write for everyone, so the
/// peer process can attach regardless of which side created the segment.
pub const SEGMENT_MODE: u32 = 0o666;

/// Look up (and optionally create) the segment for `key`, returning its id.
pub(crate) fn get(key: i32, size: usize, create: bool) -> io::Result<i32> {
    let mut flags = SEGMENT_MODE as libc::c_int;
    if create {
        flags |= libc::IPC_CREAT;
    }
    // SAFETY: shmget takes plain integers and reports failure via -1.
    let id = unsafe { libc::shmget(key as libc::key_t, size, flags) };
    if id == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

/// Create a fresh segment with no key; the id is the only way to reach it.
pub(crate) fn create_private(size: usize) -> io::Result<i32> {
    let flags = SEGMENT_MODE as libc::c_int | libc::IPC_CREAT | libc::IPC_EXCL;
    // SAFETY: as above.
    let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, flags) };
    if id == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

/// Size in bytes of the segment `id`, as recorded by the kernel.
fn segment_size(id: i32) -> io::Result<usize> {
    // SAFETY: shmid_ds is plain old data; IPC_STAT fills it in.
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ds.shm_segsz as usize)
}

/// Mark segment `id` for removal. The kernel frees it once the last process detaches.
pub(crate) fn remove(id: i32) -> io::Result<()> {
    // SAFETY: IPC_RMID ignores the buffer argument.
    let rc = unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A live `shmat` attachment. Dropping it calls `shmdt`.
pub(crate) struct SysvMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory; synchronization of its contents is the
// protocol's job (strict request/response alternation with the driver).
unsafe impl Send for SysvMapping {}

impl SysvMapping {
    pub(crate) fn attach(id: i32) -> io::Result<Self> {
        let len = segment_size(id)?;

        // SAFETY: a null address lets the kernel pick the placement.
        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(io::Error::last_os_error());
        }

        let base = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("shmat returned a null address"))?;

        Ok(Self { base, len })
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

impl Drop for SysvMapping {
    fn drop(&mut self) {
        // SAFETY: base came from a successful shmat and is detached only here.
        let rc = unsafe { libc::shmdt(self.base.as_ptr() as *const libc::c_void) };
        if rc == -1 {
            tracing::warn!(error = %io::Error::last_os_error(), "shmdt failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_segment_attach_and_remove() {
        let id = create_private(4096).unwrap();
        let mapping = SysvMapping::attach(id).unwrap();
        assert!(mapping.len() >= 4096);

        // SAFETY: the mapping is at least 4096 bytes long.
        unsafe {
            mapping.base().write(0xAB);
            assert_eq!(mapping.base().read(), 0xAB);
        }

        remove(id).unwrap();
        drop(mapping);

        assert!(SysvMapping::attach(id).is_err());
    }

    #[test]
    fn missing_key_without_create_fails() {
        // Keys this large are vanishingly unlikely to be in use.
        let err = get(0x7A5E_0F1D, 4096, false).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
