use std::fmt;
use std::io;
use std::sync::Arc;

use crate::heap::{HeapNamespace, HeapSegment};
use crate::sysv::{self, SysvMapping};

/// Which direction a region carries payload in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Written by the driver, read by the processor.
    Input,
    /// Written by the processor, read by the driver.
    Output,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Input => f.write_str("input"),
            Role::Output => f.write_str("output"),
        }
    }
}

/// How a segment is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRef {
    /// A well-known or negotiated key, resolved with `shmget`.
    Key(i32),
    /// A segment id handed over by the peer, attached directly.
    Id(i32),
}

/// Whether this side releases the segment back to the system at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Detach and destroy.
    Owned,
    /// Detach only; the peer destroys it.
    Borrowed,
}

/// Where segments live.
#[derive(Debug, Clone, Default)]
pub enum Namespace {
    #[default]
    System,
    InProcess(HeapNamespace),
}

/// Everything needed to open a region.
#[derive(Debug, Clone, Copy)]
pub struct RegionSpec {
    pub role: Role,
    pub target: SegmentRef,
    /// Requested size in bytes. Also used as the `shmget` size for keyed lookups.
    pub capacity: usize,
    /// Create the segment if the key does not exist yet. Ignored for [`SegmentRef::Id`].
    pub create: bool,
    pub ownership: Ownership,
}

enum Mapping {
    System(SysvMapping),
    Heap(Arc<HeapSegment>),
}

impl Mapping {
    #[inline]
    fn base(&self) -> *mut u8 {
        match self {
            Mapping::System(m) => m.base(),
            Mapping::Heap(s) => s.base(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        match self {
            Mapping::System(m) => m.len(),
            Mapping::Heap(s) => s.len(),
        }
    }
}

/// One attached shared-memory segment.
///
/// The base address is only reachable through range-checked views, and only
/// while the region is attached. [`detach`](Self::detach) is idempotent;
/// [`destroy`](Self::destroy) runs at most once and only for owned regions.
pub struct SharedMemoryRegion {
    role: Role,
    key: Option<i32>,
    id: i32,
    capacity: usize,
    ownership: Ownership,
    namespace: Namespace,
    mapping: Option<Mapping>,
    destroyed: bool,
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("role", &self.role)
            .field("key", &self.key)
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("ownership", &self.ownership)
            .field("attached", &self.is_attached())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl SharedMemoryRegion {
    /// Resolve and attach a segment according to `spec`.
    pub fn open(namespace: &Namespace, spec: RegionSpec) -> Result<Self, RegionError> {
        if spec.capacity == 0 {
            return Err(RegionError::InvalidCapacity);
        }
        let attach_err = |source| RegionError::Attach {
            role: spec.role,
            source,
        };

        let (key, id) = match spec.target {
            SegmentRef::Key(key) => {
                let id = match namespace {
                    Namespace::System => sysv::get(key, spec.capacity, spec.create),
                    Namespace::InProcess(ns) => ns.get(key, spec.capacity, spec.create),
                }
                .map_err(attach_err)?;
                (Some(key), id)
            }
            SegmentRef::Id(id) => (None, id),
        };

        let mapping = match namespace {
            Namespace::System => SysvMapping::attach(id).map(Mapping::System),
            Namespace::InProcess(ns) => ns.attach(id).map(Mapping::Heap),
        }
        .map_err(attach_err)?;

        // Never expose more than is actually mapped.
        let capacity = spec.capacity.min(mapping.len());

        tracing::debug!(
            role = %spec.role,
            ?key,
            shmid = id,
            capacity,
            "attached shared memory region"
        );

        Ok(Self {
            role: spec.role,
            key,
            id,
            capacity,
            ownership: spec.ownership,
            namespace: namespace.clone(),
            mapping: Some(mapping),
            destroyed: false,
        })
    }

    /// Create a new keyless segment and attach it. The creator owns it.
    pub fn create_private(
        namespace: &Namespace,
        role: Role,
        capacity: usize,
    ) -> Result<Self, RegionError> {
        if capacity == 0 {
            return Err(RegionError::InvalidCapacity);
        }
        let id = match namespace {
            Namespace::System => sysv::create_private(capacity).map_err(|source| {
                RegionError::Attach { role, source }
            })?,
            Namespace::InProcess(ns) => ns.create_private(capacity),
        };
        Self::open(
            namespace,
            RegionSpec {
                role,
                target: SegmentRef::Id(id),
                capacity,
                create: false,
                ownership: Ownership::Owned,
            },
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Key the segment was resolved from, if it was located by key.
    pub fn key(&self) -> Option<i32> {
        self.key
    }

    /// System-wide segment id.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_attached(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<&Mapping, RegionError> {
        let mapping = self.mapping.as_ref().ok_or(RegionError::Detached)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(mapping),
            _ => Err(RegionError::Range {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }

    /// Read-only view of `[offset, offset + len)`.
    pub fn view(&self, offset: usize, len: usize) -> Result<&[u8], RegionError> {
        let mapping = self.check_range(offset, len)?;
        // SAFETY: range checked against capacity, which never exceeds the
        // mapped length; the mapping lives as long as &self.
        Ok(unsafe { std::slice::from_raw_parts(mapping.base().add(offset), len) })
    }

    /// Writable view of `[offset, offset + len)`.
    pub fn view_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], RegionError> {
        let mapping = self.check_range(offset, len)?;
        // SAFETY: as in view; &mut self guarantees no other view from this region.
        Ok(unsafe { std::slice::from_raw_parts_mut(mapping.base().add(offset), len) })
    }

    /// Unmap the region. Returns `true` if this call did the unmapping.
    pub fn detach(&mut self) -> bool {
        match self.mapping.take() {
            Some(mapping) => {
                drop(mapping);
                tracing::debug!(role = %self.role, shmid = self.id, "detached region");
                true
            }
            None => false,
        }
    }

    /// Release the segment back to the system. Owned regions only.
    ///
    /// Detaches first if still attached. A second call is a no-op.
    pub fn destroy(&mut self) -> Result<(), RegionError> {
        if self.ownership != Ownership::Owned {
            return Err(RegionError::NotOwner);
        }
        if self.destroyed {
            return Ok(());
        }
        self.detach();
        match &self.namespace {
            Namespace::System => sysv::remove(self.id),
            Namespace::InProcess(ns) => ns.remove(self.id),
        }
        .map_err(RegionError::Destroy)?;
        self.destroyed = true;
        tracing::debug!(role = %self.role, shmid = self.id, "destroyed segment");
        Ok(())
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Errors from region operations.
#[derive(Debug)]
pub enum RegionError {
    /// The platform refused to create, look up or attach the segment.
    Attach { role: Role, source: io::Error },
    /// A view fell outside the region.
    Range {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    /// The region has already been detached.
    Detached,
    /// Only the owning side may destroy a segment.
    NotOwner,
    /// Removing the segment failed.
    Destroy(io::Error),
    /// Zero-sized regions are not allowed.
    InvalidCapacity,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attach { role, source } => {
                write!(f, "failed to attach {} shared memory: {}", role, source)
            }
            Self::Range {
                offset,
                len,
                capacity,
            } => write!(
                f,
                "range {}..{} out of bounds for region of {} bytes",
                offset,
                offset.saturating_add(*len),
                capacity
            ),
            Self::Detached => write!(f, "region is detached"),
            Self::NotOwner => write!(f, "region is not owned by this process"),
            Self::Destroy(e) => write!(f, "failed to destroy segment: {}", e),
            Self::InvalidCapacity => write!(f, "region capacity must be non-zero"),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Attach { source, .. } => Some(source),
            Self::Destroy(e) => Some(e),
            _ => None,
        }
    }
}
