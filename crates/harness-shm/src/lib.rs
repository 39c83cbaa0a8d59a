//! Shared-memory regions for the processor harness.
//!
//! A driver process and a processor exchange bulk payloads through two
//! System V segments: the driver writes a request at offset 0 of the input
//! segment, the processor writes its response at offset 0 of the output
//! segment. This crate owns the lifecycle of one such segment per
//! [`SharedMemoryRegion`].
//!
//! # Namespaces
//!
//! Segments are looked up in a [`Namespace`]:
//!
//! - [`Namespace::System`]: real System V segments (`shmget`/`shmat`/`shmdt`/`shmctl`).
//! - [`Namespace::InProcess`]: heap-backed segments shared between tasks of one
//!   process, keyed and numbered the same way. Used to run a driver and a
//!   processor side by side in tests.
//!
//! # Views
//!
//! All payload access goes through [`SharedMemoryRegion::view`] and
//! [`SharedMemoryRegion::view_mut`], which range-check `offset + len` against
//! the region capacity before touching the mapping.
//!
//! # Cleanup
//!
//! [`CleanupGate`] is an exactly-once latch. Two paths may race to release the
//! same regions (the foreground loop and a signal handler); whichever enters
//! the gate first does the work.
//!
//! Enable the `loom` feature to model-check the gate:
//!
//! ```text
//! cargo test -p harness-shm --features loom
//! ```

pub mod gate;
pub mod heap;
pub mod region;
pub mod sync;
mod sysv;

pub use gate::CleanupGate;
pub use heap::HeapNamespace;
pub use region::{
    Namespace, Ownership, RegionError, RegionSpec, Role, SegmentRef, SharedMemoryRegion,
};
pub use sysv::SEGMENT_MODE;
