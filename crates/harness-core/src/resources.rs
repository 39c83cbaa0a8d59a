use harness_shm::{CleanupGate, Ownership, Role, SharedMemoryRegion};
use parking_lot::Mutex;

use crate::{ProcessorError, ProtocolFault};

/// What a single cleanup pass released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub detached: usize,
    pub destroyed: usize,
}

/// The session's two regions plus the gate that releases them exactly once.
///
/// Shared between the foreground loop and the cancellation path. Payload
/// access and release both take the region's lock, so a release can never
/// unmap memory out from under an in-progress copy.
#[derive(Debug)]
pub struct SessionResources {
    input: Mutex<Option<SharedMemoryRegion>>,
    output: Mutex<Option<SharedMemoryRegion>>,
    gate: CleanupGate,
}

impl Default for SessionResources {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionResources {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(None),
            output: Mutex::new(None),
            gate: CleanupGate::new(),
        }
    }

    fn slot(&self, role: Role) -> &Mutex<Option<SharedMemoryRegion>> {
        match role {
            Role::Input => &self.input,
            Role::Output => &self.output,
        }
    }

    /// Hand a freshly attached region over to the session.
    ///
    /// Returns `false` if cleanup has already run; the region is then released
    /// on the spot instead of being stored.
    pub fn install(&self, mut region: SharedMemoryRegion) -> bool {
        let mut slot = self.slot(region.role()).lock();
        if self.gate.is_closed() {
            drop(slot);
            let mut report = CleanupReport::default();
            release(&mut region, &mut report);
            return false;
        }
        if let Some(mut previous) = slot.replace(region) {
            tracing::warn!(role = %previous.role(), "replacing an installed region");
            release(&mut previous, &mut CleanupReport::default());
        }
        true
    }

    /// Capacity of the installed region for `role`.
    pub fn capacity(&self, role: Role) -> Option<usize> {
        self.slot(role).lock().as_ref().map(|r| r.capacity())
    }

    /// Copy the first `len` bytes of the input region into a private buffer.
    ///
    /// `Ok(None)` means the regions were already released.
    pub fn copy_input(&self, len: usize) -> Result<Option<Vec<u8>>, ProcessorError> {
        let slot = self.input.lock();
        let Some(region) = slot.as_ref() else {
            return Ok(None);
        };
        if len > region.capacity() {
            return Err(ProcessorError::Protocol(ProtocolFault::InputTooLarge {
                len,
                capacity: region.capacity(),
            }));
        }
        Ok(Some(region.view(0, len)?.to_vec()))
    }

    /// Write `bytes` at offset 0 of the output region.
    ///
    /// `Ok(false)` means the regions were already released.
    pub fn write_output(&self, bytes: &[u8]) -> Result<bool, ProcessorError> {
        let mut slot = self.output.lock();
        let Some(region) = slot.as_mut() else {
            return Ok(false);
        };
        if bytes.len() > region.capacity() {
            return Err(ProcessorError::Protocol(ProtocolFault::OutputTooLarge {
                len: bytes.len(),
                capacity: region.capacity(),
            }));
        }
        region.view_mut(0, bytes.len())?.copy_from_slice(bytes);
        Ok(true)
    }

    /// Detach both regions and destroy the owned ones.
    ///
    /// Safe to call from several tasks at once: exactly one call does the work
    /// and gets `Some`; the rest get `None`.
    pub fn cleanup(&self) -> Option<CleanupReport> {
        if !self.gate.try_enter() {
            return None;
        }
        let mut report = CleanupReport::default();
        for role in [Role::Input, Role::Output] {
            if let Some(mut region) = self.slot(role).lock().take() {
                release(&mut region, &mut report);
            }
        }
        tracing::debug!(
            detached = report.detached,
            destroyed = report.destroyed,
            "released shared memory"
        );
        Some(report)
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.gate.is_closed()
    }
}

fn release(region: &mut SharedMemoryRegion, report: &mut CleanupReport) {
    if region.detach() {
        report.detached += 1;
    }
    if region.ownership() == Ownership::Owned {
        match region.destroy() {
            Ok(()) => report.destroyed += 1,
            Err(e) => tracing::warn!(role = %region.role(), error = %e, "failed to destroy segment"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_shm::{HeapNamespace, Namespace, RegionSpec, SegmentRef};
    use std::sync::Arc;

    fn owned(ns: &Namespace, role: Role, capacity: usize) -> SharedMemoryRegion {
        SharedMemoryRegion::create_private(ns, role, capacity).unwrap()
    }

    fn borrowed(ns: &Namespace, role: Role, id: i32) -> SharedMemoryRegion {
        SharedMemoryRegion::open(
            ns,
            RegionSpec {
                role,
                target: SegmentRef::Id(id),
                capacity: 1024,
                create: false,
                ownership: Ownership::Borrowed,
            },
        )
        .unwrap()
    }

    #[test]
    fn copy_and_write_respect_capacity() {
        let heap = HeapNamespace::new();
        let ns = Namespace::InProcess(heap);
        let resources = SessionResources::new();
        assert!(resources.install(owned(&ns, Role::Input, 8)));
        assert!(resources.install(owned(&ns, Role::Output, 4)));

        assert_eq!(resources.copy_input(8).unwrap().unwrap(), vec![0u8; 8]);
        assert!(matches!(
            resources.copy_input(9),
            Err(ProcessorError::Protocol(ProtocolFault::InputTooLarge {
                len: 9,
                capacity: 8
            }))
        ));

        assert!(resources.write_output(b"abcd").unwrap());
        assert!(matches!(
            resources.write_output(b"abcde"),
            Err(ProcessorError::Protocol(ProtocolFault::OutputTooLarge { .. }))
        ));
    }

    #[test]
    fn cleanup_runs_once_and_honours_ownership() {
        let heap = HeapNamespace::new();
        let ns = Namespace::InProcess(heap.clone());

        let driver_side = owned(&ns, Role::Input, 1024);
        let resources = SessionResources::new();
        assert!(resources.install(borrowed(&ns, Role::Input, driver_side.id())));
        let output = owned(&ns, Role::Output, 1024);
        let output_id = output.id();
        assert!(resources.install(output));

        let report = resources.cleanup().unwrap();
        assert_eq!(
            report,
            CleanupReport {
                detached: 2,
                destroyed: 1
            }
        );
        assert!(resources.cleanup().is_none());
        assert!(resources.is_cleaned_up());

        assert!(heap.contains(driver_side.id()));
        assert!(!heap.contains(output_id));
        assert_eq!(resources.copy_input(1).unwrap(), None);
        assert!(!resources.write_output(b"x").unwrap());
    }

    #[test]
    fn install_after_cleanup_releases_immediately() {
        let heap = HeapNamespace::new();
        let ns = Namespace::InProcess(heap.clone());
        let resources = SessionResources::new();
        resources.cleanup().unwrap();

        let late = owned(&ns, Role::Output, 64);
        let id = late.id();
        assert!(!resources.install(late));
        assert!(!heap.contains(id));
        assert_eq!(resources.capacity(Role::Output), None);
    }

    #[test]
    fn concurrent_cleanup_releases_each_region_once() {
        for _ in 0..32 {
            let heap = HeapNamespace::new();
            let ns = Namespace::InProcess(heap.clone());
            let resources = Arc::new(SessionResources::new());
            resources.install(owned(&ns, Role::Input, 64));
            resources.install(owned(&ns, Role::Output, 64));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let resources = resources.clone();
                    std::thread::spawn(move || resources.cleanup())
                })
                .collect();
            let reports: Vec<_> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();

            assert_eq!(reports.len(), 1);
            assert_eq!(
                reports[0],
                CleanupReport {
                    detached: 2,
                    destroyed: 2
                }
            );
            assert!(heap.is_empty());
        }
    }
}
