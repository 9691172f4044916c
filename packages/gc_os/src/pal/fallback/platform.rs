use std::alloc::{self, Layout};
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use tracing::debug;

use crate::pal::{
    ALLOCATION_GRANULARITY, ContainerMemoryLimits, CpuidRegisters, GroupInfo, Platform,
    ProcessAffinity, SystemInfo, SystemMemoryStatus, WriteWatchReport,
};
use crate::{AffinityMask, NodeIndex, ProcessorIndex, ProcessorNumber, ThreadAffinity};

const PAGE_SIZE: usize = 4096;

/// We cannot ask the operating system, so we assume a machine that constrains nothing.
const ASSUMED_PHYSICAL_MEMORY: u64 = 16 << 30;

#[cfg(target_pointer_width = "64")]
const ASSUMED_ADDRESS_SPACE: u64 = 1 << 47;
#[cfg(not(target_pointer_width = "64"))]
const ASSUMED_ADDRESS_SPACE: u64 = 2 << 30;

/// Singleton instance of `BuildTargetPlatform`, used by public API types
/// to hook up to the correct PAL implementation.
pub(crate) static BUILD_TARGET_PLATFORM: BuildTargetPlatform = BuildTargetPlatform::new();

/// Fallback platform implementation for operating systems without native support.
///
/// This implementation provides graceful degradation on unsupported platforms by:
/// - Using `std::thread::available_parallelism()` to determine processor count
/// - Presenting all processors as one group without NUMA nodes
/// - Backing "reserved" address ranges with zeroed heap allocations
/// - Tracking committed pages itself, as there is no operating system to ask
/// - Reporting write-watch as unsupported
#[derive(Debug)]
pub(crate) struct BuildTargetPlatform {
    processor_count: OnceLock<u32>,

    // Base address -> layout of the heap allocation backing each reservation.
    reservations: Mutex<BTreeMap<usize, Layout>>,

    // Addresses of committed pages.
    committed_pages: Mutex<BTreeSet<usize>>,
}

impl Platform for BuildTargetPlatform {
    fn system_info(&self) -> SystemInfo {
        SystemInfo {
            page_size: PAGE_SIZE,
            allocation_granularity: ALLOCATION_GRANULARITY,
            processor_count: self.processor_count(),
        }
    }

    fn processor_groups(&self) -> Option<Vec<GroupInfo>> {
        None
    }

    fn process_affinity(&self) -> Option<ProcessAffinity> {
        let all = AffinityMask::first_n(self.processor_count() as usize);

        Some(ProcessAffinity {
            process: all,
            system: all,
        })
    }

    fn numa_highest_node_number(&self) -> Option<NodeIndex> {
        None
    }

    fn processor_node(&self, _processor: ProcessorNumber) -> Option<NodeIndex> {
        None
    }

    fn current_processor_number(&self) -> Option<ProcessorIndex> {
        None
    }

    fn set_current_thread_affinity(&self, _affinity: ThreadAffinity) -> bool {
        false
    }

    fn container_memory_limits(&self) -> Option<ContainerMemoryLimits> {
        None
    }

    fn memory_status(&self) -> SystemMemoryStatus {
        SystemMemoryStatus {
            load_percent: 0,
            total_physical: ASSUMED_PHYSICAL_MEMORY,
            available_physical: ASSUMED_PHYSICAL_MEMORY,
            total_virtual: ASSUMED_ADDRESS_SPACE,
            available_virtual: ASSUMED_ADDRESS_SPACE,
            available_page_file: ASSUMED_PHYSICAL_MEMORY,
        }
    }

    fn process_working_set(&self) -> Option<u64> {
        None
    }

    fn cpuid(&self, _leaf: u32) -> Option<CpuidRegisters> {
        None
    }

    fn os_cache_sizes(&self) -> Vec<u64> {
        Vec::new()
    }

    fn supports_write_watch(&self) -> bool {
        false
    }

    fn reserve(&self, size: usize, write_watch: bool) -> Option<NonNull<u8>> {
        if size == 0 || write_watch {
            return None;
        }

        let layout = Layout::from_size_align(
            size.checked_next_multiple_of(PAGE_SIZE)?,
            ALLOCATION_GRANULARITY,
        )
        .ok()?;

        // SAFETY: The layout has a nonzero size.
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;

        lock(&self.reservations).insert(base.addr().get(), layout);

        Some(base)
    }

    unsafe fn commit(&self, address: NonNull<u8>, size: usize, _node: Option<NodeIndex>) -> bool {
        lock(&self.committed_pages).extend(pages_of(address, size));
        true
    }

    unsafe fn decommit(&self, address: NonNull<u8>, size: usize) -> bool {
        let mut committed = lock(&self.committed_pages);

        for page in pages_of(address, size) {
            committed.remove(&page);
        }

        // Decommitted memory reads as zero once committed again.
        // SAFETY: The caller guarantees the range is inside one of our reservations.
        unsafe {
            ptr::write_bytes(address.as_ptr(), 0, size);
        }

        true
    }

    #[cfg_attr(test, mutants::skip)] // A reset has no observable effect here.
    unsafe fn reset(&self, _address: NonNull<u8>, _size: usize, _unlock: bool) -> bool {
        // The contents may be kept, which is all a reset promises.
        true
    }

    unsafe fn release(&self, address: NonNull<u8>, size: usize) -> bool {
        let Some(layout) = lock(&self.reservations).remove(&address.addr().get()) else {
            debug!(address = address.addr().get(), size, "release of unknown reservation");
            return false;
        };

        let mut committed = lock(&self.committed_pages);

        for page in pages_of(address, layout.size()) {
            committed.remove(&page);
        }

        // SAFETY: The pointer came from `alloc_zeroed()` with this layout.
        unsafe {
            alloc::dealloc(address.as_ptr(), layout);
        }

        true
    }

    fn is_range_committed(&self, address: NonNull<u8>, size: usize) -> bool {
        let start = address.addr().get();
        let end = start.saturating_add(size);

        lock(&self.committed_pages).range(start..end).next().is_some()
    }

    fn reset_write_watch(&self, _address: NonNull<u8>, _size: usize) -> bool {
        false
    }

    fn get_write_watch(
        &self,
        _reset: bool,
        _address: NonNull<u8>,
        _size: usize,
    ) -> Option<WriteWatchReport> {
        None
    }
}

impl BuildTargetPlatform {
    pub(crate) const fn new() -> Self {
        Self {
            processor_count: OnceLock::new(),
            reservations: Mutex::new(BTreeMap::new()),
            committed_pages: Mutex::new(BTreeSet::new()),
        }
    }

    #[cfg_attr(test, mutants::skip)] // The real processor count is not predictable in tests.
    fn processor_count(&self) -> u32 {
        *self.processor_count.get_or_init(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .ok()
                .and_then(|count| u32::try_from(count).ok())
                .unwrap_or(1)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The data stays consistent even if a holder panicked.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start addresses of the pages that overlap the range.
fn pages_of(address: NonNull<u8>, size: usize) -> impl Iterator<Item = usize> {
    let start = address.addr().get();
    let first_page = start.checked_div(PAGE_SIZE).unwrap_or_default();
    let end = start.saturating_add(size);

    (first_page.saturating_mul(PAGE_SIZE)..end).step_by(PAGE_SIZE)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn single_group_without_numa() {
        let platform = BuildTargetPlatform::new();

        assert!(platform.processor_groups().is_none());
        assert!(platform.numa_highest_node_number().is_none());
        assert!(platform.system_info().processor_count >= 1);

        let affinity = platform.process_affinity().unwrap();
        assert_eq!(affinity.process, affinity.system);
        assert_eq!(affinity.process.count(), platform.system_info().processor_count);
    }

    #[test]
    fn write_watch_is_unsupported() {
        let platform = BuildTargetPlatform::new();

        assert!(!platform.supports_write_watch());
        assert!(platform.reserve(ALLOCATION_GRANULARITY, true).is_none());
    }

    #[test]
    fn lifecycle_tracks_committed_pages() {
        let platform = BuildTargetPlatform::new();

        let base = platform.reserve(ALLOCATION_GRANULARITY, false).unwrap();
        assert_eq!(base.addr().get() % ALLOCATION_GRANULARITY, 0);
        assert!(!platform.is_range_committed(base, ALLOCATION_GRANULARITY));

        // SAFETY: We own the reservation.
        unsafe {
            assert!(platform.commit(base, PAGE_SIZE, None));
        }
        assert!(platform.is_range_committed(base, ALLOCATION_GRANULARITY));

        // SAFETY: The first page is committed.
        unsafe {
            base.as_ptr().write(42);
        }

        // SAFETY: We own the reservation and do not access it until we commit again.
        unsafe {
            assert!(platform.decommit(base, PAGE_SIZE));
        }
        assert!(!platform.is_range_committed(base, ALLOCATION_GRANULARITY));

        // SAFETY: We own the reservation.
        unsafe {
            assert!(platform.commit(base, PAGE_SIZE, None));
        }

        // SAFETY: The first page is committed.
        assert_eq!(unsafe { base.as_ptr().read() }, 0);

        // SAFETY: We own the reservation.
        unsafe {
            assert!(platform.decommit(base, PAGE_SIZE));
            assert!(platform.release(base, ALLOCATION_GRANULARITY));
        }
    }

    #[test]
    fn release_of_unknown_range_fails() {
        let platform = BuildTargetPlatform::new();

        let base = NonNull::<u8>::dangling();

        // SAFETY: The platform does not touch unknown ranges.
        assert!(!unsafe { platform.release(base, PAGE_SIZE) });
    }
}
