#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;
use std::ptr::NonNull;

use crate::{AffinityMask, NodeIndex, ProcessorIndex, ProcessorNumber, ThreadAffinity};

/// Basic facts about the system that every platform can provide.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SystemInfo {
    /// Size of a virtual memory page in bytes.
    pub(crate) page_size: usize,

    /// Granularity (and alignment) of address space reservations in bytes.
    pub(crate) allocation_granularity: usize,

    /// Number of logical processors that are currently online, across all groups.
    pub(crate) processor_count: u32,
}

/// One processor group as reported by the operating system.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct GroupInfo {
    pub(crate) active_count: u32,
    pub(crate) active_mask: u64,
}

/// The affinity masks that decide which processors the process may run on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ProcessAffinity {
    pub(crate) process: AffinityMask,
    pub(crate) system: AffinityMask,
}

/// Memory quotas imposed on the process by a container, job object or resource limit.
///
/// `None` means the quota is not set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ContainerMemoryLimits {
    /// Limit on the total memory used by the job or container the process is part of.
    pub(crate) job: Option<u64>,

    /// Limit on the memory committed by this process alone.
    pub(crate) process: Option<u64>,

    /// Limit on the resident set (working set) of the process.
    pub(crate) working_set: Option<u64>,
}

/// A snapshot of system-wide memory usage, ignoring any quotas.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct SystemMemoryStatus {
    pub(crate) load_percent: u32,
    pub(crate) total_physical: u64,
    pub(crate) available_physical: u64,
    pub(crate) total_virtual: u64,
    pub(crate) available_virtual: u64,
    pub(crate) available_page_file: u64,
}

/// `part` as a percentage of `whole`, rounded down and capped at 100. Zero if `whole` is zero.
pub(crate) fn percent_of(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }

    let percent = u128::from(part).saturating_mul(100) / u128::from(whole);

    u32::try_from(percent.min(100)).unwrap_or(100)
}

/// Raw register values returned by the processor identification instruction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CpuidRegisters {
    pub(crate) eax: u32,
    pub(crate) ebx: u32,
    pub(crate) ecx: u32,
    pub(crate) edx: u32,
}

/// Result of a write-watch query.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct WriteWatchReport {
    /// Addresses of the written pages, in ascending order.
    pub(crate) pages: Vec<usize>,

    /// Size of the unit that the operating system tracks writes in.
    pub(crate) granularity: usize,
}

/// Everything the rest of the package needs from the operating system.
///
/// Each platform provides one implementation of this trait. Methods that can legitimately fail on
/// some systems return `Option` or `bool` and callers degrade gracefully when they do.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Platform: Debug + Send + Sync + 'static {
    fn system_info(&self) -> SystemInfo;

    /// All processor groups, or `None` if the operating system has no such concept.
    fn processor_groups(&self) -> Option<Vec<GroupInfo>>;

    fn process_affinity(&self) -> Option<ProcessAffinity>;

    /// The highest NUMA node number, or `None` if NUMA information is unavailable.
    fn numa_highest_node_number(&self) -> Option<NodeIndex>;

    fn processor_node(&self, processor: ProcessorNumber) -> Option<NodeIndex>;

    /// The global index of the processor executing the calling thread.
    fn current_processor_number(&self) -> Option<ProcessorIndex>;

    fn set_current_thread_affinity(&self, affinity: ThreadAffinity) -> bool;

    /// Quotas imposed on the process, or `None` if the platform cannot tell.
    fn container_memory_limits(&self) -> Option<ContainerMemoryLimits>;

    fn memory_status(&self) -> SystemMemoryStatus;

    /// Physical memory currently resident for the process.
    fn process_working_set(&self) -> Option<u64>;

    /// Executes the processor identification instruction, if the architecture has one.
    fn cpuid(&self, leaf: u32) -> Option<CpuidRegisters>;

    /// Sizes in bytes of every processor cache the operating system reports.
    fn os_cache_sizes(&self) -> Vec<u64>;

    fn supports_write_watch(&self) -> bool;

    /// Reserves address space without backing it with memory. The result is aligned to the
    /// allocation granularity.
    fn reserve(&self, size: usize, write_watch: bool) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// The range must lie within a reservation made by this platform. Any existing contents of
    /// the range remain intact.
    unsafe fn commit(&self, address: NonNull<u8>, size: usize, node: Option<NodeIndex>) -> bool;

    /// # Safety
    ///
    /// The range must lie within a reservation made by this platform. The caller must not
    /// access the range until it is committed again.
    unsafe fn decommit(&self, address: NonNull<u8>, size: usize) -> bool;

    /// # Safety
    ///
    /// The range must lie within committed memory of a reservation made by this platform. The
    /// caller must treat the contents of the range as undefined afterwards.
    unsafe fn reset(&self, address: NonNull<u8>, size: usize, unlock: bool) -> bool;

    /// # Safety
    ///
    /// The range must be an entire reservation made by this platform. The caller must not
    /// access the range afterwards.
    unsafe fn release(&self, address: NonNull<u8>, size: usize) -> bool;

    /// Whether any page in the range is currently accessible.
    fn is_range_committed(&self, address: NonNull<u8>, size: usize) -> bool;

    fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> bool;

    fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
    ) -> Option<WriteWatchReport>;
}
