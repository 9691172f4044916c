use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::cache::CacheSize;
use crate::capabilities::Capabilities;
use crate::memory_budget::MemoryBudgetCell;
use crate::numa::NumaDirectory;
use crate::pal::{Platform, PlatformFacade, SystemInfo};
use crate::time::{Clock, PERFORMANCE_FREQUENCY};
use crate::{
    MemoryBudget, MemoryStatus, NodeIndex, OsConfig, PhysicalMemoryLimit, ProcessorIndex,
    ProcessorNumber, ProcessorTopology, ReserveFlags, ThreadAffinity,
};

/// The interface created from the process environment, initialized on first access.
static CURRENT: OnceLock<OsInterface> = OnceLock::new();

/// The operating system, as seen by a garbage collector.
///
/// Creating an instance detects the processor topology and the optional operating system
/// capabilities. Everything else (memory budget, cache size) is computed on first use and
/// cached for the lifetime of the instance. Clones share all of this state.
///
/// Most code should use the process-wide instance returned by [`current()`][Self::current].
///
/// # Example
///
/// ```rust
/// use gc_os::{OsInterface, ReserveFlags};
///
/// let os = OsInterface::current();
/// let size = os.allocation_granularity();
///
/// let base = os
///     .virtual_reserve(size, size, ReserveFlags::new())
///     .expect("out of address space");
///
/// // SAFETY: We own the reservation and access nothing outside it.
/// unsafe {
///     assert!(os.virtual_commit(base, size, None));
///     base.as_ptr().write(42);
///     assert!(os.virtual_decommit(base, size));
///     assert!(os.virtual_release(base, size));
/// }
/// ```
#[derive(Clone, Debug)]
pub struct OsInterface {
    inner: Arc<OsInterfaceInner>,
}

#[derive(Debug)]
struct OsInterfaceInner {
    platform: PlatformFacade,
    config: OsConfig,
    system_info: SystemInfo,
    topology: ProcessorTopology,
    numa: NumaDirectory,
    capabilities: Capabilities,
    memory_budget: MemoryBudgetCell,
    cache_size: OnceLock<CacheSize>,
    process_cpu_count: OnceLock<u32>,
    clock: Clock,
}

impl OsInterface {
    /// The process-wide instance, configured from the environment.
    ///
    /// An invalid configuration is logged and replaced by the default configuration.
    #[must_use]
    pub fn current() -> &'static Self {
        CURRENT.get_or_init(|| {
            let config = OsConfig::from_env().unwrap_or_else(|e| {
                warn!(error = %e, "ignoring invalid configuration");
                OsConfig::default()
            });

            Self::new(config)
        })
    }

    /// Creates an independent instance with the given configuration.
    #[must_use]
    pub fn new(config: OsConfig) -> Self {
        Self::from_platform(PlatformFacade::target(), config)
    }

    pub(crate) fn from_platform(platform: PlatformFacade, config: OsConfig) -> Self {
        let system_info = platform.system_info();
        let numa = NumaDirectory::discover(&platform, &config);
        let topology = ProcessorTopology::discover(&platform, &config, numa.is_enabled());
        let capabilities = Capabilities::detect(&platform, &topology, &numa);

        debug!(
            ?config,
            page_size = system_info.page_size,
            allocation_granularity = system_info.allocation_granularity,
            total_processor_count = topology.total_processor_count(),
            "operating system interface created"
        );

        Self {
            inner: Arc::new(OsInterfaceInner {
                platform,
                config,
                system_info,
                topology,
                numa,
                capabilities,
                memory_budget: MemoryBudgetCell::new(),
                cache_size: OnceLock::new(),
                process_cpu_count: OnceLock::new(),
                clock: Clock::new(),
            }),
        }
    }

    /// The configuration the instance was created with.
    #[must_use]
    pub fn config(&self) -> OsConfig {
        self.inner.config
    }

    fn platform(&self) -> &PlatformFacade {
        &self.inner.platform
    }

    /// The processors of the machine and how they are grouped.
    #[must_use]
    pub fn topology(&self) -> &ProcessorTopology {
        &self.inner.topology
    }

    /// Number of processors across all groups that are in use.
    #[must_use]
    pub fn total_processor_count(&self) -> u32 {
        self.inner.topology.total_processor_count()
    }

    /// Number of processors the process is allowed to run on.
    ///
    /// Computed once. Falls back to [`total_processor_count()`][1] if the affinity of the
    /// process cannot be determined.
    ///
    /// [1]: Self::total_processor_count
    #[must_use]
    pub fn current_process_cpu_count(&self) -> u32 {
        *self.inner.process_cpu_count.get_or_init(|| {
            let count = self
                .platform()
                .process_affinity()
                .map(|affinity| affinity.process.intersection(&affinity.system).count())
                .filter(|&count| count > 0)
                .unwrap_or_else(|| self.total_processor_count());

            debug!(count, "process processor count determined");

            count
        })
    }

    /// Whether [`current_processor_number()`][Self::current_processor_number] works here.
    #[must_use]
    pub fn can_get_current_processor_number(&self) -> bool {
        self.inner.capabilities.current_processor_number
    }

    /// The global index of the processor executing the calling thread.
    ///
    /// The answer may be stale by the time the caller looks at it. Returns `None` if the
    /// operating system cannot tell.
    #[must_use]
    pub fn current_processor_number(&self) -> Option<ProcessorIndex> {
        self.platform().current_processor_number()
    }

    /// Pins the calling thread to the processor named by `affinity`.
    ///
    /// Returns `false` if the request names no processor or the operating system refuses.
    pub fn set_current_thread_affinity(&self, affinity: ThreadAffinity) -> bool {
        if affinity.processor_index().is_none() {
            return false;
        }

        self.platform().set_current_thread_affinity(affinity)
    }

    /// Translates a global processor index into a group-relative processor number.
    ///
    /// The index must be less than [`total_processor_count()`][Self::total_processor_count].
    #[must_use]
    pub fn group_for_processor(&self, processor: ProcessorIndex) -> Option<ProcessorNumber> {
        debug_assert!(
            processor < self.total_processor_count(),
            "processor {processor} is outside the topology"
        );

        self.inner.topology.group_for_processor(processor)
    }

    /// Whether threads may be distributed across multiple processor groups.
    #[must_use]
    pub fn can_enable_cpu_groups(&self) -> bool {
        self.inner.capabilities.cpu_groups
    }

    /// Whether the process was limited to a single processor when the instance was created.
    #[must_use]
    pub fn had_single_processor_at_startup(&self) -> bool {
        self.inner.topology.single_processor_at_startup()
    }

    /// Whether NUMA-aware behavior is enabled.
    ///
    /// Must be checked before calling [`processor_node()`][Self::processor_node] or committing
    /// memory on a preferred node.
    #[must_use]
    pub fn can_enable_numa_aware(&self) -> bool {
        self.inner.capabilities.numa_aware
    }

    /// The highest NUMA node number, or zero if NUMA awareness is not enabled.
    #[must_use]
    pub fn highest_numa_node(&self) -> NodeIndex {
        if self.can_enable_numa_aware() {
            self.inner.numa.highest_node()
        } else {
            0
        }
    }

    /// The NUMA node of a processor, or `None` if the operating system does not know.
    ///
    /// Only legal if [`can_enable_numa_aware()`][Self::can_enable_numa_aware] is `true`.
    /// Debug builds panic otherwise.
    #[must_use]
    pub fn processor_node(&self, processor: ProcessorNumber) -> Option<NodeIndex> {
        self.inner.numa.processor_node(self.platform(), processor)
    }

    /// The resolved memory budget of the process.
    #[must_use]
    pub fn memory_budget(&self) -> MemoryBudget {
        self.inner.memory_budget.get_or_resolve(self.platform())
    }

    /// The amount of physical memory the process may use.
    ///
    /// The limit is resolved once and never changes afterwards.
    #[must_use]
    pub fn physical_memory_limit(&self) -> PhysicalMemoryLimit {
        match self.memory_budget().restricted_limit() {
            Some(bytes) => PhysicalMemoryLimit::restricted(bytes),
            None => {
                PhysicalMemoryLimit::unrestricted(self.platform().memory_status().total_physical)
            }
        }
    }

    /// Current memory usage, measured against the limit that applies to the process.
    #[must_use]
    pub fn memory_status(&self) -> MemoryStatus {
        MemoryStatus::measure(self.memory_budget(), self.platform())
    }

    /// Bytes of virtual address space that are still available to the process.
    #[must_use]
    pub fn virtual_memory_limit(&self) -> u64 {
        self.platform().memory_status().available_virtual
    }

    /// The size of the largest processor cache, in bytes.
    ///
    /// With `true_size`, returns the actual size. Otherwise returns the size that generation
    /// budgets should be derived from, which is a multiple of the actual size on some
    /// processors. Zero if the size cannot be determined.
    #[must_use]
    pub fn cache_size_per_logical_processor(&self, true_size: bool) -> u64 {
        let size = self
            .inner
            .cache_size
            .get_or_init(|| CacheSize::detect(self.platform(), self.inner.capabilities.cpu_vendor));

        if true_size {
            size.true_size
        } else {
            size.scaled_size
        }
    }

    /// A high resolution monotonic timestamp, in ticks of
    /// [`query_performance_frequency()`][Self::query_performance_frequency].
    #[must_use]
    pub fn query_performance_counter(&self) -> u64 {
        self.inner.clock.performance_counter()
    }

    /// Ticks per second of [`query_performance_counter()`][Self::query_performance_counter].
    #[must_use]
    pub fn query_performance_frequency(&self) -> u64 {
        PERFORMANCE_FREQUENCY
    }

    /// A monotonic timestamp in milliseconds.
    #[must_use]
    pub fn low_precision_timestamp_ms(&self) -> u64 {
        self.inner.clock.timestamp_ms()
    }

    /// Size of a virtual memory page in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.inner.system_info.page_size
    }

    /// Granularity and alignment of address space reservations, in bytes.
    #[must_use]
    pub fn allocation_granularity(&self) -> usize {
        self.inner.system_info.allocation_granularity
    }

    /// Whether address space can be reserved with write-watch enabled.
    #[must_use]
    pub fn supports_write_watch(&self) -> bool {
        self.inner.capabilities.write_watch
    }

    /// Reserves a range of address space without backing it with memory.
    ///
    /// `alignment` must be a power of two no larger than
    /// [`allocation_granularity()`][Self::allocation_granularity]; every reservation is aligned
    /// to the allocation granularity. Write-watch may only be requested if
    /// [`supports_write_watch()`][Self::supports_write_watch] is `true`.
    ///
    /// Returns `None` if the address space could not be reserved.
    #[must_use]
    pub fn virtual_reserve(
        &self,
        size: usize,
        alignment: usize,
        flags: ReserveFlags,
    ) -> Option<NonNull<u8>> {
        debug_assert!(
            alignment.is_power_of_two() && alignment <= self.allocation_granularity(),
            "alignment {alignment} must be a power of two no larger than the allocation granularity"
        );
        debug_assert!(
            !flags.write_watch() || self.supports_write_watch(),
            "write-watch requested but not supported"
        );

        self.platform().reserve(size, flags.write_watch())
    }

    /// Backs a range of reserved address space with memory that reads as zero until written.
    ///
    /// With a `node`, the memory is preferably taken from that NUMA node, which is only legal
    /// if [`can_enable_numa_aware()`][Self::can_enable_numa_aware] is `true`.
    ///
    /// Returns `false` if the memory could not be committed.
    ///
    /// # Safety
    ///
    /// The range must lie within a reservation made by this interface.
    #[must_use]
    pub unsafe fn virtual_commit(
        &self,
        address: NonNull<u8>,
        size: usize,
        node: Option<NodeIndex>,
    ) -> bool {
        debug_assert!(
            node.is_none() || self.can_enable_numa_aware(),
            "commit on a preferred node requires NUMA awareness"
        );

        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.platform().commit(address, size, node) }
    }

    /// Returns the memory backing a range to the operating system, keeping the address space.
    ///
    /// On Linux this also discards the write record of a write-watch range, so all of it reads
    /// as written once recommitted. Call [`reset_write_watch()`][Self::reset_write_watch] after
    /// recommitting. [`VirtualMemoryRegion`][crate::VirtualMemoryRegion] does this for you.
    ///
    /// # Safety
    ///
    /// The range must lie within a reservation made by this interface. The caller must not
    /// access the range until it is committed again.
    #[must_use]
    pub unsafe fn virtual_decommit(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.platform().decommit(address, size) }
    }

    /// Tells the operating system that the contents of a committed range are no longer
    /// interesting, so it may reclaim the memory. The range stays committed. With `unlock`,
    /// any lock on the pages is removed as well.
    ///
    /// # Safety
    ///
    /// The range must be committed memory of a reservation made by this interface. The caller
    /// must treat the contents of the range as undefined afterwards.
    #[must_use]
    pub unsafe fn virtual_reset(&self, address: NonNull<u8>, size: usize, unlock: bool) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.platform().reset(address, size, unlock) }
    }

    /// Releases a reservation.
    ///
    /// No page of the reservation may be committed; decommit it first. Debug builds panic if
    /// this is violated.
    ///
    /// # Safety
    ///
    /// The range must be an entire reservation made by this interface. The caller must not
    /// access the range afterwards.
    #[must_use]
    pub unsafe fn virtual_release(&self, address: NonNull<u8>, size: usize) -> bool {
        debug_assert!(
            !self.platform().is_range_committed(address, size),
            "reservation released while committed; decommit it first"
        );

        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.platform().release(address, size) }
    }

    /// Clears the record of written pages for a range reserved with write-watch.
    ///
    /// Returns `false` if the operating system refused.
    pub fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> bool {
        debug_assert!(
            self.supports_write_watch(),
            "write-watch used but not supported"
        );

        self.platform().reset_write_watch(address, size)
    }

    /// The pages of a range reserved with write-watch that were written since the record was
    /// last cleared, in ascending order. With `reset`, the record is cleared in the same step.
    ///
    /// Returns `None` if the operating system refused.
    ///
    /// # Panics
    ///
    /// Panics if the operating system tracks writes at a granularity other than the page size.
    #[must_use]
    pub fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
    ) -> Option<Vec<NonNull<u8>>> {
        debug_assert!(
            self.supports_write_watch(),
            "write-watch used but not supported"
        );

        let report = self.platform().get_write_watch(reset, address, size)?;

        assert_eq!(
            report.granularity,
            self.page_size(),
            "write-watch granularity does not match the page size"
        );

        let base = address.addr().get();

        let pages = report
            .pages
            .into_iter()
            .filter_map(|page| {
                let offset = page.checked_sub(base)?;
                NonNull::new(address.as_ptr().wrapping_add(offset))
            })
            .collect();

        Some(pages)
    }
}
