use std::mem;
use std::ptr::NonNull;
use std::sync::OnceLock;

use tracing::debug;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use crate::pal::cpuid;
use crate::pal::linux::{
    Bindings, BindingsFacade, CgroupPaths, Filesystem, FilesystemFacade, ResourceLimit,
    WriteWatchTracker, parse_cache_size, parse_cgroup_memory_limit, parse_cgroup_paths,
    parse_kib_field,
};
use crate::pal::{
    ALLOCATION_GRANULARITY, ContainerMemoryLimits, CpuidRegisters, GroupInfo, Platform,
    ProcessAffinity, SystemInfo, SystemMemoryStatus, WriteWatchReport, percent_of,
};
use crate::{
    AffinityMask, MAX_AFFINITY_PROCESSORS, NodeIndex, ProcessorIndex, ProcessorNumber,
    ThreadAffinity,
};

/// Used if the kernel refuses to tell us the page size, which never happens in practice.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Size of the user-mode virtual address space when no address space limit is set.
#[cfg(target_arch = "aarch64")]
const USER_ADDRESS_SPACE_BYTES: u64 = 1 << 48;
#[cfg(all(target_pointer_width = "64", not(target_arch = "aarch64")))]
const USER_ADDRESS_SPACE_BYTES: u64 = 1 << 47;
#[cfg(not(target_pointer_width = "64"))]
const USER_ADDRESS_SPACE_BYTES: u64 = 3 << 30;

/// Singleton instance of `BuildTargetPlatform`, used by public API types
/// to hook up to the correct PAL implementation.
pub(crate) static BUILD_TARGET_PLATFORM: BuildTargetPlatform =
    BuildTargetPlatform::new(BindingsFacade::target(), FilesystemFacade::target());

/// The platform that matches the crate's build target.
///
/// You would only use a different platform in unit tests that need to mock the platform.
/// Even then, whenever possible, unit tests should use the real platform for maximum realism.
#[derive(Debug)]
pub(crate) struct BuildTargetPlatform {
    pub(super) bindings: BindingsFacade,
    pub(super) fs: FilesystemFacade,

    numa_nodes: OnceLock<Vec<NumaNode>>,

    /// `None` if the kernel cannot track writes for us.
    pub(super) write_watch_tracker: OnceLock<Option<WriteWatchTracker>>,
    pub(super) write_watch_supported: OnceLock<bool>,
}

#[derive(Debug)]
struct NumaNode {
    index: NodeIndex,

    // Sorted.
    processors: Vec<u32>,
}

impl Platform for BuildTargetPlatform {
    fn system_info(&self) -> SystemInfo {
        let page_size = self
            .bindings
            .sysconf(libc::_SC_PAGESIZE)
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(FALLBACK_PAGE_SIZE);

        let processor_count = self
            .bindings
            .sysconf(libc::_SC_NPROCESSORS_ONLN)
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(1);

        SystemInfo {
            page_size,
            allocation_granularity: ALLOCATION_GRANULARITY.max(page_size),
            processor_count,
        }
    }

    fn processor_groups(&self) -> Option<Vec<GroupInfo>> {
        // Linux has no processor groups. The whole system is one implicit group.
        None
    }

    fn process_affinity(&self) -> Option<ProcessAffinity> {
        let cpu_set = self
            .bindings
            .sched_getaffinity_current()
            .inspect_err(|e| debug!(error = %e, "sched_getaffinity failed"))
            .ok()?;

        let process = (0..MAX_AFFINITY_PROCESSORS)
            // SAFETY: No safety requirements. The index is within the bounds of cpu_set_t.
            .filter(|index| unsafe { libc::CPU_ISSET(*index, &cpu_set) })
            .collect::<AffinityMask>();

        let system = match self.online_processors() {
            Some(online) => online.into_iter().map(|index| index as usize).collect(),
            None => AffinityMask::first_n(self.system_info().processor_count as usize),
        };

        Some(ProcessAffinity { process, system })
    }

    fn numa_highest_node_number(&self) -> Option<NodeIndex> {
        self.numa_nodes().iter().map(|node| node.index).max()
    }

    fn processor_node(&self, processor: ProcessorNumber) -> Option<NodeIndex> {
        if processor.group() != 0 {
            return None;
        }

        self.numa_nodes()
            .iter()
            .find(|node| {
                node.processors
                    .binary_search(&processor.index_in_group())
                    .is_ok()
            })
            .map(|node| node.index)
    }

    fn current_processor_number(&self) -> Option<ProcessorIndex> {
        ProcessorIndex::try_from(self.bindings.sched_getcpu()).ok()
    }

    fn set_current_thread_affinity(&self, affinity: ThreadAffinity) -> bool {
        let Some(processor) = affinity.processor_index() else {
            return false;
        };

        if affinity.group().is_some_and(|group| group != 0) {
            return false;
        }

        let processor = processor as usize;

        if processor >= MAX_AFFINITY_PROCESSORS {
            return false;
        }

        // SAFETY: Zero-initialized cpu_set_t is a valid value.
        let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };

        // SAFETY: No safety requirements. The index is within the bounds of cpu_set_t.
        unsafe {
            libc::CPU_SET(processor, &mut cpu_set);
        }

        self.bindings
            .sched_setaffinity_current(&cpu_set)
            .inspect_err(|e| debug!(processor, error = %e, "sched_setaffinity failed"))
            .is_ok()
    }

    fn container_memory_limits(&self) -> Option<ContainerMemoryLimits> {
        // Without the cgroup membership file we cannot tell whether we are constrained at all.
        let cgroups = parse_cgroup_paths(&self.fs.get_proc_self_cgroup()?);

        let (job, working_set) = self.cgroup_memory_limits(&cgroups);

        let process = self
            .bindings
            .getrlimit(ResourceLimit::Data)
            .inspect_err(|e| debug!(error = %e, "getrlimit(RLIMIT_DATA) failed"))
            .ok()
            .flatten();

        Some(ContainerMemoryLimits {
            job,
            process,
            working_set,
        })
    }

    fn memory_status(&self) -> SystemMemoryStatus {
        let meminfo = self.fs.get_meminfo_contents();

        let total_physical = kib_field(meminfo.as_deref(), "MemTotal")
            .or_else(|| self.sysconf_bytes(libc::_SC_PHYS_PAGES))
            .unwrap_or(0);

        let available_physical = kib_field(meminfo.as_deref(), "MemAvailable")
            .or_else(|| kib_field(meminfo.as_deref(), "MemFree"))
            .or_else(|| self.sysconf_bytes(libc::_SC_AVPHYS_PAGES))
            .unwrap_or(0);

        let swap_free = kib_field(meminfo.as_deref(), "SwapFree").unwrap_or(0);

        let total_virtual = self
            .bindings
            .getrlimit(ResourceLimit::AddressSpace)
            .inspect_err(|e| debug!(error = %e, "getrlimit(RLIMIT_AS) failed"))
            .ok()
            .flatten()
            .unwrap_or(USER_ADDRESS_SPACE_BYTES)
            .min(USER_ADDRESS_SPACE_BYTES);

        let used_virtual =
            kib_field(self.fs.get_proc_self_status_contents().as_deref(), "VmSize").unwrap_or(0);

        SystemMemoryStatus {
            load_percent: percent_of(
                total_physical.saturating_sub(available_physical),
                total_physical,
            ),
            total_physical,
            available_physical,
            total_virtual,
            available_virtual: total_virtual.saturating_sub(used_virtual),
            available_page_file: available_physical.saturating_add(swap_free),
        }
    }

    fn process_working_set(&self) -> Option<u64> {
        kib_field(self.fs.get_proc_self_status_contents().as_deref(), "VmRSS")
    }

    fn cpuid(&self, leaf: u32) -> Option<CpuidRegisters> {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            Some(cpuid::query(leaf))
        }

        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            _ = leaf;
            None
        }
    }

    fn os_cache_sizes(&self) -> Vec<u64> {
        let processors = self.online_processors().unwrap_or_else(|| vec![0]);

        processors
            .into_iter()
            .flat_map(|processor| {
                (0..)
                    .map_while(move |cache_index| {
                        self.fs.get_cpu_cache_size_contents(processor, cache_index)
                    })
                    .filter_map(|contents| {
                        parse_cache_size(&contents)
                            .inspect_err(|e| debug!(error = %e, "ignoring unparseable cache size"))
                            .ok()
                    })
            })
            .collect()
    }

    fn supports_write_watch(&self) -> bool {
        *self
            .write_watch_supported
            .get_or_init(|| self.detect_write_watch())
    }

    fn reserve(&self, size: usize, write_watch: bool) -> Option<NonNull<u8>> {
        self.reserve_aligned(size, write_watch)
    }

    unsafe fn commit(&self, address: NonNull<u8>, size: usize, node: Option<NodeIndex>) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.commit_range(address, size, node) }
    }

    unsafe fn decommit(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.decommit_range(address, size) }
    }

    unsafe fn reset(&self, address: NonNull<u8>, size: usize, unlock: bool) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.reset_range(address, size, unlock) }
    }

    unsafe fn release(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.release_range(address, size) }
    }

    fn is_range_committed(&self, address: NonNull<u8>, size: usize) -> bool {
        self.is_range_accessible(address, size)
    }

    fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> bool {
        self.reset_written_pages(address, size)
    }

    fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
    ) -> Option<WriteWatchReport> {
        let pages = self.scan_written_pages(address, size, reset)?;

        Some(WriteWatchReport {
            pages,
            granularity: self.system_info().page_size,
        })
    }
}

impl BuildTargetPlatform {
    pub(crate) const fn new(bindings: BindingsFacade, fs: FilesystemFacade) -> Self {
        Self {
            bindings,
            fs,
            numa_nodes: OnceLock::new(),
            write_watch_tracker: OnceLock::new(),
            write_watch_supported: OnceLock::new(),
        }
    }

    fn online_processors(&self) -> Option<Vec<u32>> {
        let contents = self.fs.get_cpu_online_contents()?;

        cpulist::parse(contents.trim())
            .inspect_err(|e| debug!(error = %e, "unparseable list of online processors"))
            .ok()
            .filter(|processors| !processors.is_empty())
    }

    fn numa_nodes(&self) -> &[NumaNode] {
        self.numa_nodes.get_or_init(|| self.load_numa_nodes())
    }

    fn load_numa_nodes(&self) -> Vec<NumaNode> {
        // /sys/devices/system/node may be missing entirely on kernels built without NUMA support.
        let Some(possible) = self.fs.get_numa_node_possible_contents() else {
            return Vec::new();
        };

        let node_indexes = match cpulist::parse(possible.trim()) {
            Ok(indexes) => indexes,
            Err(e) => {
                debug!(error = %e, "unparseable list of possible NUMA nodes");
                return Vec::new();
            }
        };

        node_indexes
            .into_iter()
            .filter_map(|node| {
                let index = NodeIndex::try_from(node).ok()?;

                // Offline nodes have no processors (and sometimes no cpulist file at all).
                let processors = self
                    .fs
                    .get_numa_node_cpulist_contents(node)
                    .and_then(|contents| cpulist::parse(contents.trim()).ok())
                    .unwrap_or_default();

                Some(NumaNode { index, processors })
            })
            .collect()
    }

    /// Returns (job limit, working set limit) from whichever cgroup hierarchy has a memory
    /// controller for us.
    fn cgroup_memory_limits(&self, cgroups: &CgroupPaths) -> (Option<u64>, Option<u64>) {
        if let Some(path) = &cgroups.v2 {
            let max = self
                .fs
                .get_v2_cgroup_memory_max(path)
                .and_then(|contents| memory_limit(&contents));
            let high = self
                .fs
                .get_v2_cgroup_memory_high(path)
                .and_then(|contents| memory_limit(&contents));

            if max.is_some() || high.is_some() {
                return (max, high);
            }
        }

        if let Some(path) = &cgroups.v1_memory {
            let limit = self
                .fs
                .get_v1_cgroup_memory_limit(path)
                .and_then(|contents| memory_limit(&contents));

            return (limit, None);
        }

        (None, None)
    }

    fn sysconf_bytes(&self, pages_name: libc::c_int) -> Option<u64> {
        let pages = self.bindings.sysconf(pages_name)?;
        let page_size = self.bindings.sysconf(libc::_SC_PAGESIZE)?;

        Some(pages.saturating_mul(page_size))
    }
}

fn kib_field(contents: Option<&str>, field: &'static str) -> Option<u64> {
    parse_kib_field(contents?, field)
        .inspect_err(|e| debug!(error = %e, "memory statistic unavailable"))
        .ok()
}

fn memory_limit(contents: &str) -> Option<u64> {
    parse_cgroup_memory_limit(contents)
        .inspect_err(|e| debug!(error = %e, "unparseable cgroup memory limit"))
        .ok()
        .flatten()
}
