use std::ptr::NonNull;
use std::sync::OnceLock;

use tracing::debug;
use windows::Win32::System::JobObjects::{
    JOB_OBJECT_LIMIT, JOB_OBJECT_LIMIT_JOB_MEMORY, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
    JOB_OBJECT_LIMIT_WORKINGSET, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
};
use windows::Win32::System::Kernel::PROCESSOR_NUMBER;
use windows::Win32::System::SystemInformation::{GROUP_AFFINITY, RelationCache};

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use crate::pal::cpuid;
use crate::pal::windows::{Bindings, BindingsFacade};
use crate::pal::{
    ContainerMemoryLimits, CpuidRegisters, GroupInfo, Platform, ProcessAffinity, SystemInfo,
    SystemMemoryStatus, WriteWatchReport,
};
use crate::{AffinityMask, GroupIndex, NodeIndex, ProcessorIndex, ProcessorNumber, ThreadAffinity};

/// Reported by `GetNumaProcessorNodeEx()` for processors without a node.
const NO_NODE: u16 = u16::MAX;

/// A processor group holds at most this many processors.
const MAX_PROCESSORS_PER_GROUP: u32 = 64;

/// Singleton instance of `BuildTargetPlatform`, used by public API types
/// to hook up to the correct PAL implementation.
pub(crate) static BUILD_TARGET_PLATFORM: BuildTargetPlatform =
    BuildTargetPlatform::new(BindingsFacade::target());

/// The platform that matches the crate's build target.
///
/// You would only use a different platform in unit tests that need to mock the platform.
/// Even then, whenever possible, unit tests should use the real platform for maximum realism.
#[derive(Debug)]
pub(crate) struct BuildTargetPlatform {
    pub(super) bindings: BindingsFacade,

    // Active processors of each group. We expect this to never change.
    groups: OnceLock<Vec<GroupInfo>>,

    write_watch_supported: OnceLock<bool>,
}

impl Platform for BuildTargetPlatform {
    fn system_info(&self) -> SystemInfo {
        let info = self.bindings.get_system_info();

        SystemInfo {
            page_size: info.dwPageSize as usize,
            allocation_granularity: info.dwAllocationGranularity as usize,
            processor_count: self.groups().iter().map(|group| group.active_count).sum(),
        }
    }

    fn processor_groups(&self) -> Option<Vec<GroupInfo>> {
        let groups = self.groups();

        (!groups.is_empty()).then(|| groups.to_vec())
    }

    fn process_affinity(&self) -> Option<ProcessAffinity> {
        let (process, system) = self
            .bindings
            .get_current_process_affinity_mask()
            .inspect_err(|e| debug!(error = %e, "GetProcessAffinityMask failed"))
            .ok()?;

        Some(ProcessAffinity {
            process: AffinityMask::from_bits(process as u64),
            system: AffinityMask::from_bits(system as u64),
        })
    }

    fn numa_highest_node_number(&self) -> Option<NodeIndex> {
        let highest = self
            .bindings
            .get_numa_highest_node_number()
            .inspect_err(|e| debug!(error = %e, "GetNumaHighestNodeNumber failed"))
            .ok()?;

        NodeIndex::try_from(highest).ok()
    }

    fn processor_node(&self, processor: ProcessorNumber) -> Option<NodeIndex> {
        let processor = PROCESSOR_NUMBER {
            Group: processor.group(),
            Number: u8::try_from(processor.index_in_group()).ok()?,
            Reserved: 0,
        };

        self.bindings
            .get_numa_processor_node_ex(processor)
            .inspect_err(|e| debug!(error = %e, "GetNumaProcessorNodeEx failed"))
            .ok()
            .filter(|&node| node != NO_NODE)
    }

    fn current_processor_number(&self) -> Option<ProcessorIndex> {
        let current = self.bindings.get_current_processor_number_ex();
        let groups = self.groups();

        let group_start = groups
            .iter()
            .take(current.Group as usize)
            .map(|group| group.active_count)
            .sum::<u32>();

        // Inactive processors of the group leave holes in the mask that do not count.
        let below_current = 1_u64
            .checked_shl(u32::from(current.Number))
            .map_or(u64::MAX, |bit| bit.wrapping_sub(1));
        let active_mask = groups.get(current.Group as usize)?.active_mask;

        group_start.checked_add((active_mask & below_current).count_ones())
    }

    fn set_current_thread_affinity(&self, affinity: ThreadAffinity) -> bool {
        let Some(processor) = affinity.processor_index() else {
            return false;
        };

        let target = match affinity.group() {
            Some(group) => Some((group, processor)),
            None => self.locate_processor(processor),
        };

        let Some((group, index_in_group)) = target else {
            return false;
        };

        if index_in_group >= MAX_PROCESSORS_PER_GROUP {
            return false;
        }

        let group_affinity = GROUP_AFFINITY {
            Mask: 1 << index_in_group,
            Group: group,
            ..Default::default()
        };

        self.bindings
            .set_current_thread_group_affinity(group_affinity)
            .inspect_err(|e| {
                debug!(group, index_in_group, error = %e, "SetThreadGroupAffinity failed");
            })
            .is_ok()
    }

    fn container_memory_limits(&self) -> Option<ContainerMemoryLimits> {
        let in_job = self
            .bindings
            .is_current_process_in_job()
            .inspect_err(|e| debug!(error = %e, "IsProcessInJob failed"))
            .ok()?;

        if !in_job {
            return None;
        }

        let info = self
            .bindings
            .get_current_job_extended_limit_information()
            .inspect_err(|e| debug!(error = %e, "cannot query job limits"))
            .ok()?;

        Some(job_memory_limits(&info))
    }

    fn memory_status(&self) -> SystemMemoryStatus {
        let Ok(status) = self
            .bindings
            .global_memory_status_ex()
            .inspect_err(|e| debug!(error = %e, "GlobalMemoryStatusEx failed"))
        else {
            return SystemMemoryStatus::default();
        };

        SystemMemoryStatus {
            load_percent: status.dwMemoryLoad,
            total_physical: status.ullTotalPhys,
            available_physical: status.ullAvailPhys,
            total_virtual: status.ullTotalVirtual,
            available_virtual: status.ullAvailVirtual,
            available_page_file: status.ullAvailPageFile,
        }
    }

    fn process_working_set(&self) -> Option<u64> {
        let counters = self
            .bindings
            .get_current_process_memory_info()
            .inspect_err(|e| debug!(error = %e, "GetProcessMemoryInfo failed"))
            .ok()?;

        Some(counters.WorkingSetSize as u64)
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
        let Ok(entries) = self
            .bindings
            .get_logical_processor_information()
            .inspect_err(|e| debug!(error = %e, "GetLogicalProcessorInformation failed"))
        else {
            return Vec::new();
        };

        entries
            .iter()
            .filter(|entry| entry.Relationship == RelationCache)
            // SAFETY: The relationship tells us the union holds a cache descriptor.
            .map(|entry| u64::from(unsafe { entry.Anonymous.Cache.Size }))
            .collect()
    }

    fn supports_write_watch(&self) -> bool {
        *self
            .write_watch_supported
            .get_or_init(|| self.detect_write_watch())
    }

    fn reserve(&self, size: usize, write_watch: bool) -> Option<NonNull<u8>> {
        self.reserve_range(size, write_watch)
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
        self.is_any_page_committed(address, size)
    }

    fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> bool {
        self.bindings
            .reset_write_watch(address, size)
            .inspect_err(|e| debug!(error = %e, "ResetWriteWatch failed"))
            .is_ok()
    }

    fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
    ) -> Option<WriteWatchReport> {
        self.written_pages(reset, address, size)
    }
}

impl BuildTargetPlatform {
    pub(crate) const fn new(bindings: BindingsFacade) -> Self {
        Self {
            bindings,
            groups: OnceLock::new(),
            write_watch_supported: OnceLock::new(),
        }
    }

    fn groups(&self) -> &[GroupInfo] {
        self.groups.get_or_init(|| self.load_groups())
    }

    fn load_groups(&self) -> Vec<GroupInfo> {
        match self.bindings.get_processor_group_information() {
            Ok(groups) if !groups.is_empty() => {
                return groups
                    .iter()
                    .map(|group| GroupInfo {
                        active_count: u32::from(group.ActiveProcessorCount),
                        active_mask: group.ActiveProcessorMask as u64,
                    })
                    .collect();
            }
            Ok(_) => debug!("GetLogicalProcessorInformationEx reported no groups"),
            Err(e) => debug!(error = %e, "GetLogicalProcessorInformationEx failed"),
        }

        // Without the real masks, we assume active processors occupy the low bits of each group.
        let group_count = self.bindings.get_active_processor_group_count();

        (0..group_count)
            .map(|group| {
                let active_count = self.bindings.get_active_processor_count(group);

                GroupInfo {
                    active_count,
                    active_mask: AffinityMask::first_n(active_count as usize).low_bits(),
                }
            })
            .collect()
    }

    /// Translates a global processor index into (group, index in group).
    ///
    /// The global index counts only active processors, so the index in group is the position
    /// of the matching bit in the group's active mask.
    fn locate_processor(&self, processor: ProcessorIndex) -> Option<(GroupIndex, ProcessorIndex)> {
        let mut group_start: ProcessorIndex = 0;

        for (group, info) in self.groups().iter().enumerate() {
            let group_end = group_start.checked_add(info.active_count)?;

            if processor < group_end {
                let position = processor.checked_sub(group_start)?;
                let index_in_group =
                    AffinityMask::from_bits(info.active_mask).nth(position as usize)?;

                return Some((
                    GroupIndex::try_from(group).ok()?,
                    ProcessorIndex::try_from(index_in_group).ok()?,
                ));
            }

            group_start = group_end;
        }

        None
    }
}

fn job_memory_limits(info: &JOBOBJECT_EXTENDED_LIMIT_INFORMATION) -> ContainerMemoryLimits {
    let flags = info.BasicLimitInformation.LimitFlags;

    let limit_if =
        |flag: JOB_OBJECT_LIMIT, value: usize| flags.contains(flag).then_some(value as u64);

    ContainerMemoryLimits {
        job: limit_if(JOB_OBJECT_LIMIT_JOB_MEMORY, info.JobMemoryLimit),
        process: limit_if(JOB_OBJECT_LIMIT_PROCESS_MEMORY, info.ProcessMemoryLimit),
        working_set: limit_if(
            JOB_OBJECT_LIMIT_WORKINGSET,
            info.BasicLimitInformation.MaximumWorkingSetSize,
        ),
    }
}
