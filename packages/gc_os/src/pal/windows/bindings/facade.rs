#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
use std::ptr::NonNull;
#[cfg(test)]
use std::sync::Arc;

use windows::Win32::System::JobObjects::JOBOBJECT_EXTENDED_LIMIT_INFORMATION;
use windows::Win32::System::Kernel::PROCESSOR_NUMBER;
use windows::Win32::System::Memory::{
    MEMORY_BASIC_INFORMATION, VIRTUAL_ALLOCATION_TYPE, VIRTUAL_FREE_TYPE,
};
use windows::Win32::System::ProcessStatus::PROCESS_MEMORY_COUNTERS;
use windows::Win32::System::SystemInformation::{
    GROUP_AFFINITY, MEMORYSTATUSEX, PROCESSOR_GROUP_INFO, SYSTEM_INFO,
    SYSTEM_LOGICAL_PROCESSOR_INFORMATION,
};
use windows::core::Result;

#[cfg(test)]
use crate::pal::windows::MockBindings;
use crate::pal::windows::{Bindings, BuildTargetBindings, WriteWatchOutput};

/// Hide the real/mock bindings choice behind a single type.
#[derive(Clone)]
pub(crate) enum BindingsFacade {
    Target(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

impl BindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetBindings)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Bindings for BindingsFacade {
    fn get_system_info(&self) -> SYSTEM_INFO {
        match self {
            Self::Target(bindings) => bindings.get_system_info(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_system_info(),
        }
    }

    fn get_active_processor_group_count(&self) -> u16 {
        match self {
            Self::Target(bindings) => bindings.get_active_processor_group_count(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_active_processor_group_count(),
        }
    }

    fn get_active_processor_count(&self, group_number: u16) -> u32 {
        match self {
            Self::Target(bindings) => bindings.get_active_processor_count(group_number),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_active_processor_count(group_number),
        }
    }

    fn get_processor_group_information(&self) -> Result<Vec<PROCESSOR_GROUP_INFO>> {
        match self {
            Self::Target(bindings) => bindings.get_processor_group_information(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_processor_group_information(),
        }
    }

    fn get_current_process_affinity_mask(&self) -> Result<(usize, usize)> {
        match self {
            Self::Target(bindings) => bindings.get_current_process_affinity_mask(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_current_process_affinity_mask(),
        }
    }

    fn get_numa_highest_node_number(&self) -> Result<u32> {
        match self {
            Self::Target(bindings) => bindings.get_numa_highest_node_number(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_numa_highest_node_number(),
        }
    }

    fn get_numa_processor_node_ex(&self, processor: PROCESSOR_NUMBER) -> Result<u16> {
        match self {
            Self::Target(bindings) => bindings.get_numa_processor_node_ex(processor),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_numa_processor_node_ex(processor),
        }
    }

    fn get_current_processor_number_ex(&self) -> PROCESSOR_NUMBER {
        match self {
            Self::Target(bindings) => bindings.get_current_processor_number_ex(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_current_processor_number_ex(),
        }
    }

    fn set_current_thread_group_affinity(&self, affinity: GROUP_AFFINITY) -> Result<()> {
        match self {
            Self::Target(bindings) => bindings.set_current_thread_group_affinity(affinity),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.set_current_thread_group_affinity(affinity),
        }
    }

    fn is_current_process_in_job(&self) -> Result<bool> {
        match self {
            Self::Target(bindings) => bindings.is_current_process_in_job(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.is_current_process_in_job(),
        }
    }

    fn get_current_job_extended_limit_information(
        &self,
    ) -> Result<JOBOBJECT_EXTENDED_LIMIT_INFORMATION> {
        match self {
            Self::Target(bindings) => bindings.get_current_job_extended_limit_information(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_current_job_extended_limit_information(),
        }
    }

    fn global_memory_status_ex(&self) -> Result<MEMORYSTATUSEX> {
        match self {
            Self::Target(bindings) => bindings.global_memory_status_ex(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.global_memory_status_ex(),
        }
    }

    fn get_current_process_memory_info(&self) -> Result<PROCESS_MEMORY_COUNTERS> {
        match self {
            Self::Target(bindings) => bindings.get_current_process_memory_info(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_current_process_memory_info(),
        }
    }

    fn get_logical_processor_information(
        &self,
    ) -> Result<Vec<SYSTEM_LOGICAL_PROCESSOR_INFORMATION>> {
        match self {
            Self::Target(bindings) => bindings.get_logical_processor_information(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_logical_processor_information(),
        }
    }

    fn virtual_alloc_reserve(
        &self,
        size: usize,
        allocation_type: VIRTUAL_ALLOCATION_TYPE,
    ) -> Option<NonNull<u8>> {
        match self {
            Self::Target(bindings) => bindings.virtual_alloc_reserve(size, allocation_type),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.virtual_alloc_reserve(size, allocation_type),
        }
    }

    unsafe fn virtual_alloc_commit(&self, address: NonNull<u8>, size: usize) -> bool {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.virtual_alloc_commit(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(bindings) => unsafe { bindings.virtual_alloc_commit(address, size) },
        }
    }

    unsafe fn virtual_alloc_commit_numa(
        &self,
        address: NonNull<u8>,
        size: usize,
        preferred_node: u32,
    ) -> bool {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe {
                bindings.virtual_alloc_commit_numa(address, size, preferred_node)
            },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(bindings) => unsafe {
                bindings.virtual_alloc_commit_numa(address, size, preferred_node)
            },
        }
    }

    unsafe fn virtual_alloc_reset(&self, address: NonNull<u8>, size: usize) -> bool {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.virtual_alloc_reset(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(bindings) => unsafe { bindings.virtual_alloc_reset(address, size) },
        }
    }

    unsafe fn virtual_free(
        &self,
        address: NonNull<u8>,
        size: usize,
        free_type: VIRTUAL_FREE_TYPE,
    ) -> Result<()> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.virtual_free(address, size, free_type) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(bindings) => unsafe { bindings.virtual_free(address, size, free_type) },
        }
    }

    unsafe fn virtual_unlock(&self, address: NonNull<u8>, size: usize) -> Result<()> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.virtual_unlock(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(bindings) => unsafe { bindings.virtual_unlock(address, size) },
        }
    }

    fn virtual_query(&self, address: usize) -> Option<MEMORY_BASIC_INFORMATION> {
        match self {
            Self::Target(bindings) => bindings.virtual_query(address),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.virtual_query(address),
        }
    }

    fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
        addresses: &mut [usize],
    ) -> Result<WriteWatchOutput> {
        match self {
            Self::Target(bindings) => bindings.get_write_watch(reset, address, size, addresses),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_write_watch(reset, address, size, addresses),
        }
    }

    fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> Result<()> {
        match self {
            Self::Target(bindings) => bindings.reset_write_watch(address, size),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.reset_write_watch(address, size),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for BindingsFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
