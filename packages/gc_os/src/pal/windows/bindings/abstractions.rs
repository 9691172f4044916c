#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;
use std::ptr::NonNull;

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

/// What `GetWriteWatch()` wrote into the caller's buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct WriteWatchOutput {
    /// Number of entries of the address buffer that were filled.
    pub(crate) count: usize,
    pub(crate) granularity: u32,
}

/// Bindings for FFI calls into external libraries (either provided by operating system or not).
///
/// All PAL FFI calls must go through this trait, enabling them to be mocked.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    fn get_system_info(&self) -> SYSTEM_INFO;

    fn get_active_processor_group_count(&self) -> u16;
    fn get_active_processor_count(&self, group_number: u16) -> u32;

    // The active groups from `GetLogicalProcessorInformationEx(RelationGroup)`, in group order.
    fn get_processor_group_information(&self) -> Result<Vec<PROCESSOR_GROUP_INFO>>;

    // GetProcessAffinityMask() for the current process, as (process mask, system mask).
    // Only covers the primary processor group of the process.
    fn get_current_process_affinity_mask(&self) -> Result<(usize, usize)>;

    fn get_numa_highest_node_number(&self) -> Result<u32>;
    fn get_numa_processor_node_ex(&self, processor: PROCESSOR_NUMBER) -> Result<u16>;

    fn get_current_processor_number_ex(&self) -> PROCESSOR_NUMBER;

    fn set_current_thread_group_affinity(&self, affinity: GROUP_AFFINITY) -> Result<()>;

    fn is_current_process_in_job(&self) -> Result<bool>;
    fn get_current_job_extended_limit_information(
        &self,
    ) -> Result<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>;

    fn global_memory_status_ex(&self) -> Result<MEMORYSTATUSEX>;
    fn get_current_process_memory_info(&self) -> Result<PROCESS_MEMORY_COUNTERS>;

    fn get_logical_processor_information(
        &self,
    ) -> Result<Vec<SYSTEM_LOGICAL_PROCESSOR_INFORMATION>>;

    /// `VirtualAlloc()` of fresh address space with `PAGE_NOACCESS`.
    fn virtual_alloc_reserve(
        &self,
        size: usize,
        allocation_type: VIRTUAL_ALLOCATION_TYPE,
    ) -> Option<NonNull<u8>>;

    /// `VirtualAlloc(MEM_COMMIT, PAGE_READWRITE)` inside an existing reservation.
    unsafe fn virtual_alloc_commit(&self, address: NonNull<u8>, size: usize) -> bool;

    /// `VirtualAllocExNuma(MEM_COMMIT, PAGE_READWRITE)` inside an existing reservation.
    unsafe fn virtual_alloc_commit_numa(
        &self,
        address: NonNull<u8>,
        size: usize,
        preferred_node: u32,
    ) -> bool;

    /// `VirtualAlloc(MEM_RESET)`.
    unsafe fn virtual_alloc_reset(&self, address: NonNull<u8>, size: usize) -> bool;

    unsafe fn virtual_free(
        &self,
        address: NonNull<u8>,
        size: usize,
        free_type: VIRTUAL_FREE_TYPE,
    ) -> Result<()>;

    unsafe fn virtual_unlock(&self, address: NonNull<u8>, size: usize) -> Result<()>;

    fn virtual_query(&self, address: usize) -> Option<MEMORY_BASIC_INFORMATION>;

    fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
        addresses: &mut [usize],
    ) -> Result<WriteWatchOutput>;

    fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> Result<()>;
}
