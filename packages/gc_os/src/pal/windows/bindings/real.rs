use std::ffi::c_void;
use std::fmt::Debug;
use std::ptr::{self, NonNull};

use windows::Win32::Foundation::{E_FAIL, ERROR_INSUFFICIENT_BUFFER};
use windows::Win32::System::JobObjects::{
    IsProcessInJob, JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
    QueryInformationJobObject,
};
use windows::Win32::System::Kernel::PROCESSOR_NUMBER;
use windows::Win32::System::Memory::{
    GetWriteWatch, MEM_COMMIT, MEM_RESET, MEMORY_BASIC_INFORMATION, PAGE_NOACCESS, PAGE_READWRITE,
    ResetWriteWatch, VIRTUAL_ALLOCATION_TYPE, VIRTUAL_FREE_TYPE, VirtualAlloc, VirtualAllocExNuma,
    VirtualFree, VirtualQuery, VirtualUnlock,
};
use windows::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use windows::Win32::System::SystemInformation::{
    GROUP_AFFINITY, GetLogicalProcessorInformation, GetLogicalProcessorInformationEx,
    GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX, PROCESSOR_GROUP_INFO, RelationGroup,
    SYSTEM_INFO, SYSTEM_LOGICAL_PROCESSOR_INFORMATION, SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
};
use windows::Win32::System::Threading::{
    GetActiveProcessorCount, GetActiveProcessorGroupCount, GetCurrentProcess,
    GetCurrentProcessorNumberEx, GetCurrentThread, GetNumaHighestNodeNumber,
    GetNumaProcessorNodeEx, GetProcessAffinityMask, SetThreadGroupAffinity,
};
use windows::core::{BOOL, Error, Result};

use crate::pal::windows::{Bindings, WriteWatchOutput};

const WRITE_WATCH_FLAG_RESET: u32 = 0x01;

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

impl Bindings for BuildTargetBindings {
    fn get_system_info(&self) -> SYSTEM_INFO {
        let mut info = SYSTEM_INFO::default();

        // SAFETY: No safety requirements beyond passing valid input.
        unsafe { GetSystemInfo(&raw mut info) };

        info
    }

    fn get_active_processor_group_count(&self) -> u16 {
        // SAFETY: No safety requirements.
        unsafe { GetActiveProcessorGroupCount() }
    }

    fn get_active_processor_count(&self, group_number: u16) -> u32 {
        // SAFETY: No safety requirements.
        unsafe { GetActiveProcessorCount(group_number) }
    }

    fn get_processor_group_information(&self) -> Result<Vec<PROCESSOR_GROUP_INFO>> {
        let mut length: u32 = 0;

        // First we ask how much buffer we need.
        // SAFETY: No safety requirements beyond passing valid inputs.
        match unsafe { GetLogicalProcessorInformationEx(RelationGroup, None, &raw mut length) } {
            Ok(()) => return Ok(Vec::new()),
            Err(e) if e.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() => {}
            Err(e) => return Err(e),
        }

        // The records are variable-length. A u64 buffer satisfies their alignment.
        let mut buffer = vec![0_u64; (length as usize).div_ceil(size_of::<u64>())];
        let record = buffer
            .as_mut_ptr()
            .cast::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX>();

        // SAFETY: The buffer is at least `length` bytes long.
        unsafe { GetLogicalProcessorInformationEx(RelationGroup, Some(record), &raw mut length) }?;

        if (length as usize) < size_of::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX>() {
            return Ok(Vec::new());
        }

        // RelationGroup yields a single record that describes every group. Its group table
        // extends past the end of the declared struct, so we only go through raw pointers.
        // SAFETY: The operating system wrote a complete record at the start of the buffer.
        let group_count = usize::from(unsafe { (*record).Anonymous.Group.ActiveGroupCount });

        // SAFETY: Points into the record we just checked.
        let first = unsafe { &raw const (*record).Anonymous.Group.GroupInfo }
            .cast::<PROCESSOR_GROUP_INFO>();

        let table_end = group_count
            .checked_mul(size_of::<PROCESSOR_GROUP_INFO>())
            .and_then(|table_size| table_size.checked_add(first.addr()));
        let buffer_end = record.addr().checked_add(length as usize);

        if table_end.is_none() || table_end > buffer_end {
            return Err(Error::from_hresult(E_FAIL));
        }

        let mut groups = Vec::with_capacity(group_count);

        for index in 0..group_count {
            // SAFETY: We verified above that the whole table is inside the written buffer.
            groups.push(unsafe { first.add(index).read_unaligned() });
        }

        Ok(groups)
    }

    fn get_current_process_affinity_mask(&self) -> Result<(usize, usize)> {
        // SAFETY: No safety requirements. Does not require closing the handle.
        let current_process = unsafe { GetCurrentProcess() };

        let mut process_mask: usize = 0;
        let mut system_mask: usize = 0;

        // SAFETY: No safety requirements beyond passing valid input.
        unsafe {
            GetProcessAffinityMask(
                current_process,
                &raw mut process_mask,
                &raw mut system_mask,
            )
        }?;

        Ok((process_mask, system_mask))
    }

    fn get_numa_highest_node_number(&self) -> Result<u32> {
        let mut result: u32 = 0;

        // SAFETY: No safety requirements beyond passing valid input.
        unsafe { GetNumaHighestNodeNumber(&raw mut result) }?;

        Ok(result)
    }

    fn get_numa_processor_node_ex(&self, processor: PROCESSOR_NUMBER) -> Result<u16> {
        let mut node: u16 = 0;

        // SAFETY: No safety requirements beyond passing valid input.
        unsafe { GetNumaProcessorNodeEx(&raw const processor, &raw mut node) }?;

        Ok(node)
    }

    fn get_current_processor_number_ex(&self) -> PROCESSOR_NUMBER {
        // SAFETY: No safety requirements.
        unsafe { GetCurrentProcessorNumberEx() }
    }

    fn set_current_thread_group_affinity(&self, affinity: GROUP_AFFINITY) -> Result<()> {
        // SAFETY: No safety requirements. Does not require closing the handle.
        let current_thread = unsafe { GetCurrentThread() };

        // SAFETY: No safety requirements beyond passing valid input.
        unsafe { SetThreadGroupAffinity(current_thread, &raw const affinity, None) }
    }

    fn is_current_process_in_job(&self) -> Result<bool> {
        // SAFETY: No safety requirements. Does not require closing the handle.
        let current_process = unsafe { GetCurrentProcess() };

        let mut result = BOOL::default();

        // SAFETY: No safety requirements beyond passing valid inputs.
        unsafe { IsProcessInJob(current_process, None, &raw mut result) }?;

        Ok(result.as_bool())
    }

    fn get_current_job_extended_limit_information(
        &self,
    ) -> Result<JOBOBJECT_EXTENDED_LIMIT_INFORMATION> {
        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();

        // SAFETY: No safety requirements beyond passing valid inputs. A null job handle means
        // the job of the current process.
        unsafe {
            QueryInformationJobObject(
                None,
                JobObjectExtendedLimitInformation,
                ptr::from_mut(&mut info).cast(),
                struct_size_u32::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>(),
                None,
            )
        }?;

        Ok(info)
    }

    fn global_memory_status_ex(&self) -> Result<MEMORYSTATUSEX> {
        let mut status = MEMORYSTATUSEX {
            dwLength: struct_size_u32::<MEMORYSTATUSEX>(),
            ..Default::default()
        };

        // SAFETY: No safety requirements beyond passing valid input.
        unsafe { GlobalMemoryStatusEx(&raw mut status) }?;

        Ok(status)
    }

    fn get_current_process_memory_info(&self) -> Result<PROCESS_MEMORY_COUNTERS> {
        // SAFETY: No safety requirements. Does not require closing the handle.
        let current_process = unsafe { GetCurrentProcess() };

        let mut counters = PROCESS_MEMORY_COUNTERS::default();

        // SAFETY: No safety requirements beyond passing valid inputs.
        unsafe {
            GetProcessMemoryInfo(
                current_process,
                &raw mut counters,
                struct_size_u32::<PROCESS_MEMORY_COUNTERS>(),
            )
        }?;

        Ok(counters)
    }

    fn get_logical_processor_information(
        &self,
    ) -> Result<Vec<SYSTEM_LOGICAL_PROCESSOR_INFORMATION>> {
        let element_size = size_of::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION>();

        let mut length: u32 = 0;

        // First we ask how much buffer we need.
        // SAFETY: No safety requirements beyond passing valid inputs.
        match unsafe { GetLogicalProcessorInformation(None, &raw mut length) } {
            Ok(()) => return Ok(Vec::new()),
            Err(e) if e.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() => {}
            Err(e) => return Err(e),
        }

        let mut buffer = vec![
            SYSTEM_LOGICAL_PROCESSOR_INFORMATION::default();
            (length as usize).div_ceil(element_size)
        ];

        // SAFETY: The buffer is at least `length` bytes long.
        unsafe { GetLogicalProcessorInformation(Some(buffer.as_mut_ptr()), &raw mut length) }?;

        buffer.truncate((length as usize).checked_div(element_size).unwrap_or_default());

        Ok(buffer)
    }

    fn virtual_alloc_reserve(
        &self,
        size: usize,
        allocation_type: VIRTUAL_ALLOCATION_TYPE,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Creating a new mapping has no safety requirements.
        let address = unsafe { VirtualAlloc(None, size, allocation_type, PAGE_NOACCESS) };

        NonNull::new(address.cast())
    }

    unsafe fn virtual_alloc_commit(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        let result = unsafe {
            VirtualAlloc(
                Some(address.as_ptr().cast_const().cast()),
                size,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };

        !result.is_null()
    }

    unsafe fn virtual_alloc_commit_numa(
        &self,
        address: NonNull<u8>,
        size: usize,
        preferred_node: u32,
    ) -> bool {
        // SAFETY: No safety requirements. Does not require closing the handle.
        let current_process = unsafe { GetCurrentProcess() };

        // SAFETY: Forwarding safety requirements to caller.
        let result = unsafe {
            VirtualAllocExNuma(
                current_process,
                Some(address.as_ptr().cast_const().cast()),
                size,
                MEM_COMMIT,
                PAGE_READWRITE.0,
                preferred_node,
            )
        };

        !result.is_null()
    }

    unsafe fn virtual_alloc_reset(&self, address: NonNull<u8>, size: usize) -> bool {
        // The protection is ignored for MEM_RESET but must still be a valid value.
        // SAFETY: Forwarding safety requirements to caller.
        let result = unsafe {
            VirtualAlloc(
                Some(address.as_ptr().cast_const().cast()),
                size,
                MEM_RESET,
                PAGE_NOACCESS,
            )
        };

        !result.is_null()
    }

    unsafe fn virtual_free(
        &self,
        address: NonNull<u8>,
        size: usize,
        free_type: VIRTUAL_FREE_TYPE,
    ) -> Result<()> {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { VirtualFree(address.as_ptr().cast(), size, free_type) }
    }

    unsafe fn virtual_unlock(&self, address: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { VirtualUnlock(address.as_ptr().cast_const().cast(), size) }
    }

    fn virtual_query(&self, address: usize) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut info = MEMORY_BASIC_INFORMATION::default();

        // SAFETY: Querying any address is valid, the memory is never accessed.
        let written = unsafe {
            VirtualQuery(
                Some(ptr::without_provenance::<c_void>(address)),
                &raw mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };

        (written != 0).then_some(info)
    }

    fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
        addresses: &mut [usize],
    ) -> Result<WriteWatchOutput> {
        let flags = if reset { WRITE_WATCH_FLAG_RESET } else { 0 };

        let mut count = addresses.len();
        let mut granularity: u32 = 0;

        // SAFETY: The output buffer holds `count` pointer-sized entries. The range is only
        // inspected, never accessed.
        let result = unsafe {
            GetWriteWatch(
                flags,
                address.as_ptr().cast_const().cast(),
                size,
                Some(addresses.as_mut_ptr().cast()),
                Some(&raw mut count),
                Some(&raw mut granularity),
            )
        };

        if result != 0 {
            return Err(Error::from_win32());
        }

        Ok(WriteWatchOutput { count, granularity })
    }

    fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: The range is only inspected, never accessed.
        let result = unsafe { ResetWriteWatch(address.as_ptr().cast_const().cast(), size) };

        if result != 0 {
            return Err(Error::from_win32());
        }

        Ok(())
    }
}

fn struct_size_u32<T>() -> u32 {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "the structs we pass to the OS are a few hundred bytes at most"
    )]
    let size = size_of::<T>() as u32;

    size
}
