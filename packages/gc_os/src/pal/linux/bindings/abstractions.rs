#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::ptr::NonNull;

use libc::{c_int, cpu_set_t};

use crate::NodeIndex;

/// Resource limits we read via `getrlimit()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ResourceLimit {
    /// `RLIMIT_AS`, the maximum size of the virtual address space of the process.
    AddressSpace,

    /// `RLIMIT_DATA`, the maximum size of the data segment (including anonymous mappings since
    /// Linux 4.7).
    Data,
}

/// One run of pages with identical attributes, as reported by the `PAGEMAP_SCAN` ioctl.
///
/// Layout matches `struct page_region` from `linux/fs.h`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct PageRegion {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) categories: u64,
}

/// How far a single `PAGEMAP_SCAN` call got.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ScanProgress {
    /// Number of entries of the output buffer that were filled.
    pub(crate) region_count: usize,

    /// Address at which the scan stopped. Equal to the requested end if the scan completed.
    pub(crate) walk_end: usize,
}

/// Bindings for FFI calls into external libraries (either provided by operating system or not).
///
/// All PAL FFI calls must go through this trait, enabling them to be mocked.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    /// `sysconf()`, with failure and "no limit" both mapped to `None`.
    fn sysconf(&self, name: c_int) -> Option<u64>;

    // sched_getaffinity() for the current thread
    fn sched_getaffinity_current(&self) -> Result<cpu_set_t, io::Error>;

    // sched_setaffinity() for the current thread
    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> Result<(), io::Error>;

    fn sched_getcpu(&self) -> i32;

    /// The soft limit of a resource, or `None` if the resource is unlimited.
    fn getrlimit(&self, resource: ResourceLimit) -> Result<Option<u64>, io::Error>;

    /// Maps an inaccessible, unbacked anonymous range of the given size.
    fn mmap_reserve(&self, size: usize) -> Result<NonNull<u8>, io::Error>;

    /// # Safety
    ///
    /// The range must be part of a mapping owned by the caller, not referenced afterwards.
    unsafe fn munmap(&self, address: NonNull<u8>, size: usize) -> Result<(), io::Error>;

    /// # Safety
    ///
    /// The range must be part of a mapping owned by the caller.
    unsafe fn mprotect(
        &self,
        address: NonNull<u8>,
        size: usize,
        protection: c_int,
    ) -> Result<(), io::Error>;

    /// # Safety
    ///
    /// The range must be part of a mapping owned by the caller. Destructive advice discards the
    /// contents of the range.
    unsafe fn madvise(&self, address: NonNull<u8>, size: usize, advice: c_int)
    -> Result<(), io::Error>;

    /// # Safety
    ///
    /// The range must be part of a mapping owned by the caller.
    unsafe fn munlock(&self, address: NonNull<u8>, size: usize) -> Result<(), io::Error>;

    /// `mbind()` with `MPOL_PREFERRED` for a single node.
    ///
    /// # Safety
    ///
    /// The range must be part of a mapping owned by the caller.
    unsafe fn mbind_preferred(
        &self,
        address: NonNull<u8>,
        size: usize,
        node: NodeIndex,
    ) -> Result<(), io::Error>;

    /// Opens a userfaultfd with asynchronous write-protect tracking enabled.
    fn userfaultfd_open(&self) -> Result<OwnedFd, io::Error>;

    /// Registers a range for write-protect tracking on the userfaultfd.
    fn userfaultfd_register_write_protect(
        &self,
        uffd: RawFd,
        address: NonNull<u8>,
        size: usize,
    ) -> Result<(), io::Error>;

    /// Opens `/proc/self/pagemap`, the target of `PAGEMAP_SCAN`.
    fn pagemap_open(&self) -> Result<OwnedFd, io::Error>;

    /// Finds the written pages between `start` and `end`, writing them to `regions`.
    ///
    /// With `write_protect`, the reported pages are atomically write-protected again so that
    /// their next write is detected.
    fn pagemap_scan_written(
        &self,
        pagemap: RawFd,
        start: usize,
        end: usize,
        write_protect: bool,
        regions: &mut [PageRegion],
    ) -> Result<ScanProgress, io::Error>;
}
