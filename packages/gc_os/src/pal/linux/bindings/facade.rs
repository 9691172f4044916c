#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::ptr::NonNull;
#[cfg(test)]
use std::sync::Arc;

use libc::{c_int, cpu_set_t};

use crate::NodeIndex;
#[cfg(test)]
use crate::pal::linux::MockBindings;
use crate::pal::linux::{Bindings, BuildTargetBindings, PageRegion, ResourceLimit, ScanProgress};

/// Enum to hide the real/mock choice behind a single wrapper type.
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
    fn sysconf(&self, name: c_int) -> Option<u64> {
        match self {
            Self::Target(bindings) => bindings.sysconf(name),
            #[cfg(test)]
            Self::Mock(mock) => mock.sysconf(name),
        }
    }

    fn sched_getaffinity_current(&self) -> Result<cpu_set_t, io::Error> {
        match self {
            Self::Target(bindings) => bindings.sched_getaffinity_current(),
            #[cfg(test)]
            Self::Mock(mock) => mock.sched_getaffinity_current(),
        }
    }

    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> Result<(), io::Error> {
        match self {
            Self::Target(bindings) => bindings.sched_setaffinity_current(cpuset),
            #[cfg(test)]
            Self::Mock(mock) => mock.sched_setaffinity_current(cpuset),
        }
    }

    fn sched_getcpu(&self) -> i32 {
        match self {
            Self::Target(bindings) => bindings.sched_getcpu(),
            #[cfg(test)]
            Self::Mock(mock) => mock.sched_getcpu(),
        }
    }

    fn getrlimit(&self, resource: ResourceLimit) -> Result<Option<u64>, io::Error> {
        match self {
            Self::Target(bindings) => bindings.getrlimit(resource),
            #[cfg(test)]
            Self::Mock(mock) => mock.getrlimit(resource),
        }
    }

    fn mmap_reserve(&self, size: usize) -> Result<NonNull<u8>, io::Error> {
        match self {
            Self::Target(bindings) => bindings.mmap_reserve(size),
            #[cfg(test)]
            Self::Mock(mock) => mock.mmap_reserve(size),
        }
    }

    unsafe fn munmap(&self, address: NonNull<u8>, size: usize) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.munmap(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.munmap(address, size) },
        }
    }

    unsafe fn mprotect(
        &self,
        address: NonNull<u8>,
        size: usize,
        protection: c_int,
    ) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.mprotect(address, size, protection) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.mprotect(address, size, protection) },
        }
    }

    unsafe fn madvise(
        &self,
        address: NonNull<u8>,
        size: usize,
        advice: c_int,
    ) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.madvise(address, size, advice) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.madvise(address, size, advice) },
        }
    }

    unsafe fn munlock(&self, address: NonNull<u8>, size: usize) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.munlock(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.munlock(address, size) },
        }
    }

    unsafe fn mbind_preferred(
        &self,
        address: NonNull<u8>,
        size: usize,
        node: NodeIndex,
    ) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.mbind_preferred(address, size, node) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.mbind_preferred(address, size, node) },
        }
    }

    fn userfaultfd_open(&self) -> Result<OwnedFd, io::Error> {
        match self {
            Self::Target(bindings) => bindings.userfaultfd_open(),
            #[cfg(test)]
            Self::Mock(mock) => mock.userfaultfd_open(),
        }
    }

    fn userfaultfd_register_write_protect(
        &self,
        uffd: RawFd,
        address: NonNull<u8>,
        size: usize,
    ) -> Result<(), io::Error> {
        match self {
            Self::Target(bindings) => {
                bindings.userfaultfd_register_write_protect(uffd, address, size)
            }
            #[cfg(test)]
            Self::Mock(mock) => mock.userfaultfd_register_write_protect(uffd, address, size),
        }
    }

    fn pagemap_open(&self) -> Result<OwnedFd, io::Error> {
        match self {
            Self::Target(bindings) => bindings.pagemap_open(),
            #[cfg(test)]
            Self::Mock(mock) => mock.pagemap_open(),
        }
    }

    fn pagemap_scan_written(
        &self,
        pagemap: RawFd,
        start: usize,
        end: usize,
        write_protect: bool,
        regions: &mut [PageRegion],
    ) -> Result<ScanProgress, io::Error> {
        match self {
            Self::Target(bindings) => {
                bindings.pagemap_scan_written(pagemap, start, end, write_protect, regions)
            }
            #[cfg(test)]
            Self::Mock(mock) => {
                mock.pagemap_scan_written(pagemap, start, end, write_protect, regions)
            }
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
