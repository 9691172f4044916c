use std::fmt::Debug;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};
use std::{io, mem};

use libc::{c_int, c_long, c_uint, c_ulong, cpu_set_t};

use crate::NodeIndex;
use crate::pal::linux::{Bindings, PageRegion, ResourceLimit, ScanProgress};

const MPOL_PREFERRED: c_int = 1;
const MAX_NUMA_NODES: usize = 1024;
const NODE_MASK_WORDS: usize = MAX_NUMA_NODES / c_ulong::BITS as usize;

// linux/userfaultfd.h
const UFFD_API: u64 = 0xAA;
const UFFD_USER_MODE_ONLY: c_int = 1;
const UFFD_FEATURE_WP_UNPOPULATED: u64 = 1 << 13;
const UFFD_FEATURE_WP_ASYNC: u64 = 1 << 15;
const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;
const UFFDIO_API: u32 = 0xC018_AA3F;
const UFFDIO_REGISTER: u32 = 0xC020_AA00;

// linux/fs.h
const PAGEMAP_SCAN: u32 = 0xC060_6610;
const PM_SCAN_WP_MATCHING: u64 = 1 << 0;
const PM_SCAN_CHECK_WPASYNC: u64 = 1 << 1;
pub(crate) const PAGE_IS_WRITTEN: u64 = 1 << 1;

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct PmScanArg {
    size: u64,
    flags: u64,
    start: u64,
    end: u64,
    walk_end: u64,
    vec: u64,
    vec_len: u64,
    max_pages: u64,
    category_inverted: u64,
    category_mask: u64,
    category_anyof_mask: u64,
    return_mask: u64,
}

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

// Real OS bindings are excluded from coverage measurement because:
// 1. They are tested via integration tests running on actual Linux.
// 2. Error paths require OS-level failures that are impractical to trigger in tests.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Bindings for BuildTargetBindings {
    fn sysconf(&self, name: c_int) -> Option<u64> {
        // SAFETY: No safety requirements.
        let result = unsafe { libc::sysconf(name) };

        u64::try_from(result).ok().filter(|value| *value > 0)
    }

    fn sched_getaffinity_current(&self) -> Result<cpu_set_t, io::Error> {
        // SAFETY: All zeroes is a valid cpu_set_t.
        let mut cpuset: cpu_set_t = unsafe { mem::zeroed() };

        // 0 means current thread.
        // SAFETY: No safety requirements beyond passing valid arguments.
        let result = unsafe { libc::sched_getaffinity(0, size_of::<cpu_set_t>(), &raw mut cpuset) };

        if result == 0 {
            Ok(cpuset)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> Result<(), io::Error> {
        // 0 means current thread.
        // SAFETY: No safety requirements beyond passing valid arguments.
        let result = unsafe { libc::sched_setaffinity(0, size_of::<cpu_set_t>(), cpuset) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn sched_getcpu(&self) -> i32 {
        // SAFETY: No safety requirements.
        unsafe { libc::sched_getcpu() }
    }

    #[allow(
        clippy::useless_conversion,
        reason = "rlim_t is narrower than 64 bits on some targets"
    )]
    fn getrlimit(&self, resource: ResourceLimit) -> Result<Option<u64>, io::Error> {
        let resource = match resource {
            ResourceLimit::AddressSpace => libc::RLIMIT_AS,
            ResourceLimit::Data => libc::RLIMIT_DATA,
        };

        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };

        // SAFETY: No safety requirements beyond passing valid arguments.
        let result = unsafe { libc::getrlimit(resource, &raw mut limit) };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        if limit.rlim_cur == libc::RLIM_INFINITY {
            Ok(None)
        } else {
            Ok(Some(limit.rlim_cur.into()))
        }
    }

    fn mmap_reserve(&self, size: usize) -> Result<NonNull<u8>, io::Error> {
        // SAFETY: Creating a new anonymous mapping has no safety requirements beyond passing
        // valid arguments. It does not affect any existing memory.
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if address == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(address.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
    }

    unsafe fn munmap(&self, address: NonNull<u8>, size: usize) -> Result<(), io::Error> {
        // SAFETY: Forwarding safety requirements to caller.
        let result = unsafe { libc::munmap(address.as_ptr().cast(), size) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    unsafe fn mprotect(
        &self,
        address: NonNull<u8>,
        size: usize,
        protection: c_int,
    ) -> Result<(), io::Error> {
        // SAFETY: Forwarding safety requirements to caller.
        let result = unsafe { libc::mprotect(address.as_ptr().cast(), size, protection) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    unsafe fn madvise(
        &self,
        address: NonNull<u8>,
        size: usize,
        advice: c_int,
    ) -> Result<(), io::Error> {
        // SAFETY: Forwarding safety requirements to caller.
        let result = unsafe { libc::madvise(address.as_ptr().cast(), size, advice) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    unsafe fn munlock(&self, address: NonNull<u8>, size: usize) -> Result<(), io::Error> {
        // SAFETY: Forwarding safety requirements to caller.
        let result = unsafe { libc::munlock(address.as_ptr().cast(), size) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    unsafe fn mbind_preferred(
        &self,
        address: NonNull<u8>,
        size: usize,
        node: NodeIndex,
    ) -> Result<(), io::Error> {
        let bits_per_word = c_ulong::BITS as usize;
        let node = usize::from(node);

        let mut node_mask: [c_ulong; NODE_MASK_WORDS] = [0; NODE_MASK_WORDS];

        let word = node_mask
            .get_mut(node / bits_per_word)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        *word |= 1 << (node % bits_per_word);

        // The kernel expects one more than the number of bits in the mask.
        // SAFETY: Forwarding safety requirements to caller. The node mask outlives the call.
        let result = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                address.as_ptr(),
                size,
                MPOL_PREFERRED,
                node_mask.as_ptr(),
                MAX_NUMA_NODES + 1,
                0 as c_uint,
            )
        };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn userfaultfd_open(&self) -> Result<OwnedFd, io::Error> {
        let base_flags = libc::O_CLOEXEC | libc::O_NONBLOCK;

        // Kernel-mode faults are of no interest to us and asking for user mode only lets the call
        // succeed even when unprivileged userfaultfd is otherwise disabled. Older kernels do not
        // know the flag and reject it with EINVAL.
        let fd = match open_userfaultfd(base_flags | UFFD_USER_MODE_ONLY) {
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => open_userfaultfd(base_flags)?,
            result => result?,
        };

        let required_features = UFFD_FEATURE_WP_ASYNC | UFFD_FEATURE_WP_UNPOPULATED;

        let mut api = UffdioApi {
            api: UFFD_API,
            features: required_features,
            ioctls: 0,
        };

        // SAFETY: The fd is a valid userfaultfd and the argument matches the ioctl's layout.
        let result =
            unsafe { libc::ioctl(fd.as_raw_fd(), ioctl_request(UFFDIO_API), &raw mut api) };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        if api.features & required_features != required_features {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "userfaultfd does not support asynchronous write-protect tracking",
            ));
        }

        Ok(fd)
    }

    fn userfaultfd_register_write_protect(
        &self,
        uffd: RawFd,
        address: NonNull<u8>,
        size: usize,
    ) -> Result<(), io::Error> {
        let mut register = UffdioRegister {
            range: UffdioRange {
                start: address.addr().get() as u64,
                len: size as u64,
            },
            mode: UFFDIO_REGISTER_MODE_WP,
            ioctls: 0,
        };

        // SAFETY: The argument matches the ioctl's layout. An invalid fd is reported as an error.
        let result =
            unsafe { libc::ioctl(uffd, ioctl_request(UFFDIO_REGISTER), &raw mut register) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn pagemap_open(&self) -> Result<OwnedFd, io::Error> {
        Ok(OwnedFd::from(File::open("/proc/self/pagemap")?))
    }

    fn pagemap_scan_written(
        &self,
        pagemap: RawFd,
        start: usize,
        end: usize,
        write_protect: bool,
        regions: &mut [PageRegion],
    ) -> Result<ScanProgress, io::Error> {
        let flags = if write_protect {
            PM_SCAN_WP_MATCHING | PM_SCAN_CHECK_WPASYNC
        } else {
            PM_SCAN_CHECK_WPASYNC
        };

        let vec = if regions.is_empty() {
            0
        } else {
            regions.as_mut_ptr().addr() as u64
        };

        let mut arg = PmScanArg {
            size: size_of::<PmScanArg>() as u64,
            flags,
            start: start as u64,
            end: end as u64,
            walk_end: 0,
            vec,
            vec_len: regions.len() as u64,
            max_pages: 0,
            category_inverted: 0,
            category_mask: PAGE_IS_WRITTEN,
            category_anyof_mask: 0,
            return_mask: PAGE_IS_WRITTEN,
        };

        // SAFETY: The argument matches the ioctl's layout and the output buffer it points to
        // is valid for `vec_len` entries for the duration of the call.
        let result = unsafe { libc::ioctl(pagemap, ioctl_request(PAGEMAP_SCAN), &raw mut arg) };

        let region_count =
            usize::try_from(result).map_err(|_overflow| io::Error::last_os_error())?;

        Ok(ScanProgress {
            region_count: region_count.min(regions.len()),
            walk_end: usize::try_from(arg.walk_end).unwrap_or(end),
        })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
fn open_userfaultfd(flags: c_int) -> Result<OwnedFd, io::Error> {
    // SAFETY: No safety requirements beyond passing valid arguments.
    let result: c_long = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };

    let fd = RawFd::try_from(result).map_err(|_overflow| io::Error::last_os_error())?;

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: The syscall returned a new file descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[allow(
    clippy::cast_possible_wrap,
    clippy::cast_lossless,
    trivial_numeric_casts,
    reason = "the ioctl request type is c_ulong on glibc and c_int on musl"
)]
const fn ioctl_request(request: u32) -> libc::Ioctl {
    request as libc::Ioctl
}
