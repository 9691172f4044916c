use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::NodeIndex;
use crate::pal::linux::{Bindings, BuildTargetPlatform, Filesystem, is_any_mapping_accessible};
use crate::pal::Platform;

impl BuildTargetPlatform {
    /// Maps an inaccessible range aligned to the allocation granularity.
    ///
    /// `mmap()` only guarantees page alignment, so we map enough extra to be able to find an
    /// aligned start inside the mapping and unmap the excess on both sides.
    pub(super) fn reserve_aligned(&self, size: usize, write_watch: bool) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let info = self.system_info();
        let granularity = info.allocation_granularity;

        let size = size.checked_next_multiple_of(info.page_size)?;
        let padding = granularity.saturating_sub(info.page_size);
        let padded_size = size.checked_add(padding)?;

        let tracker = if write_watch {
            Some(self.write_watch_tracker()?)
        } else {
            None
        };

        let mapping = self
            .bindings
            .mmap_reserve(padded_size)
            .inspect_err(|e| debug!(size, error = %e, "address space reservation failed"))
            .ok()?;

        let misalignment = mapping.addr().get() % granularity;
        let head = if misalignment == 0 {
            0
        } else {
            granularity.saturating_sub(misalignment)
        };
        let tail = padding.saturating_sub(head);

        // Derived from the mapping pointer to keep its provenance. Cannot be null because it is
        // inside the mapping.
        let base = NonNull::new(mapping.as_ptr().wrapping_add(head))?;

        if head > 0 {
            // SAFETY: The head is the part of our fresh mapping that precedes the aligned range.
            unsafe { unmap_excess(self, mapping, head) };
        }

        if tail > 0 {
            let tail_start = NonNull::new(base.as_ptr().wrapping_add(size))?;

            // SAFETY: The tail is the part of our fresh mapping that follows the aligned range.
            unsafe { unmap_excess(self, tail_start, tail) };
        }

        if let Some(tracker) = tracker {
            if !self.start_tracking_writes(tracker, base, size) {
                // SAFETY: We own the whole range and nobody has seen it yet.
                _ = unsafe { self.bindings.munmap(base, size) };
                return None;
            }
        }

        trace!(address = base.addr().get(), size, write_watch, "reserved address space");

        Some(base)
    }

    /// # Safety
    ///
    /// See `Platform::commit()`.
    pub(super) unsafe fn commit_range(
        &self,
        address: NonNull<u8>,
        size: usize,
        node: Option<NodeIndex>,
    ) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        let committed = unsafe {
            self.bindings
                .mprotect(address, size, libc::PROT_READ | libc::PROT_WRITE)
        };

        if let Err(e) = committed {
            debug!(address = address.addr().get(), size, error = %e, "commit failed");
            return false;
        }

        if let Some(node) = node {
            // The policy only steers where pages land once touched. If the kernel refuses it,
            // the memory is still committed and usable.
            // SAFETY: Forwarding safety requirements to caller.
            if let Err(e) = unsafe { self.bindings.mbind_preferred(address, size, node) } {
                debug!(node, error = %e, "NUMA placement preference rejected");
            }
        }

        true
    }

    /// # Safety
    ///
    /// See `Platform::decommit()`.
    pub(super) unsafe fn decommit_range(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        let discarded = unsafe { self.bindings.madvise(address, size, libc::MADV_DONTNEED) };

        if let Err(e) = discarded {
            debug!(
                address = address.addr().get(),
                size,
                error = %e,
                "decommit failed to discard pages"
            );
            return false;
        }

        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.bindings.mprotect(address, size, libc::PROT_NONE) }
            .inspect_err(|e| {
                debug!(
                    address = address.addr().get(),
                    size,
                    error = %e,
                    "decommit failed to protect pages"
                );
            })
            .is_ok()
    }

    /// # Safety
    ///
    /// See `Platform::reset()`.
    pub(super) unsafe fn reset_range(
        &self,
        address: NonNull<u8>,
        size: usize,
        unlock: bool,
    ) -> bool {
        // MADV_FREE lets the kernel reclaim the pages lazily. Kernels before 4.5 do not know it,
        // in which case we discard the pages eagerly instead.
        // SAFETY: Forwarding safety requirements to caller.
        let reset = match unsafe { self.bindings.madvise(address, size, libc::MADV_FREE) } {
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                // SAFETY: Forwarding safety requirements to caller.
                unsafe { self.bindings.madvise(address, size, libc::MADV_DONTNEED) }
            }
            result => result,
        };

        if let Err(e) = reset {
            debug!(address = address.addr().get(), size, error = %e, "reset failed");
            return false;
        }

        if unlock {
            // Unlocking pages that were never locked is not an error.
            // SAFETY: Forwarding safety requirements to caller.
            if let Err(e) = unsafe { self.bindings.munlock(address, size) } {
                debug!(error = %e, "munlock after reset failed");
            }
        }

        true
    }

    /// # Safety
    ///
    /// See `Platform::release()`.
    pub(super) unsafe fn release_range(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.bindings.munmap(address, size) }
            .inspect_err(|e| {
                debug!(address = address.addr().get(), size, error = %e, "release failed");
            })
            .is_ok()
    }

    pub(super) fn is_range_accessible(&self, address: NonNull<u8>, size: usize) -> bool {
        let Some(maps) = self.fs.get_proc_self_maps_contents() else {
            return false;
        };

        let start = address.addr().get();

        is_any_mapping_accessible(&maps, start, start.saturating_add(size))
            .inspect_err(|e| debug!(error = %e, "unparseable memory map"))
            .unwrap_or(false)
    }
}

/// # Safety
///
/// The range must be an unused part of a mapping owned by the caller.
unsafe fn unmap_excess(platform: &BuildTargetPlatform, address: NonNull<u8>, size: usize) {
    // SAFETY: Forwarding safety requirements to caller.
    if let Err(e) = unsafe { platform.bindings.munmap(address, size) } {
        // Leaves some inaccessible address space mapped. Harmless.
        debug!(size, error = %e, "failed to trim reservation padding");
    }
}
