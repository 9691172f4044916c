//! Write-watch on Linux is built from two kernel features that together behave like a dirty
//! page log:
//!
//! * A userfaultfd registration in asynchronous write-protect mode. The kernel resolves
//!   write-protect faults by itself and merely clears the write-protect bit of the page.
//! * The `PAGEMAP_SCAN` ioctl, which lists the pages whose write-protect bit is clear (i.e. the
//!   pages written since they were last protected) and can atomically protect them again.
//!
//! Both need Linux 6.7 or newer. On older kernels the detection fails and write-watch is
//! reported as unsupported.

use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use tracing::debug;

use crate::pal::Platform;
use crate::pal::linux::{Bindings, BuildTargetPlatform, PageRegion};

/// Number of page runs we retrieve per `PAGEMAP_SCAN` call.
const SCAN_BATCH_SIZE: usize = 64;

/// The file descriptors needed to track writes. Opened once and kept open for the lifetime of
/// the platform, since registrations die with the userfaultfd.
#[derive(Debug)]
pub(crate) struct WriteWatchTracker {
    uffd: OwnedFd,
    pagemap: OwnedFd,
}

impl BuildTargetPlatform {
    pub(super) fn write_watch_tracker(&self) -> Option<&WriteWatchTracker> {
        self.write_watch_tracker
            .get_or_init(|| self.open_write_watch_tracker())
            .as_ref()
    }

    fn open_write_watch_tracker(&self) -> Option<WriteWatchTracker> {
        let uffd = self
            .bindings
            .userfaultfd_open()
            .inspect_err(|e| debug!(error = %e, "userfaultfd write-protect tracking unavailable"))
            .ok()?;

        let pagemap = self
            .bindings
            .pagemap_open()
            .inspect_err(|e| debug!(error = %e, "pagemap unavailable"))
            .ok()?;

        Some(WriteWatchTracker { uffd, pagemap })
    }

    /// Registers a fresh reservation for tracking and protects all of it, so that the first
    /// write to any page is recorded.
    pub(super) fn start_tracking_writes(
        &self,
        tracker: &WriteWatchTracker,
        address: NonNull<u8>,
        size: usize,
    ) -> bool {
        if let Err(e) =
            self.bindings
                .userfaultfd_register_write_protect(tracker.uffd.as_raw_fd(), address, size)
        {
            debug!(error = %e, "failed to register range for write tracking");
            return false;
        }

        self.protect_written_pages(tracker, address, size)
    }

    /// Write-protects every page in the range without reporting anything.
    pub(super) fn reset_written_pages(&self, address: NonNull<u8>, size: usize) -> bool {
        self.write_watch_tracker()
            .is_some_and(|tracker| self.protect_written_pages(tracker, address, size))
    }

    fn protect_written_pages(
        &self,
        tracker: &WriteWatchTracker,
        address: NonNull<u8>,
        size: usize,
    ) -> bool {
        let start = address.addr().get();
        let Some(end) = start.checked_add(size) else {
            return false;
        };

        // Without an output buffer the kernel walks the whole range in one go.
        self.bindings
            .pagemap_scan_written(tracker.pagemap.as_raw_fd(), start, end, true, &mut [])
            .inspect_err(|e| debug!(error = %e, "failed to reset written pages"))
            .is_ok()
    }

    /// Lists the addresses of the pages written since the range was last protected, optionally
    /// protecting them again in the same step.
    pub(super) fn scan_written_pages(
        &self,
        address: NonNull<u8>,
        size: usize,
        reset: bool,
    ) -> Option<Vec<usize>> {
        let tracker = self.write_watch_tracker()?;
        let page_size = self.system_info().page_size;

        let start = address.addr().get();
        let end = start.checked_add(size)?;

        let mut regions = [PageRegion::default(); SCAN_BATCH_SIZE];
        let mut pages = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let progress = self
                .bindings
                .pagemap_scan_written(tracker.pagemap.as_raw_fd(), cursor, end, reset, &mut regions)
                .inspect_err(|e| debug!(error = %e, "failed to scan for written pages"))
                .ok()?;

            for region in regions.iter().take(progress.region_count) {
                let region_start = usize::try_from(region.start).ok()?;
                let region_end = usize::try_from(region.end).ok()?;

                pages.extend((region_start..region_end).step_by(page_size));
            }

            if progress.walk_end <= cursor {
                // The kernel made no progress. Stop rather than spin.
                break;
            }

            cursor = progress.walk_end;
        }

        Some(pages)
    }

    /// Exercises the full write-watch cycle on a scratch reservation. Only a kernel that passes
    /// every step is considered to support write-watch.
    pub(super) fn detect_write_watch(&self) -> bool {
        let info = self.system_info();
        let size = info.allocation_granularity;

        let Some(base) = self.reserve_aligned(size, true) else {
            debug!("write-watch not supported: cannot reserve a tracked range");
            return false;
        };

        // Write to the second page (if there is one) so that a kernel reporting everything or
        // only the first page does not pass the check.
        let offset = if size >= info.page_size.saturating_mul(2) {
            info.page_size
        } else {
            0
        };
        let target = base.as_ptr().wrapping_add(offset);

        // SAFETY: We own the fresh reservation.
        let supported = unsafe { self.commit_range(base, size, None) } && {
            // SAFETY: The target is inside the range we just committed.
            unsafe {
                target.write_volatile(1);
            }

            let written = self.scan_written_pages(base, size, true);
            let written_after_reset = self.scan_written_pages(base, size, false);

            written.as_deref() == Some(&[target.addr()])
                && written_after_reset.as_deref() == Some(&[])
        };

        // SAFETY: We own the reservation and nothing references it any more.
        unsafe {
            self.release_range(base, size);
        }

        debug!(supported, "write-watch detection finished");

        supported
    }
}
