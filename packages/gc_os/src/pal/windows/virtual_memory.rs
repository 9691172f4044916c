use std::ptr::NonNull;

use tracing::{debug, trace};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, MEM_WRITE_WATCH,
};

use crate::NodeIndex;
use crate::pal::windows::{Bindings, BuildTargetPlatform};
use crate::pal::{Platform, WriteWatchReport};

impl BuildTargetPlatform {
    /// `VirtualAlloc()` already aligns reservations to the allocation granularity.
    pub(super) fn reserve_range(&self, size: usize, write_watch: bool) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let allocation_type = if write_watch {
            MEM_RESERVE | MEM_WRITE_WATCH
        } else {
            MEM_RESERVE
        };

        let Some(base) = self.bindings.virtual_alloc_reserve(size, allocation_type) else {
            debug!(size, write_watch, "address space reservation failed");
            return None;
        };

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
        let committed = match node {
            // SAFETY: Forwarding safety requirements to caller.
            None => unsafe { self.bindings.virtual_alloc_commit(address, size) },
            // SAFETY: Forwarding safety requirements to caller.
            Some(node) => unsafe {
                self.bindings
                    .virtual_alloc_commit_numa(address, size, u32::from(node))
            },
        };

        if !committed {
            debug!(address = address.addr().get(), size, ?node, "commit failed");
        }

        committed
    }

    /// # Safety
    ///
    /// See `Platform::decommit()`.
    pub(super) unsafe fn decommit_range(&self, address: NonNull<u8>, size: usize) -> bool {
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.bindings.virtual_free(address, size, MEM_DECOMMIT) }
            .inspect_err(|e| {
                debug!(address = address.addr().get(), size, error = %e, "decommit failed");
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
        // SAFETY: Forwarding safety requirements to caller.
        if !unsafe { self.bindings.virtual_alloc_reset(address, size) } {
            debug!(address = address.addr().get(), size, "reset failed");
            return false;
        }

        if unlock {
            // Unlocking pages that were never locked fails, which is fine.
            // SAFETY: Forwarding safety requirements to caller.
            if let Err(e) = unsafe { self.bindings.virtual_unlock(address, size) } {
                debug!(error = %e, "VirtualUnlock after reset failed");
            }
        }

        true
    }

    /// # Safety
    ///
    /// See `Platform::release()`.
    pub(super) unsafe fn release_range(&self, address: NonNull<u8>, size: usize) -> bool {
        // MEM_RELEASE always releases the entire reservation and demands a size of zero.
        // SAFETY: Forwarding safety requirements to caller.
        unsafe { self.bindings.virtual_free(address, 0, MEM_RELEASE) }
            .inspect_err(|e| {
                debug!(address = address.addr().get(), size, error = %e, "release failed");
            })
            .is_ok()
    }

    /// Walks the regions of identical state that cover the range.
    pub(super) fn is_any_page_committed(&self, address: NonNull<u8>, size: usize) -> bool {
        let start = address.addr().get();
        let end = start.saturating_add(size);

        let mut cursor = start;

        while cursor < end {
            let Some(region) = self.bindings.virtual_query(cursor) else {
                return false;
            };

            if region.State == MEM_COMMIT {
                return true;
            }

            let region_end = region.BaseAddress.addr().saturating_add(region.RegionSize);

            if region_end <= cursor {
                return false;
            }

            cursor = region_end;
        }

        false
    }

    pub(super) fn written_pages(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
    ) -> Option<WriteWatchReport> {
        let page_size = self.system_info().page_size;

        // Every page of the range may have been written, so this is always enough.
        let mut addresses = vec![0_usize; size.div_ceil(page_size)];

        let output = self
            .bindings
            .get_write_watch(reset, address, size, &mut addresses)
            .inspect_err(|e| debug!(error = %e, "GetWriteWatch failed"))
            .ok()?;

        addresses.truncate(output.count);

        Some(WriteWatchReport {
            pages: addresses,
            granularity: output.granularity as usize,
        })
    }

    /// Windows supports write-watch if it lets us reserve a range with it.
    pub(super) fn detect_write_watch(&self) -> bool {
        let size = self.system_info().allocation_granularity;

        let Some(base) = self.reserve_range(size, true) else {
            debug!("write-watch not supported");
            return false;
        };

        // SAFETY: We own the reservation and nothing references it.
        unsafe {
            self.release_range(base, size);
        }

        true
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr;

    use mockall::predicate::eq;
    use windows::Win32::Foundation::E_FAIL;
    use windows::Win32::System::Memory::{MEM_FREE, MEMORY_BASIC_INFORMATION};
    use windows::Win32::System::SystemInformation::{PROCESSOR_GROUP_INFO, SYSTEM_INFO};
    use windows::core::Error;

    use super::*;
    use crate::pal::windows::{BindingsFacade, MockBindings, WriteWatchOutput};

    fn fake_pointer(address: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut::<u8>(address)).unwrap()
    }

    fn bindings_with_4k_pages() -> MockBindings {
        let mut bindings = MockBindings::new();

        bindings.expect_get_system_info().returning(|| SYSTEM_INFO {
            dwPageSize: 4096,
            dwAllocationGranularity: 64 * 1024,
            ..Default::default()
        });
        bindings
            .expect_get_processor_group_information()
            .returning(|| {
                Ok(vec![PROCESSOR_GROUP_INFO {
                    MaximumProcessorCount: 4,
                    ActiveProcessorCount: 4,
                    Reserved: [0; 38],
                    ActiveProcessorMask: 0b1111,
                }])
            });

        bindings
    }

    fn platform(bindings: MockBindings) -> BuildTargetPlatform {
        BuildTargetPlatform::new(BindingsFacade::from_mock(bindings))
    }

    #[test]
    fn reserve_requests_write_watch_when_asked() {
        let mut bindings = MockBindings::new();

        bindings
            .expect_virtual_alloc_reserve()
            .with(eq(64 * 1024), eq(MEM_RESERVE | MEM_WRITE_WATCH))
            .times(1)
            .returning(|_, _| Some(fake_pointer(0x1_0000)));
        bindings
            .expect_virtual_alloc_reserve()
            .with(eq(64 * 1024), eq(MEM_RESERVE))
            .times(1)
            .returning(|_, _| None);

        let platform = platform(bindings);

        assert_eq!(
            platform.reserve_range(64 * 1024, true),
            Some(fake_pointer(0x1_0000))
        );
        assert_eq!(platform.reserve_range(64 * 1024, false), None);
        assert_eq!(platform.reserve_range(0, false), None);
    }

    #[test]
    fn numa_commit_uses_preferred_node() {
        let mut bindings = MockBindings::new();

        bindings
            .expect_virtual_alloc_commit_numa()
            .withf(|_, size, node| *size == 4096 && *node == 1)
            .times(1)
            .return_const(true);

        let platform = platform(bindings);

        // SAFETY: The mock does not touch memory.
        assert!(unsafe { platform.commit_range(fake_pointer(0x1_0000), 4096, Some(1)) });
    }

    #[test]
    fn release_passes_zero_size() {
        let mut bindings = MockBindings::new();

        bindings
            .expect_virtual_free()
            .withf(|_, size, free_type| *size == 0 && *free_type == MEM_RELEASE)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let platform = platform(bindings);

        // SAFETY: The mock does not touch memory.
        assert!(unsafe { platform.release_range(fake_pointer(0x1_0000), 64 * 1024) });
    }

    #[test]
    fn reset_ignores_unlock_failure() {
        let mut bindings = MockBindings::new();

        bindings
            .expect_virtual_alloc_reset()
            .times(1)
            .return_const(true);
        bindings
            .expect_virtual_unlock()
            .times(1)
            .returning(|_, _| Err(Error::from_hresult(E_FAIL)));

        let platform = platform(bindings);

        // SAFETY: The mock does not touch memory.
        assert!(unsafe { platform.reset_range(fake_pointer(0x1_0000), 4096, true) });
    }

    #[test]
    fn committed_region_is_found_after_reserved_one() {
        let mut bindings = MockBindings::new();

        bindings
            .expect_virtual_query()
            .with(eq(0x1_0000))
            .returning(|_| {
                Some(MEMORY_BASIC_INFORMATION {
                    BaseAddress: ptr::without_provenance_mut(0x1_0000),
                    RegionSize: 0x2000,
                    State: MEM_RESERVE,
                    ..Default::default()
                })
            });
        bindings
            .expect_virtual_query()
            .with(eq(0x1_2000))
            .returning(|_| {
                Some(MEMORY_BASIC_INFORMATION {
                    BaseAddress: ptr::without_provenance_mut(0x1_2000),
                    RegionSize: 0x1000,
                    State: MEM_COMMIT,
                    ..Default::default()
                })
            });

        let platform = platform(bindings);

        assert!(platform.is_any_page_committed(fake_pointer(0x1_0000), 0x1_0000));
        assert!(!platform.is_any_page_committed(fake_pointer(0x1_0000), 0x2000));
    }

    #[test]
    fn free_region_is_not_committed() {
        let mut bindings = MockBindings::new();

        bindings.expect_virtual_query().returning(|address| {
            Some(MEMORY_BASIC_INFORMATION {
                BaseAddress: ptr::without_provenance_mut(address),
                RegionSize: 0x10_0000,
                State: MEM_FREE,
                ..Default::default()
            })
        });

        let platform = platform(bindings);

        assert!(!platform.is_any_page_committed(fake_pointer(0x1_0000), 0x1_0000));
    }

    #[test]
    fn write_watch_truncates_to_reported_count() {
        let mut bindings = bindings_with_4k_pages();

        bindings
            .expect_get_write_watch()
            .withf(|reset, _, size, addresses| {
                *reset && *size == 64 * 1024 && addresses.len() == 16
            })
            .times(1)
            .returning(|_, _, _, addresses| {
                addresses[0] = 0x1_1000;
                Ok(WriteWatchOutput {
                    count: 1,
                    granularity: 4096,
                })
            });

        let platform = platform(bindings);

        let report = platform
            .written_pages(true, fake_pointer(0x1_0000), 64 * 1024)
            .unwrap();

        assert_eq!(report.pages, vec![0x1_1000]);
        assert_eq!(report.granularity, 4096);
    }

    #[test]
    fn write_watch_detection_releases_trial_reservation() {
        let mut bindings = bindings_with_4k_pages();

        bindings
            .expect_virtual_alloc_reserve()
            .with(eq(64 * 1024), eq(MEM_RESERVE | MEM_WRITE_WATCH))
            .times(1)
            .returning(|_, _| Some(fake_pointer(0x1_0000)));
        bindings
            .expect_virtual_free()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let platform = platform(bindings);

        assert!(platform.supports_write_watch());
        // Cached.
        assert!(platform.supports_write_watch());
    }
}
