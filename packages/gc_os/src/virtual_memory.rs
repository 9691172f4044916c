use std::ptr::NonNull;

use derive_more::derive::Display;
use thiserror::Error;
use tracing::warn;

use crate::{NodeIndex, OsInterface};

/// Options for reserving address space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReserveFlags {
    write_watch: bool,
}

impl ReserveFlags {
    /// No options.
    #[must_use]
    pub const fn new() -> Self {
        Self { write_watch: false }
    }

    /// Sets whether the operating system should record which pages of the range are written.
    ///
    /// Only legal if [`OsInterface::supports_write_watch()`] is `true`.
    #[must_use]
    pub const fn with_write_watch(mut self, value: bool) -> Self {
        self.write_watch = value;
        self
    }

    /// Whether written pages are recorded.
    #[must_use]
    pub const fn write_watch(&self) -> bool {
        self.write_watch
    }
}

/// The lifecycle state of a [`VirtualMemoryRegion`].
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "callers match on the state and there will never be another one"
)]
pub enum RegionState {
    /// Address space is reserved but not backed by memory.
    #[display("reserved")]
    Reserved,

    /// The region is backed by memory and may be accessed.
    #[display("committed")]
    Committed,

    /// The memory was returned to the operating system, the address space is still reserved.
    #[display("decommitted")]
    Decommitted,

    /// The address space was returned to the operating system. This state is final.
    #[display("released")]
    Released,
}

/// An operation on a [`VirtualMemoryRegion`].
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum RegionOperation {
    /// See [`VirtualMemoryRegion::commit()`].
    #[display("commit")]
    Commit,

    /// See [`VirtualMemoryRegion::decommit()`].
    #[display("decommit")]
    Decommit,

    /// See [`VirtualMemoryRegion::reset()`].
    #[display("reset")]
    Reset,

    /// See [`VirtualMemoryRegion::release()`].
    #[display("release")]
    Release,

    /// See [`VirtualMemoryRegion::written_pages()`].
    #[display("query written pages of")]
    QueryWrites,
}

/// Errors returned by [`VirtualMemoryRegion`] operations.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum RegionError {
    /// The operation is not legal in the current state of the region.
    #[error("cannot {operation} a region that is {state}")]
    IllegalTransition {
        /// The operation that was attempted.
        operation: RegionOperation,

        /// The state the region is in.
        state: RegionState,
    },

    /// The operating system did not perform the operation. The region remains in the state it
    /// was in.
    #[error("the operating system failed to {operation} the region")]
    OsRefused {
        /// The operation that was attempted.
        operation: RegionOperation,
    },

    /// Written pages were requested for a region reserved without write-watch.
    #[error("the region was reserved without write-watch")]
    WriteWatchNotEnabled,
}

/// A reserved range of address space that tracks its own lifecycle.
///
/// The state machine is `Reserved -> Committed -> Decommitted -> Released`, where a decommitted
/// region may be committed again and a reserved region may be released directly. Releasing a
/// committed region is rejected: decommit it first. A reset leaves the region committed.
///
/// Dropping a region decommits and releases it, whatever state it is in.
///
/// # Example
///
/// ```rust
/// use gc_os::{OsInterface, RegionState, ReserveFlags, VirtualMemoryRegion};
///
/// let os = OsInterface::current();
/// let size = os.allocation_granularity();
///
/// let mut region = VirtualMemoryRegion::reserve(os, size, size, ReserveFlags::new())
///     .expect("out of address space");
///
/// region.commit(None).unwrap();
///
/// // SAFETY: The region is committed and we stay within it.
/// unsafe { region.base().as_ptr().write(42) };
///
/// // Releasing committed memory is not allowed.
/// assert!(region.release().is_err());
///
/// region.decommit().unwrap();
/// region.release().unwrap();
/// assert_eq!(region.state(), RegionState::Released);
/// ```
#[derive(Debug)]
pub struct VirtualMemoryRegion {
    os: OsInterface,
    base: NonNull<u8>,
    size: usize,
    state: RegionState,
    write_watch: bool,
}

// SAFETY: The region exclusively owns its address range. Nothing about it is tied to the thread
// that reserved it.
unsafe impl Send for VirtualMemoryRegion {}

// SAFETY: Shared references only allow reading the state and querying written pages, which the
// operating system synchronizes.
unsafe impl Sync for VirtualMemoryRegion {}

impl VirtualMemoryRegion {
    /// Reserves a region of `size` bytes.
    ///
    /// See [`OsInterface::virtual_reserve()`] for the requirements on `alignment` and `flags`.
    ///
    /// Returns `None` if the address space could not be reserved.
    #[must_use]
    pub fn reserve(
        os: &OsInterface,
        size: usize,
        alignment: usize,
        flags: ReserveFlags,
    ) -> Option<Self> {
        let base = os.virtual_reserve(size, alignment, flags)?;

        Some(Self {
            os: os.clone(),
            base,
            size,
            state: RegionState::Reserved,
            write_watch: flags.write_watch(),
        })
    }

    /// The first byte of the region.
    ///
    /// The memory may only be accessed while the region is committed.
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// The lifecycle state of the region.
    #[must_use]
    pub const fn state(&self) -> RegionState {
        self.state
    }

    /// Whether the region records which of its pages are written.
    #[must_use]
    pub const fn is_write_watch_enabled(&self) -> bool {
        self.write_watch
    }

    /// Backs the whole region with zeroed memory, preferably from `node` if one is given.
    ///
    /// Recommitting a write-watch region clears its write record, so only pages written after
    /// the commit are reported.
    ///
    /// # Errors
    ///
    /// Fails if the region is not reserved or decommitted, or the operating system refuses.
    pub fn commit(&mut self, node: Option<NodeIndex>) -> Result<(), RegionError> {
        self.require(
            RegionOperation::Commit,
            &[RegionState::Reserved, RegionState::Decommitted],
        )?;

        let recommitting = self.state == RegionState::Decommitted;

        // SAFETY: We own the reservation.
        let committed = unsafe { self.os.virtual_commit(self.base, self.size, node) };

        self.complete(RegionOperation::Commit, committed, RegionState::Committed)?;

        // Decommitting may discard the write record along with the pages, after which the
        // recommitted pages would all look written.
        if recommitting && self.write_watch && !self.os.reset_write_watch(self.base, self.size) {
            warn!(
                size = self.size,
                "recommitted region kept a stale write record"
            );
        }

        Ok(())
    }

    /// Returns the memory backing the region to the operating system.
    ///
    /// # Errors
    ///
    /// Fails if the region is not committed, or the operating system refuses.
    pub fn decommit(&mut self) -> Result<(), RegionError> {
        self.require(RegionOperation::Decommit, &[RegionState::Committed])?;

        // SAFETY: We own the reservation and nothing may access it while it is not committed,
        // as `base()` documents.
        let decommitted = unsafe { self.os.virtual_decommit(self.base, self.size) };

        self.complete(
            RegionOperation::Decommit,
            decommitted,
            RegionState::Decommitted,
        )
    }

    /// Tells the operating system that the contents of the region are no longer needed. The
    /// region stays committed but its contents become undefined.
    ///
    /// # Errors
    ///
    /// Fails if the region is not committed, or the operating system refuses.
    ///
    /// # Safety
    ///
    /// The caller must not rely on the contents of the region afterwards.
    pub unsafe fn reset(&mut self, unlock: bool) -> Result<(), RegionError> {
        self.require(RegionOperation::Reset, &[RegionState::Committed])?;

        // SAFETY: We own the committed reservation. The caller accepts the loss of contents.
        let reset = unsafe { self.os.virtual_reset(self.base, self.size, unlock) };

        self.complete(RegionOperation::Reset, reset, RegionState::Committed)
    }

    /// Returns the address space of the region to the operating system.
    ///
    /// # Errors
    ///
    /// Fails if the region is committed or already released, or the operating system refuses.
    pub fn release(&mut self) -> Result<(), RegionError> {
        self.require(
            RegionOperation::Release,
            &[RegionState::Reserved, RegionState::Decommitted],
        )?;

        // SAFETY: We own the entire reservation and it is not committed.
        let released = unsafe { self.os.virtual_release(self.base, self.size) };

        self.complete(RegionOperation::Release, released, RegionState::Released)
    }

    /// The pages written since the record was last cleared, in ascending order. With `reset`,
    /// the record is cleared in the same step.
    ///
    /// # Errors
    ///
    /// Fails if the region was reserved without write-watch or is released, or the operating
    /// system refuses.
    pub fn written_pages(&self, reset: bool) -> Result<Vec<NonNull<u8>>, RegionError> {
        if !self.write_watch {
            return Err(RegionError::WriteWatchNotEnabled);
        }

        if self.state == RegionState::Released {
            return Err(RegionError::IllegalTransition {
                operation: RegionOperation::QueryWrites,
                state: self.state,
            });
        }

        self.os
            .get_write_watch(reset, self.base, self.size)
            .ok_or(RegionError::OsRefused {
                operation: RegionOperation::QueryWrites,
            })
    }

    fn require(
        &self,
        operation: RegionOperation,
        legal_states: &[RegionState],
    ) -> Result<(), RegionError> {
        if legal_states.contains(&self.state) {
            Ok(())
        } else {
            Err(RegionError::IllegalTransition {
                operation,
                state: self.state,
            })
        }
    }

    fn complete(
        &mut self,
        operation: RegionOperation,
        succeeded: bool,
        new_state: RegionState,
    ) -> Result<(), RegionError> {
        if !succeeded {
            return Err(RegionError::OsRefused { operation });
        }

        self.state = new_state;
        Ok(())
    }
}

impl Drop for VirtualMemoryRegion {
    fn drop(&mut self) {
        if self.state == RegionState::Committed {
            if let Err(e) = self.decommit() {
                // Releasing would trip over the committed pages, so we leak the region instead.
                warn!(size = self.size, error = %e, "leaking region that failed to decommit");
                return;
            }
        }

        if self.state != RegionState::Released {
            if let Err(e) = self.release() {
                warn!(size = self.size, error = %e, "leaking region that failed to release");
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::OsConfig;
    use crate::pal::{MockPlatform, PlatformFacade, SystemInfo, WriteWatchReport};

    assert_impl_all!(VirtualMemoryRegion: Send, Sync);
    assert_impl_all!(RegionError: std::error::Error, Send, Sync);

    const BASE: usize = 0x10_0000;
    const SIZE: usize = 0x1_0000;

    fn fake_pointer(address: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut::<u8>(address)).unwrap()
    }

    /// A platform whose reservations always land at `BASE` and whose memory operations succeed
    /// unless the test says otherwise.
    fn mock_platform(write_watch: bool) -> MockPlatform {
        let mut platform = MockPlatform::new();

        platform.expect_system_info().return_const(SystemInfo {
            page_size: 4096,
            allocation_granularity: SIZE,
            processor_count: 1,
        });
        platform.expect_processor_groups().returning(|| None);
        platform.expect_process_affinity().returning(|| None);
        platform.expect_numa_highest_node_number().return_const(None);
        platform
            .expect_supports_write_watch()
            .return_const(write_watch);
        platform
            .expect_current_processor_number()
            .return_const(None);
        platform.expect_cpuid().returning(|_| None);
        platform
            .expect_reserve()
            .returning(|_, _| Some(fake_pointer(BASE)));

        platform
    }

    fn reserve(platform: MockPlatform, flags: ReserveFlags) -> VirtualMemoryRegion {
        let os = OsInterface::from_platform(PlatformFacade::from_mock(platform), OsConfig::new());

        VirtualMemoryRegion::reserve(&os, SIZE, SIZE, flags).unwrap()
    }

    #[test]
    fn full_lifecycle() {
        let mut platform = mock_platform(false);
        platform.expect_commit().times(2).return_const(true);
        platform.expect_decommit().times(2).return_const(true);
        platform.expect_reset().times(1).return_const(true);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().times(1).return_const(true);

        let mut region = reserve(platform, ReserveFlags::new());

        assert_eq!(region.state(), RegionState::Reserved);
        assert_eq!(region.base(), fake_pointer(BASE));
        assert_eq!(region.size(), SIZE);
        assert!(!region.is_write_watch_enabled());

        region.commit(None).unwrap();
        assert_eq!(region.state(), RegionState::Committed);

        // SAFETY: We do not care about the contents.
        unsafe { region.reset(true) }.unwrap();
        assert_eq!(region.state(), RegionState::Committed);

        region.decommit().unwrap();
        assert_eq!(region.state(), RegionState::Decommitted);

        region.commit(None).unwrap();
        region.decommit().unwrap();

        region.release().unwrap();
        assert_eq!(region.state(), RegionState::Released);
    }

    #[test]
    fn release_while_committed_is_rejected() {
        let mut platform = mock_platform(false);
        platform.expect_commit().return_const(true);
        platform.expect_decommit().times(1).return_const(true);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().times(1).return_const(true);

        let mut region = reserve(platform, ReserveFlags::new());
        region.commit(None).unwrap();

        assert_eq!(
            region.release(),
            Err(RegionError::IllegalTransition {
                operation: RegionOperation::Release,
                state: RegionState::Committed,
            })
        );
        assert_eq!(region.state(), RegionState::Committed);

        // Dropping decommits and releases.
    }

    #[test]
    fn illegal_transitions() {
        let mut platform = mock_platform(false);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().times(1).return_const(true);

        let mut region = reserve(platform, ReserveFlags::new());

        assert!(matches!(
            region.decommit(),
            Err(RegionError::IllegalTransition {
                operation: RegionOperation::Decommit,
                state: RegionState::Reserved,
            })
        ));

        // SAFETY: Rejected before touching anything.
        assert!(unsafe { region.reset(false) }.is_err());

        region.release().unwrap();

        assert!(region.commit(None).is_err());
        assert!(region.release().is_err());
    }

    #[test]
    fn os_refusal_keeps_state() {
        let mut platform = mock_platform(false);
        platform.expect_commit().times(1).return_const(false);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().times(1).return_const(true);

        let mut region = reserve(platform, ReserveFlags::new());

        assert_eq!(
            region.commit(None),
            Err(RegionError::OsRefused {
                operation: RegionOperation::Commit,
            })
        );
        assert_eq!(region.state(), RegionState::Reserved);
    }

    #[test]
    fn drop_releases_reserved_region() {
        let mut platform = mock_platform(false);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().times(1).return_const(true);

        drop(reserve(platform, ReserveFlags::new()));
    }

    #[test]
    fn drop_leaks_region_that_fails_to_decommit() {
        let mut platform = mock_platform(false);
        platform.expect_commit().return_const(true);
        platform.expect_decommit().times(1).return_const(false);
        platform.expect_release().never();

        let mut region = reserve(platform, ReserveFlags::new());
        region.commit(None).unwrap();

        drop(region);
    }

    #[test]
    fn written_pages_require_write_watch() {
        let mut platform = mock_platform(false);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().return_const(true);

        let region = reserve(platform, ReserveFlags::new());

        assert_eq!(
            region.written_pages(true),
            Err(RegionError::WriteWatchNotEnabled)
        );
    }

    #[test]
    fn written_pages_reported() {
        let mut platform = mock_platform(true);
        platform
            .expect_get_write_watch()
            .times(1)
            .returning(|_, _, _| {
                Some(WriteWatchReport {
                    pages: vec![BASE + 0x2000],
                    granularity: 4096,
                })
            });
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().return_const(true);

        let region = reserve(platform, ReserveFlags::new().with_write_watch(true));

        assert!(region.is_write_watch_enabled());
        assert_eq!(
            region.written_pages(true).unwrap(),
            vec![fake_pointer(BASE + 0x2000)]
        );
    }

    #[test]
    fn recommit_clears_write_record() {
        let mut platform = mock_platform(true);
        platform.expect_commit().times(2).return_const(true);
        platform.expect_decommit().times(2).return_const(true);
        platform
            .expect_reset_write_watch()
            .withf(|address, size| *address == fake_pointer(BASE) && *size == SIZE)
            .times(1)
            .return_const(true);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().return_const(true);

        let mut region = reserve(platform, ReserveFlags::new().with_write_watch(true));

        // The first commit starts from a clean record and needs no reset.
        region.commit(None).unwrap();
        region.decommit().unwrap();

        region.commit(None).unwrap();
        region.decommit().unwrap();
    }

    #[test]
    fn recommit_without_write_watch_leaves_record_alone() {
        let mut platform = mock_platform(false);
        platform.expect_commit().times(2).return_const(true);
        platform.expect_decommit().times(2).return_const(true);
        platform.expect_reset_write_watch().never();
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().return_const(true);

        let mut region = reserve(platform, ReserveFlags::new());

        region.commit(None).unwrap();
        region.decommit().unwrap();
        region.commit(None).unwrap();
        region.decommit().unwrap();
    }

    #[test]
    fn failed_record_reset_still_commits() {
        let mut platform = mock_platform(true);
        platform.expect_commit().times(2).return_const(true);
        platform.expect_decommit().times(2).return_const(true);
        platform.expect_reset_write_watch().return_const(false);
        platform.expect_is_range_committed().return_const(false);
        platform.expect_release().return_const(true);

        let mut region = reserve(platform, ReserveFlags::new().with_write_watch(true));

        region.commit(None).unwrap();
        region.decommit().unwrap();

        region.commit(None).unwrap();
        assert_eq!(region.state(), RegionState::Committed);
    }

    #[test]
    fn errors_describe_themselves() {
        let error = RegionError::IllegalTransition {
            operation: RegionOperation::Release,
            state: RegionState::Committed,
        };

        assert_eq!(
            error.to_string(),
            "cannot release a region that is committed"
        );

        let error = RegionError::OsRefused {
            operation: RegionOperation::QueryWrites,
        };

        assert_eq!(
            error.to_string(),
            "the operating system failed to query written pages of the region"
        );
    }

    #[test]
    fn flags_builder() {
        assert!(!ReserveFlags::new().write_watch());
        assert!(ReserveFlags::new().with_write_watch(true).write_watch());
        assert_eq!(ReserveFlags::default(), ReserveFlags::new());
    }
}
