use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::pal::{ContainerMemoryLimits, Platform, PlatformFacade, SystemMemoryStatus, percent_of};

/// Marks a budget cell whose value has not been published yet.
const NOT_COMPUTED: u64 = u64::MAX;

/// Set in the published value if the limit comes from the size of the address space.
const VIRTUAL_CONSTRAINED_BIT: u64 = 1 << 63;

/// The largest limit we can publish without colliding with the flag bit or the sentinel.
const MAX_ENCODED_LIMIT: u64 = VIRTUAL_CONSTRAINED_BIT - 2;

/// How much physical memory the process may use, once quotas, installed memory and the size of
/// the virtual address space are reconciled.
///
/// Resolved once per [`OsInterface`][crate::OsInterface] and constant afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryBudget {
    restricted_limit: Option<u64>,
    virtual_memory_constrained: bool,
}

impl MemoryBudget {
    /// The limit in bytes, or `None` if the process may use all physical memory.
    #[must_use]
    pub const fn restricted_limit(&self) -> Option<u64> {
        self.restricted_limit
    }

    /// Whether the limit is the size of the virtual address space, which is smaller than the
    /// physical memory the process would otherwise be allowed to use.
    #[must_use]
    pub const fn is_virtual_memory_constrained(&self) -> bool {
        self.virtual_memory_constrained
    }

    /// Reconciles the quotas with the memory status of the system.
    ///
    /// Unset and zero quotas are ignored. The smallest remaining quota is clamped to the
    /// installed physical memory. If the virtual address space is smaller than that (or than
    /// physical memory, if there is no quota), the address space becomes the limit.
    pub(crate) fn resolve(
        limits: Option<ContainerMemoryLimits>,
        status: &SystemMemoryStatus,
    ) -> Self {
        let quota = limits
            .into_iter()
            .flat_map(|limits| [limits.job, limits.process, limits.working_set])
            .flatten()
            .filter(|&quota| quota > 0)
            .min();

        let restricted_limit = quota.map(|quota| {
            if status.total_physical > 0 {
                quota.min(status.total_physical)
            } else {
                quota
            }
        });

        let usable = restricted_limit.unwrap_or(status.total_physical);

        if status.total_virtual > 0 && status.total_virtual < usable {
            return Self {
                restricted_limit: Some(status.total_virtual),
                virtual_memory_constrained: true,
            };
        }

        Self {
            restricted_limit,
            virtual_memory_constrained: false,
        }
    }

    /// Packs the budget into one word for the publishing cell.
    ///
    /// Limits at or above 2^63 do not fit beside the flag bit and are saturated to
    /// `MAX_ENCODED_LIMIT`, so a budget that large does not survive a round trip unchanged.
    fn encode(self) -> u64 {
        let limit = self.restricted_limit.unwrap_or(0).min(MAX_ENCODED_LIMIT);

        if self.virtual_memory_constrained {
            limit | VIRTUAL_CONSTRAINED_BIT
        } else {
            limit
        }
    }

    fn decode(value: u64) -> Self {
        let limit = value & !VIRTUAL_CONSTRAINED_BIT;

        Self {
            restricted_limit: (limit != 0).then_some(limit),
            virtual_memory_constrained: value & VIRTUAL_CONSTRAINED_BIT != 0,
        }
    }
}

/// Publishes a [`MemoryBudget`] exactly once.
///
/// The budget is encoded into a single atomic word so no reader can ever observe half of it.
/// Racing first callers may all compute it, but only the first to publish wins and every caller
/// returns the published value.
#[derive(Debug)]
pub(crate) struct MemoryBudgetCell {
    value: AtomicU64,
}

impl MemoryBudgetCell {
    pub(crate) const fn new() -> Self {
        Self {
            value: AtomicU64::new(NOT_COMPUTED),
        }
    }

    pub(crate) fn get_or_resolve(&self, platform: &PlatformFacade) -> MemoryBudget {
        self.get_or_insert_with(|| {
            MemoryBudget::resolve(platform.container_memory_limits(), &platform.memory_status())
        })
    }

    fn get_or_insert_with(&self, resolve: impl FnOnce() -> MemoryBudget) -> MemoryBudget {
        let cached = self.value.load(Ordering::Acquire);

        if cached != NOT_COMPUTED {
            return MemoryBudget::decode(cached);
        }

        let budget = resolve();
        let encoded = budget.encode();

        match self
            .value
            .compare_exchange(NOT_COMPUTED, encoded, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(
                    restricted_limit = budget.restricted_limit,
                    virtual_memory_constrained = budget.virtual_memory_constrained,
                    "memory budget published"
                );

                MemoryBudget::decode(encoded)
            }
            Err(published) => MemoryBudget::decode(published),
        }
    }
}

/// The physical memory ceiling of the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysicalMemoryLimit {
    bytes: u64,
    is_restricted: bool,
}

impl PhysicalMemoryLimit {
    pub(crate) const fn restricted(bytes: u64) -> Self {
        Self {
            bytes,
            is_restricted: true,
        }
    }

    pub(crate) const fn unrestricted(total_physical: u64) -> Self {
        Self {
            bytes: total_physical,
            is_restricted: false,
        }
    }

    /// The number of bytes of physical memory the process may use.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether the limit is lower than the physical memory installed in the machine.
    #[must_use]
    pub const fn is_restricted(&self) -> bool {
        self.is_restricted
    }
}

/// Live memory usage figures, measured against whichever limit applies to the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryStatus {
    load_percent: u32,
    available_physical: u64,
    available_page_file: u64,
}

impl MemoryStatus {
    pub(crate) fn measure(budget: MemoryBudget, platform: &PlatformFacade) -> Self {
        if let Some(limit) = budget.restricted_limit {
            if !budget.virtual_memory_constrained {
                if let Some(working_set) = platform.process_working_set() {
                    return Self::against_limit(limit, working_set);
                }

                debug!("working set unknown; reporting system memory status");
            }
        }

        let status = platform.memory_status();

        if budget.virtual_memory_constrained {
            Self::against_address_space(&status)
        } else {
            Self::unrestricted(&status)
        }
    }

    fn against_limit(limit: u64, working_set: u64) -> Self {
        Self {
            load_percent: percent_of(working_set, limit),
            available_physical: limit.saturating_sub(working_set),
            available_page_file: 0,
        }
    }

    fn against_address_space(status: &SystemMemoryStatus) -> Self {
        let used = status.total_virtual.saturating_sub(status.available_virtual);

        Self {
            load_percent: percent_of(used, status.total_virtual),
            available_physical: status.available_virtual,
            available_page_file: 0,
        }
    }

    fn unrestricted(status: &SystemMemoryStatus) -> Self {
        Self {
            load_percent: status.load_percent,
            available_physical: status.available_physical,
            available_page_file: status.available_page_file,
        }
    }

    /// How much of the usable memory is in use, as a percentage from 0 to 100.
    #[must_use]
    pub const fn load_percent(&self) -> u32 {
        self.load_percent
    }

    /// Bytes of physical memory the process can still use.
    #[must_use]
    pub const fn available_physical(&self) -> u64 {
        self.available_physical
    }

    /// Bytes of page file the process can still use. Always zero when a quota or the address
    /// space is the limit.
    #[must_use]
    pub const fn available_page_file(&self) -> u64 {
        self.available_page_file
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::pal::MockPlatform;

    assert_impl_all!(MemoryBudgetCell: Send, Sync);

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    fn status(total_physical: u64, total_virtual: u64) -> SystemMemoryStatus {
        SystemMemoryStatus {
            load_percent: 40,
            total_physical,
            available_physical: total_physical / 2,
            total_virtual,
            available_virtual: total_virtual / 4,
            available_page_file: 3 * GB,
        }
    }

    #[test]
    fn job_limit_alone() {
        let limits = ContainerMemoryLimits {
            job: Some(100 * MB),
            ..Default::default()
        };

        let budget = MemoryBudget::resolve(Some(limits), &status(GB, 128 * GB));

        assert_eq!(budget.restricted_limit(), Some(100 * MB));
        assert!(!budget.is_virtual_memory_constrained());
    }

    #[test]
    fn smallest_set_quota_wins() {
        let limits = ContainerMemoryLimits {
            job: Some(800 * MB),
            process: None,
            working_set: Some(300 * MB),
        };

        let budget = MemoryBudget::resolve(Some(limits), &status(GB, 128 * GB));

        assert_eq!(budget.restricted_limit(), Some(300 * MB));
    }

    #[test]
    fn zero_quota_is_ignored() {
        let limits = ContainerMemoryLimits {
            job: Some(0),
            process: Some(200 * MB),
            working_set: None,
        };

        let budget = MemoryBudget::resolve(Some(limits), &status(GB, 128 * GB));

        assert_eq!(budget.restricted_limit(), Some(200 * MB));
    }

    #[test]
    fn quota_clamped_to_physical() {
        let limits = ContainerMemoryLimits {
            job: Some(64 * GB),
            ..Default::default()
        };

        let budget = MemoryBudget::resolve(Some(limits), &status(8 * GB, 128 * GB));

        assert_eq!(budget.restricted_limit(), Some(8 * GB));
        assert!(!budget.is_virtual_memory_constrained());
    }

    #[test]
    fn no_container_means_unrestricted() {
        let budget = MemoryBudget::resolve(None, &status(8 * GB, 128 * GB));

        assert_eq!(budget.restricted_limit(), None);
    }

    #[test]
    fn container_without_quotas_is_unrestricted() {
        let budget = MemoryBudget::resolve(
            Some(ContainerMemoryLimits::default()),
            &status(8 * GB, 128 * GB),
        );

        assert_eq!(budget.restricted_limit(), None);
    }

    #[test]
    fn small_address_space_constrains() {
        let budget = MemoryBudget::resolve(None, &status(8 * GB, 2 * GB));

        assert_eq!(budget.restricted_limit(), Some(2 * GB));
        assert!(budget.is_virtual_memory_constrained());
    }

    #[test]
    fn address_space_below_quota_constrains() {
        let limits = ContainerMemoryLimits {
            job: Some(4 * GB),
            ..Default::default()
        };

        let budget = MemoryBudget::resolve(Some(limits), &status(8 * GB, 2 * GB));

        assert_eq!(budget.restricted_limit(), Some(2 * GB));
        assert!(budget.is_virtual_memory_constrained());
    }

    #[test]
    fn address_space_above_quota_does_not_constrain() {
        let limits = ContainerMemoryLimits {
            job: Some(GB),
            ..Default::default()
        };

        let budget = MemoryBudget::resolve(Some(limits), &status(8 * GB, 2 * GB));

        assert_eq!(budget.restricted_limit(), Some(GB));
        assert!(!budget.is_virtual_memory_constrained());
    }

    #[test]
    fn encoding_preserves_every_shape() {
        for budget in [
            MemoryBudget {
                restricted_limit: None,
                virtual_memory_constrained: false,
            },
            MemoryBudget {
                restricted_limit: Some(100 * MB),
                virtual_memory_constrained: false,
            },
            MemoryBudget {
                restricted_limit: Some(2 * GB),
                virtual_memory_constrained: true,
            },
        ] {
            let encoded = budget.encode();

            assert_ne!(encoded, NOT_COMPUTED);
            assert_eq!(MemoryBudget::decode(encoded), budget);
        }
    }

    #[test]
    fn huge_limit_does_not_become_sentinel() {
        let budget = MemoryBudget {
            restricted_limit: Some(u64::MAX),
            virtual_memory_constrained: true,
        };

        assert_ne!(budget.encode(), NOT_COMPUTED);
    }

    #[test]
    fn huge_limit_is_saturated() {
        for virtual_memory_constrained in [false, true] {
            let budget = MemoryBudget {
                restricted_limit: Some(VIRTUAL_CONSTRAINED_BIT),
                virtual_memory_constrained,
            };

            assert_eq!(
                MemoryBudget::decode(budget.encode()),
                MemoryBudget {
                    restricted_limit: Some(MAX_ENCODED_LIMIT),
                    virtual_memory_constrained,
                }
            );
        }
    }

    #[test]
    fn cell_resolves_once() {
        let mut platform = MockPlatform::new();

        platform
            .expect_container_memory_limits()
            .times(1)
            .returning(|| {
                Some(ContainerMemoryLimits {
                    job: Some(100 * MB),
                    ..Default::default()
                })
            });
        platform
            .expect_memory_status()
            .times(1)
            .return_const(status(GB, 128 * GB));

        let platform = PlatformFacade::from_mock(platform);
        let cell = MemoryBudgetCell::new();

        let first = cell.get_or_resolve(&platform);
        let second = cell.get_or_resolve(&platform);

        assert_eq!(first, second);
        assert_eq!(first.restricted_limit(), Some(100 * MB));
    }

    #[test]
    fn racing_first_callers_agree() {
        const THREADS: usize = 8;

        with_watchdog(|| {
            let cell = Arc::new(MemoryBudgetCell::new());
            let barrier = Arc::new(Barrier::new(THREADS));
            let computations = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..THREADS)
                .map(|thread_index| {
                    let cell = Arc::clone(&cell);
                    let barrier = Arc::clone(&barrier);
                    let computations = Arc::clone(&computations);

                    thread::spawn(move || {
                        barrier.wait();

                        cell.get_or_insert_with(|| {
                            computations.fetch_add(1, Ordering::Relaxed);

                            // Each thread computes a different value so that a torn or
                            // overwritten publication would be detected.
                            MemoryBudget {
                                restricted_limit: Some((thread_index as u64 + 1) * GB),
                                virtual_memory_constrained: thread_index % 2 == 0,
                            }
                        })
                    })
                })
                .collect();

            let results: Vec<MemoryBudget> = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect();

            assert!(computations.load(Ordering::Relaxed) >= 1);
            assert!(results.windows(2).all(|pair| pair[0] == pair[1]));

            let published = MemoryBudget::decode(cell.value.load(Ordering::Acquire));
            assert_eq!(results[0], published);

            let index = published.restricted_limit().unwrap() / GB - 1;
            assert_eq!(published.is_virtual_memory_constrained(), index % 2 == 0);
        });
    }

    fn platform_for_status(working_set: Option<u64>, status: SystemMemoryStatus) -> PlatformFacade {
        let mut platform = MockPlatform::new();

        platform
            .expect_process_working_set()
            .return_const(working_set);
        platform.expect_memory_status().return_const(status);

        PlatformFacade::from_mock(platform)
    }

    #[test]
    fn status_against_quota() {
        let budget = MemoryBudget {
            restricted_limit: Some(100 * MB),
            virtual_memory_constrained: false,
        };
        let platform = platform_for_status(Some(25 * MB), status(GB, 128 * GB));

        let memory = MemoryStatus::measure(budget, &platform);

        assert_eq!(memory.load_percent(), 25);
        assert_eq!(memory.available_physical(), 75 * MB);
        assert_eq!(memory.available_page_file(), 0);
    }

    #[test]
    fn status_with_working_set_over_quota() {
        let budget = MemoryBudget {
            restricted_limit: Some(100 * MB),
            virtual_memory_constrained: false,
        };
        let platform = platform_for_status(Some(150 * MB), status(GB, 128 * GB));

        let memory = MemoryStatus::measure(budget, &platform);

        assert_eq!(memory.load_percent(), 100);
        assert_eq!(memory.available_physical(), 0);
    }

    #[test]
    fn status_with_unknown_working_set_uses_system() {
        let budget = MemoryBudget {
            restricted_limit: Some(100 * MB),
            virtual_memory_constrained: false,
        };
        let platform = platform_for_status(None, status(GB, 128 * GB));

        let memory = MemoryStatus::measure(budget, &platform);

        assert_eq!(memory.load_percent(), 40);
        assert_eq!(memory.available_physical(), GB / 2);
        assert_eq!(memory.available_page_file(), 3 * GB);
    }

    #[test]
    fn status_against_address_space() {
        let budget = MemoryBudget {
            restricted_limit: Some(2 * GB),
            virtual_memory_constrained: true,
        };
        let platform = platform_for_status(Some(GB), status(8 * GB, 2 * GB));

        let memory = MemoryStatus::measure(budget, &platform);

        // A quarter of the address space is available.
        assert_eq!(memory.load_percent(), 75);
        assert_eq!(memory.available_physical(), GB / 2);
        assert_eq!(memory.available_page_file(), 0);
    }

    #[test]
    fn status_unrestricted() {
        let budget = MemoryBudget {
            restricted_limit: None,
            virtual_memory_constrained: false,
        };
        let platform = platform_for_status(Some(GB), status(8 * GB, 128 * GB));

        let memory = MemoryStatus::measure(budget, &platform);

        assert_eq!(memory.load_percent(), 40);
        assert_eq!(memory.available_physical(), 4 * GB);
        assert_eq!(memory.available_page_file(), 3 * GB);
    }
}
