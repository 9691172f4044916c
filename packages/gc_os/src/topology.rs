use nonempty::NonEmpty;
use tracing::{debug, warn};

use crate::pal::{GroupInfo, Platform, PlatformFacade};
use crate::{AffinityMask, GroupIndex, OsConfig, ProcessorIndex, ProcessorNumber};

/// One operating system partition of logical processors.
///
/// The processors of a group occupy the inclusive range `begin()..=end()` of the global
/// processor index space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessorGroup {
    index: GroupIndex,
    active_count: u32,
    affinity_mask: AffinityMask,
    begin: ProcessorIndex,
    end: ProcessorIndex,
    weight: u64,
}

impl ProcessorGroup {
    /// Index of the group as the operating system knows it.
    #[must_use]
    pub const fn index(&self) -> GroupIndex {
        self.index
    }

    /// Number of active logical processors in the group.
    #[must_use]
    pub const fn active_count(&self) -> u32 {
        self.active_count
    }

    /// The active processors of the group, as group-relative processor numbers.
    ///
    /// The mask may have holes, for example after processors were removed from a running system.
    #[must_use]
    pub const fn affinity_mask(&self) -> AffinityMask {
        self.affinity_mask
    }

    /// Global index of the first processor in the group.
    #[must_use]
    pub const fn begin(&self) -> ProcessorIndex {
        self.begin
    }

    /// Global index of the last processor in the group.
    #[must_use]
    pub const fn end(&self) -> ProcessorIndex {
        self.end
    }

    /// Scheduling weight of the group.
    ///
    /// `weight() * active_count()` is the same for every group of a topology, so a group with
    /// fewer processors weighs more. See [`WeightedGroupScheduler`][crate::WeightedGroupScheduler].
    #[must_use]
    pub const fn weight(&self) -> u64 {
        self.weight
    }

    const fn contains(&self, processor: ProcessorIndex) -> bool {
        self.begin <= processor && processor <= self.end
    }
}

/// The processors of the machine, partitioned into processor groups.
///
/// The topology is discovered once when an [`OsInterface`][crate::OsInterface] is created and
/// never changes afterwards. If processor groups are not supported, not enabled or discovery
/// fails, the topology consists of a single implicit group that contains every processor.
///
/// # Example
///
/// ```rust
/// use gc_os::ProcessorTopology;
///
/// let topology = ProcessorTopology::from_group_sizes(&[4, 6]).unwrap();
///
/// assert_eq!(topology.total_processor_count(), 10);
/// assert_eq!(topology.groups()[1].begin(), 4);
///
/// // 12 is the least common multiple of 4 and 6.
/// assert_eq!(topology.groups()[0].weight(), 3);
/// assert_eq!(topology.groups()[1].weight(), 2);
///
/// let processor = topology.group_for_processor(5).unwrap();
/// assert_eq!(processor.group(), 1);
/// assert_eq!(processor.index_in_group(), 1);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessorTopology {
    groups: NonEmpty<ProcessorGroup>,
    total_processor_count: u32,
    groups_enabled: bool,
    numa_enabled: bool,
    single_processor_at_startup: bool,
}

impl ProcessorTopology {
    pub(crate) fn discover(
        platform: &PlatformFacade,
        config: &OsConfig,
        numa_enabled: bool,
    ) -> Self {
        let single_processor_at_startup = platform
            .process_affinity()
            .is_some_and(|affinity| affinity.process.intersection(&affinity.system).is_single());

        let implicit = || {
            let processor_count = platform.system_info().processor_count.max(1);
            Self::single_group(processor_count, numa_enabled, single_processor_at_startup)
        };

        let Some(reported) = platform.processor_groups() else {
            debug!("processor groups not supported");
            return implicit();
        };

        if reported.len() <= 1 {
            debug!(groups = reported.len(), "single processor group");
            return implicit();
        }

        if !config.cpu_groups() {
            debug!(
                groups = reported.len(),
                "multiple processor groups present but not enabled by configuration"
            );
            return implicit();
        }

        let Some(groups) = build_groups(&reported) else {
            warn!(
                ?reported,
                "processor groups cannot be weighted; using a single implicit group"
            );
            return implicit();
        };

        let topology = Self::from_groups(groups, true, numa_enabled, single_processor_at_startup);

        debug!(
            groups = topology.groups.len(),
            total_processor_count = topology.total_processor_count,
            "processor groups enabled"
        );

        topology
    }

    /// Builds a topology with processor groups of the given sizes, in order.
    ///
    /// This is meant for simulating machines with multiple processor groups. Every group is
    /// considered fully active. Returns `None` if there are no groups, a group is empty or
    /// larger than 64 processors, or the groups cannot be weighted without overflowing.
    #[must_use]
    pub fn from_group_sizes(sizes: &[u32]) -> Option<Self> {
        let reported = sizes
            .iter()
            .map(|&active_count| GroupInfo {
                active_count,
                active_mask: AffinityMask::first_n(active_count as usize).low_bits(),
            })
            .collect::<Vec<_>>();

        if reported.iter().any(|group| group.active_count > 64) {
            return None;
        }

        let groups = build_groups(&reported)?;
        let groups_enabled = groups.len() > 1;

        Some(Self::from_groups(groups, groups_enabled, false, false))
    }

    fn single_group(
        processor_count: u32,
        numa_enabled: bool,
        single_processor_at_startup: bool,
    ) -> Self {
        let group = ProcessorGroup {
            index: 0,
            active_count: processor_count,
            affinity_mask: AffinityMask::first_n(processor_count as usize),
            begin: 0,
            end: processor_count.saturating_sub(1),
            weight: 1,
        };

        Self::from_groups(
            NonEmpty::new(group),
            false,
            numa_enabled,
            single_processor_at_startup,
        )
    }

    fn from_groups(
        groups: NonEmpty<ProcessorGroup>,
        groups_enabled: bool,
        numa_enabled: bool,
        single_processor_at_startup: bool,
    ) -> Self {
        let total_processor_count = groups.last().end.saturating_add(1);

        Self {
            groups,
            total_processor_count,
            groups_enabled,
            numa_enabled,
            single_processor_at_startup,
        }
    }

    /// The processor groups, in operating system order.
    #[must_use]
    pub fn groups(&self) -> &NonEmpty<ProcessorGroup> {
        &self.groups
    }

    /// Number of processors across all groups.
    #[must_use]
    pub const fn total_processor_count(&self) -> u32 {
        self.total_processor_count
    }

    /// Whether threads may be distributed across multiple processor groups.
    #[must_use]
    pub const fn groups_enabled(&self) -> bool {
        self.groups_enabled
    }

    /// Whether NUMA-aware behavior is enabled.
    #[must_use]
    pub const fn numa_enabled(&self) -> bool {
        self.numa_enabled
    }

    /// Whether the process was limited to a single processor when the topology was discovered.
    #[must_use]
    pub const fn single_processor_at_startup(&self) -> bool {
        self.single_processor_at_startup
    }

    /// Translates a global processor index into a group-relative processor number.
    ///
    /// Global indexes count only active processors, so the `n`-th processor of a group is the
    /// `n`-th processor in its [`affinity_mask()`][ProcessorGroup::affinity_mask].
    ///
    /// Returns `None` if the index is not less than [`total_processor_count()`][1].
    ///
    /// [1]: Self::total_processor_count
    #[must_use]
    pub fn group_for_processor(&self, processor: ProcessorIndex) -> Option<ProcessorNumber> {
        // There are at most a few dozen groups, so a scan beats anything clever.
        let group = self.groups.iter().find(|group| group.contains(processor))?;

        let position = processor.checked_sub(group.begin)?;
        let index_in_group = group.affinity_mask.nth(position as usize)?;

        Some(ProcessorNumber::new(
            group.index,
            ProcessorIndex::try_from(index_in_group).ok()?,
        ))
    }
}

/// Assigns index ranges and weights to the reported groups.
///
/// Returns `None` if any group is empty or its mask disagrees with its processor count, there
/// are more groups than group indexes, or the least common multiple of the group sizes does not
/// fit in 64 bits.
fn build_groups(reported: &[GroupInfo]) -> Option<NonEmpty<ProcessorGroup>> {
    let consistent = |group: &GroupInfo| {
        group.active_count > 0 && group.active_mask.count_ones() == group.active_count
    };

    if !reported.iter().all(consistent) {
        return None;
    }

    let lcm = reported.iter().try_fold(1_u64, |lcm, group| {
        least_common_multiple(lcm, u64::from(group.active_count))
    })?;

    let mut begin: ProcessorIndex = 0;
    let mut groups = Vec::with_capacity(reported.len());

    for (index, group) in reported.iter().enumerate() {
        let end = begin.checked_add(group.active_count)?.checked_sub(1)?;

        groups.push(ProcessorGroup {
            index: GroupIndex::try_from(index).ok()?,
            active_count: group.active_count,
            affinity_mask: AffinityMask::from_bits(group.active_mask),
            begin,
            end,
            weight: lcm.checked_div(u64::from(group.active_count))?,
        });

        begin = end.checked_add(1)?;
    }

    NonEmpty::from_vec(groups)
}

fn least_common_multiple(a: u64, b: u64) -> Option<u64> {
    let divisor = greatest_common_divisor(a, b);

    a.checked_div(divisor)?.checked_mul(b)
}

fn greatest_common_divisor(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a.wrapping_rem(b));
    }

    a
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::pal::{MockPlatform, ProcessAffinity, SystemInfo};

    assert_impl_all!(ProcessorTopology: Send, Sync);

    fn system_info(processor_count: u32) -> SystemInfo {
        SystemInfo {
            page_size: 4096,
            allocation_granularity: 64 * 1024,
            processor_count,
        }
    }

    fn group(active_count: u32) -> GroupInfo {
        GroupInfo {
            active_count,
            active_mask: AffinityMask::first_n(active_count as usize).low_bits(),
        }
    }

    fn platform_with_groups(
        groups: Option<Vec<GroupInfo>>,
        processor_count: u32,
    ) -> PlatformFacade {
        let mut platform = MockPlatform::new();

        platform
            .expect_system_info()
            .return_const(system_info(processor_count));
        platform
            .expect_processor_groups()
            .returning(move || groups.clone());
        platform.expect_process_affinity().returning(move || {
            let all = AffinityMask::first_n(processor_count as usize);
            Some(ProcessAffinity {
                process: all,
                system: all,
            })
        });

        PlatformFacade::from_mock(platform)
    }

    fn assert_partition(topology: &ProcessorTopology) {
        let sum: u32 = topology.groups().iter().map(ProcessorGroup::active_count).sum();
        assert_eq!(sum, topology.total_processor_count());

        let mut expected_begin = 0;
        for group in topology.groups() {
            assert_eq!(group.begin(), expected_begin);
            assert_eq!(group.end() + 1 - group.begin(), group.active_count());
            expected_begin = group.end() + 1;
        }

        for processor in 0..topology.total_processor_count() {
            let containing = topology
                .groups()
                .iter()
                .filter(|group| group.contains(processor))
                .count();
            assert_eq!(containing, 1);
            assert!(topology.group_for_processor(processor).is_some());
        }
    }

    fn assert_equal_weight_products(topology: &ProcessorTopology) {
        let products: Vec<u64> = topology
            .groups()
            .iter()
            .map(|group| group.weight() * u64::from(group.active_count()))
            .collect();

        assert!(products.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn no_group_support_gives_single_implicit_group() {
        let platform = platform_with_groups(None, 8);

        let topology =
            ProcessorTopology::discover(&platform, &OsConfig::new().with_cpu_groups(true), false);

        assert!(!topology.groups_enabled());
        assert_eq!(topology.groups().len(), 1);
        assert_eq!(topology.total_processor_count(), 8);
        assert_eq!(topology.groups().head.weight(), 1);
        assert_eq!(topology.groups().head.end(), 7);
        assert_partition(&topology);
    }

    #[test]
    fn one_reported_group_is_not_enabled() {
        let platform = platform_with_groups(Some(vec![group(6)]), 6);

        let topology =
            ProcessorTopology::discover(&platform, &OsConfig::new().with_cpu_groups(true), false);

        assert!(!topology.groups_enabled());
        assert_eq!(topology.total_processor_count(), 6);
    }

    #[test]
    fn multiple_groups_need_configuration_opt_in() {
        let platform = platform_with_groups(Some(vec![group(64), group(32)]), 64);

        let topology = ProcessorTopology::discover(&platform, &OsConfig::new(), false);

        assert!(!topology.groups_enabled());
        assert_eq!(topology.groups().len(), 1);
        assert_eq!(topology.total_processor_count(), 64);
    }

    #[test]
    fn uneven_groups_are_weighted() {
        let platform = platform_with_groups(Some(vec![group(64), group(32), group(48)]), 64);

        let topology =
            ProcessorTopology::discover(&platform, &OsConfig::new().with_cpu_groups(true), true);

        assert!(topology.groups_enabled());
        assert!(topology.numa_enabled());
        assert_eq!(topology.total_processor_count(), 144);

        // LCM(64, 32, 48) = 192.
        let weights: Vec<u64> = topology.groups().iter().map(ProcessorGroup::weight).collect();
        assert_eq!(weights, vec![3, 6, 4]);

        assert_partition(&topology);
        assert_equal_weight_products(&topology);

        let processor = topology.group_for_processor(100).unwrap();
        assert_eq!(processor, ProcessorNumber::new(2, 4));
        assert!(topology.group_for_processor(144).is_none());
    }

    #[test]
    fn sparse_group_masks_map_to_active_processors() {
        let sparse = GroupInfo {
            active_count: 4,
            active_mask: 0b1011_0100,
        };
        let platform = platform_with_groups(Some(vec![group(8), sparse]), 8);

        let topology =
            ProcessorTopology::discover(&platform, &OsConfig::new().with_cpu_groups(true), false);

        assert!(topology.groups_enabled());
        assert_eq!(topology.total_processor_count(), 12);
        assert_eq!(
            topology.groups()[1].affinity_mask(),
            AffinityMask::from_bits(0b1011_0100)
        );
        assert_partition(&topology);

        // Global indexes 8..12 are the processors 2, 4, 5 and 7 of the second group.
        assert_eq!(
            topology.group_for_processor(7),
            Some(ProcessorNumber::new(0, 7))
        );
        assert_eq!(
            topology.group_for_processor(8),
            Some(ProcessorNumber::new(1, 2))
        );
        assert_eq!(
            topology.group_for_processor(10),
            Some(ProcessorNumber::new(1, 5))
        );
        assert_eq!(
            topology.group_for_processor(11),
            Some(ProcessorNumber::new(1, 7))
        );
        assert_eq!(topology.group_for_processor(12), None);
    }

    #[test]
    fn mask_disagreeing_with_count_degrades_to_implicit_group() {
        let inconsistent = GroupInfo {
            active_count: 4,
            active_mask: 0b111,
        };
        let platform = platform_with_groups(Some(vec![group(4), inconsistent]), 4);

        let topology =
            ProcessorTopology::discover(&platform, &OsConfig::new().with_cpu_groups(true), false);

        assert!(!topology.groups_enabled());
        assert_eq!(topology.total_processor_count(), 4);
    }

    #[test]
    fn empty_group_degrades_to_implicit_group() {
        let platform = platform_with_groups(Some(vec![group(4), group(0)]), 4);

        let topology =
            ProcessorTopology::discover(&platform, &OsConfig::new().with_cpu_groups(true), false);

        assert!(!topology.groups_enabled());
        assert_eq!(topology.total_processor_count(), 4);
    }

    #[test]
    fn single_processor_at_startup_from_affinity() {
        let mut platform = MockPlatform::new();

        platform.expect_system_info().return_const(system_info(4));
        platform.expect_processor_groups().returning(|| None);
        platform.expect_process_affinity().returning(|| {
            Some(ProcessAffinity {
                process: [2].into_iter().collect(),
                system: AffinityMask::first_n(4),
            })
        });

        let topology = ProcessorTopology::discover(
            &PlatformFacade::from_mock(platform),
            &OsConfig::new(),
            false,
        );

        assert!(topology.single_processor_at_startup());
    }

    #[test]
    fn unknown_affinity_is_not_single_processor() {
        let mut platform = MockPlatform::new();

        platform.expect_system_info().return_const(system_info(1));
        platform.expect_processor_groups().returning(|| None);
        platform.expect_process_affinity().returning(|| None);

        let topology = ProcessorTopology::discover(
            &PlatformFacade::from_mock(platform),
            &OsConfig::new(),
            false,
        );

        assert!(!topology.single_processor_at_startup());
        assert_eq!(topology.total_processor_count(), 1);
    }

    #[test]
    fn from_group_sizes_many_shapes() {
        for sizes in [
            &[1_u32][..],
            &[64, 64],
            &[7, 11, 13],
            &[64, 63, 62, 61, 60, 59, 58, 57],
            &[2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47],
        ] {
            let topology = ProcessorTopology::from_group_sizes(sizes).unwrap();

            assert_eq!(topology.groups_enabled(), sizes.len() > 1);
            assert_partition(&topology);
            assert_equal_weight_products(&topology);
        }
    }

    #[test]
    fn from_group_sizes_rejects_invalid() {
        assert!(ProcessorTopology::from_group_sizes(&[]).is_none());
        assert!(ProcessorTopology::from_group_sizes(&[4, 0]).is_none());
        assert!(ProcessorTopology::from_group_sizes(&[65]).is_none());
    }

    #[test]
    fn lcm_overflow_is_detected() {
        // The product of the primes up to 47 fits in 64 bits, multiplying by 53 does not.
        let primes = [2_u32, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

        assert!(ProcessorTopology::from_group_sizes(&primes).is_none());
        assert!(ProcessorTopology::from_group_sizes(&primes[..15]).is_some());
    }

    #[test]
    fn gcd_and_lcm() {
        assert_eq!(greatest_common_divisor(12, 18), 6);
        assert_eq!(greatest_common_divisor(7, 1), 1);
        assert_eq!(least_common_multiple(4, 6), Some(12));
        assert_eq!(least_common_multiple(u64::MAX, 2), None);
    }
}
