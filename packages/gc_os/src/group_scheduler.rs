use crate::{GroupIndex, ProcessorTopology};

/// Decides which processor group each new worker thread should run in.
///
/// Every assignment adds the weight of the chosen group to that group's running total, and the
/// group with the smallest total is chosen next. Because a group's weight is inversely
/// proportional to its size, threads end up spread across groups in proportion to the number of
/// processors in each group, using only integer arithmetic.
///
/// # Example
///
/// ```rust
/// use gc_os::{ProcessorTopology, WeightedGroupScheduler};
///
/// // One group with 4 processors, another with 2.
/// let topology = ProcessorTopology::from_group_sizes(&[4, 2]).unwrap();
/// let mut scheduler = WeightedGroupScheduler::new(&topology);
///
/// let assignments: Vec<_> = (0..6).map(|_| scheduler.next_group()).collect();
///
/// assert_eq!(assignments.iter().filter(|&&g| g == 0).count(), 4);
/// assert_eq!(assignments.iter().filter(|&&g| g == 1).count(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct WeightedGroupScheduler {
    groups: Vec<ScheduledGroup>,
}

#[derive(Clone, Copy, Debug)]
struct ScheduledGroup {
    index: GroupIndex,
    weight: u64,
    assigned_weight: u64,
}

impl WeightedGroupScheduler {
    /// Creates a scheduler that has not assigned any threads yet.
    #[must_use]
    pub fn new(topology: &ProcessorTopology) -> Self {
        let groups = topology
            .groups()
            .iter()
            .map(|group| ScheduledGroup {
                index: group.index(),
                weight: group.weight(),
                assigned_weight: 0,
            })
            .collect();

        Self { groups }
    }

    /// Chooses the group for the next worker thread and records the assignment.
    ///
    /// Ties go to the group that comes first.
    pub fn next_group(&mut self) -> GroupIndex {
        // `min_by_key()` returns the first of equal elements.
        let chosen = self
            .groups
            .iter_mut()
            .min_by_key(|group| group.assigned_weight);

        // The topology always has at least one group.
        let Some(chosen) = chosen else {
            return 0;
        };

        chosen.assigned_weight = chosen.assigned_weight.saturating_add(chosen.weight);
        chosen.index
    }

    /// The total weight assigned to a group so far, or `None` if there is no such group.
    #[must_use]
    pub fn assigned_weight(&self, group: GroupIndex) -> Option<u64> {
        self.groups
            .iter()
            .find(|g| g.index == group)
            .map(|g| g.assigned_weight)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn assignment_counts(sizes: &[u32], rounds: usize) -> Vec<usize> {
        let topology = ProcessorTopology::from_group_sizes(sizes).unwrap();
        let mut scheduler = WeightedGroupScheduler::new(&topology);

        let mut counts = vec![0; sizes.len()];

        for _ in 0..rounds {
            counts[scheduler.next_group() as usize] += 1;
        }

        counts
    }

    #[test]
    fn single_group_gets_everything() {
        assert_eq!(assignment_counts(&[8], 20), vec![20]);
    }

    #[test]
    fn equal_groups_alternate() {
        let topology = ProcessorTopology::from_group_sizes(&[16, 16]).unwrap();
        let mut scheduler = WeightedGroupScheduler::new(&topology);

        let order: Vec<_> = (0..4).map(|_| scheduler.next_group()).collect();

        assert_eq!(order, vec![0, 1, 0, 1]);
    }

    #[test]
    fn threads_per_processor_converge() {
        // One full round of the least common multiple (192) hands out exactly one thread per
        // processor in every group.
        let counts = assignment_counts(&[64, 32, 48], 144);

        assert_eq!(counts, vec![64, 32, 48]);
    }

    #[test]
    fn assigned_weight_accumulates() {
        let topology = ProcessorTopology::from_group_sizes(&[4, 2]).unwrap();
        let mut scheduler = WeightedGroupScheduler::new(&topology);

        assert_eq!(scheduler.assigned_weight(0), Some(0));

        assert_eq!(scheduler.next_group(), 0);
        assert_eq!(scheduler.assigned_weight(0), Some(1));

        assert_eq!(scheduler.next_group(), 1);
        assert_eq!(scheduler.assigned_weight(1), Some(2));

        assert_eq!(scheduler.assigned_weight(7), None);
    }
}
