use derive_more::derive::Display;

/// Identifies a logical processor in the global index space that spans all processor groups.
///
/// Global indexes are contiguous and start from zero: the processors of the first group come
/// first, followed by the processors of the second group and so on.
pub type ProcessorIndex = u32;

/// Identifies a processor group.
///
/// Operating systems that do not partition processors into groups present a single implicit
/// group with index zero.
pub type GroupIndex = u16;

/// Identifies a NUMA node (a memory region with processor-dependent access latency).
///
/// This matches the numeric identifier used by standard tooling of the operating system.
pub type NodeIndex = u16;

/// A processor addressed relative to the processor group that contains it.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("processor {index_in_group} in group {group}")]
pub struct ProcessorNumber {
    group: GroupIndex,
    index_in_group: u32,
}

impl ProcessorNumber {
    /// Creates a group-relative processor number.
    #[must_use]
    pub const fn new(group: GroupIndex, index_in_group: u32) -> Self {
        Self {
            group,
            index_in_group,
        }
    }

    /// The group that contains the processor.
    #[must_use]
    pub const fn group(&self) -> GroupIndex {
        self.group
    }

    /// The index of the processor within its group.
    #[must_use]
    pub const fn index_in_group(&self) -> u32 {
        self.index_in_group
    }
}
