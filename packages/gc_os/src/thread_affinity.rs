use crate::{GroupIndex, ProcessorIndex};

/// Describes the processor that a thread should be pinned to.
///
/// Without a group, the processor is identified by its global index. With a group, the processor
/// is identified by its index within that group.
///
/// # Example
///
/// ```rust
/// use gc_os::ThreadAffinity;
///
/// let global = ThreadAffinity::processor(5);
/// assert_eq!(global.group(), None);
///
/// let relative = ThreadAffinity::processor(5).in_group(1);
/// assert_eq!(relative.group(), Some(1));
/// assert_eq!(relative.processor_index(), Some(5));
///
/// assert_eq!(ThreadAffinity::none().processor_index(), None);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ThreadAffinity {
    group: Option<GroupIndex>,
    processor: Option<ProcessorIndex>,
}

impl ThreadAffinity {
    /// An affinity request that names no processor. Applying it always fails.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            group: None,
            processor: None,
        }
    }

    /// Requests the processor with the given index.
    #[must_use]
    pub const fn processor(processor: ProcessorIndex) -> Self {
        Self {
            group: None,
            processor: Some(processor),
        }
    }

    /// Interprets the processor index as relative to the given processor group.
    #[must_use]
    pub const fn in_group(mut self, group: GroupIndex) -> Self {
        self.group = Some(group);
        self
    }

    /// The processor group that the processor index is relative to, if any.
    #[must_use]
    pub const fn group(&self) -> Option<GroupIndex> {
        self.group
    }

    /// The requested processor, if any.
    #[must_use]
    pub const fn processor_index(&self) -> Option<ProcessorIndex> {
        self.processor
    }
}
