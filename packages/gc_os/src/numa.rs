use tracing::debug;

use crate::pal::{Platform, PlatformFacade};
use crate::{NodeIndex, OsConfig, ProcessorNumber};

/// Knows which NUMA node each processor belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct NumaDirectory {
    highest_node: NodeIndex,
    enabled: bool,
}

impl NumaDirectory {
    /// NUMA awareness is only enabled if the configuration allows it and there is more than
    /// one node to be aware of.
    pub(crate) fn discover(platform: &PlatformFacade, config: &OsConfig) -> Self {
        let Some(highest_node) = platform.numa_highest_node_number() else {
            debug!("NUMA information unavailable");
            return Self::disabled();
        };

        let enabled = config.numa_aware() && highest_node > 0;

        debug!(
            highest_node,
            opted_in = config.numa_aware(),
            enabled,
            "NUMA discovery complete"
        );

        Self {
            highest_node,
            enabled,
        }
    }

    pub(crate) const fn disabled() -> Self {
        Self {
            highest_node: 0,
            enabled: false,
        }
    }

    pub(crate) const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) const fn highest_node(&self) -> NodeIndex {
        self.highest_node
    }

    /// The node of the given processor, or `None` if the operating system does not know.
    ///
    /// Only legal when NUMA awareness is enabled.
    pub(crate) fn processor_node(
        &self,
        platform: &PlatformFacade,
        processor: ProcessorNumber,
    ) -> Option<NodeIndex> {
        debug_assert!(
            self.enabled,
            "processor node requested without NUMA awareness enabled"
        );

        platform.processor_node(processor)
    }
}
