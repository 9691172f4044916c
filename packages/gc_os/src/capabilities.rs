use tracing::debug;

use crate::cache::CpuVendor;
use crate::numa::NumaDirectory;
use crate::pal::{Platform, PlatformFacade};
use crate::topology::ProcessorTopology;

/// The optional operating system features that are usable in this process.
///
/// Detected once at startup. Everything else asks these flags instead of probing again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Capabilities {
    pub(crate) cpu_groups: bool,
    pub(crate) numa_aware: bool,
    pub(crate) write_watch: bool,
    pub(crate) current_processor_number: bool,

    /// `None` if the cache size cannot be deduced from processor identification registers.
    pub(crate) cpu_vendor: Option<CpuVendor>,
}

impl Capabilities {
    pub(crate) fn detect(
        platform: &PlatformFacade,
        topology: &ProcessorTopology,
        numa: &NumaDirectory,
    ) -> Self {
        let capabilities = Self {
            cpu_groups: topology.groups_enabled(),
            numa_aware: numa.is_enabled(),
            write_watch: platform.supports_write_watch(),
            current_processor_number: platform.current_processor_number().is_some(),
            cpu_vendor: CpuVendor::detect(platform),
        };

        debug!(?capabilities, "operating system capabilities detected");

        capabilities
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::OsConfig;
    use crate::pal::MockPlatform;

    #[test]
    fn flags_follow_discovery() {
        let mut platform = MockPlatform::new();

        platform.expect_supports_write_watch().return_const(true);
        platform
            .expect_current_processor_number()
            .return_const(Some(3));
        platform.expect_cpuid().returning(|_| None);
        platform.expect_numa_highest_node_number().return_const(Some(1));

        let platform = PlatformFacade::from_mock(platform);
        let numa = NumaDirectory::discover(&platform, &OsConfig::new());
        let topology = ProcessorTopology::from_group_sizes(&[8, 8]).unwrap();

        let capabilities = Capabilities::detect(&platform, &topology, &numa);

        assert_eq!(
            capabilities,
            Capabilities {
                cpu_groups: true,
                numa_aware: true,
                write_watch: true,
                current_processor_number: true,
                cpu_vendor: None,
            }
        );
    }

    #[test]
    fn everything_missing() {
        let mut platform = MockPlatform::new();

        platform.expect_supports_write_watch().return_const(false);
        platform
            .expect_current_processor_number()
            .return_const(None);
        platform.expect_cpuid().returning(|_| None);

        let platform = PlatformFacade::from_mock(platform);
        let topology = ProcessorTopology::from_group_sizes(&[4]).unwrap();

        let capabilities = Capabilities::detect(&platform, &topology, &NumaDirectory::disabled());

        assert!(!capabilities.cpu_groups);
        assert!(!capabilities.numa_aware);
        assert!(!capabilities.write_watch);
        assert!(!capabilities.current_processor_number);
        assert_eq!(capabilities.cpu_vendor, None);
    }

    #[test]
    fn fallback_platform_has_no_optional_features() {
        let platform = PlatformFacade::fallback();
        let numa = NumaDirectory::discover(&platform, &OsConfig::new());
        let topology = ProcessorTopology::discover(&platform, &OsConfig::new(), numa.is_enabled());

        let capabilities = Capabilities::detect(&platform, &topology, &numa);

        assert!(!capabilities.cpu_groups);
        assert!(!capabilities.numa_aware);
        assert!(!capabilities.write_watch);
        assert!(!capabilities.current_processor_number);
        assert_eq!(capabilities.cpu_vendor, None);
    }
}
