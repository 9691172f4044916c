//! Deduces the size of the largest processor cache.
//!
//! Sources are tried in order of preference:
//!
//! 1. Vendor-specific deduction from processor identification registers.
//! 2. The cache descriptors enumerated by the operating system (largest entry wins).
//! 3. Zero, meaning the size could not be discovered.

use tracing::debug;

use crate::pal::{CpuidRegisters, Platform, PlatformFacade};

/// Leaf 0 returns the vendor identification string in EBX, EDX, ECX (in that order).
const INTEL_VENDOR: [u32; 3] = [
    u32::from_le_bytes(*b"Genu"),
    u32::from_le_bytes(*b"ineI"),
    u32::from_le_bytes(*b"ntel"),
];
const AMD_VENDOR: [u32; 3] = [
    u32::from_le_bytes(*b"Auth"),
    u32::from_le_bytes(*b"enti"),
    u32::from_le_bytes(*b"cAMD"),
];

const EXTENDED_MAX_LEAF: u32 = 0x8000_0000;
const AMD_L2_L3_CACHE_LEAF: u32 = 0x8000_0006;
const AMD_CORE_COUNT_LEAF: u32 = 0x8000_0008;

/// Generation zero budgets are tuned against this multiple of the cache size on architectures
/// where the collector benefits from a budget larger than the cache itself.
const SCALE_FACTOR: u64 = 3;

/// Processor vendors whose identification registers we know how to interpret.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CpuVendor {
    Intel {
        /// Highest standard leaf the processor supports.
        max_leaf: u32,
    },
    Amd,
}

impl CpuVendor {
    pub(crate) fn detect(platform: &PlatformFacade) -> Option<Self> {
        let leaf0 = platform.cpuid(0)?;
        let vendor = [leaf0.ebx, leaf0.edx, leaf0.ecx];

        if vendor == INTEL_VENDOR {
            Some(Self::Intel {
                max_leaf: leaf0.eax,
            })
        } else if vendor == AMD_VENDOR {
            Some(Self::Amd)
        } else {
            None
        }
    }
}

/// The size of the largest processor cache, in bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CacheSize {
    /// The actual size of the largest cache.
    pub(crate) true_size: u64,

    /// The size that generation zero budgets should be derived from.
    pub(crate) scaled_size: u64,
}

impl CacheSize {
    pub(crate) fn detect(platform: &PlatformFacade, vendor: Option<CpuVendor>) -> Self {
        let size = vendor
            .and_then(|vendor| from_vendor(platform, vendor))
            .or_else(|| from_os(platform))
            .unwrap_or_default();

        debug!(
            ?vendor,
            true_size = size.true_size,
            scaled_size = size.scaled_size,
            "largest cache size determined"
        );

        size
    }
}

fn from_vendor(platform: &PlatformFacade, vendor: CpuVendor) -> Option<CacheSize> {
    match vendor {
        CpuVendor::Intel { max_leaf } => {
            // The operating system reports Intel caches accurately. The vendor only decides
            // the scaling.
            let true_size = largest_os_cache(platform)?;

            let scale = if cfg!(target_pointer_width = "64") && max_leaf >= 2 {
                SCALE_FACTOR
            } else {
                1
            };

            Some(CacheSize {
                true_size,
                scaled_size: true_size.saturating_mul(scale),
            })
        }
        CpuVendor::Amd => {
            let true_size = amd_cache_size(platform)?;

            Some(CacheSize {
                true_size,
                scaled_size: true_size,
            })
        }
    }
}

/// The L2 cache size plus this core's share of the L3 cache.
fn amd_cache_size(platform: &PlatformFacade) -> Option<u64> {
    let max_extended_leaf = platform.cpuid(EXTENDED_MAX_LEAF)?.eax;

    if max_extended_leaf < AMD_L2_L3_CACHE_LEAF {
        debug!(max_extended_leaf, "processor does not report cache sizes");
        return None;
    }

    let caches = platform.cpuid(AMD_L2_L3_CACHE_LEAF)?;
    let l2_size = u64::from(caches.ecx >> 16).saturating_mul(1024);

    let signature = platform.cpuid(1)?;

    if !has_l3_cache(signature) {
        return (l2_size > 0).then_some(l2_size);
    }

    // Each core gets an equal share of L3, which is reported in units of 512 KiB.
    let l3_size = u64::from(caches.edx >> 18).saturating_mul(512 * 1024);

    let core_count = if max_extended_leaf >= AMD_CORE_COUNT_LEAF {
        u64::from(platform.cpuid(AMD_CORE_COUNT_LEAF)?.ecx & 0xFF).saturating_add(1)
    } else {
        1
    };

    let size = l2_size.saturating_add(l3_size.checked_div(core_count).unwrap_or_default());

    (size > 0).then_some(size)
}

/// Family 0x10 and later have an L3 cache, except for model 2 of family 0x10.
fn has_l3_cache(signature: CpuidRegisters) -> bool {
    let base_family = (signature.eax >> 8) & 0xF;
    let extended_family = (signature.eax >> 20) & 0xFF;
    let base_model = (signature.eax >> 4) & 0xF;
    let extended_model = (signature.eax >> 16) & 0xF;

    let (family, model) = if base_family == 0xF {
        (
            base_family.saturating_add(extended_family),
            (extended_model << 4) | base_model,
        )
    } else {
        (base_family, base_model)
    };

    family >= 0x10 && !(family == 0x10 && model == 2)
}

fn from_os(platform: &PlatformFacade) -> Option<CacheSize> {
    let true_size = largest_os_cache(platform)?;

    let scale = if cfg!(target_arch = "aarch64") {
        SCALE_FACTOR
    } else {
        1
    };

    Some(CacheSize {
        true_size,
        scaled_size: true_size.saturating_mul(scale),
    })
}

fn largest_os_cache(platform: &PlatformFacade) -> Option<u64> {
    platform
        .os_cache_sizes()
        .into_iter()
        .max()
        .filter(|&size| size > 0)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::pal::MockPlatform;

    fn vendor_leaf(max_leaf: u32, vendor: [u32; 3]) -> CpuidRegisters {
        CpuidRegisters {
            eax: max_leaf,
            ebx: vendor[0],
            edx: vendor[1],
            ecx: vendor[2],
        }
    }

    /// Family 0x17 (Zen) is encoded as base family 0xF plus extended family 0x8.
    const ZEN_SIGNATURE: u32 = (0x8 << 20) | (0xF << 8) | (0x1 << 4);

    fn amd_platform(signature: u32, l2_kib: u32, l3_units: u32, cores: u32) -> MockPlatform {
        let mut platform = MockPlatform::new();

        platform.expect_cpuid().returning(move |leaf| match leaf {
            0 => Some(vendor_leaf(0x10, AMD_VENDOR)),
            1 => Some(CpuidRegisters {
                eax: signature,
                ..Default::default()
            }),
            EXTENDED_MAX_LEAF => Some(CpuidRegisters {
                eax: AMD_CORE_COUNT_LEAF,
                ..Default::default()
            }),
            AMD_L2_L3_CACHE_LEAF => Some(CpuidRegisters {
                ecx: l2_kib << 16,
                edx: l3_units << 18,
                ..Default::default()
            }),
            AMD_CORE_COUNT_LEAF => Some(CpuidRegisters {
                ecx: cores - 1,
                ..Default::default()
            }),
            _ => None,
        });

        platform
    }

    #[test]
    fn detects_vendors() {
        let mut platform = MockPlatform::new();
        platform
            .expect_cpuid()
            .returning(|_| Some(vendor_leaf(0x16, INTEL_VENDOR)));

        assert_eq!(
            CpuVendor::detect(&PlatformFacade::from_mock(platform)),
            Some(CpuVendor::Intel { max_leaf: 0x16 })
        );

        let platform = amd_platform(ZEN_SIGNATURE, 512, 64, 8);
        assert_eq!(
            CpuVendor::detect(&PlatformFacade::from_mock(platform)),
            Some(CpuVendor::Amd)
        );

        let mut platform = MockPlatform::new();
        platform
            .expect_cpuid()
            .returning(|_| Some(vendor_leaf(0x10, [1, 2, 3])));
        assert_eq!(CpuVendor::detect(&PlatformFacade::from_mock(platform)), None);

        let mut platform = MockPlatform::new();
        platform.expect_cpuid().returning(|_| None);
        assert_eq!(CpuVendor::detect(&PlatformFacade::from_mock(platform)), None);
    }

    #[test]
    fn amd_adds_share_of_l3() {
        // 512 KiB of L2, 32 MiB of L3 shared by 8 cores.
        let platform = PlatformFacade::from_mock(amd_platform(ZEN_SIGNATURE, 512, 64, 8));

        let size = CacheSize::detect(&platform, Some(CpuVendor::Amd));

        let expected = 512 * 1024 + 32 * 1024 * 1024 / 8;
        assert_eq!(size.true_size, expected);
        assert_eq!(size.scaled_size, expected);
    }

    #[test]
    fn amd_family_10h_model_2_has_no_l3() {
        // Base family 0xF + extended family 0x1 = 0x10, extended model 0, base model 2.
        let signature = (0x1 << 20) | (0xF << 8) | (0x2 << 4);
        let platform = PlatformFacade::from_mock(amd_platform(signature, 512, 4, 4));

        let size = CacheSize::detect(&platform, Some(CpuVendor::Amd));

        assert_eq!(size.true_size, 512 * 1024);
    }

    #[test]
    fn old_amd_family_has_no_l3() {
        let signature = 0x6 << 8;
        let platform = PlatformFacade::from_mock(amd_platform(signature, 256, 4, 2));

        let size = CacheSize::detect(&platform, Some(CpuVendor::Amd));

        assert_eq!(size.true_size, 256 * 1024);
    }

    #[test]
    fn amd_without_cache_leaf_falls_back_to_os() {
        let mut platform = MockPlatform::new();
        platform.expect_cpuid().returning(|leaf| match leaf {
            EXTENDED_MAX_LEAF => Some(CpuidRegisters {
                eax: 0x8000_0004,
                ..Default::default()
            }),
            _ => None,
        });
        platform
            .expect_os_cache_sizes()
            .returning(|| vec![32 * 1024, 1024 * 1024]);

        let size = CacheSize::detect(&PlatformFacade::from_mock(platform), Some(CpuVendor::Amd));

        assert_eq!(size.true_size, 1024 * 1024);
    }

    #[test]
    fn intel_scales_os_size() {
        let mut platform = MockPlatform::new();
        platform
            .expect_os_cache_sizes()
            .returning(|| vec![48 * 1024, 2 * 1024 * 1024, 30 * 1024 * 1024, 2 * 1024 * 1024]);

        let size = CacheSize::detect(
            &PlatformFacade::from_mock(platform),
            Some(CpuVendor::Intel { max_leaf: 0x16 }),
        );

        assert_eq!(size.true_size, 30 * 1024 * 1024);

        if cfg!(target_pointer_width = "64") {
            assert_eq!(size.scaled_size, 90 * 1024 * 1024);
        } else {
            assert_eq!(size.scaled_size, size.true_size);
        }
    }

    #[test]
    fn intel_with_low_max_leaf_is_not_scaled() {
        let mut platform = MockPlatform::new();
        platform
            .expect_os_cache_sizes()
            .returning(|| vec![512 * 1024]);

        let size = CacheSize::detect(
            &PlatformFacade::from_mock(platform),
            Some(CpuVendor::Intel { max_leaf: 1 }),
        );

        assert_eq!(size.scaled_size, 512 * 1024);
    }

    #[test]
    fn unknown_vendor_uses_os_enumeration() {
        let mut platform = MockPlatform::new();
        platform
            .expect_os_cache_sizes()
            .returning(|| vec![64 * 1024, 4 * 1024 * 1024]);

        let size = CacheSize::detect(&PlatformFacade::from_mock(platform), None);

        assert_eq!(size.true_size, 4 * 1024 * 1024);

        if cfg!(target_arch = "aarch64") {
            assert_eq!(size.scaled_size, 12 * 1024 * 1024);
        } else {
            assert_eq!(size.scaled_size, size.true_size);
        }
    }

    #[test]
    fn nothing_known_gives_zero() {
        let mut platform = MockPlatform::new();
        platform.expect_os_cache_sizes().returning(Vec::new);

        let size = CacheSize::detect(&PlatformFacade::from_mock(platform), None);

        assert_eq!(size, CacheSize::default());
    }
}
