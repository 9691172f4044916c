#[cfg(target_arch = "x86")]
use std::arch::x86::__cpuid;
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::__cpuid;

use crate::pal::CpuidRegisters;

/// Executes the CPUID instruction for the given leaf (subleaf zero).
///
/// Leaves above the maximum supported leaf return unspecified values on some processors, so
/// callers are expected to check the maximum leaf (reported by leaf zero, or by `0x8000_0000` for
/// extended leaves) before trusting the result.
#[cfg_attr(coverage_nightly, coverage(off))]
pub(crate) fn query(leaf: u32) -> CpuidRegisters {
    #[allow(
        unused_unsafe,
        reason = "the intrinsic is safe on newer toolchains and unsafe on older ones"
    )]
    // SAFETY: CPUID is available on every processor that can run Rust-compiled x86 code.
    let result = unsafe { __cpuid(leaf) };

    CpuidRegisters {
        eax: result.eax,
        ebx: result.ebx,
        ecx: result.ecx,
        edx: result.edx,
    }
}
