//! Platform Abstraction Layer (PAL). Everything the package asks of the operating system goes
//! through the `Platform` trait defined here.

mod abstractions;
pub(crate) use abstractions::*;

mod facade;
pub(crate) use facade::*;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod cpuid;

#[cfg(all(target_os = "linux", not(miri)))]
mod linux;
#[cfg(all(target_os = "linux", not(miri)))]
pub(crate) use linux::*;

#[cfg(all(windows, not(miri)))]
mod windows;
#[cfg(all(windows, not(miri)))]
pub(crate) use windows::*;

// The fallback module is compiled in test mode on all platforms, under Miri, and as the primary
// implementation on unsupported platforms. However, we only glob-import it when it is the primary
// implementation (i.e. on unsupported platforms or under Miri). On supported platforms in test
// mode, it must be accessed via the explicit path `fallback::` to avoid ambiguity with the
// platform-specific implementation.
#[cfg(any(test, miri, not(any(target_os = "linux", windows))))]
pub(crate) mod fallback;

#[cfg(any(miri, not(any(target_os = "linux", windows))))]
pub(crate) use fallback::*;

/// The granularity at which address space is reserved on every platform.
///
/// Windows dictates 64 KiB. Other platforms over-reserve and trim to match, so the collector
/// sees the same alignment guarantees everywhere.
pub(crate) const ALLOCATION_GRANULARITY: usize = 64 * 1024;
