#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
use std::ptr::NonNull;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockPlatform;
#[cfg(test)]
use crate::pal::fallback::BuildTargetPlatform as FallbackPlatform;
use crate::pal::{
    BUILD_TARGET_PLATFORM, BuildTargetPlatform, ContainerMemoryLimits, CpuidRegisters, GroupInfo,
    Platform, ProcessAffinity, SystemInfo, SystemMemoryStatus, WriteWatchReport,
};
use crate::{NodeIndex, ProcessorIndex, ProcessorNumber, ThreadAffinity};

/// Hides the real/fallback/mock platform choice behind a single type.
#[derive(Clone)]
pub(crate) enum PlatformFacade {
    Target(&'static BuildTargetPlatform),

    #[cfg(test)]
    Fallback(&'static FallbackPlatform),

    #[cfg(test)]
    Mock(Arc<MockPlatform>),
}

impl PlatformFacade {
    pub(crate) fn target() -> Self {
        Self::Target(&BUILD_TARGET_PLATFORM)
    }

    #[cfg(test)]
    pub(crate) fn fallback() -> Self {
        Self::Fallback(&crate::pal::fallback::BUILD_TARGET_PLATFORM)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockPlatform) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Platform for PlatformFacade {
    fn system_info(&self) -> SystemInfo {
        match self {
            Self::Target(p) => p.system_info(),
            #[cfg(test)]
            Self::Fallback(p) => p.system_info(),
            #[cfg(test)]
            Self::Mock(p) => p.system_info(),
        }
    }

    fn processor_groups(&self) -> Option<Vec<GroupInfo>> {
        match self {
            Self::Target(p) => p.processor_groups(),
            #[cfg(test)]
            Self::Fallback(p) => p.processor_groups(),
            #[cfg(test)]
            Self::Mock(p) => p.processor_groups(),
        }
    }

    fn process_affinity(&self) -> Option<ProcessAffinity> {
        match self {
            Self::Target(p) => p.process_affinity(),
            #[cfg(test)]
            Self::Fallback(p) => p.process_affinity(),
            #[cfg(test)]
            Self::Mock(p) => p.process_affinity(),
        }
    }

    fn numa_highest_node_number(&self) -> Option<NodeIndex> {
        match self {
            Self::Target(p) => p.numa_highest_node_number(),
            #[cfg(test)]
            Self::Fallback(p) => p.numa_highest_node_number(),
            #[cfg(test)]
            Self::Mock(p) => p.numa_highest_node_number(),
        }
    }

    fn processor_node(&self, processor: ProcessorNumber) -> Option<NodeIndex> {
        match self {
            Self::Target(p) => p.processor_node(processor),
            #[cfg(test)]
            Self::Fallback(p) => p.processor_node(processor),
            #[cfg(test)]
            Self::Mock(p) => p.processor_node(processor),
        }
    }

    fn current_processor_number(&self) -> Option<ProcessorIndex> {
        match self {
            Self::Target(p) => p.current_processor_number(),
            #[cfg(test)]
            Self::Fallback(p) => p.current_processor_number(),
            #[cfg(test)]
            Self::Mock(p) => p.current_processor_number(),
        }
    }

    fn set_current_thread_affinity(&self, affinity: ThreadAffinity) -> bool {
        match self {
            Self::Target(p) => p.set_current_thread_affinity(affinity),
            #[cfg(test)]
            Self::Fallback(p) => p.set_current_thread_affinity(affinity),
            #[cfg(test)]
            Self::Mock(p) => p.set_current_thread_affinity(affinity),
        }
    }

    fn container_memory_limits(&self) -> Option<ContainerMemoryLimits> {
        match self {
            Self::Target(p) => p.container_memory_limits(),
            #[cfg(test)]
            Self::Fallback(p) => p.container_memory_limits(),
            #[cfg(test)]
            Self::Mock(p) => p.container_memory_limits(),
        }
    }

    fn memory_status(&self) -> SystemMemoryStatus {
        match self {
            Self::Target(p) => p.memory_status(),
            #[cfg(test)]
            Self::Fallback(p) => p.memory_status(),
            #[cfg(test)]
            Self::Mock(p) => p.memory_status(),
        }
    }

    fn process_working_set(&self) -> Option<u64> {
        match self {
            Self::Target(p) => p.process_working_set(),
            #[cfg(test)]
            Self::Fallback(p) => p.process_working_set(),
            #[cfg(test)]
            Self::Mock(p) => p.process_working_set(),
        }
    }

    fn cpuid(&self, leaf: u32) -> Option<CpuidRegisters> {
        match self {
            Self::Target(p) => p.cpuid(leaf),
            #[cfg(test)]
            Self::Fallback(p) => p.cpuid(leaf),
            #[cfg(test)]
            Self::Mock(p) => p.cpuid(leaf),
        }
    }

    fn os_cache_sizes(&self) -> Vec<u64> {
        match self {
            Self::Target(p) => p.os_cache_sizes(),
            #[cfg(test)]
            Self::Fallback(p) => p.os_cache_sizes(),
            #[cfg(test)]
            Self::Mock(p) => p.os_cache_sizes(),
        }
    }

    fn supports_write_watch(&self) -> bool {
        match self {
            Self::Target(p) => p.supports_write_watch(),
            #[cfg(test)]
            Self::Fallback(p) => p.supports_write_watch(),
            #[cfg(test)]
            Self::Mock(p) => p.supports_write_watch(),
        }
    }

    fn reserve(&self, size: usize, write_watch: bool) -> Option<NonNull<u8>> {
        match self {
            Self::Target(p) => p.reserve(size, write_watch),
            #[cfg(test)]
            Self::Fallback(p) => p.reserve(size, write_watch),
            #[cfg(test)]
            Self::Mock(p) => p.reserve(size, write_watch),
        }
    }

    unsafe fn commit(&self, address: NonNull<u8>, size: usize, node: Option<NodeIndex>) -> bool {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(p) => unsafe { p.commit(address, size, node) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Fallback(p) => unsafe { p.commit(address, size, node) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(p) => unsafe { p.commit(address, size, node) },
        }
    }

    unsafe fn decommit(&self, address: NonNull<u8>, size: usize) -> bool {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(p) => unsafe { p.decommit(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Fallback(p) => unsafe { p.decommit(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(p) => unsafe { p.decommit(address, size) },
        }
    }

    unsafe fn reset(&self, address: NonNull<u8>, size: usize, unlock: bool) -> bool {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(p) => unsafe { p.reset(address, size, unlock) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Fallback(p) => unsafe { p.reset(address, size, unlock) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(p) => unsafe { p.reset(address, size, unlock) },
        }
    }

    unsafe fn release(&self, address: NonNull<u8>, size: usize) -> bool {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(p) => unsafe { p.release(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Fallback(p) => unsafe { p.release(address, size) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(p) => unsafe { p.release(address, size) },
        }
    }

    fn is_range_committed(&self, address: NonNull<u8>, size: usize) -> bool {
        match self {
            Self::Target(p) => p.is_range_committed(address, size),
            #[cfg(test)]
            Self::Fallback(p) => p.is_range_committed(address, size),
            #[cfg(test)]
            Self::Mock(p) => p.is_range_committed(address, size),
        }
    }

    fn reset_write_watch(&self, address: NonNull<u8>, size: usize) -> bool {
        match self {
            Self::Target(p) => p.reset_write_watch(address, size),
            #[cfg(test)]
            Self::Fallback(p) => p.reset_write_watch(address, size),
            #[cfg(test)]
            Self::Mock(p) => p.reset_write_watch(address, size),
        }
    }

    fn get_write_watch(
        &self,
        reset: bool,
        address: NonNull<u8>,
        size: usize,
    ) -> Option<WriteWatchReport> {
        match self {
            Self::Target(p) => p.get_write_watch(reset, address, size),
            #[cfg(test)]
            Self::Fallback(p) => p.get_write_watch(reset, address, size),
            #[cfg(test)]
            Self::Mock(p) => p.get_write_watch(reset, address, size),
        }
    }
}

impl From<&'static BuildTargetPlatform> for PlatformFacade {
    fn from(p: &'static BuildTargetPlatform) -> Self {
        Self::Target(p)
    }
}

#[cfg(test)]
impl From<MockPlatform> for PlatformFacade {
    fn from(p: MockPlatform) -> Self {
        Self::Mock(Arc::new(p))
    }
}

impl Debug for PlatformFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Fallback(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
