#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::linux::MockFilesystem;
use crate::pal::linux::{BuildTargetFilesystem, Filesystem};

/// Enum to hide the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum FilesystemFacade {
    Target(&'static BuildTargetFilesystem),

    #[cfg(test)]
    Mock(Arc<MockFilesystem>),
}

impl FilesystemFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetFilesystem)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockFilesystem) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Filesystem for FilesystemFacade {
    fn get_cpu_online_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_cpu_online_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_cpu_online_contents(),
        }
    }

    fn get_numa_node_possible_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_numa_node_possible_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_numa_node_possible_contents(),
        }
    }

    fn get_numa_node_cpulist_contents(&self, node_index: u32) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_numa_node_cpulist_contents(node_index),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_numa_node_cpulist_contents(node_index),
        }
    }

    fn get_cpu_cache_size_contents(&self, cpu_index: u32, cache_index: u32) -> Option<String> {
        match self {
            Self::Target(filesystem) => {
                filesystem.get_cpu_cache_size_contents(cpu_index, cache_index)
            }
            #[cfg(test)]
            Self::Mock(mock) => mock.get_cpu_cache_size_contents(cpu_index, cache_index),
        }
    }

    fn get_meminfo_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_meminfo_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_meminfo_contents(),
        }
    }

    fn get_proc_self_status_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_proc_self_status_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_proc_self_status_contents(),
        }
    }

    fn get_proc_self_maps_contents(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_proc_self_maps_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_proc_self_maps_contents(),
        }
    }

    fn get_proc_self_cgroup(&self) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_proc_self_cgroup(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_proc_self_cgroup(),
        }
    }

    fn get_v1_cgroup_memory_limit(&self, cgroup_name: &str) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_v1_cgroup_memory_limit(cgroup_name),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_v1_cgroup_memory_limit(cgroup_name),
        }
    }

    fn get_v2_cgroup_memory_max(&self, cgroup_name: &str) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_v2_cgroup_memory_max(cgroup_name),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_v2_cgroup_memory_max(cgroup_name),
        }
    }

    fn get_v2_cgroup_memory_high(&self, cgroup_name: &str) -> Option<String> {
        match self {
            Self::Target(filesystem) => filesystem.get_v2_cgroup_memory_high(cgroup_name),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_v2_cgroup_memory_high(cgroup_name),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for FilesystemFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
