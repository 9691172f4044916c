#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;

/// Linux has this funny notion of exposing various OS APIs as a virtual filesystem. This trait
/// abstracts this virtual filesystem to allow it to be mocked.
///
/// The scope of this trait is limited to only the virtual filesystem exposed by the OS. We do not
/// expect to do "real" file I/O in this layer. All I/O is synchronous and blocking because we
/// expect it to hit a fast path in the OS, given the data is never on a real storage device.
///
/// Every file is optional. Containers and stripped-down kernels routinely hide parts of `/sys`
/// and `/proc`, in which case the corresponding fact is reported as unknown.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Filesystem: Debug + Send + Sync + 'static {
    /// Contents of `/sys/devices/system/cpu/online`.
    ///
    /// This is a cpulist format file ("0,1,2-4" style list).
    fn get_cpu_online_contents(&self) -> Option<String>;

    /// Contents of `/sys/devices/system/node/possible`.
    ///
    /// This lists all NUMA nodes that could possibly exist in the system, even those that are
    /// offline. This is a cpulist format file.
    fn get_numa_node_possible_contents(&self) -> Option<String>;

    /// Contents of `/sys/devices/system/node/node{}/cpulist`.
    fn get_numa_node_cpulist_contents(&self, node_index: u32) -> Option<String>;

    /// Contents of `/sys/devices/system/cpu/cpu{}/cache/index{}/size`.
    ///
    /// A single value with a unit suffix, e.g. `32K` or `16384K`.
    fn get_cpu_cache_size_contents(&self, cpu_index: u32, cache_index: u32) -> Option<String>;

    /// Contents of `/proc/meminfo`.
    ///
    /// This is a plaintext file with "key:     value kB" pairs.
    fn get_meminfo_contents(&self) -> Option<String>;

    /// Contents of `/proc/self/status`.
    ///
    /// This is a plaintext file with "key:     value" pairs.
    fn get_proc_self_status_contents(&self) -> Option<String>;

    /// Contents of `/proc/self/maps`, one mapping per line.
    ///
    /// ```text
    /// 7f2c4a000000-7f2c4a010000 rw-p 00000000 00:00 0
    /// 7f2c4a010000-7f2c4a400000 ---p 00000000 00:00 0
    /// ```
    fn get_proc_self_maps_contents(&self) -> Option<String>;

    /// Contents of `/proc/self/cgroup`, one line per hierarchy the process belongs to.
    ///
    /// ```text
    /// 15:memory:/docker/6a74f501e3b4c9d93ad440a7b73149cf2b5d56073c109a8d774c0793f7fe267f
    /// 0::/docker/6a74f501e3b4c9d93ad440a7b73149cf2b5d56073c109a8d774c0793f7fe267f
    /// ```
    ///
    /// Lines with an empty controller list belong to cgroups v2, the rest to cgroups v1.
    fn get_proc_self_cgroup(&self) -> Option<String>;

    /// Contents of `/sys/fs/cgroup/memory/{name}/memory.limit_in_bytes` (cgroups v1).
    fn get_v1_cgroup_memory_limit(&self, cgroup_name: &str) -> Option<String>;

    /// Contents of `/sys/fs/cgroup/{name}/memory.max` (cgroups v2).
    fn get_v2_cgroup_memory_max(&self, cgroup_name: &str) -> Option<String>;

    /// Contents of `/sys/fs/cgroup/{name}/memory.high` (cgroups v2).
    fn get_v2_cgroup_memory_high(&self, cgroup_name: &str) -> Option<String>;
}
