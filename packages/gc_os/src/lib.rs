#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Operating system substrate for garbage collector engines.
//!
//! A collector needs to know a handful of facts about the machine it runs on and needs a small
//! set of virtual memory operations that behave the same way on every platform. This package
//! provides exactly that and nothing more:
//!
//! * **Processor topology.** Processor groups, a global processor index space spanning all groups
//!   and integer weights that let a scheduler spread worker threads evenly across groups of
//!   different sizes (see [`ProcessorTopology`] and [`WeightedGroupScheduler`]).
//! * **NUMA placement.** Which memory node a processor belongs to, and committing memory on a
//!   preferred node.
//! * **Memory budget.** How much physical memory the process may use once container or job
//!   quotas, installed memory and the size of the virtual address space are all reconciled
//!   (see [`OsInterface::physical_memory_limit()`]).
//! * **Virtual memory lifecycle.** Reserve, commit, decommit, reset and release address ranges,
//!   plus write-watch queries that report which pages were written since the last query.
//! * **Cache size.** The size of the largest processor cache, used to size allocation budgets.
//!
//! # Quick start
//!
//! ```rust
//! use gc_os::OsInterface;
//!
//! let os = OsInterface::current();
//!
//! let limit = os.physical_memory_limit();
//! println!(
//!     "May use up to {} bytes of physical memory (restricted: {})",
//!     limit.bytes(),
//!     limit.is_restricted()
//! );
//!
//! let topology = os.topology();
//! println!(
//!     "{} processors in {} group(s)",
//!     topology.total_processor_count(),
//!     topology.groups().len()
//! );
//! ```
//!
//! # Capabilities
//!
//! Optional operating system features (processor groups, NUMA, write-watch, vendor-specific cache
//! deduction) are detected once when the [`OsInterface`] is created. Missing features never cause
//! errors; the corresponding capability is simply reported as unavailable. Operations that depend
//! on a capability are only legal after the caller has checked the matching `can_enable_*()` or
//! `supports_*()` function. Calling them without the capability is a programming error that
//! panics in debug builds.
//!
//! # Configuration
//!
//! NUMA awareness and processor group support are opt-in/opt-out via [`OsConfig`], which can be
//! loaded from the `GC_NUMA_AWARE` and `GC_CPU_GROUPS` environment variables.
//!
//! # Operating system compatibility
//!
//! Linux and Windows have native implementations. Other platforms (and Miri) use a fallback that
//! reports a single processor group, no NUMA, no write-watch and heap-backed address ranges.

mod affinity_mask;
mod cache;
mod capabilities;
mod config;
mod group_scheduler;
mod memory_budget;
mod numa;
mod os_interface;
mod pal;
mod primitive_types;
mod thread_affinity;
mod time;
mod topology;
mod virtual_memory;

pub use affinity_mask::*;
pub use config::*;
pub use group_scheduler::*;
pub use memory_budget::{MemoryBudget, MemoryStatus, PhysicalMemoryLimit};
pub use os_interface::OsInterface;
pub use primitive_types::*;
pub use thread_affinity::*;
pub use topology::*;
pub use virtual_memory::*;
