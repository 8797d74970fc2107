//! Sandboxed containers built from Linux namespaces.
//!
//! [`Container::create`] forks a child that unshares the requested
//! namespaces and walks through a fixed setup sequence with the host:
//! id maps, cgroup limits, a veth pair and BPF LSM policy admission, in
//! that order. The child finishes as PID1 of its pid namespace and serves
//! a small command protocol on a Unix datagram socket in the container's
//! runtime directory; the [`Container`] methods are clients of it.

mod caps;
mod cgroup;
mod child;
mod container;
mod control;
mod error;
mod ids;
mod logs;
mod mounts;
mod net;
mod nsfds;
mod options;
pub mod paths;
mod seccomp;
mod stats;
mod sync;

pub use container::Container;
pub use control::{SpawnOptions, Spawned};
pub use error::{Error, Result};
pub use ids::{container_veth, generate_id, host_veth};
pub use nsfds::{NamespaceFds, NamespaceType};
pub use options::{Capabilities, CgroupLimits, ContainerOptions, IdMap, Layer, NetworkConfig};
pub use policy_core::{ErrorKind, Policy};
pub use stats::{ContainerStats, IoStats, NetworkStats, ProcessInfo};
