use crate::error::{Error, Result};
use bitflags::bitflags;
use nix::sched::CloneFlags;
use policy_core::Policy;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

bitflags! {
    /// Isolation features requested for a container.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const FILESYSTEM = 1;
        const PROCESS_CONTROL = 1 << 1;
        const NETWORK = 1 << 2;
        const IPC = 1 << 3;
        const CGROUPS = 1 << 4;
        const USERS = 1 << 5;
    }
}

impl Capabilities {
    /// Namespaces to unshare. UTS is always private so the hostname can
    /// mirror the container id.
    pub fn clone_flags(self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWUTS;
        for (cap, flag) in [
            (Self::FILESYSTEM, CloneFlags::CLONE_NEWNS),
            (Self::PROCESS_CONTROL, CloneFlags::CLONE_NEWPID),
            (Self::NETWORK, CloneFlags::CLONE_NEWNET),
            (Self::IPC, CloneFlags::CLONE_NEWIPC),
            (Self::CGROUPS, CloneFlags::CLONE_NEWCGROUP),
            (Self::USERS, CloneFlags::CLONE_NEWUSER),
        ] {
            if self.contains(cap) {
                flags |= flag;
            }
        }
        flags
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// One contiguous id range mapped into a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub host_start: u32,
    pub child_start: u32,
    pub count: u32,
}

impl IdMap {
    pub fn new(host_start: u32, child_start: u32, count: u32) -> Self {
        Self {
            host_start,
            child_start,
            count,
        }
    }

    /// Maps root inside the namespace to a single host id.
    pub fn root_to(host: u32) -> Self {
        Self::new(host, 0, 1)
    }

    /// The line written to `/proc/<pid>/uid_map` or `gid_map`.
    pub fn to_line(&self) -> String {
        format!("{} {} {}\n", self.child_start, self.host_start, self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLimits {
    /// Written verbatim to `memory.max`.
    pub memory_max: String,
    pub cpu_weight: u32,
    pub pids_max: u32,
}

impl Default for CgroupLimits {
    fn default() -> Self {
        Self {
            memory_max: "1G".to_string(),
            cpu_weight: 100,
            pids_max: 256,
        }
    }
}

/// Addresses for the veth pair; masks are dotted quads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub host_ip: Ipv4Addr,
    pub host_mask: Ipv4Addr,
    pub container_ip: Ipv4Addr,
    pub container_mask: Ipv4Addr,
}

impl NetworkConfig {
    pub fn new(host_ip: Ipv4Addr, container_ip: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self {
            host_ip,
            host_mask: mask,
            container_ip,
            container_mask: mask,
        }
    }

    pub fn host_prefix(&self) -> Result<u8> {
        prefix_len(self.host_mask)
    }

    pub fn container_prefix(&self) -> Result<u8> {
        prefix_len(self.container_mask)
    }
}

pub(crate) fn prefix_len(mask: Ipv4Addr) -> Result<u8> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return Err(Error::InvalidArgument(format!("netmask {mask} is not contiguous")));
    }
    Ok(ones as u8)
}

/// A piece of the container root filesystem, applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// Bind a host directory as the root.
    Base(PathBuf),
    /// Overlay of `lower` directories (topmost first) with a writable
    /// `upper`; `work` must be on the same filesystem as `upper`.
    Overlay {
        lower: Vec<PathBuf>,
        upper: PathBuf,
        work: PathBuf,
    },
    /// Bind a host path to `target` inside the container.
    HostBind {
        source: PathBuf,
        target: PathBuf,
        readonly: bool,
    },
}

/// Everything needed to create a container.
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub(crate) id: Option<String>,
    pub(crate) rootfs: PathBuf,
    pub(crate) capabilities: Capabilities,
    pub(crate) layers: Vec<Layer>,
    pub(crate) uid_map: Option<IdMap>,
    pub(crate) gid_map: Option<IdMap>,
    pub(crate) limits: CgroupLimits,
    pub(crate) network: Option<NetworkConfig>,
    pub(crate) policy: Option<Policy>,
    pub(crate) runtime_base: Option<PathBuf>,
    pub(crate) cgroup_root: Option<PathBuf>,
}

impl ContainerOptions {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            rootfs: rootfs.into(),
            capabilities: Capabilities::default(),
            layers: Vec::new(),
            uid_map: None,
            gid_map: None,
            limits: CgroupLimits::default(),
            network: None,
            policy: None,
            runtime_base: None,
            cgroup_root: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_uid_map(mut self, map: IdMap) -> Self {
        self.uid_map = Some(map);
        self
    }

    pub fn with_gid_map(mut self, map: IdMap) -> Self {
        self.gid_map = Some(map);
        self
    }

    pub fn with_limits(mut self, limits: CgroupLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_runtime_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.runtime_base = Some(base.into());
        self
    }

    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = Some(root.into());
        self
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.policy.as_ref()
    }

    /// Network setup runs only when both the capability and an address
    /// plan are present.
    pub fn network_enabled(&self) -> bool {
        self.capabilities.contains(Capabilities::NETWORK) && self.network.is_some()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.rootfs.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "rootfs {} must be absolute",
                self.rootfs.display()
            )));
        }
        if let Some(id) = &self.id {
            crate::ids::check_id(id)?;
        }
        for layer in &self.layers {
            if let Layer::HostBind { target, .. } = layer
                && !target.is_absolute()
            {
                return Err(Error::InvalidArgument(format!(
                    "bind target {} must be absolute",
                    target.display()
                )));
            }
            if let Layer::Overlay { lower, .. } = layer
                && lower.is_empty()
            {
                return Err(Error::InvalidArgument(
                    "overlay needs at least one lower directory".into(),
                ));
            }
        }
        if let Some(network) = &self.network {
            network.host_prefix()?;
            network.container_prefix()?;
        }
        for map in [self.uid_map, self.gid_map].into_iter().flatten() {
            if map.count == 0 {
                return Err(Error::InvalidArgument("id map with zero length".into()));
            }
        }
        Ok(())
    }
}
