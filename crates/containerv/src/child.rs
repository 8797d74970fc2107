//! Setup run by the forked child, ending in the PID1 control loop.
//!
//! Each step that needs the host reports a stage over the sync channel
//! and blocks for the acknowledgement. The process that unshares the
//! namespaces is not PID1 itself: after setup it starts a new session and
//! forks, and the grandchild becomes init of the new pid namespace.

use crate::caps;
use crate::control::Server;
use crate::error::{Error, Result};
use crate::mounts;
use crate::net;
use crate::nsfds::NamespaceFds;
use crate::options::{Capabilities, Layer};
use crate::paths::{CONTROL_SOCKET, PROC_ROOT};
use crate::seccomp;
use crate::sync::{Channel, Stage};
use nix::sched::unshare;
use nix::unistd::{ForkResult, Gid, Uid, fork, getpid, getuid, sethostname, setgid, setsid, setuid};
use std::net::Ipv4Addr;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

/// Container-side network settings.
#[derive(Debug, Clone)]
pub(crate) struct ChildNetwork {
    pub peer: String,
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

/// Everything the child needs, prepared by the host before fork.
#[derive(Debug, Clone)]
pub(crate) struct ChildPlan {
    pub id: String,
    pub rootfs: PathBuf,
    pub layers: Vec<Layer>,
    pub capabilities: Capabilities,
    pub runtime_dir: PathBuf,
    pub network: Option<ChildNetwork>,
    pub has_policy: bool,
    /// Seccomp allow-list; no filter when empty.
    pub syscalls: Vec<String>,
}

fn regain_root() -> Result<()> {
    if getuid().is_root() {
        return Ok(());
    }
    setgid(Gid::from_raw(0)).map_err(|errno| Error::sys("setgid 0", errno))?;
    setuid(Uid::from_raw(0)).map_err(|errno| Error::sys("setuid 0", errno))
}

/// Runs the setup sequence. Returns in the intermediate process right
/// after it forked PID1, and in PID1 once the control loop ends.
pub(crate) fn run(plan: &ChildPlan, chan: &mut Channel) -> Result<()> {
    let caps = plan.capabilities;
    regain_root()?;
    unshare(caps.clone_flags()).map_err(|errno| Error::sys("unshare", errno))?;

    if caps.contains(Capabilities::USERS) {
        chan.request(Stage::NsSetup)?;
    }
    sethostname(&plan.id).map_err(|errno| Error::sys("sethostname", errno))?;
    if caps.contains(Capabilities::CGROUPS) {
        chan.request(Stage::CgroupsSetup)?;
    }

    let filesystem = caps.contains(Capabilities::FILESYSTEM);
    if filesystem {
        mounts::make_private()?;
        mounts::enter_rootfs(&plan.rootfs, &plan.layers, &plan.runtime_dir)?;
    }

    let control = plan.runtime_dir.join(CONTROL_SOCKET);
    let socket = UnixDatagram::bind(&control)
        .map_err(|err| Error::io(format!("bind {}", control.display()), err))?;

    if let Some(network) = &plan.network {
        chan.request(Stage::NetworkSetup)?;
        net::configure_container(&network.peer, network.addr, network.prefix)?;
    }
    if plan.has_policy {
        chan.request(Stage::PolicySetup)?;
    }

    setsid().map_err(|errno| Error::sys("setsid", errno))?;
    // SAFETY: this process is single-threaded.
    match unsafe { fork() }.map_err(|errno| Error::sys("fork init", errno))? {
        ForkResult::Parent { .. } => return Ok(()),
        ForkResult::Child => {}
    }

    let new_pid_ns = caps.contains(Capabilities::PROCESS_CONTROL);
    if filesystem && new_pid_ns {
        mounts::mount_proc()?;
    }
    let namespaces = NamespaceFds::open_self(Path::new(PROC_ROOT))?;
    caps::drop_nonessential()?;
    if !plan.syscalls.is_empty() {
        let allow: Vec<&str> = plan.syscalls.iter().map(String::as_str).collect();
        seccomp::build_filter(&allow)?.install()?;
    }

    chan.send(Stage::Up, 0)?;
    log::info!(target: "containerv", "container {} is up", plan.id);
    let rootfs = plan.rootfs.to_string_lossy().into_owned();
    Server::new(socket, rootfs, namespaces, getpid().as_raw() == 1).run()
}
