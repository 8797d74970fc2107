use crate::cgroup::Cgroup;
use crate::child::{self, ChildNetwork, ChildPlan};
use crate::control::{self, SpawnOptions, Spawned};
use crate::error::{Error, Result};
use crate::ids;
use crate::logs::LogThread;
use crate::net::HostVeth;
use crate::nsfds::NamespaceFds;
use crate::options::{ContainerOptions, IdMap, NetworkConfig};
use crate::paths::{self, NET_CLASS_ROOT, PROC_ROOT};
use crate::stats::{self, ContainerStats, CpuSampler, ProcessInfo};
use crate::sync::{Channel, Sequencer, Stage};
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, dup2, fork, getegid, geteuid, pipe2};
use std::fs::{self, File};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running container and the host resources backing it. Dropping it
/// tears everything down.
pub struct Container {
    id: String,
    rootfs: PathBuf,
    runtime_dir: PathBuf,
    cgroup: Option<Cgroup>,
    veth: Option<HostVeth>,
    logs: Option<LogThread>,
    admitted: bool,
    running: bool,
    torn_down: bool,
    sampler: Mutex<CpuSampler>,
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

fn pipe() -> Result<Pipe> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(|errno| Error::sys("pipe", errno))?;
    Ok(Pipe { read, write })
}

fn write_id_map(pid: i32, file: &str, map: IdMap) -> Result<()> {
    let path = Path::new(PROC_ROOT).join(pid.to_string()).join(file);
    fs::write(&path, map.to_line()).map_err(|err| Error::io(format!("write {}", path.display()), err))
}

/// Points the calling process's stdout and stderr at the log pipes.
fn redirect_stdio(stdout: RawFd, stderr: RawFd) -> Result<()> {
    dup2(stdout, libc::STDOUT_FILENO)
        .and_then(|_| dup2(stderr, libc::STDERR_FILENO))
        .map(drop)
        .map_err(|errno| Error::sys("redirect stdio", errno))
}

fn ack_status(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.errno(),
    }
}

impl Container {
    /// Forks the container and drives its setup to completion.
    pub fn create(options: ContainerOptions) -> Result<Self> {
        options.validate()?;
        if options.policy.is_some() {
            cvd::init()?;
        }
        let id = options.id.clone().unwrap_or_else(ids::generate_id);
        let base = options.runtime_base.clone().unwrap_or_else(paths::runtime_base);
        fs::create_dir_all(&base).map_err(|err| Error::io(format!("create {}", base.display()), err))?;
        let runtime_dir = base.join(&id);
        fs::create_dir(&runtime_dir)
            .map_err(|err| Error::io(format!("create {}", runtime_dir.display()), err))?;

        let mut container = Self {
            id: id.clone(),
            rootfs: options.rootfs.clone(),
            runtime_dir: runtime_dir.clone(),
            cgroup: None,
            veth: None,
            logs: None,
            admitted: false,
            running: false,
            torn_down: false,
            sampler: Mutex::new(CpuSampler::default()),
        };

        let network = match (&options.network, options.network_enabled()) {
            (Some(net), true) => Some((net, net.host_prefix()?, net.container_prefix()?)),
            _ => None,
        };
        let plan = ChildPlan {
            id: id.clone(),
            rootfs: options.rootfs.clone(),
            layers: options.layers.clone(),
            capabilities: options.capabilities,
            runtime_dir,
            network: network.map(|(net, _, prefix)| ChildNetwork {
                peer: ids::container_veth(&id),
                addr: net.container_ip,
                prefix,
            }),
            has_policy: options.policy.is_some(),
            syscalls: options
                .policy
                .as_ref()
                .map(|policy| policy.syscalls().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
        };

        let events = pipe()?;
        let acks = pipe()?;
        let stdout = pipe()?;
        let stderr = pipe()?;

        // SAFETY: the child only runs the setup sequence and exits.
        let child = match unsafe { fork() }.map_err(|errno| Error::sys("fork", errno))? {
            ForkResult::Child => {
                drop(events.read);
                drop(acks.write);
                drop(stdout.read);
                drop(stderr.read);
                let mut chan = Channel::new(events.write, acks.read);
                let redirected = redirect_stdio(stdout.write.as_raw_fd(), stderr.write.as_raw_fd());
                let code = match redirected.and_then(|()| child::run(&plan, &mut chan)) {
                    Ok(()) => 0,
                    Err(err) => {
                        log::error!(target: "containerv", "container {}: {err}", plan.id);
                        let _ = chan.send(Stage::Down, err.errno());
                        1
                    }
                };
                // SAFETY: leave without running the host's atexit handlers.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => child,
        };
        drop(events.write);
        drop(acks.read);
        drop(stdout.write);
        drop(stderr.write);
        container.logs = LogThread::spawn(&id, stdout.read, stderr.read)
            .map_err(|err| log::warn!(target: "containerv", "[{id}] no log thread: {err}"))
            .ok();

        let mut chan = Channel::new(acks.write, events.read);
        let setup = container.drive(&options, child, &mut chan, network.map(|(net, prefix, _)| (net, prefix)));
        match setup {
            Ok(()) => {
                // The intermediate process exits once PID1 is forked.
                let _ = waitpid(child, None);
                container.running = true;
                log::info!(target: "containerv", "created container {id}");
                Ok(container)
            }
            Err(err) => {
                log::error!(target: "containerv", "creating container {id} failed: {err}");
                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
                Err(err)
            }
        }
    }

    fn drive(
        &mut self,
        options: &ContainerOptions,
        child: Pid,
        chan: &mut Channel,
        network: Option<(&NetworkConfig, u8)>,
    ) -> Result<()> {
        let pid = child.as_raw();
        let mut sequence = Sequencer::default();
        loop {
            let (stage, status) = chan.recv()?;
            sequence.accept(stage)?;
            log::debug!(target: "containerv", "[{}] {}", self.id, stage.name());
            let result = match stage {
                Stage::NsSetup => {
                    let uid = options.uid_map.unwrap_or(IdMap::root_to(geteuid().as_raw()));
                    let gid = options.gid_map.unwrap_or(IdMap::root_to(getegid().as_raw()));
                    write_id_map(pid, "uid_map", uid).and_then(|()| write_id_map(pid, "gid_map", gid))
                }
                Stage::CgroupsSetup => {
                    let root = options.cgroup_root.clone().unwrap_or_else(paths::cgroup_root);
                    Cgroup::create(&root, &self.id, &options.limits).and_then(|cgroup| {
                        let added = cgroup.add_process(pid);
                        self.cgroup = Some(cgroup);
                        added
                    })
                }
                Stage::NetworkSetup => match network {
                    Some((net, prefix)) => HostVeth::create(
                        &ids::host_veth(&self.id),
                        &ids::container_veth(&self.id),
                        pid,
                        net.host_ip,
                        prefix,
                    )
                    .map(|veth| self.veth = Some(veth)),
                    None => Err(Error::Protocol("network setup without a network".into())),
                },
                Stage::PolicySetup => match &options.policy {
                    Some(policy) => {
                        self.admitted = true;
                        cvd::admit(&self.id, &self.rootfs, policy).map_err(Error::from)
                    }
                    None => Err(Error::Protocol("policy setup without a policy".into())),
                },
                Stage::Up => return Ok(()),
                Stage::Down => {
                    return Err(Error::ChildFailed {
                        stage: Stage::Down.name(),
                        status,
                    });
                }
            };
            chan.send(stage, ack_status(&result))?;
            result?;
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn cgroup_path(&self) -> Option<&Path> {
        self.cgroup.as_ref().map(Cgroup::path)
    }

    pub fn spawn(&self, opts: &SpawnOptions) -> Result<Spawned> {
        control::spawn(&self.runtime_dir, opts)
    }

    /// Sends SIGTERM to a process started with [`Container::spawn`].
    pub fn kill(&self, pid: i32) -> Result<()> {
        control::kill(&self.runtime_dir, pid)
    }

    /// Waits for a spawned process; signals are reported as 128+n.
    pub fn wait(&self, pid: i32) -> Result<i32> {
        control::wait(&self.runtime_dir, pid)
    }

    pub fn root(&self) -> Result<PathBuf> {
        control::root(&self.runtime_dir)
    }

    /// Handles to the container's namespaces, usable with
    /// [`NamespaceFds::enter`].
    pub fn namespace_fds(&self) -> Result<NamespaceFds> {
        control::namespace_fds(&self.runtime_dir)
    }

    /// Copies host files to paths inside the container.
    pub fn send_files(&self, files: &[(&str, &File)]) -> Result<()> {
        control::send_files(&self.runtime_dir, files)
    }

    /// Opens files inside the container; one result per path.
    pub fn recv_files(&self, paths: &[&str]) -> Result<Vec<Result<File>>> {
        control::recv_files(&self.runtime_dir, paths)
    }

    pub fn stats(&self) -> ContainerStats {
        let Some(cgroup) = &self.cgroup else {
            return ContainerStats::default();
        };
        let veth = self.veth.as_ref().map(HostVeth::name);
        let mut snapshot = stats::read(cgroup.path(), Path::new(NET_CLASS_ROOT), veth);
        snapshot.cpu_percent = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample(Instant::now(), snapshot.cpu_time_ns);
        snapshot
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        match &self.cgroup {
            Some(cgroup) => stats::processes(cgroup.path(), Path::new(PROC_ROOT)),
            None => Vec::new(),
        }
    }

    /// Stops the container and releases its host resources.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    /// Keeps going after failures and reports the first one.
    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut first: Option<Error> = None;
        let mut note = |err: Error| {
            log::warn!(target: "containerv", "[{}] teardown: {err}", self.id);
            first.get_or_insert(err);
        };

        if self.running {
            self.running = false;
            if let Err(err) = control::destroy(&self.runtime_dir) {
                note(err);
            }
        }
        if let Some(logs) = self.logs.take()
            && !logs.join_timeout(LOG_DRAIN_TIMEOUT)
        {
            log::debug!(target: "containerv", "[{}] log thread still draining", self.id);
        }
        if self.admitted {
            self.admitted = false;
            match cvd::cleanup(&self.id) {
                Ok(Some(timings)) => log::debug!(
                    target: "containerv",
                    "[{}] policy entries removed in {}us",
                    self.id,
                    timings.last_cleanup_us
                ),
                Ok(None) => {}
                Err(err) => note(err.into()),
            }
        }
        if let Some(mut veth) = self.veth.take() {
            veth.remove();
        }
        if let Some(mut cgroup) = self.cgroup.take()
            && let Err(err) = cgroup.remove()
        {
            note(err);
        }
        if let Err(err) = fs::remove_dir_all(&self.runtime_dir)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            note(Error::io(format!("remove {}", self.runtime_dir.display()), err));
        }
        log::info!(target: "containerv", "destroyed container {}", self.id);
        first.map_or(Ok(()), Err)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_redirect_reports_bad_descriptors() {
        let err = redirect_stdio(-1, -1).unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
    }

    #[test]
    fn ack_status_carries_the_errno() {
        assert_eq!(ack_status(&Ok(())), 0);
        let err = Err(Error::sys("mount", nix::errno::Errno::EPERM));
        assert_eq!(ack_status(&err), libc::EPERM);
    }
}
