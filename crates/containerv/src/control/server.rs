//! Command loop run by the container's init process.

use super::fdpass::{self, Datagram, Peer};
use super::proto::{Kind, Request, Response, SLOTS, SpawnOptions};
use crate::error::{Error, Result};
use crate::nsfds::NamespaceFds;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::UnixDatagram;
use std::time::{Duration, Instant};

const TICK_MS: u16 = 1000;
const PAYLOAD_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit code reported for a finished process; signals map to 128+n.
pub(crate) fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

enum Flow {
    Continue,
    Stop,
}

/// Everything prepared before fork so the child only makes syscalls.
struct Exec {
    path: CString,
    _args: Vec<CString>,
    _env: Vec<CString>,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    uid: Option<u32>,
    gid: Option<u32>,
}

fn cstrings(strings: &[String]) -> Result<Vec<CString>> {
    strings
        .iter()
        .map(|s| CString::new(s.as_str()).map_err(|_| Error::InvalidArgument(format!("{s:?} contains NUL"))))
        .collect()
}

impl Exec {
    fn new(opts: &SpawnOptions) -> Result<Self> {
        let path = CString::new(opts.path.as_str())
            .map_err(|_| Error::InvalidArgument("spawn path contains NUL".into()))?;
        let args = cstrings(&opts.args)?;
        let env = cstrings(&opts.env)?;
        let terminated = |list: &[CString]| {
            list.iter()
                .map(|s| s.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect::<Vec<_>>()
        };
        Ok(Self {
            argv: terminated(&args),
            envp: terminated(&env),
            path,
            _args: args,
            _env: env,
            uid: opts.uid,
            gid: opts.gid,
        })
    }

    /// Runs in the forked child; never returns.
    fn exec(&self, report: RawFd) -> ! {
        // SAFETY: only raw syscalls on data prepared before fork.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
            let ok = self.gid.is_none_or(|gid| libc::setgid(gid) == 0)
                && self.uid.is_none_or(|uid| libc::setuid(uid) == 0);
            if ok {
                libc::execve(self.path.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
            }
            let errno = *libc::__errno_location();
            libc::write(report, (&errno as *const i32).cast(), size_of::<i32>());
            libc::_exit(127)
        }
    }
}

pub(crate) struct Server {
    socket: UnixDatagram,
    rootfs: String,
    namespaces: NamespaceFds,
    /// Spawned pids; `Some` once the exit status is known.
    tracked: HashMap<i32, Option<i32>>,
    /// Reap every child, not just tracked ones. Set when running as pid 1.
    reap_all: bool,
}

impl Server {
    pub(crate) fn new(socket: UnixDatagram, rootfs: String, namespaces: NamespaceFds, reap_all: bool) -> Self {
        Self {
            socket,
            rootfs,
            namespaces,
            tracked: HashMap::new(),
            reap_all,
        }
    }

    /// Serves commands until a destroy request arrives.
    pub(crate) fn run(mut self) -> Result<()> {
        log::debug!(target: "containerv", "control loop started");
        loop {
            self.reap();
            let readable = fdpass::wait_readable(self.socket.as_fd(), TICK_MS)
                .map_err(|err| Error::io("poll control socket", err))?;
            if !readable {
                continue;
            }
            let datagram = match fdpass::recv(self.socket.as_raw_fd()) {
                Ok(datagram) => datagram,
                Err(err) => {
                    log::warn!(target: "containerv", "control receive failed: {err}");
                    continue;
                }
            };
            if let Flow::Stop = self.handle(datagram) {
                break;
            }
        }
        self.terminate_all();
        log::debug!(target: "containerv", "control loop finished");
        Ok(())
    }

    fn handle(&mut self, datagram: Datagram) -> Flow {
        let Some(peer) = datagram.peer else {
            log::warn!(target: "containerv", "dropping command from an unbound socket");
            return Flow::Continue;
        };
        let (kind, header) = match Request::decode_header(&datagram.bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!(target: "containerv", "bad command header: {err}");
                return Flow::Continue;
            }
        };
        let (payload, fds) = if kind.has_payload() {
            match self.payload_from(&peer, kind) {
                Some(Datagram { bytes, fds, .. }) => (bytes, fds),
                None => return Flow::Continue,
            }
        } else {
            (Vec::new(), Vec::new())
        };
        let request = match Request::decode(kind, &header, &payload) {
            Ok(request) => request,
            Err(err) => {
                log::warn!(target: "containerv", "bad {} command: {err}", kind.name());
                self.reply(&peer, Response::error(kind, libc::EINVAL), Vec::new());
                return Flow::Continue;
            }
        };

        let stop = matches!(request, Request::Destroy);
        let (response, out_fds) = self.dispatch(request, fds);
        self.reply(&peer, response, out_fds);
        if stop { Flow::Stop } else { Flow::Continue }
    }

    /// Waits for the payload datagram from `peer`; other senders get
    /// EBUSY meanwhile.
    fn payload_from(&mut self, peer: &Peer, kind: Kind) -> Option<Datagram> {
        let deadline = Instant::now() + PAYLOAD_TIMEOUT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let left_ms = u16::try_from(left.as_millis()).unwrap_or(u16::MAX);
            let ready = fdpass::wait_readable(self.socket.as_fd(), left_ms);
            match ready {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!(target: "containerv", "{} payload never arrived", kind.name());
                    return None;
                }
                Err(err) => {
                    log::warn!(target: "containerv", "poll control socket: {err}");
                    return None;
                }
            }
            let datagram = match fdpass::recv(self.socket.as_raw_fd()) {
                Ok(datagram) => datagram,
                Err(err) => {
                    log::warn!(target: "containerv", "control receive failed: {err}");
                    return None;
                }
            };
            match datagram.peer {
                Some(from) if from == *peer => return Some(datagram),
                Some(other) => self.reply(&other, Response::error(kind, libc::EBUSY), Vec::new()),
                None => {}
            }
        }
    }

    fn reply(&self, peer: &Peer, mut response: Response, fds: Vec<OwnedFd>) {
        response.count = fds.len() as u32;
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let sent = response
            .encode()
            .and_then(|bytes| {
                fdpass::send(self.socket.as_raw_fd(), Some(peer), &bytes, &raw)
                    .map_err(|err| Error::io("send reply", err))
            });
        if let Err(err) = sent {
            log::warn!(target: "containerv", "{} reply to {peer:?} failed: {err}", response.kind.name());
        }
    }

    fn dispatch(&mut self, request: Request, fds: Vec<OwnedFd>) -> (Response, Vec<OwnedFd>) {
        let kind = request.kind();
        let mut response = Response::new(kind);
        let mut out = Vec::new();
        match request {
            Request::Spawn(opts) => match self.spawn(&opts) {
                Ok(pid) => {
                    response.pid = pid;
                    if opts.wait {
                        response.exit_code = self.wait(pid).unwrap_or(-1);
                    }
                }
                Err(err) => response.status = err.errno(),
            },
            Request::Kill { pid } => {
                if let Err(errno) = self.kill(pid) {
                    response.status = errno;
                }
            }
            Request::Wait { pid } => match self.wait(pid) {
                Ok(code) => {
                    response.pid = pid;
                    response.exit_code = code;
                }
                Err(errno) => {
                    response.status = errno;
                    response.exit_code = -1;
                }
            },
            Request::GetRoot => response.payload = self.rootfs.as_bytes().to_vec(),
            Request::GetFds => {
                for (slot, (kind, fd)) in self.namespaces.iter().take(SLOTS).enumerate() {
                    match fd.try_clone_to_owned() {
                        Ok(owned) => {
                            response.slots[out.len()] = kind.tag() as i32;
                            out.push(owned);
                        }
                        Err(err) => log::warn!(
                            target: "containerv",
                            "duplicating namespace fd {slot} failed: {err}"
                        ),
                    }
                }
            }
            Request::SendFiles { paths } => {
                if paths.len() != fds.len() {
                    response.status = libc::EINVAL;
                } else {
                    for (index, (path, fd)) in paths.iter().zip(fds).enumerate() {
                        if let Err(err) = write_file(path, fd) {
                            log::warn!(target: "containerv", "receiving {path} failed: {err}");
                            response.slots[index] = errno_of(&err);
                        }
                    }
                }
            }
            Request::RecvFiles { paths } => {
                for (index, path) in paths.iter().enumerate() {
                    match File::open(path) {
                        Ok(file) => out.push(OwnedFd::from(file)),
                        Err(err) => response.slots[index] = errno_of(&err),
                    }
                }
            }
            Request::Destroy => {
                log::info!(target: "containerv", "destroy requested");
            }
        }
        (response, out)
    }

    fn spawn(&mut self, opts: &SpawnOptions) -> Result<i32> {
        let exec = Exec::new(opts)?;
        let (report_rx, report_tx) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|errno| Error::sys("pipe", errno))?;
        // SAFETY: the child only runs `Exec::exec`, which sticks to raw
        // syscalls on memory prepared before the fork.
        match unsafe { fork() }.map_err(|errno| Error::sys("fork", errno))? {
            ForkResult::Child => exec.exec(report_tx.as_raw_fd()),
            ForkResult::Parent { child } => {
                drop(report_tx);
                let mut report = File::from(report_rx);
                let mut buf = [0u8; 4];
                let read = loop {
                    match report.read(&mut buf) {
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        other => break other,
                    }
                };
                if let Ok(4) = read {
                    let errno = i32::from_ne_bytes(buf);
                    let _ = waitpid(child, None);
                    return Err(Error::sys(format!("exec {}", opts.path), Errno::from_raw(errno)));
                }
                let pid = child.as_raw();
                self.tracked.insert(pid, None);
                log::info!(target: "containerv", "spawned {} as pid {pid}", opts.path);
                Ok(pid)
            }
        }
    }

    fn kill(&self, pid: i32) -> std::result::Result<(), i32> {
        match self.tracked.get(&pid) {
            Some(None) => kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|errno| errno as i32),
            _ => Err(libc::ESRCH),
        }
    }

    fn wait(&mut self, pid: i32) -> std::result::Result<i32, i32> {
        match self.tracked.get(&pid) {
            None => return Err(libc::ECHILD),
            Some(Some(code)) => {
                let code = *code;
                self.tracked.remove(&pid);
                return Ok(code);
            }
            Some(None) => {}
        }
        let code = loop {
            match waitpid(Pid::from_raw(pid), None) {
                Ok(status) => {
                    if let Some(code) = exit_code(status) {
                        break code;
                    }
                }
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    self.tracked.remove(&pid);
                    return Err(errno as i32);
                }
            }
        };
        self.tracked.remove(&pid);
        Ok(code)
    }

    fn reap(&mut self) {
        if self.reap_all {
            loop {
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) | Err(_) => break,
                    Ok(status) => self.record(status),
                }
            }
        } else {
            let live: Vec<i32> = self
                .tracked
                .iter()
                .filter(|(_, code)| code.is_none())
                .map(|(pid, _)| *pid)
                .collect();
            for pid in live {
                if let Ok(status) = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                    self.record(status);
                }
            }
        }
    }

    fn record(&mut self, status: WaitStatus) {
        let (Some(pid), Some(code)) = (status.pid(), exit_code(status)) else {
            return;
        };
        if let Some(slot) = self.tracked.get_mut(&pid.as_raw()) {
            log::debug!(target: "containerv", "pid {pid} exited with {code}");
            *slot = Some(code);
        }
    }

    fn terminate_all(&mut self) {
        for (pid, code) in &self.tracked {
            if code.is_none() {
                let _ = kill(Pid::from_raw(*pid), Signal::SIGTERM);
            }
        }
        self.tracked.clear();
        self.namespaces = NamespaceFds::default();
    }
}

fn write_file(path: &str, fd: OwnedFd) -> io::Result<()> {
    let mut source = File::from(fd);
    let mode = source.metadata()?.permissions().mode() & 0o7777;
    let mut target = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    io::copy(&mut source, &mut target)?;
    target.set_permissions(Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_encode_signals() {
        let pid = Pid::from_raw(10);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
    }

    #[test]
    fn written_files_keep_the_source_mode() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.sh");
        std::fs::write(&source, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&source, Permissions::from_mode(0o750)).unwrap();
        let target = dir.path().join("target.sh");

        let fd = OwnedFd::from(File::open(&source).unwrap());
        write_file(target.to_str().unwrap(), fd).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "#!/bin/sh\n");
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o750);
    }
}
