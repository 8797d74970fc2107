//! Consumer thread for denial events emitted by the cvd LSM programs.
//!
//! One thread watches every ring buffer through a single epoll set and
//! logs each denial. Shutdown is cooperative: the flag is checked on every
//! wake, and the wait times out after [`Config::poll_timeout`].

mod record;

pub use record::{DenialRecord, EventKind, FsDenial, NetDenial};

use anyhow::{Context, Error as AnyhowError};
use aya::maps::{MapData, ring_buf::RingBuf};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::errno::Errno;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// A readable fd that yields raw event payloads once it polls ready.
pub trait EventSource: Send {
    fn fd(&self) -> BorrowedFd<'_>;

    /// Hands every pending payload to `sink`.
    fn drain(&mut self, sink: &mut dyn FnMut(&[u8]));
}

impl EventSource for RingBuf<MapData> {
    fn fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the ring buffer owns the map fd for as long as `self` lives.
        unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }

    fn drain(&mut self, sink: &mut dyn FnMut(&[u8])) {
        while let Some(item) = self.next() {
            sink(&item);
        }
    }
}

pub struct Source {
    pub kind: EventKind,
    pub events: Box<dyn EventSource>,
}

impl Source {
    pub fn new(kind: EventKind, events: impl EventSource + 'static) -> Self {
        Self {
            kind,
            events: Box::new(events),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Optional JSON-lines file receiving every denial.
    pub events_path: Option<PathBuf>,
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            events_path: None,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Flag observed by the consumer loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

/// Requests a stop of the loop holding the paired [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            ShutdownHandle { flag: flag.clone() },
            Shutdown { flag },
        )
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

struct Sink {
    file: Option<File>,
}

impl Sink {
    fn open(cfg: &Config) -> Result<Self, AnyhowError> {
        let file = match &cfg.events_path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self { file })
    }

    fn emit(&mut self, record: &DenialRecord) -> Result<(), AnyhowError> {
        log::warn!(target: "cvd", "{record}");
        if let Some(file) = self.file.as_mut() {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Runs the consumer loop until `shutdown` is requested.
pub fn run_with_shutdown(
    mut sources: Vec<Source>,
    cfg: Config,
    shutdown: Shutdown,
) -> Result<(), AnyhowError> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create1 failed")?;
    for (index, source) in sources.iter().enumerate() {
        epoll
            .add(
                source.events.fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, index as u64),
            )
            .context("failed to watch event source")?;
    }
    let mut sink = Sink::open(&cfg)?;
    let mut ready = vec![EpollEvent::empty(); sources.len().max(1)];
    let timeout_ms = u16::try_from(cfg.poll_timeout.as_millis()).unwrap_or(u16::MAX);
    let mut failure = None;

    while !shutdown.is_requested() {
        let n = match epoll.wait(&mut ready, timeout_ms) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(errno) => return Err(errno).context("epoll_wait failed"),
        };
        for event in &ready[..n] {
            let Some(source) = sources.get_mut(event.data() as usize) else {
                continue;
            };
            let kind = source.kind;
            source.events.drain(&mut |bytes| {
                let Some(record) = DenialRecord::decode(kind, bytes) else {
                    log::debug!(target: "cvd", "dropping short {kind:?} record of {} bytes", bytes.len());
                    return;
                };
                if let Err(err) = sink.emit(&record)
                    && failure.is_none()
                {
                    failure = Some(err);
                }
            });
        }
        if let Some(err) = failure.take() {
            return Err(err);
        }
    }
    Ok(())
}

/// Handle to a running consumer thread.
pub struct Agent {
    shutdown: ShutdownHandle,
    thread: Option<thread::JoinHandle<Result<(), AnyhowError>>>,
}

impl Agent {
    pub fn stop(mut self) -> io::Result<()> {
        self.shutdown.request();
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(result) => result.map_err(|err| io::Error::other(err.to_string())),
                Err(err) => Err(io::Error::other(format!("agent thread panicked: {err:?}"))),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shutdown.request();
            let _ = handle.join();
        }
    }
}

/// Spawns the consumer loop on a dedicated thread.
pub fn spawn(sources: Vec<Source>, cfg: Config) -> io::Result<Agent> {
    let (shutdown, signal) = Shutdown::new();
    let thread = thread::Builder::new()
        .name("cvd-events".into())
        .spawn(move || run_with_shutdown(sources, cfg, signal))
        .map_err(|err| io::Error::other(format!("failed to spawn agent thread: {err}")))?;
    Ok(Agent {
        shutdown,
        thread: Some(thread),
    })
}
