//! Host thread forwarding the container's stdout and stderr to the log.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_TIMEOUT_MS: i32 = 250;
const READ_CHUNK: usize = 4096;
const MAX_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Splits a byte stream into lines; overlong lines are cut at
/// [`MAX_LINE`].
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(&str)) {
        for &byte in bytes {
            if byte == b'\n' {
                self.flush(&mut emit);
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE {
                    self.flush(&mut emit);
                }
            }
        }
    }

    pub(crate) fn finish(&mut self, mut emit: impl FnMut(&str)) {
        if !self.pending.is_empty() {
            self.flush(&mut emit);
        }
    }

    fn flush(&mut self, emit: &mut impl FnMut(&str)) {
        let line = String::from_utf8_lossy(&self.pending);
        emit(line.trim_end_matches('\r'));
        self.pending.clear();
    }
}

fn emit(id: &str, stream: Stream, line: &str) {
    match stream {
        Stream::Stdout => log::info!(target: "containerv", "[{id}] {line}"),
        Stream::Stderr => log::error!(target: "containerv", "[{id}] {line}"),
    }
}

struct Pipe {
    fd: OwnedFd,
    stream: Stream,
    lines: LineBuffer,
    open: bool,
}

fn read_some(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for writes of its length.
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn run(id: &str, mut pipes: Vec<Pipe>, stop: &AtomicBool) {
    let mut buf = [0u8; READ_CHUNK];
    while pipes.iter().any(|pipe| pipe.open) && !stop.load(Ordering::Acquire) {
        let mut fds: Vec<libc::pollfd> = pipes
            .iter()
            .map(|pipe| libc::pollfd {
                fd: if pipe.open { pipe.fd.as_raw_fd() } else { -1 },
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        // SAFETY: `fds` is a valid array of `fds.len()` entries.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::warn!(target: "containerv", "[{id}] log poll failed: {err}");
            break;
        }
        for (pipe, polled) in pipes.iter_mut().zip(&fds) {
            if !pipe.open || polled.revents == 0 {
                continue;
            }
            match read_some(&pipe.fd, &mut buf) {
                Ok(0) => pipe.open = false,
                Ok(n) => {
                    let stream = pipe.stream;
                    pipe.lines.push(&buf[..n], |line| emit(id, stream, line));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::debug!(target: "containerv", "[{id}] log pipe: {err}");
                    pipe.open = false;
                }
            }
        }
    }
    for pipe in &mut pipes {
        let stream = pipe.stream;
        pipe.lines.finish(|line| emit(id, stream, line));
    }
}

/// Drains the two log pipes until both reach end of file.
pub(crate) struct LogThread {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl LogThread {
    pub(crate) fn spawn(id: &str, stdout: OwnedFd, stderr: OwnedFd) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, done) = mpsc::channel();
        let pipes = vec![
            Pipe {
                fd: stdout,
                stream: Stream::Stdout,
                lines: LineBuffer::default(),
                open: true,
            },
            Pipe {
                fd: stderr,
                stream: Stream::Stderr,
                lines: LineBuffer::default(),
                open: true,
            },
        ];
        let id = id.to_string();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("cv-logs-{id}"))
            .spawn(move || {
                run(&id, pipes, &flag);
                let _ = tx.send(());
            })?;
        Ok(Self {
            stop,
            done,
            handle: Some(handle),
        })
    }

    /// Waits up to `timeout` for the pipes to drain. On timeout the thread
    /// is told to stop and left detached.
    pub(crate) fn join_timeout(mut self, timeout: Duration) -> bool {
        let drained = match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        self.stop.store(true, Ordering::Release);
        if drained && let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        drained
    }
}

impl Drop for LogThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::fs::File;
    use std::io::Write;

    fn collect(chunks: &[&[u8]]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut buffer = LineBuffer::default();
        for chunk in chunks {
            buffer.push(chunk, |line| lines.push(line.to_string()));
        }
        buffer.finish(|line| lines.push(line.to_string()));
        lines
    }

    #[test]
    fn lines_span_reads() {
        assert_eq!(
            collect(&[b"hel", b"lo\nwor", b"ld\r\n", b"tail"]),
            ["hello", "world", "tail"]
        );
        assert_eq!(collect(&[b"\n"]), [""]);
        assert!(collect(&[]).is_empty());
    }

    #[test]
    fn long_lines_are_split() {
        let long = vec![b'x'; MAX_LINE + 10];
        let lines = collect(&[&long]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE);
        assert_eq!(lines[1].len(), 10);
    }

    #[test]
    fn thread_finishes_when_writers_close() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (out_rx, out_tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (err_rx, err_tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let logs = LogThread::spawn("box-1", out_rx, err_rx).unwrap();
        let mut out = File::from(out_tx);
        writeln!(out, "hello from the container").unwrap();
        drop(out);
        drop(err_tx);
        assert!(logs.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn join_times_out_while_a_writer_is_open() {
        let (out_rx, out_tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (err_rx, _err_tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let logs = LogThread::spawn("box-2", out_rx, err_rx).unwrap();
        drop(out_tx);
        assert!(!logs.join_timeout(Duration::from_millis(100)));
    }
}
