//! Host to PID1 control plane over a Unix datagram socket.

mod client;
mod fdpass;
pub(crate) mod proto;
mod server;

pub use proto::SpawnOptions;

pub(crate) use client::Client;
pub(crate) use server::Server;

use crate::error::{Error, Result};
use crate::nsfds::NamespaceFds;
use proto::{MAX_FILE_FDS, Request};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Outcome of a spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub pid: i32,
    /// Set when the request asked to wait for completion.
    pub exit_code: Option<i32>,
}

pub(crate) fn spawn(runtime_dir: &Path, opts: &SpawnOptions) -> Result<Spawned> {
    let client = Client::connect(runtime_dir)?;
    let (response, _) = client.call(&Request::Spawn(opts.clone()), &[])?;
    Ok(Spawned {
        pid: response.pid,
        exit_code: opts.wait.then_some(response.exit_code),
    })
}

pub(crate) fn kill(runtime_dir: &Path, pid: i32) -> Result<()> {
    Client::connect(runtime_dir)?.call(&Request::Kill { pid }, &[])?;
    Ok(())
}

pub(crate) fn wait(runtime_dir: &Path, pid: i32) -> Result<i32> {
    let (response, _) = Client::connect(runtime_dir)?.call(&Request::Wait { pid }, &[])?;
    Ok(response.exit_code)
}

pub(crate) fn root(runtime_dir: &Path) -> Result<PathBuf> {
    let (response, _) = Client::connect(runtime_dir)?.call(&Request::GetRoot, &[])?;
    let text = String::from_utf8(response.payload)
        .map_err(|_| Error::Protocol("root path is not UTF-8".into()))?;
    Ok(PathBuf::from(text))
}

pub(crate) fn namespace_fds(runtime_dir: &Path) -> Result<NamespaceFds> {
    let (response, fds) = Client::connect(runtime_dir)?.call(&Request::GetFds, &[])?;
    let tags: Vec<u32> = response
        .slots
        .iter()
        .take(fds.len())
        .map(|tag| *tag as u32)
        .collect();
    NamespaceFds::from_parts(&tags, fds)
}

/// Copies each open file to its path inside the container, keeping the
/// source's mode bits.
pub(crate) fn send_files(runtime_dir: &Path, files: &[(&str, &File)]) -> Result<()> {
    let paths = files.iter().map(|(path, _)| path.to_string()).collect();
    let fds: Vec<RawFd> = files.iter().map(|(_, file)| file.as_raw_fd()).collect();
    let (response, _) = Client::connect(runtime_dir)?.call(&Request::SendFiles { paths }, &fds)?;
    match response.slots.iter().take(files.len()).find(|status| **status != 0) {
        Some(&errno) => Err(Error::Remote {
            op: "send-files",
            errno,
        }),
        None => Ok(()),
    }
}

/// Opens each path inside the container for reading.
pub(crate) fn recv_files(runtime_dir: &Path, paths: &[&str]) -> Result<Vec<Result<File>>> {
    let request = Request::RecvFiles {
        paths: paths.iter().map(|path| path.to_string()).collect(),
    };
    let (response, fds) = Client::connect(runtime_dir)?.call(&request, &[])?;
    let mut fds = fds.into_iter();
    let mut out = Vec::with_capacity(paths.len());
    for status in response.slots.iter().take(paths.len().min(MAX_FILE_FDS)) {
        if *status != 0 {
            out.push(Err(Error::Remote {
                op: "recv-files",
                errno: *status,
            }));
            continue;
        }
        let fd = fds
            .next()
            .ok_or_else(|| Error::Protocol("recv-files reply is missing a descriptor".into()))?;
        out.push(Ok(File::from(fd)));
    }
    Ok(out)
}

pub(crate) fn destroy(runtime_dir: &Path) -> Result<()> {
    Client::connect(runtime_dir)?.call(&Request::Destroy, &[])?;
    Ok(())
}
