use super::fdpass;
use super::proto::{Request, Response};
use crate::error::{Error, Result};
use crate::paths::CONTROL_SOCKET;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::process;

/// Host end of one RPC: a datagram socket bound to a throwaway path in
/// the runtime directory, removed on drop.
pub(crate) struct Client {
    socket: UnixDatagram,
    path: PathBuf,
}

impl Client {
    pub(crate) fn connect(runtime_dir: &Path) -> Result<Self> {
        let path = runtime_dir.join(format!(
            "client-{}-{:08x}",
            process::id(),
            rand::random::<u32>()
        ));
        let socket = UnixDatagram::bind(&path)
            .map_err(|err| Error::io(format!("bind {}", path.display()), err))?;
        let client = Self { socket, path };
        let control = runtime_dir.join(CONTROL_SOCKET);
        client
            .socket
            .connect(&control)
            .map_err(|err| Error::io(format!("connect {}", control.display()), err))?;
        Ok(client)
    }

    /// Sends `request`, attaching `fds` to its payload datagram, and
    /// blocks for the reply. A non-zero reply status becomes
    /// [`Error::Remote`].
    pub(crate) fn call(&self, request: &Request, fds: &[RawFd]) -> Result<(Response, Vec<OwnedFd>)> {
        let kind = request.kind();
        let (header, payload) = request.encode()?;
        let fd = self.socket.as_raw_fd();
        let send_err = |err: std::io::Error| Error::io(format!("send {}", kind.name()), err);
        match payload {
            Some(payload) => {
                fdpass::send(fd, None, bytemuck::bytes_of(&header), &[]).map_err(send_err)?;
                fdpass::send(fd, None, &payload, fds).map_err(send_err)?;
            }
            None => fdpass::send(fd, None, bytemuck::bytes_of(&header), fds).map_err(send_err)?,
        }

        let datagram = fdpass::recv(fd).map_err(|err| Error::io(format!("{} reply", kind.name()), err))?;
        let response = Response::decode(&datagram.bytes)?;
        if response.kind != kind {
            return Err(Error::Protocol(format!(
                "{} reply to a {} request",
                response.kind.name(),
                kind.name()
            )));
        }
        if response.status != 0 {
            return Err(Error::Remote {
                op: kind.name(),
                errno: response.status,
            });
        }
        if datagram.fds.len() != response.count as usize {
            return Err(Error::Protocol(format!(
                "{} reply announced {} descriptors, carried {}",
                kind.name(),
                response.count,
                datagram.fds.len()
            )));
        }
        Ok((response, datagram.fds))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
