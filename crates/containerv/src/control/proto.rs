//! Control socket wire format.
//!
//! A request is one [`CommandHeader`] datagram; spawn, send-files and
//! recv-files follow it with a payload datagram of packed NUL-terminated
//! strings. Every reply is one datagram: a [`ResponseHeader`] followed by
//! `payload_len` inline bytes. Descriptors travel as `SCM_RIGHTS`.

use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};

pub(crate) const MAX_MESSAGE: usize = 64 * 1024;
pub(crate) const MAX_FDS: usize = 16;
pub(crate) const MAX_FILE_FDS: usize = 8;
pub(crate) const SLOTS: usize = 8;

pub(crate) const SPAWN_WAIT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Kind {
    Spawn = 1,
    Kill = 2,
    Wait = 3,
    GetRoot = 4,
    GetFds = 5,
    SendFiles = 6,
    RecvFiles = 7,
    Destroy = 8,
}

impl Kind {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Kind::Spawn,
            2 => Kind::Kill,
            3 => Kind::Wait,
            4 => Kind::GetRoot,
            5 => Kind::GetFds,
            6 => Kind::SendFiles,
            7 => Kind::RecvFiles,
            8 => Kind::Destroy,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Kind::Spawn => "spawn",
            Kind::Kill => "kill",
            Kind::Wait => "wait",
            Kind::GetRoot => "get-root",
            Kind::GetFds => "get-fds",
            Kind::SendFiles => "send-files",
            Kind::RecvFiles => "recv-files",
            Kind::Destroy => "destroy",
        }
    }

    /// Whether a payload datagram follows the header.
    pub(crate) fn has_payload(self) -> bool {
        matches!(self, Kind::Spawn | Kind::SendFiles | Kind::RecvFiles)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub(crate) struct CommandHeader {
    pub kind: u32,
    pub flags: u32,
    pub pid: i32,
    pub uid: i32,
    pub gid: i32,
    /// Spawn: argument count. File commands: path count.
    pub argc: u32,
    pub envc: u32,
    pub payload_len: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub(crate) struct ResponseHeader {
    pub kind: u32,
    pub status: i32,
    pub pid: i32,
    pub exit_code: i32,
    /// Descriptors attached to this reply.
    pub count: u32,
    pub payload_len: u32,
    /// Namespace tags for get-fds, per-path status for file commands.
    pub slots: [i32; SLOTS],
}

/// What to run inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    pub path: String,
    /// Full argv, including argv\[0\].
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Reply only after the process exits.
    pub wait: bool,
}

impl SpawnOptions {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            args: vec![path.clone()],
            path,
            env: Vec::new(),
            uid: None,
            gid: None,
            wait: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    pub fn user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Spawn(SpawnOptions),
    Kill { pid: i32 },
    Wait { pid: i32 },
    GetRoot,
    GetFds,
    SendFiles { paths: Vec<String> },
    RecvFiles { paths: Vec<String> },
    Destroy,
}

fn id_field(id: Option<u32>) -> Result<i32> {
    match id {
        None => Ok(-1),
        Some(id) => i32::try_from(id)
            .map_err(|_| Error::InvalidArgument(format!("id {id} out of range"))),
    }
}

fn check_paths(paths: &[String]) -> Result<()> {
    if paths.is_empty() || paths.len() > MAX_FILE_FDS {
        return Err(Error::InvalidArgument(format!(
            "file commands take 1 to {MAX_FILE_FDS} paths, got {}",
            paths.len()
        )));
    }
    Ok(())
}

impl Request {
    pub(crate) fn kind(&self) -> Kind {
        match self {
            Request::Spawn(_) => Kind::Spawn,
            Request::Kill { .. } => Kind::Kill,
            Request::Wait { .. } => Kind::Wait,
            Request::GetRoot => Kind::GetRoot,
            Request::GetFds => Kind::GetFds,
            Request::SendFiles { .. } => Kind::SendFiles,
            Request::RecvFiles { .. } => Kind::RecvFiles,
            Request::Destroy => Kind::Destroy,
        }
    }

    /// Header plus the payload datagram, if the command has one.
    pub(crate) fn encode(&self) -> Result<(CommandHeader, Option<Vec<u8>>)> {
        let mut header = CommandHeader {
            kind: self.kind() as u32,
            uid: -1,
            gid: -1,
            ..CommandHeader::zeroed()
        };
        let payload = match self {
            Request::Spawn(spawn) => {
                if spawn.args.is_empty() {
                    return Err(Error::InvalidArgument("spawn needs argv[0]".into()));
                }
                header.flags = if spawn.wait { SPAWN_WAIT } else { 0 };
                header.uid = id_field(spawn.uid)?;
                header.gid = id_field(spawn.gid)?;
                header.argc = spawn.args.len() as u32;
                header.envc = spawn.env.len() as u32;
                let strings = std::iter::once(&spawn.path)
                    .chain(&spawn.args)
                    .chain(&spawn.env)
                    .map(String::as_str);
                Some(pack_strings(strings)?)
            }
            Request::Kill { pid } | Request::Wait { pid } => {
                header.pid = *pid;
                None
            }
            Request::SendFiles { paths } | Request::RecvFiles { paths } => {
                check_paths(paths)?;
                header.argc = paths.len() as u32;
                Some(pack_strings(paths.iter().map(String::as_str))?)
            }
            Request::GetRoot | Request::GetFds | Request::Destroy => None,
        };
        if let Some(bytes) = &payload {
            header.payload_len = bytes.len() as u32;
        }
        Ok((header, payload))
    }

    pub(crate) fn decode_header(bytes: &[u8]) -> Result<(Kind, CommandHeader)> {
        if bytes.len() != size_of::<CommandHeader>() {
            return Err(Error::Protocol(format!(
                "command header of {} bytes",
                bytes.len()
            )));
        }
        let header: CommandHeader = bytemuck::pod_read_unaligned(bytes);
        let kind = Kind::from_raw(header.kind)
            .ok_or_else(|| Error::Protocol(format!("unknown command {}", header.kind)))?;
        if header.payload_len as usize > MAX_MESSAGE {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds the limit",
                header.payload_len
            )));
        }
        Ok((kind, header))
    }

    pub(crate) fn decode(kind: Kind, header: &CommandHeader, payload: &[u8]) -> Result<Self> {
        if payload.len() != header.payload_len as usize {
            return Err(Error::Protocol(format!(
                "{} payload is {} bytes, header says {}",
                kind.name(),
                payload.len(),
                header.payload_len
            )));
        }
        let optional = |raw: i32| u32::try_from(raw).ok();
        Ok(match kind {
            Kind::Spawn => {
                let argc = header.argc as usize;
                let envc = header.envc as usize;
                let mut strings = unpack_strings(payload, 1 + argc + envc)?.into_iter();
                let path = strings.next().unwrap_or_default();
                let args: Vec<String> = strings.by_ref().take(argc).collect();
                let env = strings.collect();
                Request::Spawn(SpawnOptions {
                    path,
                    args,
                    env,
                    uid: optional(header.uid),
                    gid: optional(header.gid),
                    wait: header.flags & SPAWN_WAIT != 0,
                })
            }
            Kind::Kill => Request::Kill { pid: header.pid },
            Kind::Wait => Request::Wait { pid: header.pid },
            Kind::GetRoot => Request::GetRoot,
            Kind::GetFds => Request::GetFds,
            Kind::SendFiles | Kind::RecvFiles => {
                let paths = unpack_strings(payload, header.argc as usize)?;
                check_paths(&paths).map_err(|err| Error::Protocol(err.to_string()))?;
                if kind == Kind::SendFiles {
                    Request::SendFiles { paths }
                } else {
                    Request::RecvFiles { paths }
                }
            }
            Kind::Destroy => Request::Destroy,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Response {
    pub kind: Kind,
    pub status: i32,
    pub pid: i32,
    pub exit_code: i32,
    pub count: u32,
    pub slots: [i32; SLOTS],
    pub payload: Vec<u8>,
}

impl Response {
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            kind,
            status: 0,
            pid: 0,
            exit_code: 0,
            count: 0,
            slots: [0; SLOTS],
            payload: Vec::new(),
        }
    }

    pub(crate) fn error(kind: Kind, errno: i32) -> Self {
        Self {
            status: errno,
            ..Self::new(kind)
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        if size_of::<ResponseHeader>() + self.payload.len() > MAX_MESSAGE {
            return Err(Error::Protocol(format!(
                "{} reply of {} bytes exceeds the limit",
                self.kind.name(),
                self.payload.len()
            )));
        }
        let header = ResponseHeader {
            kind: self.kind as u32,
            status: self.status,
            pid: self.pid,
            exit_code: self.exit_code,
            count: self.count,
            payload_len: self.payload.len() as u32,
            slots: self.slots,
        };
        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let header_len = size_of::<ResponseHeader>();
        let Some(head) = bytes.get(..header_len) else {
            return Err(Error::Protocol(format!("reply of {} bytes", bytes.len())));
        };
        let header: ResponseHeader = bytemuck::pod_read_unaligned(head);
        let kind = Kind::from_raw(header.kind)
            .ok_or_else(|| Error::Protocol(format!("unknown reply kind {}", header.kind)))?;
        let payload = &bytes[header_len..];
        if payload.len() != header.payload_len as usize {
            return Err(Error::Protocol(format!(
                "reply payload is {} bytes, header says {}",
                payload.len(),
                header.payload_len
            )));
        }
        Ok(Self {
            kind,
            status: header.status,
            pid: header.pid,
            exit_code: header.exit_code,
            count: header.count,
            slots: header.slots,
            payload: payload.to_vec(),
        })
    }
}

pub(crate) fn pack_strings<'a>(strings: impl IntoIterator<Item = &'a str>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for s in strings {
        if s.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument(format!("{s:?} contains a NUL byte")));
        }
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    if out.len() > MAX_MESSAGE {
        return Err(Error::InvalidArgument(format!(
            "{} bytes of strings exceed the message limit",
            out.len()
        )));
    }
    Ok(out)
}

/// Splits exactly `count` NUL-terminated strings off `bytes`.
pub(crate) fn unpack_strings(bytes: &[u8], count: usize) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(count.min(bytes.len()));
    let mut rest = bytes;
    for _ in 0..count {
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("unterminated string in payload".into()))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|_| Error::Protocol("payload string is not UTF-8".into()))?;
        out.push(s.to_string());
        rest = &rest[end + 1..];
    }
    if !rest.is_empty() {
        return Err(Error::Protocol(format!("{} trailing payload bytes", rest.len())));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_sizes_are_fixed() {
        assert_eq!(size_of::<CommandHeader>(), 32);
        assert_eq!(size_of::<ResponseHeader>(), 56);
    }

    #[test]
    fn spawn_survives_the_wire() {
        let spawn = SpawnOptions::new("/bin/sh")
            .args(["sh", "-c", "echo hi"])
            .env("PATH", "/bin")
            .user(1000, 100)
            .wait(true);
        let (header, payload) = Request::Spawn(spawn.clone()).encode().unwrap();
        let payload = payload.unwrap();
        assert_eq!(header.argc, 3);
        assert_eq!(header.envc, 1);
        assert_eq!(header.flags, SPAWN_WAIT);

        let (kind, decoded_header) = Request::decode_header(bytemuck::bytes_of(&header)).unwrap();
        assert_eq!(kind, Kind::Spawn);
        assert!(kind.has_payload());
        let decoded = Request::decode(kind, &decoded_header, &payload).unwrap();
        assert_eq!(decoded, Request::Spawn(spawn));
    }

    #[test]
    fn unset_ids_are_minus_one() {
        let (header, _) = Request::Spawn(SpawnOptions::new("/bin/true")).encode().unwrap();
        assert_eq!((header.uid, header.gid), (-1, -1));
        assert!(
            Request::Spawn(SpawnOptions::new("/bin/true").user(u32::MAX, 0))
                .encode()
                .is_err()
        );
    }

    #[test]
    fn file_commands_are_bounded() {
        let nine: Vec<String> = (0..9).map(|i| format!("/f{i}")).collect();
        assert!(Request::RecvFiles { paths: nine }.encode().is_err());
        assert!(Request::SendFiles { paths: vec![] }.encode().is_err());
        let (header, payload) = Request::RecvFiles {
            paths: vec!["/etc/hostname".into()],
        }
        .encode()
        .unwrap();
        assert_eq!(header.argc, 1);
        assert_eq!(payload.unwrap(), b"/etc/hostname\0");
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(Request::decode_header(&[0u8; 12]).is_err());
        let header = CommandHeader {
            kind: 99,
            ..CommandHeader::zeroed()
        };
        assert!(Request::decode_header(bytemuck::bytes_of(&header)).is_err());
        let header = CommandHeader {
            kind: Kind::Spawn as u32,
            payload_len: 3,
            argc: 1,
            ..CommandHeader::zeroed()
        };
        assert!(Request::decode(Kind::Spawn, &header, b"ab").is_err());
        assert!(Request::decode(Kind::Spawn, &header, b"ab\0").is_err());
    }

    #[test]
    fn responses_carry_inline_payload() {
        let mut response = Response::new(Kind::GetRoot);
        response.payload = b"/srv/root".to_vec();
        response.slots[0] = 3;
        let decoded = Response::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);

        let mut too_big = Response::new(Kind::GetRoot);
        too_big.payload = vec![b'x'; MAX_MESSAGE];
        assert!(too_big.encode().is_err());
        assert!(Response::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn strings_reject_nul() {
        assert!(pack_strings(["a\0b"]).is_err());
        assert_eq!(pack_strings(["", "x"]).unwrap(), b"\0x\0");
        assert!(unpack_strings(b"a\0b\0", 1).is_err());
        assert!(unpack_strings(b"a", 1).is_err());
    }

    proptest! {
        #[test]
        fn packed_strings_unpack(strings in proptest::collection::vec("[^\u{0}]{0,12}", 0..6)) {
            let bytes = pack_strings(strings.iter().map(String::as_str)).unwrap();
            prop_assert_eq!(unpack_strings(&bytes, strings.len()).unwrap(), strings);
        }
    }
}
