use bpf_api::{FsDenyEvent, NetDenyEvent, hook_name};
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Ring buffer a raw record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Fs,
    Net,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsDenial {
    pub hook: &'static str,
    pub cgroup_id: u64,
    pub dev: u64,
    pub ino: u64,
    pub pid: u32,
    pub required_mask: u32,
    pub comm: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetDenial {
    pub hook: &'static str,
    pub cgroup_id: u64,
    pub pid: u32,
    pub required_mask: u32,
    pub family: u16,
    pub sock_type: u16,
    pub protocol: u16,
    pub port: u16,
    pub addr: String,
    pub comm: String,
    pub path: String,
}

/// User-facing representation of a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DenialRecord {
    Fs(FsDenial),
    Net(NetDenial),
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn format_addr(family: u16, addr: &[u8; 16]) -> String {
    match family {
        2 => Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string(),
        10 => Ipv6Addr::from(*addr).to_string(),
        _ => "-".to_string(),
    }
}

impl From<FsDenyEvent> for DenialRecord {
    fn from(e: FsDenyEvent) -> Self {
        DenialRecord::Fs(FsDenial {
            hook: hook_name(e.hook),
            cgroup_id: e.cgroup_id,
            dev: e.dev,
            ino: e.ino,
            pid: e.pid,
            required_mask: e.required_mask,
            comm: c_string(&e.comm),
            name: c_string(&e.name),
        })
    }
}

impl From<NetDenyEvent> for DenialRecord {
    fn from(e: NetDenyEvent) -> Self {
        DenialRecord::Net(NetDenial {
            hook: hook_name(e.hook),
            cgroup_id: e.cgroup_id,
            pid: e.pid,
            required_mask: e.required_mask,
            family: e.family,
            sock_type: e.sock_type,
            protocol: e.protocol,
            port: e.port,
            addr: format_addr(e.family, &e.addr),
            comm: c_string(&e.comm),
            path: c_string(&e.name),
        })
    }
}

impl DenialRecord {
    /// Decodes a raw ring buffer payload. Short records yield `None`.
    pub fn decode(kind: EventKind, bytes: &[u8]) -> Option<Self> {
        match kind {
            EventKind::Fs => {
                let raw = bytes.get(..size_of::<FsDenyEvent>())?;
                Some(bytemuck::pod_read_unaligned::<FsDenyEvent>(raw).into())
            }
            EventKind::Net => {
                let raw = bytes.get(..size_of::<NetDenyEvent>())?;
                Some(bytemuck::pod_read_unaligned::<NetDenyEvent>(raw).into())
            }
        }
    }
}

impl fmt::Display for DenialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialRecord::Fs(e) => write!(
                f,
                "denied hook={} cgroup={} dev={} ino={} mask={:#x} pid={} comm={} name={}",
                e.hook, e.cgroup_id, e.dev, e.ino, e.required_mask, e.pid, e.comm, e.name
            ),
            DenialRecord::Net(e) => {
                write!(
                    f,
                    "denied hook={} cgroup={} family={} type={} proto={} addr={} port={} mask={:#x} pid={} comm={}",
                    e.hook,
                    e.cgroup_id,
                    e.family,
                    e.sock_type,
                    e.protocol,
                    e.addr,
                    e.port,
                    e.required_mask,
                    e.pid,
                    e.comm
                )?;
                if !e.path.is_empty() {
                    write!(f, " path={}", e.path)?;
                }
                Ok(())
            }
        }
    }
}
