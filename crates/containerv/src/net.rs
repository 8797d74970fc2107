//! rtnetlink requests for the container veth pair.

use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const NLMSG_ERROR: u16 = 2;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;

const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const NLA_F_NESTED: u16 = 1 << 15;

const IFF_UP: u32 = 0x1;
const RECV_BUF: usize = 8192;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct NlMsgHdr {
    len: u32,
    kind: u16,
    flags: u16,
    seq: u32,
    pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct IfInfoMsg {
    family: u8,
    _pad: u8,
    kind: u16,
    index: i32,
    flags: u32,
    change: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct IfAddrMsg {
    family: u8,
    prefixlen: u8,
    flags: u8,
    scope: u8,
    index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RtAttr {
    len: u16,
    kind: u16,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Builder for a single netlink request.
#[derive(Debug)]
struct Message {
    buf: Vec<u8>,
    nests: Vec<usize>,
}

impl Message {
    fn new(kind: u16, flags: u16) -> Self {
        let header = NlMsgHdr {
            len: 0,
            kind,
            flags: NLM_F_REQUEST | NLM_F_ACK | flags,
            seq: 0,
            pid: 0,
        };
        Self {
            buf: bytemuck::bytes_of(&header).to_vec(),
            nests: Vec::new(),
        }
    }

    fn pad(&mut self) {
        self.buf.resize(align4(self.buf.len()), 0);
    }

    fn push<T: Pod>(&mut self, value: &T) -> &mut Self {
        self.buf.extend_from_slice(bytemuck::bytes_of(value));
        self.pad();
        self
    }

    fn attr(&mut self, kind: u16, data: &[u8]) -> &mut Self {
        let header = RtAttr {
            len: (size_of::<RtAttr>() + data.len()) as u16,
            kind,
        };
        self.buf.extend_from_slice(bytemuck::bytes_of(&header));
        self.buf.extend_from_slice(data);
        self.pad();
        self
    }

    fn attr_str(&mut self, kind: u16, value: &str) -> &mut Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.attr(kind, &data)
    }

    fn begin(&mut self, kind: u16) -> &mut Self {
        self.nests.push(self.buf.len());
        let header = RtAttr {
            len: 0,
            kind: kind | NLA_F_NESTED,
        };
        self.buf.extend_from_slice(bytemuck::bytes_of(&header));
        self
    }

    fn end(&mut self) -> &mut Self {
        if let Some(start) = self.nests.pop() {
            let len = (self.buf.len() - start) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
        self
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf
    }
}

fn link_msg(kind: u16, flags: u16, index: i32) -> Message {
    let mut msg = Message::new(kind, flags);
    msg.push(&IfInfoMsg {
        index,
        ..IfInfoMsg::zeroed()
    });
    msg
}

fn veth_request(host: &str, peer: &str) -> Message {
    let mut msg = link_msg(RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL, 0);
    msg.attr_str(IFLA_IFNAME, host)
        .begin(IFLA_LINKINFO)
        .attr_str(IFLA_INFO_KIND, "veth")
        .begin(IFLA_INFO_DATA)
        .begin(VETH_INFO_PEER)
        .push(&IfInfoMsg::zeroed())
        .attr_str(IFLA_IFNAME, peer)
        .end()
        .end()
        .end();
    msg
}

fn move_request(index: i32, pid: i32) -> Message {
    let mut msg = link_msg(RTM_NEWLINK, 0, index);
    msg.attr(IFLA_NET_NS_PID, &(pid as u32).to_ne_bytes());
    msg
}

fn up_request(index: i32) -> Message {
    let mut msg = Message::new(RTM_NEWLINK, 0);
    msg.push(&IfInfoMsg {
        index,
        flags: IFF_UP,
        change: IFF_UP,
        ..IfInfoMsg::zeroed()
    });
    msg
}

fn addr_request(index: i32, addr: Ipv4Addr, prefix: u8) -> Message {
    let mut msg = Message::new(RTM_NEWADDR, NLM_F_CREATE | NLM_F_EXCL);
    msg.push(&IfAddrMsg {
        family: libc::AF_INET as u8,
        prefixlen: prefix,
        flags: 0,
        scope: 0,
        index: index as u32,
    })
    .attr(IFA_LOCAL, &addr.octets())
    .attr(IFA_ADDRESS, &addr.octets());
    msg
}

/// Parses an ack; `Ok(Some(seq))` on success, errno on failure.
fn parse_ack(buf: &[u8]) -> io::Result<Option<u32>> {
    let Some(header) = buf
        .get(..size_of::<NlMsgHdr>())
        .map(bytemuck::pod_read_unaligned::<NlMsgHdr>)
    else {
        return Err(io::Error::other("short netlink reply"));
    };
    if header.kind != NLMSG_ERROR {
        return Ok(None);
    }
    let start = size_of::<NlMsgHdr>();
    let code = buf
        .get(start..start + 4)
        .map(|bytes| i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .ok_or_else(|| io::Error::other("truncated netlink error"))?;
    if code == 0 {
        Ok(Some(header.seq))
    } else {
        Err(io::Error::from_raw_os_error(-code))
    }
}

fn ifindex(name: &str) -> Result<i32> {
    let cname = CString::new(name)
        .map_err(|_| Error::InvalidArgument(format!("interface name {name:?}")))?;
    // SAFETY: `cname` is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        Err(Error::io(format!("interface {name}"), io::Error::last_os_error()))
    } else {
        Ok(index as i32)
    }
}

/// A route netlink socket; closed on drop.
pub(crate) struct Netlink {
    fd: OwnedFd,
    seq: u32,
}

impl Netlink {
    pub(crate) fn open() -> Result<Self> {
        // SAFETY: plain socket(2); ownership of the fd is taken below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(Error::io("netlink socket", io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a fresh descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: `addr` is a valid sockaddr_nl for the duration of the call.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::io("netlink bind", io::Error::last_os_error()));
        }
        Ok(Self { fd, seq: 0 })
    }

    fn request(&mut self, what: &str, msg: Message) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let bytes = msg.finish(self.seq);
        // SAFETY: `bytes` is valid for reads of its length.
        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(Error::io(what.to_string(), io::Error::last_os_error()));
        }
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            // SAFETY: `buf` is valid for writes of its length.
            let len = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if len < 0 {
                return Err(Error::io(what.to_string(), io::Error::last_os_error()));
            }
            match parse_ack(&buf[..len as usize]) {
                Ok(Some(seq)) if seq == self.seq => return Ok(()),
                Ok(_) => continue,
                Err(err) => return Err(Error::io(what.to_string(), err)),
            }
        }
    }

    pub(crate) fn create_veth(&mut self, host: &str, peer: &str) -> Result<()> {
        self.request(&format!("create veth {host}/{peer}"), veth_request(host, peer))
    }

    pub(crate) fn move_to_netns(&mut self, name: &str, pid: i32) -> Result<()> {
        let index = ifindex(name)?;
        self.request(&format!("move {name} to pid {pid}"), move_request(index, pid))
    }

    pub(crate) fn set_up(&mut self, name: &str) -> Result<()> {
        let index = ifindex(name)?;
        self.request(&format!("set {name} up"), up_request(index))
    }

    pub(crate) fn add_address(&mut self, name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        let index = ifindex(name)?;
        self.request(
            &format!("add {addr}/{prefix} to {name}"),
            addr_request(index, addr, prefix),
        )
    }

    pub(crate) fn delete_link(&mut self, name: &str) -> Result<()> {
        let index = ifindex(name)?;
        self.request(&format!("delete {name}"), link_msg(RTM_DELLINK, 0, index))
    }
}

/// Host side of the pair; deleted on drop unless the container is
/// torn down through its network namespace.
pub(crate) struct HostVeth {
    name: String,
    armed: bool,
}

impl HostVeth {
    /// Creates the pair, moves the peer into `pid`'s network namespace and
    /// configures the host end.
    pub(crate) fn create(host: &str, peer: &str, pid: i32, addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        let mut nl = Netlink::open()?;
        nl.create_veth(host, peer)?;
        let veth = Self {
            name: host.to_string(),
            armed: true,
        };
        nl.move_to_netns(peer, pid)?;
        nl.add_address(host, addr, prefix)?;
        nl.set_up(host)?;
        log::info!(target: "containerv", "veth {host} up at {addr}/{prefix}, peer {peer} in pid {pid}");
        Ok(veth)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn remove(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let result = Netlink::open().and_then(|mut nl| nl.delete_link(&self.name));
        match result {
            Ok(()) => log::debug!(target: "containerv", "removed veth {}", self.name),
            // Gone with the container's network namespace.
            Err(err) if err.errno() == libc::ENODEV => {}
            Err(err) => log::warn!(target: "containerv", "failed to remove veth {}: {err}", self.name),
        }
    }
}

impl Drop for HostVeth {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Inside the container: bring up loopback and the peer end.
pub(crate) fn configure_container(peer: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
    let mut nl = Netlink::open()?;
    nl.set_up("lo")?;
    nl.add_address(peer, addr, prefix)?;
    nl.set_up(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u16(buf: &[u8], at: usize) -> u16 {
        u16::from_ne_bytes([buf[at], buf[at + 1]])
    }

    fn read_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn veth_request_layout() {
        let bytes = veth_request("vethabc", "vethabcc").finish(7);
        assert_eq!(read_u32(&bytes, 0) as usize, bytes.len());
        assert_eq!(read_u16(&bytes, 4), RTM_NEWLINK);
        assert_eq!(
            read_u16(&bytes, 6),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL
        );
        assert_eq!(read_u32(&bytes, 8), 7);
        assert_eq!(bytes.len() % 4, 0);

        // nlmsghdr + ifinfomsg, then IFLA_IFNAME "vethabc\0" padded to 12.
        let first = 16 + 16;
        assert_eq!(read_u16(&bytes, first), 4 + 8);
        assert_eq!(read_u16(&bytes, first + 2), IFLA_IFNAME);
        assert_eq!(&bytes[first + 4..first + 11], b"vethabc");

        // IFLA_LINKINFO spans to the end of the message.
        let linkinfo = first + 12;
        assert_eq!(read_u16(&bytes, linkinfo + 2), IFLA_LINKINFO | NLA_F_NESTED);
        assert_eq!(read_u16(&bytes, linkinfo) as usize, bytes.len() - linkinfo);
        let peer_name = bytes
            .windows(9)
            .position(|window| window == b"vethabcc\0")
            .unwrap();
        assert!(peer_name > linkinfo);
    }

    #[test]
    fn addr_request_carries_prefix_and_address() {
        let bytes = addr_request(3, Ipv4Addr::new(10, 1, 2, 3), 24).finish(1);
        assert_eq!(read_u16(&bytes, 4), RTM_NEWADDR);
        assert_eq!(bytes[16], libc::AF_INET as u8);
        assert_eq!(bytes[17], 24);
        assert_eq!(read_u32(&bytes, 20), 3);
        assert_eq!(read_u16(&bytes, 24), 8);
        assert_eq!(read_u16(&bytes, 26), IFA_LOCAL);
        assert_eq!(&bytes[28..32], &[10, 1, 2, 3]);
    }

    #[test]
    fn acks_and_errors() {
        let mut ok = bytemuck::bytes_of(&NlMsgHdr {
            len: 36,
            kind: NLMSG_ERROR,
            flags: 0,
            seq: 5,
            pid: 0,
        })
        .to_vec();
        ok.extend_from_slice(&0i32.to_ne_bytes());
        assert_eq!(parse_ack(&ok).unwrap(), Some(5));

        let mut failed = ok.clone();
        failed[16..20].copy_from_slice(&(-libc::EEXIST).to_ne_bytes());
        assert_eq!(
            parse_ack(&failed).unwrap_err().raw_os_error(),
            Some(libc::EEXIST)
        );

        let mut other = ok.clone();
        other[4..6].copy_from_slice(&RTM_NEWLINK.to_ne_bytes());
        assert_eq!(parse_ack(&other).unwrap(), None);
        assert!(parse_ack(&ok[..8]).is_err());
    }
}
