#![no_std]
//! Kernel ABI shared between the enforcement manager and the LSM programs.
//!
//! Every struct is `repr(C)` with explicit padding so it can be copied into
//! a BPF map byte for byte.

use bytemuck::{Pod, Zeroable};
use core::mem::size_of;

pub const FS_PERM_READ: u32 = 1;
pub const FS_PERM_WRITE: u32 = 1 << 1;
pub const FS_PERM_EXEC: u32 = 1 << 2;
pub const FS_PERM_ALL: u32 = FS_PERM_READ | FS_PERM_WRITE | FS_PERM_EXEC;

pub const NET_PERM_CREATE: u32 = 1;
pub const NET_PERM_BIND: u32 = 1 << 1;
pub const NET_PERM_CONNECT: u32 = 1 << 2;
pub const NET_PERM_LISTEN: u32 = 1 << 3;
pub const NET_PERM_ACCEPT: u32 = 1 << 4;
pub const NET_PERM_SEND: u32 = 1 << 5;
pub const NET_PERM_ALL: u32 = NET_PERM_CREATE
    | NET_PERM_BIND
    | NET_PERM_CONNECT
    | NET_PERM_LISTEN
    | NET_PERM_ACCEPT
    | NET_PERM_SEND;

/// Directory rule applies to direct children only.
pub const DIR_FLAG_CHILDREN_ONLY: u32 = 1;
/// Directory rule applies to the whole subtree.
pub const DIR_FLAG_RECURSIVE: u32 = 1 << 1;

pub const BASENAME_MAX_RULES: usize = 8;
pub const BASENAME_MAX_TOKENS: usize = 6;
pub const BASENAME_TOKEN_LEN: usize = 32;

pub const BASENAME_TOKEN_NONE: u8 = 0;
pub const BASENAME_TOKEN_LITERAL: u8 = 1;
pub const BASENAME_TOKEN_DIGIT_ONE: u8 = 2;
pub const BASENAME_TOKEN_DIGIT_PLUS: u8 = 3;

pub const UNIX_PATH_MAX: usize = 108;
pub const COMM_LEN: usize = 16;
pub const EVENT_NAME_LEN: usize = 64;

/// Directory under bpffs where policy maps are pinned.
pub const PIN_DIR: &str = "/sys/fs/bpf/cvd";
/// Lists the active LSMs; `bpf` must be present for enforcement.
pub const LSM_PROBE_FILE: &str = "/sys/kernel/security/lsm";

pub const POLICY_MAP: &str = "policy_map";
pub const DIR_POLICY_MAP: &str = "dir_policy_map";
pub const BASENAME_POLICY_MAP: &str = "basename_policy_map";
pub const NET_CREATE_MAP: &str = "net_create_map";
pub const NET_TUPLE_MAP: &str = "net_tuple_map";
pub const NET_UNIX_MAP: &str = "net_unix_map";

pub const FS_EVENTS_RING: &str = "fs_deny_events";
pub const NET_EVENTS_RING: &str = "net_deny_events";

pub const FS_OBJECT: &str = "cvd-fs.o";
pub const NET_OBJECT: &str = "cvd-net.o";

/// LSM hooks implemented by the filesystem object.
pub const FS_PROGRAMS: &[&str] = &[
    "file_open",
    "bprm_check_security",
    "inode_create",
    "inode_mkdir",
    "inode_unlink",
    "inode_rename",
];

/// LSM hooks implemented by the network object.
pub const NET_PROGRAMS: &[&str] = &[
    "socket_create",
    "socket_bind",
    "socket_connect",
    "socket_listen",
    "socket_accept",
    "socket_sendmsg",
];

pub const BPF_MAP_TYPE_HASH: u32 = 1;

/// Expected shape of a pinned map, compared against what the kernel reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapSpec {
    pub name: &'static str,
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
}

pub const MAP_SPECS: [MapSpec; 6] = [
    MapSpec {
        name: POLICY_MAP,
        map_type: BPF_MAP_TYPE_HASH,
        key_size: size_of::<PolicyKey>() as u32,
        value_size: size_of::<PolicyValue>() as u32,
    },
    MapSpec {
        name: DIR_POLICY_MAP,
        map_type: BPF_MAP_TYPE_HASH,
        key_size: size_of::<PolicyKey>() as u32,
        value_size: size_of::<PolicyValue>() as u32,
    },
    MapSpec {
        name: BASENAME_POLICY_MAP,
        map_type: BPF_MAP_TYPE_HASH,
        key_size: size_of::<PolicyKey>() as u32,
        value_size: size_of::<BasenamePolicy>() as u32,
    },
    MapSpec {
        name: NET_CREATE_MAP,
        map_type: BPF_MAP_TYPE_HASH,
        key_size: size_of::<NetCreateKey>() as u32,
        value_size: size_of::<NetPolicyValue>() as u32,
    },
    MapSpec {
        name: NET_TUPLE_MAP,
        map_type: BPF_MAP_TYPE_HASH,
        key_size: size_of::<NetTupleKey>() as u32,
        value_size: size_of::<NetPolicyValue>() as u32,
    },
    MapSpec {
        name: NET_UNIX_MAP,
        map_type: BPF_MAP_TYPE_HASH,
        key_size: size_of::<NetUnixKey>() as u32,
        value_size: size_of::<NetPolicyValue>() as u32,
    },
];

/// Key of the file, directory and basename maps.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct PolicyKey {
    pub cgroup_id: u64,
    pub dev: u64,
    pub ino: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PolicyValue {
    pub allow_mask: u32,
    /// `DIR_FLAG_*` bits; zero for file entries.
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BasenameTokenEntry {
    pub kind: u8,
    pub len: u8,
    pub _pad: [u8; 2],
    pub text: [u8; BASENAME_TOKEN_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BasenameRuleEntry {
    pub allow_mask: u32,
    pub token_count: u8,
    pub tail_wildcard: u8,
    pub _pad: [u8; 2],
    pub tokens: [BasenameTokenEntry; BASENAME_MAX_TOKENS],
}

/// Per-directory table of basename rules.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BasenamePolicy {
    pub count: u32,
    pub rules: [BasenameRuleEntry; BASENAME_MAX_RULES],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct NetCreateKey {
    pub cgroup_id: u64,
    pub family: u16,
    pub sock_type: u16,
    pub protocol: u16,
    pub _pad: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct NetTupleKey {
    pub cgroup_id: u64,
    pub family: u16,
    pub sock_type: u16,
    pub protocol: u16,
    /// Network byte order; zero means any port.
    pub port: u16,
    /// IPv4 addresses use the first four bytes; all zero means any address.
    pub addr: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct NetUnixKey {
    pub cgroup_id: u64,
    pub sock_type: u16,
    pub protocol: u16,
    pub path_len: u8,
    pub is_abstract: u8,
    pub _pad: [u8; 2],
    pub path: [u8; UNIX_PATH_MAX],
    pub _pad2: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NetPolicyValue {
    pub allow_mask: u32,
}

/// Filesystem denial reported through `fs_deny_events`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct FsDenyEvent {
    pub cgroup_id: u64,
    pub dev: u64,
    pub ino: u64,
    pub pid: u32,
    pub hook: u32,
    pub required_mask: u32,
    pub _pad: u32,
    pub comm: [u8; COMM_LEN],
    pub name: [u8; EVENT_NAME_LEN],
}

/// Network denial reported through `net_deny_events`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct NetDenyEvent {
    pub cgroup_id: u64,
    pub pid: u32,
    pub hook: u32,
    pub required_mask: u32,
    pub family: u16,
    pub sock_type: u16,
    pub protocol: u16,
    pub port: u16,
    pub _pad: u32,
    pub addr: [u8; 16],
    pub comm: [u8; COMM_LEN],
    /// AF_UNIX path, truncated.
    pub name: [u8; EVENT_NAME_LEN],
}

pub const HOOK_FILE_OPEN: u32 = 1;
pub const HOOK_BPRM_CHECK: u32 = 2;
pub const HOOK_INODE_CREATE: u32 = 3;
pub const HOOK_INODE_MKDIR: u32 = 4;
pub const HOOK_INODE_UNLINK: u32 = 5;
pub const HOOK_INODE_RENAME: u32 = 6;
pub const HOOK_SOCKET_CREATE: u32 = 16;
pub const HOOK_SOCKET_BIND: u32 = 17;
pub const HOOK_SOCKET_CONNECT: u32 = 18;
pub const HOOK_SOCKET_LISTEN: u32 = 19;
pub const HOOK_SOCKET_ACCEPT: u32 = 20;
pub const HOOK_SOCKET_SENDMSG: u32 = 21;

pub fn hook_name(hook: u32) -> &'static str {
    match hook {
        HOOK_FILE_OPEN => "file_open",
        HOOK_BPRM_CHECK => "bprm_check_security",
        HOOK_INODE_CREATE => "inode_create",
        HOOK_INODE_MKDIR => "inode_mkdir",
        HOOK_INODE_UNLINK => "inode_unlink",
        HOOK_INODE_RENAME => "inode_rename",
        HOOK_SOCKET_CREATE => "socket_create",
        HOOK_SOCKET_BIND => "socket_bind",
        HOOK_SOCKET_CONNECT => "socket_connect",
        HOOK_SOCKET_LISTEN => "socket_listen",
        HOOK_SOCKET_ACCEPT => "socket_accept",
        HOOK_SOCKET_SENDMSG => "socket_sendmsg",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, size_of};

    #[test]
    fn policy_key_size() {
        assert_eq!(size_of::<PolicyKey>(), 24);
        assert_eq!(size_of::<PolicyValue>(), 8);
    }

    #[test]
    fn basename_policy_size() {
        assert_eq!(size_of::<BasenameTokenEntry>(), 36);
        assert_eq!(size_of::<BasenameRuleEntry>(), 224);
        assert_eq!(size_of::<BasenamePolicy>(), 4 + 8 * 224);
    }

    #[test]
    fn net_key_sizes() {
        assert_eq!(size_of::<NetCreateKey>(), 16);
        assert_eq!(size_of::<NetTupleKey>(), 32);
        assert_eq!(size_of::<NetUnixKey>(), 128);
        assert_eq!(align_of::<NetUnixKey>(), 8);
    }

    #[test]
    fn event_sizes() {
        assert_eq!(size_of::<FsDenyEvent>(), 120);
        assert_eq!(size_of::<NetDenyEvent>(), 128);
    }

    #[test]
    fn map_specs_cover_every_pinned_map() {
        let names = MAP_SPECS.map(|spec| spec.name);
        assert_eq!(
            names,
            [
                POLICY_MAP,
                DIR_POLICY_MAP,
                BASENAME_POLICY_MAP,
                NET_CREATE_MAP,
                NET_TUPLE_MAP,
                NET_UNIX_MAP
            ]
        );
    }

    #[test]
    fn hook_names() {
        assert_eq!(hook_name(HOOK_FILE_OPEN), "file_open");
        assert_eq!(hook_name(HOOK_SOCKET_CONNECT), "socket_connect");
        assert_eq!(hook_name(999), "unknown");
    }
}
