use bitflags::bitflags;
use indexmap::map::IndexMap;
use indexmap::set::IndexSet;
use protecc::Permission;
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;

bitflags! {
    /// Socket operations a network rule allows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NetAccess: u32 {
        const CREATE = 1;
        const BIND = 1 << 1;
        const CONNECT = 1 << 2;
        const LISTEN = 1 << 3;
        const ACCEPT = 1 << 4;
        const SEND = 1 << 5;
    }
}

impl NetAccess {
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "create" => Some(Self::CREATE),
            "bind" => Some(Self::BIND),
            "connect" => Some(Self::CONNECT),
            "listen" => Some(Self::LISTEN),
            "accept" => Some(Self::ACCEPT),
            "send" => Some(Self::SEND),
            "all" => Some(Self::all()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SocketFamily {
    /// Expands to both IP families at enforcement time.
    Any,
    #[serde(alias = "inet")]
    Ipv4,
    #[serde(alias = "inet6")]
    Ipv6,
    Unix,
}

impl SocketFamily {
    /// `AF_*` value; zero for [`SocketFamily::Any`].
    pub fn af(self) -> u16 {
        match self {
            Self::Any => 0,
            Self::Unix => 1,
            Self::Ipv4 => 2,
            Self::Ipv6 => 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    #[default]
    Any,
    Stream,
    Dgram,
    Raw,
    Seqpacket,
}

impl SocketType {
    /// `SOCK_*` value; zero matches every type.
    pub fn raw(self) -> u16 {
        match self {
            Self::Any => 0,
            Self::Stream => 1,
            Self::Dgram => 2,
            Self::Raw => 3,
            Self::Seqpacket => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathRule {
    pub pattern: String,
    pub access: Permission,
}

/// Allows socket operations on IP sockets matching the tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetRule {
    pub family: SocketFamily,
    pub sock_type: SocketType,
    pub protocol: u16,
    /// Zero means any port.
    pub port: u16,
    pub addr: Option<IpAddr>,
    pub access: NetAccess,
}

impl NetRule {
    pub fn new(family: SocketFamily, sock_type: SocketType, access: NetAccess) -> Self {
        Self {
            family,
            sock_type,
            protocol: 0,
            port: 0,
            addr: None,
            access,
        }
    }

    pub fn with_protocol(mut self, protocol: u16) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_addr(mut self, addr: IpAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if self.family == SocketFamily::Unix {
            return Err(format!("{self}: AF_UNIX sockets belong in [[unix]] rules"));
        }
        match (self.family, self.addr) {
            (SocketFamily::Ipv4, Some(IpAddr::V6(_))) | (SocketFamily::Ipv6, Some(IpAddr::V4(_))) => {
                Err(format!("{self}: address does not match the family"))
            }
            _ => Ok(()),
        }
    }

    /// True when the rule carries address fields but only allows creation.
    pub(crate) fn address_unused(&self) -> bool {
        self.access == NetAccess::CREATE && (self.port != 0 || self.addr.is_some())
    }
}

impl fmt::Display for NetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{} port {}",
            self.family, self.sock_type, self.protocol, self.port
        )?;
        if let Some(addr) = self.addr {
            write!(f, " addr {addr}")?;
        }
        Ok(())
    }
}

/// Allows socket operations on AF_UNIX sockets bound to `path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnixRule {
    pub path: String,
    pub is_abstract: bool,
    pub sock_type: SocketType,
    pub protocol: u16,
    pub access: NetAccess,
}

impl UnixRule {
    pub fn new(path: impl Into<String>, sock_type: SocketType, access: NetAccess) -> Self {
        Self {
            path: path.into(),
            is_abstract: false,
            sock_type,
            protocol: 0,
            access,
        }
    }

    pub fn abstract_socket(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err("unix rule with an empty path".into());
        }
        if self.path.contains('\0') {
            return Err(format!("unix path {:?} contains NUL", self.path));
        }
        if self.path.len() >= crate::UNIX_PATH_MAX {
            return Err(format!("unix path {:?} is too long", self.path));
        }
        if !self.is_abstract && !self.path.starts_with('/') {
            return Err(format!("unix path {:?} must be absolute", self.path));
        }
        Ok(())
    }
}

/// Path patterns keyed by pattern text. Re-adding a pattern ORs the access
/// and records the first duplicate for validation.
#[derive(Debug, Clone, Default)]
pub(crate) struct PathRules {
    rules: IndexMap<String, Permission>,
    duplicate: Option<String>,
}

impl PathRules {
    pub(crate) fn insert_raw(&mut self, pattern: String, access: Permission) {
        match self.rules.get_mut(&pattern) {
            Some(existing) => {
                *existing |= access;
                if self.duplicate.is_none() {
                    self.duplicate = Some(pattern);
                }
            }
            None => {
                self.rules.insert(pattern, access);
            }
        }
    }

    pub(crate) fn merge(&mut self, other: PathRules) {
        let PathRules { rules, duplicate } = other;
        for (pattern, access) in rules {
            self.insert_raw(pattern, access);
        }
        if self.duplicate.is_none() {
            self.duplicate = duplicate;
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = PathRule> + '_ {
        self.rules.iter().map(|(pattern, access)| PathRule {
            pattern: pattern.clone(),
            access: *access,
        })
    }

    pub(crate) fn first_duplicate(&self) -> Option<&String> {
        self.duplicate.as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }
}

macro_rules! define_duplicate_rules {
    ($name:ident, $value_ty:ty, $field:ident) => {
        #[derive(Debug, Clone)]
        pub(crate) struct $name {
            $field: IndexSet<$value_ty>,
            duplicate: Option<$value_ty>,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $field: IndexSet::new(),
                    duplicate: None,
                }
            }
        }

        impl $name {
            pub(crate) fn insert_raw(&mut self, value: $value_ty) {
                let (index, inserted) = self.$field.insert_full(value);
                if !inserted
                    && self.duplicate.is_none()
                    && let Some(existing) = self.$field.get_index(index)
                {
                    self.duplicate = Some(existing.clone());
                }
            }

            pub(crate) fn extend<I>(&mut self, iter: I)
            where
                I: IntoIterator<Item = $value_ty>,
            {
                for value in iter {
                    self.insert_raw(value);
                }
            }

            pub(crate) fn merge(&mut self, other: $name) {
                let $name { $field, duplicate } = other;

                for value in $field {
                    self.insert_raw(value);
                }
                if self.duplicate.is_none() {
                    self.duplicate = duplicate;
                }
            }

            pub(crate) fn iter(&self) -> impl Iterator<Item = &$value_ty> {
                self.$field.iter()
            }

            pub(crate) fn contains(&self, value: &$value_ty) -> bool {
                self.$field.contains(value)
            }

            pub(crate) fn first_duplicate(&self) -> Option<&$value_ty> {
                self.duplicate.as_ref()
            }

            pub(crate) fn len(&self) -> usize {
                self.$field.len()
            }
        }
    };
}

define_duplicate_rules!(NetRules, NetRule, rules);
define_duplicate_rules!(UnixRules, UnixRule, rules);
define_duplicate_rules!(SyscallRules, String, names);

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn path_duplicates_or_access() {
        let mut rules = PathRules::default();
        rules.insert_raw("/etc/*".into(), Permission::READ);
        rules.insert_raw("/etc/*".into(), Permission::WRITE);
        let all: Vec<_> = rules.iter().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].access, Permission::READ | Permission::WRITE);
        assert_eq!(rules.first_duplicate().map(String::as_str), Some("/etc/*"));
    }

    #[test]
    fn net_rule_family_mismatch_rejected() {
        let rule = NetRule::new(SocketFamily::Ipv6, SocketType::Stream, NetAccess::CONNECT)
            .with_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(rule.check().is_err());
        let rule = NetRule::new(SocketFamily::Unix, SocketType::Stream, NetAccess::CONNECT);
        assert!(rule.check().is_err());
    }

    #[test]
    fn create_only_rule_with_port_is_flagged() {
        let rule =
            NetRule::new(SocketFamily::Ipv4, SocketType::Stream, NetAccess::CREATE).with_port(80);
        assert!(rule.address_unused());
        let rule = rule.access_with(NetAccess::CONNECT);
        assert!(!rule.address_unused());
    }

    #[test]
    fn unix_rule_checks() {
        assert!(UnixRule::new("/run/app.sock", SocketType::Stream, NetAccess::CONNECT)
            .check()
            .is_ok());
        assert!(UnixRule::new("relative.sock", SocketType::Stream, NetAccess::CONNECT)
            .check()
            .is_err());
        assert!(UnixRule::new("dbus", SocketType::Stream, NetAccess::CONNECT)
            .abstract_socket()
            .check()
            .is_ok());
        let long = format!("/{}", "a".repeat(120));
        assert!(UnixRule::new(long, SocketType::Stream, NetAccess::CONNECT)
            .check()
            .is_err());
    }

    #[test]
    fn net_access_names() {
        assert_eq!(NetAccess::parse_name("connect"), Some(NetAccess::CONNECT));
        assert_eq!(NetAccess::parse_name("all"), Some(NetAccess::all()));
        assert_eq!(NetAccess::parse_name("shout"), None);
    }

    impl NetRule {
        fn access_with(mut self, extra: NetAccess) -> Self {
            self.access |= extra;
            self
        }
    }
}
