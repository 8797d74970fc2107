use crate::error::{Error, Result};

/// What the enforcement layer does with a matching rule.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RuleAction {
    #[default]
    Allow = 0,
    Deny = 1,
    Audit = 2,
}

impl RuleAction {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Allow),
            1 => Some(Self::Deny),
            2 => Some(Self::Audit),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetProtocol {
    #[default]
    Any = 0,
    Tcp = 1,
    Udp = 2,
    Unix = 3,
}

impl NetProtocol {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Any),
            1 => Some(Self::Tcp),
            2 => Some(Self::Udp),
            3 => Some(Self::Unix),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetFamily {
    #[default]
    Any = 0,
    Ipv4 = 1,
    Ipv6 = 2,
    Unix = 3,
}

impl NetFamily {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Any),
            1 => Some(Self::Ipv4),
            2 => Some(Self::Ipv6),
            3 => Some(Self::Unix),
            _ => None,
        }
    }

    fn is_ip(self) -> bool {
        matches!(self, Self::Ipv4 | Self::Ipv6)
    }
}

/// Network rule. `ip_pattern` and `unix_path` are globs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NetRule {
    pub action: RuleAction,
    pub protocol: NetProtocol,
    pub family: NetFamily,
    pub port_from: u16,
    pub port_to: u16,
    pub ip_pattern: Option<String>,
    pub unix_path: Option<String>,
}

impl NetRule {
    pub fn new(action: RuleAction, protocol: NetProtocol, family: NetFamily) -> Self {
        Self {
            action,
            protocol,
            family,
            ..Self::default()
        }
    }

    pub fn with_ports(mut self, from: u16, to: u16) -> Self {
        self.port_from = from;
        self.port_to = to;
        self
    }

    pub fn with_ip(mut self, pattern: impl Into<String>) -> Self {
        self.ip_pattern = Some(pattern.into());
        self
    }

    pub fn with_unix_path(mut self, path: impl Into<String>) -> Self {
        self.unix_path = Some(path.into());
        self
    }

    pub fn is_unix(&self) -> bool {
        self.protocol == NetProtocol::Unix || self.family == NetFamily::Unix
    }

    /// Checks field ranges and cross-field constraints, returning the first
    /// violated one.
    pub(crate) fn check(&self) -> std::result::Result<(), &'static str> {
        if self.port_from > self.port_to {
            return Err("port_from is greater than port_to");
        }
        if self.protocol == NetProtocol::Unix {
            if self.family.is_ip() {
                return Err("unix protocol cannot use an IPv4/IPv6 family");
            }
            if self.port_from != 0 || self.port_to != 0 {
                return Err("unix protocol rules must use ports 0..0");
            }
        }
        if self.family == NetFamily::Unix
            && matches!(self.protocol, NetProtocol::Tcp | NetProtocol::Udp)
        {
            return Err("unix family cannot use TCP/UDP");
        }
        if self.ip_pattern.is_some() && self.is_unix() {
            return Err("unix rules cannot carry an IP pattern");
        }
        if self.unix_path.is_some()
            && (self.family.is_ip() || matches!(self.protocol, NetProtocol::Tcp | NetProtocol::Udp))
        {
            return Err("AF_UNIX path requires a unix or unspecified family and protocol");
        }
        for value in [&self.ip_pattern, &self.unix_path].into_iter().flatten() {
            if value.is_empty() {
                return Err("rule strings must not be empty");
            }
            if value.contains('\0') {
                return Err("rule strings must not contain NUL");
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.check().map_err(|reason| Error::InvalidArgument(reason.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn unix_socket_rule_is_valid() {
        let rule = NetRule::new(RuleAction::Allow, NetProtocol::Unix, NetFamily::Any)
            .with_unix_path("/var/run/app.sock");
        rule.validate().unwrap();
    }

    #[test]
    fn unix_protocol_rejects_ip_family() {
        let rule = NetRule::new(RuleAction::Allow, NetProtocol::Unix, NetFamily::Ipv4)
            .with_unix_path("/var/run/app.sock");
        assert_eq!(rule.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn unix_protocol_rejects_ports() {
        let rule =
            NetRule::new(RuleAction::Allow, NetProtocol::Unix, NetFamily::Unix).with_ports(1, 2);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn unix_family_rejects_tcp() {
        let rule = NetRule::new(RuleAction::Deny, NetProtocol::Tcp, NetFamily::Unix);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn reversed_ports_are_rejected() {
        let rule =
            NetRule::new(RuleAction::Allow, NetProtocol::Tcp, NetFamily::Ipv4).with_ports(443, 80);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn tcp_rule_with_ip_glob() {
        let rule = NetRule::new(RuleAction::Audit, NetProtocol::Tcp, NetFamily::Ipv6)
            .with_ports(80, 443)
            .with_ip("fe80::*");
        rule.validate().unwrap();
    }
}
