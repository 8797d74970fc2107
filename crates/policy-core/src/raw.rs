use crate::error::PolicyError;
use crate::policy::Policy;
use crate::rules::{NetAccess, NetRule, SocketFamily, SocketType, UnixRule};
use crate::syscalls::SyscallProfile;
use protecc::Permission;
use serde::Deserialize;
use std::net::IpAddr;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawPolicy {
    #[serde(default)]
    pub(crate) profiles: Vec<String>,
    #[serde(default)]
    pub(crate) paths: Vec<RawPathRule>,
    #[serde(default)]
    pub(crate) net: Vec<RawNetRule>,
    #[serde(default)]
    pub(crate) unix: Vec<RawUnixRule>,
    #[serde(default)]
    pub(crate) syscalls: RawSyscallSection,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawPathRule {
    pub(crate) pattern: String,
    pub(crate) access: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawNetRule {
    pub(crate) family: SocketFamily,
    #[serde(default, rename = "type")]
    pub(crate) sock_type: SocketType,
    #[serde(default)]
    pub(crate) protocol: u16,
    #[serde(default)]
    pub(crate) port: u16,
    #[serde(default)]
    pub(crate) addr: Option<IpAddr>,
    pub(crate) access: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawUnixRule {
    pub(crate) path: String,
    #[serde(default, rename = "abstract")]
    pub(crate) is_abstract: bool,
    #[serde(default, rename = "type")]
    pub(crate) sock_type: SocketType,
    #[serde(default)]
    pub(crate) protocol: u16,
    pub(crate) access: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawSyscallSection {
    #[serde(default)]
    pub(crate) allow: Vec<String>,
}

fn path_access(names: &[String]) -> Result<Permission, PolicyError> {
    names.iter().try_fold(Permission::NONE, |acc, name| {
        Permission::parse_name(name)
            .map(|bit| acc | bit)
            .ok_or_else(|| PolicyError::InvalidRule(format!("unknown path access '{name}'")))
    })
}

fn net_access(names: &[String]) -> Result<NetAccess, PolicyError> {
    names.iter().try_fold(NetAccess::empty(), |acc, name| {
        NetAccess::parse_name(name)
            .map(|bit| acc | bit)
            .ok_or_else(|| PolicyError::InvalidRule(format!("unknown socket access '{name}'")))
    })
}

impl TryFrom<RawPolicy> for Policy {
    type Error = PolicyError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        let RawPolicy {
            profiles,
            paths,
            net,
            unix,
            syscalls,
        } = raw;

        let mut policy = Policy::from_profiles(&profiles.join(","));

        for rule in paths {
            let access = path_access(&rule.access)?;
            policy.add_path(rule.pattern, access)?;
        }

        for rule in net {
            let mut parsed = NetRule::new(rule.family, rule.sock_type, net_access(&rule.access)?)
                .with_protocol(rule.protocol)
                .with_port(rule.port);
            parsed.addr = rule.addr;
            policy.add_net(parsed)?;
        }

        for rule in unix {
            let mut parsed = UnixRule::new(rule.path, rule.sock_type, net_access(&rule.access)?);
            parsed.is_abstract = rule.is_abstract;
            parsed.protocol = rule.protocol;
            policy.add_unix(parsed)?;
        }

        policy.extend_syscalls(syscalls.allow);
        Ok(policy)
    }
}

pub(crate) fn known_profiles(tags: &str) -> (Vec<SyscallProfile>, Vec<&str>) {
    let mut known = vec![SyscallProfile::Minimal];
    let mut unknown = Vec::new();
    for tag in tags.split(',').map(str::trim).filter(|tag| !tag.is_empty()) {
        match tag.parse::<SyscallProfile>() {
            Ok(profile) if !known.contains(&profile) => known.push(profile),
            Ok(_) => {}
            Err(()) => unknown.push(tag),
        }
    }
    (known, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_names_fold() {
        let names = vec!["read".to_string(), "exec".to_string()];
        assert_eq!(
            path_access(&names).unwrap(),
            Permission::READ | Permission::EXEC
        );
        assert!(path_access(&["fly".to_string()]).is_err());
        assert_eq!(
            net_access(&["create".to_string(), "connect".to_string()]).unwrap(),
            NetAccess::CREATE | NetAccess::CONNECT
        );
    }

    #[test]
    fn profile_tags() {
        let (known, unknown) = known_profiles(" build ,desktop,,network,build");
        assert_eq!(
            known,
            vec![
                SyscallProfile::Minimal,
                SyscallProfile::Build,
                SyscallProfile::Network
            ]
        );
        assert_eq!(unknown, vec!["desktop"]);
    }
}
