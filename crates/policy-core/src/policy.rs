use crate::error::{PolicyError, Result};
use crate::raw::{RawPolicy, known_profiles};
use crate::rules::{
    NetAccess, NetRule, NetRules, PathRule, PathRules, SocketFamily, SocketType, SyscallRules,
    UnixRule, UnixRules,
};
use crate::syscalls::SyscallProfile;
use crate::validation::{ValidationError, ValidationReport, ValidationWarning};
use indexmap::set::IndexSet;
use protecc::{
    CompileConfig, CompiledProfile, MountRule, NetFamily, NetProtocol, Permission, ProfileBuilder,
    RuleAction,
};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::OnceLock;

/// Widest port range expanded when importing protecc net rules.
const MAX_PORT_SPAN: u32 = 256;

#[derive(Debug, Clone)]
pub struct Policy {
    profiles: Vec<SyscallProfile>,
    paths: PathRules,
    net: NetRules,
    unix: UnixRules,
    syscalls: SyscallRules,
    mounts: Vec<MountRule>,
    matcher: OnceLock<Option<CompiledProfile>>,
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy {
    /// Empty policy carrying only the `minimal` syscall profile.
    pub fn new() -> Self {
        Self {
            profiles: vec![SyscallProfile::Minimal],
            paths: PathRules::default(),
            net: NetRules::default(),
            unix: UnixRules::default(),
            syscalls: SyscallRules::default(),
            mounts: Vec::new(),
            matcher: OnceLock::new(),
        }
    }

    /// Builds a policy from comma separated profile tags such as
    /// `"build,network"`. Unknown tags are logged and skipped.
    pub fn from_profiles(tags: &str) -> Self {
        let (profiles, unknown) = known_profiles(tags);
        for tag in unknown {
            log::warn!(target: "containerv", "ignoring unknown policy profile '{tag}'");
        }
        Self {
            profiles,
            ..Self::new()
        }
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(PolicyError::from)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Converts a compiled protecc profile into policy rules. Only `allow`
    /// net rules translate; deny and audit rules are skipped.
    pub fn from_profile(profile: &CompiledProfile) -> Result<Self> {
        let mut policy = Self::new();
        for rule in profile.patterns() {
            policy.add_path(rule.pattern.clone(), rule.perms)?;
        }
        for rule in profile.net_rules() {
            if rule.action != RuleAction::Allow {
                log::debug!(target: "containerv", "skipping {:?} net rule", rule.action);
                continue;
            }
            if rule.is_unix() || rule.family == NetFamily::Unix {
                let path = rule.unix_path.as_deref().ok_or_else(|| {
                    PolicyError::Unsupported("unix net rule without a path".into())
                })?;
                let sock_type = match rule.protocol {
                    NetProtocol::Tcp => SocketType::Stream,
                    NetProtocol::Udp => SocketType::Dgram,
                    NetProtocol::Any | NetProtocol::Unix => SocketType::Any,
                };
                policy.add_unix(UnixRule::new(path, sock_type, NetAccess::all()))?;
                continue;
            }
            for translated in translate_ip_rule(rule)? {
                policy.add_net(translated)?;
            }
        }
        policy.mounts = profile.mount_rules().to_vec();
        Ok(policy)
    }

    pub fn add_path(&mut self, pattern: impl Into<String>, access: Permission) -> Result<&mut Self> {
        let pattern = pattern.into();
        if access.is_empty() {
            return Err(PolicyError::InvalidRule(format!(
                "path rule '{pattern}' grants no access"
            )));
        }
        protecc::pattern::parse(&pattern)?;
        self.paths.insert_raw(pattern, access);
        self.matcher = OnceLock::new();
        Ok(self)
    }

    pub fn add_net(&mut self, rule: NetRule) -> Result<&mut Self> {
        rule.check().map_err(PolicyError::InvalidRule)?;
        self.net.insert_raw(rule);
        Ok(self)
    }

    pub fn add_unix(&mut self, rule: UnixRule) -> Result<&mut Self> {
        rule.check().map_err(PolicyError::InvalidRule)?;
        self.unix.insert_raw(rule);
        Ok(self)
    }

    pub fn add_mount(&mut self, rule: MountRule) -> Result<&mut Self> {
        rule.validate()?;
        self.mounts.push(rule);
        Ok(self)
    }

    pub fn extend_syscalls<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.syscalls.extend(iter);
    }

    pub fn merge(&mut self, other: Policy) {
        let Policy {
            profiles,
            paths,
            net,
            unix,
            syscalls,
            mounts,
            matcher: _,
        } = other;
        for profile in profiles {
            if !self.profiles.contains(&profile) {
                self.profiles.push(profile);
            }
        }
        self.paths.merge(paths);
        self.net.merge(net);
        self.unix.merge(unix);
        self.syscalls.merge(syscalls);
        self.mounts.extend(mounts);
        self.matcher = OnceLock::new();
    }

    pub fn profiles(&self) -> &[SyscallProfile] {
        &self.profiles
    }

    pub fn path_rules(&self) -> impl Iterator<Item = PathRule> + '_ {
        self.paths.iter()
    }

    pub fn net_rules(&self) -> impl Iterator<Item = &NetRule> {
        self.net.iter()
    }

    pub fn unix_rules(&self) -> impl Iterator<Item = &UnixRule> {
        self.unix.iter()
    }

    pub fn mount_rules(&self) -> &[MountRule] {
        &self.mounts
    }

    /// Union of the profile lists and explicitly allowed syscalls, in
    /// first-seen order.
    pub fn syscalls(&self) -> Vec<&str> {
        let mut all: IndexSet<&str> = self
            .profiles
            .iter()
            .flat_map(|profile| profile.syscalls().iter().copied())
            .collect();
        all.extend(self.syscalls.iter().map(String::as_str));
        all.into_iter().collect()
    }

    pub fn has_rules(&self) -> bool {
        self.paths.len() + self.net.len() + self.unix.len() > 0
    }

    /// Compiles the path rules into a protecc profile.
    pub fn compile_paths(&self, config: &CompileConfig) -> Result<Option<CompiledProfile>> {
        if self.paths.len() == 0 {
            return Ok(None);
        }
        let mut builder = ProfileBuilder::new();
        for rule in self.paths.iter() {
            builder.add_pattern(&rule.pattern, rule.access)?;
        }
        Ok(Some(builder.compile(config)?))
    }

    /// Answers whether `path` is granted every bit of `required` by the
    /// deepest matching path rule.
    pub fn check_path(&self, path: &str, required: Permission) -> Result<bool> {
        if let Some(compiled) = self.matcher.get() {
            return Ok(compiled
                .as_ref()
                .is_some_and(|profile| profile.check(path, required)));
        }
        let compiled = self.compile_paths(&CompileConfig::default())?;
        let granted = compiled
            .as_ref()
            .is_some_and(|profile| profile.check(path, required));
        let _ = self.matcher.set(compiled);
        Ok(granted)
    }

    pub fn validate(&self) -> ValidationReport {
        use ValidationError::*;
        use ValidationWarning::*;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Some(dup) = self.paths.first_duplicate() {
            errors.push(DuplicatePath(dup.clone()));
        }
        if let Some(dup) = self.net.first_duplicate() {
            errors.push(DuplicateNet(dup.to_string()));
        }
        if let Some(dup) = self.unix.first_duplicate() {
            errors.push(DuplicateUnix(dup.path.clone()));
        }
        if let Some(dup) = self.syscalls.first_duplicate() {
            errors.push(DuplicateSyscall(dup.clone()));
        }

        for rule in self.net.iter() {
            if rule.access.is_empty() {
                warnings.push(EmptyNetAccess(rule.to_string()));
            } else if rule.address_unused() {
                warnings.push(UnusedNetAddress(rule.to_string()));
            }
        }
        for rule in self.unix.iter() {
            if rule.access.is_empty() {
                warnings.push(EmptyUnixAccess(rule.path.clone()));
            }
        }
        for name in self.syscalls.iter() {
            if self
                .profiles
                .iter()
                .any(|profile| profile.syscalls().contains(&name.as_str()))
            {
                warnings.push(RedundantSyscall(name.clone()));
            }
        }

        ValidationReport { errors, warnings }
    }
}

fn translate_ip_rule(rule: &protecc::NetRule) -> Result<Vec<NetRule>> {
    let family = match rule.family {
        NetFamily::Any => SocketFamily::Any,
        NetFamily::Ipv4 => SocketFamily::Ipv4,
        NetFamily::Ipv6 => SocketFamily::Ipv6,
        NetFamily::Unix => {
            return Err(PolicyError::Unsupported(
                "unix family rule without a unix path".into(),
            ));
        }
    };
    let (sock_type, protocol) = match rule.protocol {
        NetProtocol::Tcp => (SocketType::Stream, libc_proto::TCP),
        NetProtocol::Udp => (SocketType::Dgram, libc_proto::UDP),
        NetProtocol::Any | NetProtocol::Unix => (SocketType::Any, 0),
    };
    let addr = match rule.ip_pattern.as_deref() {
        None | Some("*") => None,
        Some(text) => Some(text.parse::<IpAddr>().map_err(|_| {
            PolicyError::Unsupported(format!("address pattern '{text}' is not a literal address"))
        })?),
    };

    let span = u32::from(rule.port_to) - u32::from(rule.port_from) + 1;
    let ports: Vec<u16> = if rule.port_from == 0 && rule.port_to == 0 {
        vec![0]
    } else if span > MAX_PORT_SPAN {
        return Err(PolicyError::Unsupported(format!(
            "port range {}-{} is too wide",
            rule.port_from, rule.port_to
        )));
    } else {
        (rule.port_from..=rule.port_to).collect()
    };

    Ok(ports
        .into_iter()
        .map(|port| NetRule {
            family,
            sock_type,
            protocol,
            port,
            addr,
            access: NetAccess::all(),
        })
        .collect())
}

mod libc_proto {
    pub const TCP: u16 = 6;
    pub const UDP: u16 = 17;
}

impl<'de> Deserialize<'de> for Policy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let raw = RawPolicy::deserialize(deserializer)?;
        Policy::try_from(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protecc::CompileMode;
    use std::net::Ipv4Addr;

    const VALID: &str = r#"
profiles = ["build"]

[[paths]]
pattern = "/usr/bin/*"
access = ["read", "exec"]

[[paths]]
pattern = "/var/log/**"
access = ["read"]

[[net]]
family = "ipv4"
type = "stream"
port = 443
addr = "10.0.0.1"
access = ["create", "connect"]

[[unix]]
path = "/var/run/app.sock"
type = "stream"
access = ["connect"]

[syscalls]
allow = ["ptrace"]
"#;

    #[test]
    fn parse_and_validate() {
        let policy = Policy::from_toml_str(VALID).unwrap();
        let report = policy.validate();
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(
            policy.profiles(),
            &[SyscallProfile::Minimal, SyscallProfile::Build]
        );
        assert_eq!(policy.path_rules().count(), 2);
        let net: Vec<_> = policy.net_rules().collect();
        assert_eq!(net.len(), 1);
        assert_eq!(net[0].port, 443);
        assert_eq!(net[0].addr, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(net[0].access, NetAccess::CREATE | NetAccess::CONNECT);
        assert!(policy.unix_rules().any(|rule| rule.path == "/var/run/app.sock"));
        let syscalls = policy.syscalls();
        assert!(syscalls.contains(&"ptrace"));
        assert!(syscalls.contains(&"clone3"));
        assert!(!syscalls.contains(&"socket"));
    }

    #[test]
    fn unknown_access_is_rejected() {
        let text = r#"
[[paths]]
pattern = "/etc/*"
access = ["read", "delete"]
"#;
        assert!(Policy::from_toml_str(text).is_err());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = Policy::new().add_path("/etc/[abc", Permission::READ).unwrap_err();
        assert_eq!(err.kind(), protecc::ErrorKind::InvalidPattern);
    }

    #[test]
    fn unknown_profiles_are_ignored() {
        let policy = Policy::from_profiles("network,desktop");
        assert_eq!(
            policy.profiles(),
            &[SyscallProfile::Minimal, SyscallProfile::Network]
        );
        assert!(policy.syscalls().contains(&"connect"));
    }

    #[test]
    fn duplicates_and_noops_are_reported() {
        let text = r#"
[[paths]]
pattern = "/etc/*"
access = ["read"]

[[paths]]
pattern = "/etc/*"
access = ["write"]

[[net]]
family = "ipv4"
port = 80
access = ["create"]

[syscalls]
allow = ["read", "ptrace", "ptrace"]
"#;
        let policy = Policy::from_toml_str(text).unwrap();
        let report = policy.validate();
        assert!(matches!(
            &report.errors[0],
            ValidationError::DuplicatePath(dup) if dup == "/etc/*"
        ));
        assert!(matches!(
            &report.errors[1],
            ValidationError::DuplicateSyscall(dup) if dup == "ptrace"
        ));
        assert!(
            report
                .warnings
                .iter()
                .any(|w| matches!(w, ValidationWarning::UnusedNetAddress(_)))
        );
        assert!(
            report
                .warnings
                .iter()
                .any(|w| matches!(w, ValidationWarning::RedundantSyscall(name) if name == "read"))
        );
        assert!(
            policy
                .check_path("/etc/hosts", Permission::READ | Permission::WRITE)
                .unwrap()
        );
    }

    #[test]
    fn check_path_uses_deepest_rule() {
        let mut policy = Policy::new();
        policy.add_path("/etc/*.conf", Permission::READ).unwrap();
        policy
            .add_path("/etc/app.conf", Permission::READ | Permission::WRITE)
            .unwrap();
        assert!(policy.check_path("/etc/app.conf", Permission::WRITE).unwrap());
        assert!(!policy.check_path("/etc/other.conf", Permission::WRITE).unwrap());
        assert!(policy.check_path("/etc/other.conf", Permission::READ).unwrap());

        policy.add_path("/etc/other.conf", Permission::WRITE).unwrap();
        assert!(policy.check_path("/etc/other.conf", Permission::WRITE).unwrap());
    }

    #[test]
    fn empty_policy_grants_nothing() {
        let policy = Policy::new();
        assert!(!policy.has_rules());
        assert!(!policy.check_path("/", Permission::READ).unwrap());
    }

    #[test]
    fn merge_unions_everything() {
        let mut base = Policy::from_profiles("build");
        base.add_path("/usr/**", Permission::READ).unwrap();
        let mut extra = Policy::from_profiles("network");
        extra.add_path("/tmp/**", Permission::WRITE).unwrap();
        extra
            .add_unix(UnixRule::new("/run/a.sock", SocketType::Dgram, NetAccess::SEND))
            .unwrap();
        base.merge(extra);
        assert_eq!(base.profiles().len(), 3);
        assert_eq!(base.path_rules().count(), 2);
        assert_eq!(base.unix_rules().count(), 1);
        assert!(base.check_path("/tmp/x", Permission::WRITE).unwrap());
        assert!(base.validate().errors.is_empty());
    }

    #[test]
    fn from_compiled_profile() {
        let mut builder = ProfileBuilder::new();
        builder
            .add_pattern("/usr/bin/*", Permission::READ | Permission::EXEC)
            .unwrap();
        builder
            .add_net_rule(
                &protecc::NetRule::new(RuleAction::Allow, NetProtocol::Tcp, NetFamily::Ipv4)
                    .with_ports(8000, 8002)
                    .with_ip("127.0.0.1"),
            )
            .unwrap();
        builder
            .add_net_rule(
                &protecc::NetRule::new(RuleAction::Allow, NetProtocol::Unix, NetFamily::Any)
                    .with_unix_path("/var/run/app.sock"),
            )
            .unwrap();
        builder
            .add_net_rule(&protecc::NetRule::new(
                RuleAction::Deny,
                NetProtocol::Any,
                NetFamily::Any,
            ))
            .unwrap();
        let compiled = builder
            .compile(&CompileConfig {
                mode: CompileMode::Dfa,
                ..CompileConfig::default()
            })
            .unwrap();

        let policy = Policy::from_profile(&compiled).unwrap();
        assert!(policy.check_path("/usr/bin/ls", Permission::EXEC).unwrap());
        let ports: Vec<u16> = policy.net_rules().map(|rule| rule.port).collect();
        assert_eq!(ports, vec![8000, 8001, 8002]);
        assert!(policy.net_rules().all(|rule| rule.protocol == 6));
        let unix: Vec<_> = policy.unix_rules().collect();
        assert_eq!(unix.len(), 1);
        assert_eq!(unix[0].path, "/var/run/app.sock");
    }

    #[test]
    fn wide_port_ranges_are_unsupported() {
        let mut builder = ProfileBuilder::new();
        builder
            .add_net_rule(
                &protecc::NetRule::new(RuleAction::Allow, NetProtocol::Tcp, NetFamily::Ipv4)
                    .with_ports(1, 65535),
            )
            .unwrap();
        let compiled = builder.compile(&CompileConfig::default()).unwrap();
        let err = Policy::from_profile(&compiled).unwrap_err();
        assert_eq!(err.kind(), protecc::ErrorKind::NotSupported);
    }
}
