use crate::blob::{
    PathBlobView, encode_dfa, encode_mount_rules, encode_net_rules, encode_trie, path_blob_size,
};
use crate::dfa::{DEFAULT_MAX_STATES, Dfa};
use crate::error::{Error, Result};
use crate::mount::MountRule;
use crate::net::NetRule;
use crate::pattern::{Element, parse};
use crate::perms::Permission;
use crate::trie::Trie;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    #[default]
    Trie,
    Dfa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileConfig {
    pub mode: CompileMode,
    pub case_insensitive: bool,
    /// Upper bound on DFA states, including the dead state.
    pub max_states: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            mode: CompileMode::Trie,
            case_insensitive: false,
            max_states: DEFAULT_MAX_STATES,
        }
    }
}

/// A path pattern together with the rights it grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternRule {
    pub pattern: String,
    pub perms: Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileStats {
    pub num_patterns: u32,
    pub num_nodes: u32,
    pub max_depth: u32,
    pub num_states: u32,
    pub binary_size: u32,
    pub num_net_rules: u32,
    pub num_mount_rules: u32,
}

/// Accumulates rules; every `add_*` call copies and validates its input.
#[derive(Debug, Clone, Default)]
pub struct ProfileBuilder {
    patterns: Vec<(PatternRule, Vec<Element>)>,
    net_rules: Vec<NetRule>,
    mount_rules: Vec<MountRule>,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pattern(&mut self, pattern: &str, perms: Permission) -> Result<&mut Self> {
        if perms.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "pattern '{pattern}' grants no permissions"
            )));
        }
        let elements = parse(pattern)?;
        self.patterns.push((
            PatternRule {
                pattern: pattern.to_string(),
                perms,
            },
            elements,
        ));
        Ok(self)
    }

    pub fn add_net_rule(&mut self, rule: &NetRule) -> Result<&mut Self> {
        rule.validate()?;
        self.net_rules.push(rule.clone());
        Ok(self)
    }

    pub fn add_mount_rule(&mut self, rule: &MountRule) -> Result<&mut Self> {
        rule.validate()?;
        self.mount_rules.push(rule.clone());
        Ok(self)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &PatternRule> {
        self.patterns.iter().map(|(rule, _)| rule)
    }

    pub fn net_rules(&self) -> &[NetRule] {
        &self.net_rules
    }

    pub fn mount_rules(&self) -> &[MountRule] {
        &self.mount_rules
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.net_rules.is_empty() && self.mount_rules.is_empty()
    }

    /// Consumes the builder. Compilation is deterministic: equal inputs give
    /// byte-identical blobs.
    pub fn compile(self, config: &CompileConfig) -> Result<CompiledProfile> {
        if self.is_empty() {
            return Err(Error::InvalidArgument("profile has no rules".into()));
        }
        if config.mode == CompileMode::Dfa && config.max_states < 2 {
            return Err(Error::InvalidArgument(format!(
                "max_states {} leaves no room for a start state",
                config.max_states
            )));
        }

        let mut stats = ProfileStats {
            num_net_rules: self.net_rules.len() as u32,
            num_mount_rules: self.mount_rules.len() as u32,
            ..ProfileStats::default()
        };

        let paths = if self.patterns.is_empty() {
            None
        } else {
            let mut trie = Trie::new(config.case_insensitive);
            for (rule, elements) in &self.patterns {
                trie.insert_pattern(elements, rule.perms)?;
            }
            stats.num_patterns = trie.num_patterns();
            stats.num_nodes = trie.nodes().len() as u32;
            stats.max_depth = trie.max_depth();
            let profile = match config.mode {
                CompileMode::Trie => PathProfile::Trie(trie),
                CompileMode::Dfa => {
                    let dfa = Dfa::from_trie(&trie, config.max_states)?;
                    stats.num_states = dfa.num_states();
                    PathProfile::Dfa(dfa)
                }
            };
            stats.binary_size = path_blob_size(&profile)
                .and_then(|size| u32::try_from(size).ok())
                .ok_or_else(|| Error::CompileFailed("path blob exceeds 4 GiB".into()))?;
            Some(profile)
        };

        log::debug!(
            target: "protecc",
            "compiled {} patterns, {} net rules, {} mount rules ({:?})",
            stats.num_patterns,
            stats.num_net_rules,
            stats.num_mount_rules,
            config.mode
        );

        Ok(CompiledProfile {
            paths,
            patterns: self.patterns.into_iter().map(|(rule, _)| rule).collect(),
            net_rules: self.net_rules,
            mount_rules: self.mount_rules,
            stats,
        })
    }
}

/// Compiled path matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathProfile {
    Trie(Trie),
    Dfa(Dfa),
}

impl PathProfile {
    pub fn lookup(&self, path: &[u8]) -> Permission {
        match self {
            Self::Trie(trie) => trie.lookup(path),
            Self::Dfa(dfa) => dfa.lookup(path),
        }
    }

    /// True when the deepest matching pattern grants every bit of `required`.
    pub fn check(&self, path: &[u8], required: Permission) -> bool {
        let granted = self.lookup(path);
        !granted.is_empty() && granted.contains(required)
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        match self {
            Self::Trie(trie) => encode_trie(trie),
            Self::Dfa(dfa) => encode_dfa(dfa),
        }
    }

    pub fn from_blob(bytes: &[u8]) -> Result<Self> {
        Ok(PathBlobView::new(bytes)?.to_profile())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProfile {
    paths: Option<PathProfile>,
    patterns: Vec<PatternRule>,
    net_rules: Vec<NetRule>,
    mount_rules: Vec<MountRule>,
    stats: ProfileStats,
}

impl CompiledProfile {
    pub fn paths(&self) -> Option<&PathProfile> {
        self.paths.as_ref()
    }

    pub fn patterns(&self) -> &[PatternRule] {
        &self.patterns
    }

    pub fn net_rules(&self) -> &[NetRule] {
        &self.net_rules
    }

    pub fn mount_rules(&self) -> &[MountRule] {
        &self.mount_rules
    }

    pub fn stats(&self) -> ProfileStats {
        self.stats
    }

    pub fn lookup(&self, path: &str) -> Permission {
        self.paths
            .as_ref()
            .map_or(Permission::NONE, |paths| paths.lookup(path.as_bytes()))
    }

    pub fn check(&self, path: &str, required: Permission) -> bool {
        self.paths
            .as_ref()
            .is_some_and(|paths| paths.check(path.as_bytes(), required))
    }

    pub fn export_path_blob(&self) -> Result<Vec<u8>> {
        self.paths
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("profile has no path patterns".into()))?
            .to_blob()
    }

    pub fn export_net_blob(&self) -> Result<Vec<u8>> {
        encode_net_rules(&self.net_rules)
    }

    pub fn export_mount_blob(&self) -> Result<Vec<u8>> {
        encode_mount_rules(&self.mount_rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::net::{NetFamily, NetProtocol, RuleAction};

    #[test]
    fn empty_builder_is_rejected() {
        let err = ProfileBuilder::new()
            .compile(&CompileConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn add_pattern_reports_bad_input() {
        let mut builder = ProfileBuilder::new();
        assert_eq!(
            builder.add_pattern("/a/[b", Permission::READ).unwrap_err().kind(),
            ErrorKind::InvalidPattern
        );
        assert_eq!(
            builder.add_pattern("/a", Permission::NONE).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(builder.is_empty());
    }

    #[test]
    fn net_only_profile_has_no_paths() {
        let mut builder = ProfileBuilder::new();
        builder
            .add_net_rule(&NetRule::new(
                RuleAction::Allow,
                NetProtocol::Tcp,
                NetFamily::Ipv4,
            ))
            .unwrap();
        let profile = builder.compile(&CompileConfig::default()).unwrap();
        assert!(profile.paths().is_none());
        assert_eq!(profile.stats().num_net_rules, 1);
        assert_eq!(
            profile.export_path_blob().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(profile.lookup("/anything"), Permission::NONE);
    }

    #[test]
    fn stats_track_blob_size() {
        let mut builder = ProfileBuilder::new();
        builder.add_pattern("/a", Permission::READ).unwrap();
        let profile = builder.compile(&CompileConfig::default()).unwrap();
        let blob = profile.export_path_blob().unwrap();
        assert_eq!(profile.stats().binary_size as usize, blob.len());
        assert_eq!(profile.stats().num_patterns, 1);
        assert_eq!(profile.patterns()[0].pattern, "/a");
    }

    #[test]
    fn check_requires_every_bit() {
        let mut builder = ProfileBuilder::new();
        builder
            .add_pattern("/bin/*", Permission::READ | Permission::EXEC)
            .unwrap();
        let profile = builder.compile(&CompileConfig::default()).unwrap();
        assert!(profile.check("/bin/sh", Permission::EXEC));
        assert!(!profile.check("/bin/sh", Permission::WRITE | Permission::READ));
        assert!(!profile.check("/sbin/sh", Permission::READ));
    }

    #[test]
    fn tiny_state_budget_is_invalid() {
        let mut builder = ProfileBuilder::new();
        builder.add_pattern("/a", Permission::READ).unwrap();
        let config = CompileConfig {
            mode: CompileMode::Dfa,
            max_states: 1,
            ..CompileConfig::default()
        };
        assert_eq!(
            builder.compile(&config).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
