use crate::context::BpfContainerContext;
use crate::error::{Error, Result};
use crate::maps::{MapId, MapStore};
use bpf_api::{
    BASENAME_MAX_RULES, BASENAME_MAX_TOKENS, BASENAME_TOKEN_DIGIT_ONE, BASENAME_TOKEN_DIGIT_PLUS,
    BASENAME_TOKEN_LEN, BASENAME_TOKEN_LITERAL, BasenamePolicy, BasenameRuleEntry,
    BasenameTokenEntry, DIR_FLAG_CHILDREN_ONLY, DIR_FLAG_RECURSIVE, NET_PERM_CREATE, NetCreateKey,
    NetPolicyValue, NetTupleKey, NetUnixKey, PolicyKey, PolicyValue, UNIX_PATH_MAX,
};
use bytemuck::{Pod, Zeroable};
use policy_core::{NetAccess, NetRule, PathRule, Policy, SocketFamily, UnixRule};
use protecc::{BasenameRule, BasenameToken, CompileConfig, Permission, ProfileBuilder};
use std::fs::{self, Metadata};
use std::net::IpAddr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

const PATH_MAX: usize = 4096;
const AF_UNIX: u16 = 1;
const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// How a path pattern lands in the kernel maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathTarget {
    /// `dir/**`: the directory and everything below it.
    Recursive(String),
    /// `dir/*`: direct children only.
    Children(String),
    /// Wildcards only in the final segment.
    Basename { dir: String, rule: BasenameRule },
    /// Anything else is expanded against the rootfs.
    Expand(String),
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

/// A glob matching a superset of `pattern`: quantified bracket sets
/// become `*` and `[^` becomes `[!`. Candidates are confirmed with the
/// compiled pattern afterwards.
fn glob_superset(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(c) = rest.chars().next() {
        if c == '['
            && let Some(close) = bracket_end(rest)
        {
            let (set, after) = rest.split_at(close + 1);
            match after.chars().next() {
                Some(q @ ('+' | '*' | '?')) => {
                    out.push('*');
                    rest = &after[q.len_utf8()..];
                }
                _ => {
                    match set.strip_prefix("[^") {
                        Some(inner) => {
                            out.push_str("[!");
                            out.push_str(inner);
                        }
                        None => out.push_str(set),
                    }
                    rest = after;
                }
            }
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Index of the `]` closing the bracket expression at the start of `text`.
fn bracket_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 1;
    if matches!(bytes.get(i), Some(b'!' | b'^')) {
        i += 1;
    }
    if bytes.get(i) == Some(&b']') {
        i += 1;
    }
    bytes[i..].iter().position(|&b| b == b']').map(|pos| i + pos)
}

fn dir_or_root(dir: &str) -> String {
    if dir.is_empty() {
        "/".to_string()
    } else {
        dir.to_string()
    }
}

pub(crate) fn classify(pattern: &str) -> PathTarget {
    if let Some(dir) = pattern.strip_suffix("/**") {
        return PathTarget::Recursive(dir_or_root(dir));
    }
    if let Some(dir) = pattern.strip_suffix("/*") {
        return PathTarget::Children(dir_or_root(dir));
    }
    if let Some(split) = pattern.rfind('/') {
        let (dir, last) = (&pattern[..split], &pattern[split + 1..]);
        if has_wildcard(last)
            && !has_wildcard(dir)
            && let Ok(rule) = BasenameRule::parse(last)
        {
            return PathTarget::Basename {
                dir: dir_or_root(dir),
                rule,
            };
        }
    }
    PathTarget::Expand(pattern.to_string())
}

/// Converts a userspace `st_dev` into the kernel's internal `dev_t`.
fn kernel_dev(st_dev: u64) -> u64 {
    let major = ((st_dev >> 8) & 0xfff) | ((st_dev >> 32) & !0xfff);
    let minor = (st_dev & 0xff) | ((st_dev >> 12) & !0xff);
    (major << 20) | minor
}

fn read_value<T: Pod>(map: MapId, bytes: &[u8]) -> Result<T> {
    bytemuck::try_pod_read_unaligned(bytes)
        .map_err(|err| Error::InvalidArgument(format!("{}: stored value: {err}", map.name())))
}

fn encode_basename(rule: &BasenameRule, mask: u32) -> Result<BasenameRuleEntry> {
    let tokens = rule.tokens();
    if tokens.len() > BASENAME_MAX_TOKENS {
        return Err(Error::NotSupported(format!(
            "basename rule with {} tokens",
            tokens.len()
        )));
    }
    let mut entry = BasenameRuleEntry::zeroed();
    entry.allow_mask = mask;
    entry.token_count = tokens.len() as u8;
    entry.tail_wildcard = u8::from(rule.tail_wildcard());
    for (slot, token) in entry.tokens.iter_mut().zip(tokens) {
        *slot = match token {
            BasenameToken::Literal(text) => {
                if text.len() > BASENAME_TOKEN_LEN {
                    return Err(Error::NotSupported(format!(
                        "basename literal '{text}' longer than {BASENAME_TOKEN_LEN} bytes"
                    )));
                }
                let mut entry = BasenameTokenEntry::zeroed();
                entry.kind = BASENAME_TOKEN_LITERAL;
                entry.len = text.len() as u8;
                entry.text[..text.len()].copy_from_slice(text.as_bytes());
                entry
            }
            BasenameToken::DigitOne => BasenameTokenEntry {
                kind: BASENAME_TOKEN_DIGIT_ONE,
                ..BasenameTokenEntry::zeroed()
            },
            BasenameToken::DigitPlus => BasenameTokenEntry {
                kind: BASENAME_TOKEN_DIGIT_PLUS,
                ..BasenameTokenEntry::zeroed()
            },
        };
    }
    Ok(entry)
}

fn same_matcher(a: &BasenameRuleEntry, b: &BasenameRuleEntry) -> bool {
    a.token_count == b.token_count && a.tail_wildcard == b.tail_wildcard && a.tokens == b.tokens
}

fn ip_families(family: SocketFamily, addr: Option<IpAddr>) -> Vec<u16> {
    match (family, addr) {
        (_, Some(IpAddr::V4(_))) => vec![AF_INET],
        (_, Some(IpAddr::V6(_))) => vec![AF_INET6],
        (SocketFamily::Any, None) => vec![AF_INET, AF_INET6],
        (family, None) => vec![family.af()],
    }
}

fn addr_bytes(addr: Option<IpAddr>) -> [u8; 16] {
    let mut out = [0u8; 16];
    match addr {
        Some(IpAddr::V4(v4)) => out[..4].copy_from_slice(&v4.octets()),
        Some(IpAddr::V6(v6)) => out = v6.octets(),
        None => {}
    }
    out
}

/// Insert counters for one admit pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub(crate) inserted: u64,
    pub(crate) failed: u64,
    pub(crate) skipped: u64,
}

pub(crate) struct Populator<'a> {
    store: &'a mut dyn MapStore,
    ctx: &'a mut BpfContainerContext,
    rootfs: PathBuf,
    canonical_root: PathBuf,
    outcome: Outcome,
}

impl<'a> Populator<'a> {
    pub(crate) fn new(
        store: &'a mut dyn MapStore,
        ctx: &'a mut BpfContainerContext,
        rootfs: &Path,
    ) -> Result<Self> {
        let canonical_root = fs::canonicalize(rootfs)
            .map_err(|err| Error::io(format!("rootfs {}", rootfs.display()), err))?;
        Ok(Self {
            store,
            ctx,
            rootfs: rootfs.to_path_buf(),
            canonical_root,
            outcome: Outcome::default(),
        })
    }

    pub(crate) fn populate(mut self, policy: &Policy) -> Outcome {
        for rule in policy.path_rules() {
            if let Err(err) = self.add_path_rule(&rule) {
                self.fail(&rule.pattern, &err);
            }
        }
        for rule in policy.net_rules() {
            self.add_net_rule(rule);
        }
        for rule in policy.unix_rules() {
            self.add_unix_rule(rule);
        }
        self.outcome
    }

    fn fail(&mut self, what: &str, err: &Error) {
        self.outcome.failed += 1;
        log::warn!(
            target: "cvd",
            "container {}: failed to apply {what}: {err}",
            self.ctx.container_id()
        );
    }

    fn track(&mut self, what: &str, result: Result<()>) {
        match result {
            Ok(()) => self.outcome.inserted += 1,
            Err(err) => self.fail(what, &err),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.rootfs.join(path.trim_start_matches('/'))
    }

    /// Expands `pattern` inside the rootfs, dropping results that escape it
    /// or exceed `PATH_MAX`. Matches follow the compiled pattern, so the
    /// kernel entries agree with `Policy::check_path`.
    fn expand(&mut self, pattern: &str) -> Result<Vec<Metadata>> {
        let root = glob::Pattern::escape(&self.rootfs.to_string_lossy());
        let full = format!(
            "{}/{}",
            root.trim_end_matches('/'),
            glob_superset(pattern).trim_start_matches('/')
        );
        if full.len() >= PATH_MAX {
            log::warn!(target: "cvd", "skipping {pattern}: path longer than {PATH_MAX} bytes");
            self.outcome.skipped += 1;
            return Ok(Vec::new());
        }
        let entries = glob::glob(&full)
            .map_err(|err| Error::InvalidArgument(format!("pattern {pattern}: {err}")))?;
        let mut builder = ProfileBuilder::new();
        builder.add_pattern(pattern, Permission::READ)?;
        let matcher = builder.compile(&CompileConfig::default())?;
        let mut out = Vec::new();
        for path in entries.filter_map(|entry| entry.ok()) {
            let Ok(relative) = path.strip_prefix(&self.rootfs) else {
                continue;
            };
            let inner = format!("/{}", relative.to_string_lossy());
            if !matcher.check(&inner, Permission::READ) {
                continue;
            }
            if let Some(meta) = self.stat_inside(&path) {
                out.push(meta);
            }
        }
        if out.is_empty() {
            log::debug!(target: "cvd", "pattern {pattern} matched nothing in {}", self.rootfs.display());
        }
        Ok(out)
    }

    fn stat_inside(&mut self, path: &Path) -> Option<Metadata> {
        if path.as_os_str().len() >= PATH_MAX {
            log::warn!(target: "cvd", "skipping {}: path longer than {PATH_MAX} bytes", path.display());
            self.outcome.skipped += 1;
            return None;
        }
        let resolved = fs::canonicalize(path).ok()?;
        if !resolved.starts_with(&self.canonical_root) {
            log::warn!(target: "cvd", "skipping {}: resolves outside the rootfs", path.display());
            self.outcome.skipped += 1;
            return None;
        }
        fs::metadata(&resolved).ok()
    }

    fn key_for(&self, meta: &Metadata) -> PolicyKey {
        PolicyKey {
            cgroup_id: self.ctx.cgroup_id(),
            dev: kernel_dev(meta.dev()),
            ino: meta.ino(),
        }
    }

    fn add_dirs(&mut self, pattern: &str, dir: &str, mask: u32, flags: u32) -> Result<()> {
        for meta in self.expand(dir)? {
            if meta.is_dir() {
                let key = self.key_for(&meta);
                let result = self.put_policy(MapId::DirPolicy, key, mask, flags);
                self.track(pattern, result);
            }
        }
        Ok(())
    }

    fn add_path_rule(&mut self, rule: &PathRule) -> Result<()> {
        let mask = rule.access.bits();
        match classify(&rule.pattern) {
            PathTarget::Recursive(dir) => self.add_dirs(&rule.pattern, &dir, mask, DIR_FLAG_RECURSIVE),
            PathTarget::Children(dir) => {
                self.add_dirs(&rule.pattern, &dir, mask, DIR_FLAG_CHILDREN_ONLY)
            }
            PathTarget::Basename { dir, rule: matcher } => {
                let host = self.host_path(&dir);
                let Some(meta) = self.stat_inside(&host) else {
                    log::debug!(target: "cvd", "basename parent {dir} is missing");
                    return Ok(());
                };
                if !meta.is_dir() {
                    return Err(Error::InvalidArgument(format!("{dir} is not a directory")));
                }
                let key = self.key_for(&meta);
                let result = self.put_basename(key, &matcher, mask);
                self.track(&rule.pattern, result);
                Ok(())
            }
            PathTarget::Expand(pattern) => {
                for meta in self.expand(&pattern)? {
                    let key = self.key_for(&meta);
                    let result = if meta.is_dir() {
                        self.put_policy(MapId::DirPolicy, key, mask, DIR_FLAG_RECURSIVE)
                    } else {
                        self.put_policy(MapId::Policy, key, mask, 0)
                    };
                    self.track(&rule.pattern, result);
                }
                Ok(())
            }
        }
    }

    fn put_policy(&mut self, map: MapId, key: PolicyKey, mask: u32, flags: u32) -> Result<()> {
        let key_bytes = bytemuck::bytes_of(&key);
        let value = match self.store.lookup(map, key_bytes)? {
            Some(existing) => {
                let old: PolicyValue = read_value(map, &existing)?;
                PolicyValue {
                    allow_mask: old.allow_mask | mask,
                    flags: old.flags | flags,
                }
            }
            None => PolicyValue {
                allow_mask: mask,
                flags,
            },
        };
        self.store.update(map, key_bytes, bytemuck::bytes_of(&value))?;
        self.ctx.record(map, key_bytes);
        Ok(())
    }

    fn put_basename(&mut self, parent: PolicyKey, rule: &BasenameRule, mask: u32) -> Result<()> {
        let map = MapId::BasenamePolicy;
        let entry = encode_basename(rule, mask)?;
        let key_bytes = bytemuck::bytes_of(&parent);
        let mut table: BasenamePolicy = match self.store.lookup(map, key_bytes)? {
            Some(existing) => read_value(map, &existing)?,
            None => BasenamePolicy::zeroed(),
        };
        let count = (table.count as usize).min(BASENAME_MAX_RULES);
        if let Some(existing) = table.rules[..count]
            .iter_mut()
            .find(|existing| same_matcher(existing, &entry))
        {
            existing.allow_mask |= mask;
        } else if count == BASENAME_MAX_RULES {
            return Err(Error::NotSupported(format!(
                "more than {BASENAME_MAX_RULES} basename rules in one directory"
            )));
        } else {
            table.rules[count] = entry;
            table.count = count as u32 + 1;
        }
        self.store.update(map, key_bytes, bytemuck::bytes_of(&table))?;
        self.ctx.record(map, key_bytes);
        Ok(())
    }

    fn put_net<K: Pod>(&mut self, map: MapId, key: &K, mask: u32) -> Result<()> {
        let key_bytes = bytemuck::bytes_of(key);
        let merged = match self.store.lookup(map, key_bytes)? {
            Some(existing) => read_value::<NetPolicyValue>(map, &existing)?.allow_mask | mask,
            None => mask,
        };
        let value = NetPolicyValue { allow_mask: merged };
        self.store.update(map, key_bytes, bytemuck::bytes_of(&value))?;
        self.ctx.record(map, key_bytes);
        Ok(())
    }

    fn add_net_rule(&mut self, rule: &NetRule) {
        let what = rule.to_string();
        let rest = rule.access - NetAccess::CREATE;
        for family in ip_families(rule.family, rule.addr) {
            if rule.access.contains(NetAccess::CREATE) {
                let key = NetCreateKey {
                    cgroup_id: self.ctx.cgroup_id(),
                    family,
                    sock_type: rule.sock_type.raw(),
                    protocol: rule.protocol,
                    _pad: 0,
                };
                let result = self.put_net(MapId::NetCreate, &key, NET_PERM_CREATE);
                self.track(&what, result);
            }
            if !rest.is_empty() {
                let key = NetTupleKey {
                    cgroup_id: self.ctx.cgroup_id(),
                    family,
                    sock_type: rule.sock_type.raw(),
                    protocol: rule.protocol,
                    port: rule.port.to_be(),
                    addr: addr_bytes(rule.addr),
                };
                let result = self.put_net(MapId::NetTuple, &key, rest.bits());
                self.track(&what, result);
            }
        }
    }

    fn add_unix_rule(&mut self, rule: &UnixRule) {
        if rule.access.contains(NetAccess::CREATE) {
            let key = NetCreateKey {
                cgroup_id: self.ctx.cgroup_id(),
                family: AF_UNIX,
                sock_type: rule.sock_type.raw(),
                protocol: rule.protocol,
                _pad: 0,
            };
            let result = self.put_net(MapId::NetCreate, &key, NET_PERM_CREATE);
            self.track(&rule.path, result);
        }
        let rest = rule.access - NetAccess::CREATE;
        if rest.is_empty() {
            return;
        }
        let result = self.unix_key(rule).and_then(|key| self.put_net(MapId::NetUnix, &key, rest.bits()));
        self.track(&rule.path, result);
    }

    fn unix_key(&self, rule: &UnixRule) -> Result<NetUnixKey> {
        if has_wildcard(&rule.path) {
            return Err(Error::NotSupported(format!(
                "wildcard AF_UNIX path {}",
                rule.path
            )));
        }
        let bytes = rule.path.as_bytes();
        if bytes.len() >= UNIX_PATH_MAX {
            return Err(Error::InvalidArgument(format!(
                "AF_UNIX path {} is too long",
                rule.path
            )));
        }
        let mut key = NetUnixKey::zeroed();
        key.cgroup_id = self.ctx.cgroup_id();
        key.sock_type = rule.sock_type.raw();
        key.protocol = rule.protocol;
        key.path_len = bytes.len() as u8;
        key.is_abstract = u8::from(rule.is_abstract);
        key.path[..bytes.len()].copy_from_slice(bytes);
        Ok(key)
    }
}
