//! Pattern compiler for sandbox policies.
//!
//! Path globs are compiled into a trie or a DFA that answers, for a resolved
//! path, which permissions the deepest matching pattern grants. Network and
//! mount rules are carried alongside. Every part of a compiled profile can be
//! exported to a versioned little-endian blob and read back through
//! zero-copy views.

pub mod basename;
pub mod blob;
mod builder;
mod dfa;
mod error;
mod mount;
mod net;
pub mod pattern;
mod perms;
mod trie;

pub use basename::{BasenameRule, BasenameToken};
pub use blob::{
    BlobStats, MountBlobView, MountRuleView, NetBlobView, NetRuleView, PathBlobView,
};
pub use builder::{
    CompileConfig, CompileMode, CompiledProfile, PathProfile, PatternRule, ProfileBuilder,
    ProfileStats,
};
pub use dfa::{DEAD_STATE, DEFAULT_MAX_STATES, Dfa};
pub use error::{Error, ErrorKind, Result};
pub use mount::MountRule;
pub use net::{NetFamily, NetProtocol, NetRule, RuleAction};
pub use perms::Permission;
pub use trie::{Trie, TrieNode};

/// Decodes a net blob into owned rules.
pub fn import_net_blob(bytes: &[u8]) -> Result<Vec<NetRule>> {
    Ok(NetBlobView::new(bytes)?.to_rules())
}

/// Decodes a mount blob into owned rules.
pub fn import_mount_blob(bytes: &[u8]) -> Result<Vec<MountRule>> {
    Ok(MountBlobView::new(bytes)?.to_rules())
}

/// Decodes a path blob into an owned trie or DFA.
pub fn import_path_blob(bytes: &[u8]) -> Result<PathProfile> {
    PathProfile::from_blob(bytes)
}
