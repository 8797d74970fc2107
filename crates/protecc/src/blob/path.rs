use super::{
    FLAG_CASE_INSENSITIVE, FLAG_TYPE_DFA, FLAG_TYPE_TRIE, PROTECC_BLOB_VERSION,
    PROTECC_PROFILE_MAGIC, checked_size, le_u32, put_u16, put_u32, read_u32,
};
use crate::builder::PathProfile;
use crate::dfa::{DEAD_STATE, Dfa, accept_bit};
use crate::error::{Error, Result};
use crate::pattern::{Element, Modifier, NodeKind};
use crate::perms::Permission;
use crate::trie::{ROOT, Trie, TrieGraph, TrieNode, search};

pub(crate) const HEADER_SIZE: usize = 40;
pub(crate) const NODE_SIZE: usize = 48;
pub(crate) const DFA_HEADER_SIZE: usize = 32;
const CLASSMAP_SIZE: usize = 256;
const CLASSMAP_OFFSET: usize = HEADER_SIZE + DFA_HEADER_SIZE;
const ACCEPT_OFFSET: usize = CLASSMAP_OFFSET + CLASSMAP_SIZE;

/// Statistics recorded in the path blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobStats {
    pub num_patterns: u32,
    pub binary_size: u32,
    pub max_depth: u32,
    pub num_nodes: u32,
}

fn trie_blob_size(num_nodes: usize, num_edges: usize) -> Option<usize> {
    checked_size(&[(num_nodes, NODE_SIZE), (num_edges, 4)], HEADER_SIZE)
}

struct DfaOffsets {
    accept: usize,
    perms: usize,
    transitions: usize,
    end: usize,
}

fn dfa_offsets(num_states: usize, num_classes: usize) -> Option<DfaOffsets> {
    let accept_words = num_states.div_ceil(32);
    let perms = checked_size(&[(accept_words, 4)], ACCEPT_OFFSET)?;
    let transitions = checked_size(&[(num_states, 4)], perms)?;
    let end = num_states
        .checked_mul(num_classes)
        .and_then(|cells| checked_size(&[(cells, 4)], transitions))?;
    Some(DfaOffsets {
        accept: ACCEPT_OFFSET,
        perms,
        transitions,
        end,
    })
}

pub(crate) fn path_blob_size(profile: &PathProfile) -> Option<usize> {
    match profile {
        PathProfile::Trie(trie) => trie_blob_size(trie.nodes().len(), trie.num_edges()),
        PathProfile::Dfa(dfa) => {
            dfa_offsets(dfa.num_states as usize, dfa.num_classes as usize).map(|o| o.end)
        }
    }
}

fn blob_size_u32(size: Option<usize>) -> Result<u32> {
    size.and_then(|size| u32::try_from(size).ok())
        .ok_or_else(|| Error::CompileFailed("path blob exceeds 4 GiB".into()))
}

fn allocate(size: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size as usize)
        .map_err(|_| Error::OutOfMemory("allocating the path blob"))?;
    Ok(buf)
}

fn put_header(buf: &mut Vec<u8>, flags: u32, num_nodes: u32, num_edges: u32, stats: BlobStats) {
    put_u32(buf, PROTECC_PROFILE_MAGIC);
    put_u32(buf, PROTECC_BLOB_VERSION);
    put_u32(buf, flags);
    put_u32(buf, num_nodes);
    put_u32(buf, num_edges);
    put_u32(buf, ROOT);
    put_u32(buf, stats.num_patterns);
    put_u32(buf, stats.binary_size);
    put_u32(buf, stats.max_depth);
    put_u32(buf, stats.num_nodes);
}

fn case_flag(case_insensitive: bool) -> u32 {
    if case_insensitive {
        FLAG_CASE_INSENSITIVE
    } else {
        0
    }
}

pub(crate) fn encode_trie(trie: &Trie) -> Result<Vec<u8>> {
    let nodes = trie.nodes();
    let size = blob_size_u32(trie_blob_size(nodes.len(), trie.num_edges()))?;
    let mut buf = allocate(size)?;
    let num_nodes = nodes.len() as u32;
    put_header(
        &mut buf,
        FLAG_TYPE_TRIE | case_flag(trie.case_insensitive()),
        num_nodes,
        trie.num_edges() as u32,
        BlobStats {
            num_patterns: trie.num_patterns(),
            binary_size: size,
            max_depth: trie.max_depth(),
            num_nodes,
        },
    );

    let mut child_start = 0u32;
    for node in nodes {
        buf.push(node.element.kind.type_code());
        buf.push(node.element.modifier as u8);
        buf.push(u8::from(node.terminal));
        buf.push(0);
        put_u32(&mut buf, child_start);
        put_u16(&mut buf, node.children.len() as u16);
        put_u16(&mut buf, 0);
        put_u32(&mut buf, node.perms.bits());
        buf.extend_from_slice(&node.element.kind.data());
        child_start += node.children.len() as u32;
    }
    for node in nodes {
        for &child in &node.children {
            put_u32(&mut buf, child);
        }
    }
    debug_assert_eq!(buf.len(), size as usize);
    Ok(buf)
}

pub(crate) fn encode_dfa(dfa: &Dfa) -> Result<Vec<u8>> {
    let offsets = dfa_offsets(dfa.num_states as usize, dfa.num_classes as usize)
        .ok_or_else(|| Error::CompileFailed("path blob exceeds 4 GiB".into()))?;
    let size = blob_size_u32(Some(offsets.end))?;
    let mut buf = allocate(size)?;
    put_header(
        &mut buf,
        FLAG_TYPE_DFA | case_flag(dfa.case_insensitive),
        0,
        0,
        BlobStats {
            num_patterns: dfa.num_patterns,
            binary_size: size,
            max_depth: dfa.max_depth,
            num_nodes: dfa.trie_nodes,
        },
    );
    put_u32(&mut buf, dfa.num_states);
    put_u32(&mut buf, dfa.num_classes);
    put_u32(&mut buf, dfa.start);
    put_u32(&mut buf, dfa.accept.len() as u32);
    for offset in [
        CLASSMAP_OFFSET,
        offsets.accept,
        offsets.perms,
        offsets.transitions,
    ] {
        put_u32(&mut buf, offset as u32);
    }
    buf.extend_from_slice(&dfa.classmap);
    for &word in dfa
        .accept
        .iter()
        .chain(&dfa.perms)
        .chain(&dfa.transitions)
    {
        put_u32(&mut buf, word);
    }
    debug_assert_eq!(buf.len(), size as usize);
    Ok(buf)
}

/// Raw node record; only meaningful inside a validated blob.
struct RawNode {
    code: u8,
    modifier: u8,
    terminal: u8,
    pad: u8,
    child_start: u32,
    child_count: u16,
    pad16: u16,
    perms: u32,
    data: [u8; 32],
}

impl RawNode {
    fn read(bytes: &[u8], index: usize) -> Self {
        let rec = HEADER_SIZE + index * NODE_SIZE;
        let mut data = [0u8; 32];
        data.copy_from_slice(&bytes[rec + 16..rec + NODE_SIZE]);
        Self {
            code: bytes[rec],
            modifier: bytes[rec + 1],
            terminal: bytes[rec + 2],
            pad: bytes[rec + 3],
            child_start: le_u32(bytes, rec + 4),
            child_count: u16::from_le_bytes([bytes[rec + 8], bytes[rec + 9]]),
            pad16: u16::from_le_bytes([bytes[rec + 10], bytes[rec + 11]]),
            perms: le_u32(bytes, rec + 12),
            data,
        }
    }

    fn element(&self) -> Option<Element> {
        let kind = NodeKind::from_parts(self.code, &self.data)?;
        let modifier = Modifier::from_code(self.modifier)?;
        Some(Element { kind, modifier })
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Trie {
        num_nodes: usize,
        edges_off: usize,
    },
    Dfa {
        num_classes: usize,
        start: u32,
        accept_off: usize,
        perms_off: usize,
        transitions_off: usize,
    },
}

/// Zero-copy, validated view over a path blob.
#[derive(Debug, Clone, Copy)]
pub struct PathBlobView<'a> {
    bytes: &'a [u8],
    case_insensitive: bool,
    stats: BlobStats,
    layout: Layout,
}

impl<'a> PathBlobView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::blob("truncated path blob header"));
        }
        if bytes.len() % 4 != 0 {
            return Err(Error::blob("path blob length is not 4-byte aligned"));
        }
        let magic = read_u32(bytes, 0)?;
        if magic != PROTECC_PROFILE_MAGIC {
            return Err(Error::blob(format!("bad path blob magic {magic:#010x}")));
        }
        let version = read_u32(bytes, 4)?;
        if version != PROTECC_BLOB_VERSION {
            return Err(Error::blob(format!("unsupported path blob version {version}")));
        }
        let flags = read_u32(bytes, 8)?;
        if flags & !(FLAG_TYPE_TRIE | FLAG_TYPE_DFA | FLAG_CASE_INSENSITIVE) != 0 {
            return Err(Error::blob(format!("unknown path blob flags {flags:#x}")));
        }
        let num_nodes = read_u32(bytes, 12)?;
        let num_edges = read_u32(bytes, 16)?;
        let root = read_u32(bytes, 20)?;
        let stats = BlobStats {
            num_patterns: read_u32(bytes, 24)?,
            binary_size: read_u32(bytes, 28)?,
            max_depth: read_u32(bytes, 32)?,
            num_nodes: read_u32(bytes, 36)?,
        };
        if stats.binary_size as usize != bytes.len() {
            return Err(Error::blob(format!(
                "header size {} does not match blob length {}",
                stats.binary_size,
                bytes.len()
            )));
        }
        if root != ROOT {
            return Err(Error::blob(format!("unsupported root index {root}")));
        }

        let layout = match flags & (FLAG_TYPE_TRIE | FLAG_TYPE_DFA) {
            FLAG_TYPE_TRIE => validate_trie(bytes, num_nodes, num_edges, &stats)?,
            FLAG_TYPE_DFA => {
                if num_nodes != 0 || num_edges != 0 {
                    return Err(Error::blob("DFA blob must not declare trie nodes"));
                }
                validate_dfa(bytes)?
            }
            _ => return Err(Error::blob("blob must be exactly one of trie or DFA")),
        };
        Ok(Self {
            bytes,
            case_insensitive: flags & FLAG_CASE_INSENSITIVE != 0,
            stats,
            layout,
        })
    }

    pub fn is_dfa(&self) -> bool {
        matches!(self.layout, Layout::Dfa { .. })
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn stats(&self) -> BlobStats {
        self.stats
    }

    /// Answers directly from the borrowed bytes.
    pub fn lookup(&self, input: &[u8]) -> Permission {
        match self.layout {
            Layout::Trie { edges_off, .. } => search(
                &TrieView {
                    bytes: self.bytes,
                    edges_off,
                    case_insensitive: self.case_insensitive,
                },
                input,
            ),
            Layout::Dfa {
                num_classes,
                start,
                accept_off,
                perms_off,
                transitions_off,
            } => {
                let mut state = start;
                for &byte in input {
                    let class = usize::from(self.bytes[CLASSMAP_OFFSET + usize::from(byte)]);
                    let cell = state as usize * num_classes + class;
                    state = le_u32(self.bytes, transitions_off + cell * 4);
                    if state == DEAD_STATE {
                        return Permission::NONE;
                    }
                }
                let word = le_u32(self.bytes, accept_off + (state as usize / 32) * 4);
                if word & (1 << (state % 32)) == 0 {
                    return Permission::NONE;
                }
                Permission::from_bits_truncate(le_u32(self.bytes, perms_off + state as usize * 4))
            }
        }
    }

    /// Copies the blob into an owned profile.
    pub fn to_profile(&self) -> PathProfile {
        match self.layout {
            Layout::Trie {
                num_nodes,
                edges_off,
            } => {
                let mut nodes: Vec<TrieNode> = Vec::with_capacity(num_nodes);
                let mut depths = vec![0u32; num_nodes];
                for index in 0..num_nodes {
                    let raw = RawNode::read(self.bytes, index);
                    let children: Vec<u32> = (0..usize::from(raw.child_count))
                        .map(|slot| {
                            le_u32(self.bytes, edges_off + (raw.child_start as usize + slot) * 4)
                        })
                        .collect();
                    for &child in &children {
                        depths[child as usize] = depths[index] + 1;
                    }
                    nodes.push(TrieNode {
                        element: raw
                            .element()
                            .unwrap_or(Element::new(NodeKind::Literal(0))),
                        terminal: raw.terminal == 1,
                        perms: Permission::from_bits_truncate(raw.perms),
                        children,
                        depth: depths[index],
                    });
                }
                PathProfile::Trie(Trie::from_parts(
                    nodes,
                    self.case_insensitive,
                    self.stats.num_patterns,
                    self.stats.max_depth,
                ))
            }
            Layout::Dfa {
                num_classes,
                start,
                accept_off,
                perms_off,
                transitions_off,
            } => {
                let words = |from: usize, to: usize| -> Vec<u32> {
                    (from..to).step_by(4).map(|off| le_u32(self.bytes, off)).collect()
                };
                let mut classmap = [0u8; 256];
                classmap.copy_from_slice(&self.bytes[CLASSMAP_OFFSET..ACCEPT_OFFSET]);
                let perms = words(perms_off, transitions_off);
                PathProfile::Dfa(Dfa {
                    num_states: perms.len() as u32,
                    num_classes: num_classes as u32,
                    start,
                    classmap,
                    accept: words(accept_off, perms_off),
                    perms,
                    transitions: words(transitions_off, self.bytes.len()),
                    case_insensitive: self.case_insensitive,
                    num_patterns: self.stats.num_patterns,
                    max_depth: self.stats.max_depth,
                    trie_nodes: self.stats.num_nodes,
                })
            }
        }
    }
}

struct TrieView<'a> {
    bytes: &'a [u8],
    edges_off: usize,
    case_insensitive: bool,
}

impl TrieGraph for TrieView<'_> {
    fn element(&self, node: u32) -> Element {
        RawNode::read(self.bytes, node as usize)
            .element()
            .unwrap_or(Element::new(NodeKind::Literal(0)))
    }

    fn terminal_perms(&self, node: u32) -> Option<Permission> {
        let raw = RawNode::read(self.bytes, node as usize);
        (raw.terminal == 1).then(|| Permission::from_bits_truncate(raw.perms))
    }

    fn child_count(&self, node: u32) -> usize {
        usize::from(RawNode::read(self.bytes, node as usize).child_count)
    }

    fn child_at(&self, node: u32, index: usize) -> u32 {
        let raw = RawNode::read(self.bytes, node as usize);
        le_u32(self.bytes, self.edges_off + (raw.child_start as usize + index) * 4)
    }

    fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }
}

fn validate_trie(
    bytes: &[u8],
    num_nodes: u32,
    num_edges: u32,
    stats: &BlobStats,
) -> Result<Layout> {
    let n = num_nodes as usize;
    let e = num_edges as usize;
    if n == 0 {
        return Err(Error::blob("trie blob has no root node"));
    }
    if stats.num_nodes != num_nodes {
        return Err(Error::blob("node count disagrees with header stats"));
    }
    if e != n - 1 {
        return Err(Error::blob(format!(
            "trie with {n} nodes must have {} edges, found {e}",
            n - 1
        )));
    }
    let expected = trie_blob_size(n, e).ok_or_else(|| Error::blob("trie size overflows"))?;
    if expected != bytes.len() {
        return Err(Error::blob(format!(
            "trie sections need {expected} bytes, blob has {}",
            bytes.len()
        )));
    }
    let edges_off = HEADER_SIZE + n * NODE_SIZE;

    let mut has_parent = vec![false; n];
    let mut depths = vec![0u32; n];
    let mut max_depth = 0;
    for index in 0..n {
        let raw = RawNode::read(bytes, index);
        if raw.pad != 0 || raw.pad16 != 0 {
            return Err(Error::blob(format!("node {index} has non-zero padding")));
        }
        let element = raw
            .element()
            .ok_or_else(|| Error::blob(format!("node {index} has an invalid type or modifier")))?;
        if !element.is_consistent() {
            return Err(Error::blob(format!(
                "node {index} combines a run wildcard with a modifier"
            )));
        }
        if element.kind.data() != raw.data {
            return Err(Error::blob(format!("node {index} payload is not canonical")));
        }
        let terminal = match raw.terminal {
            0 => false,
            1 => true,
            other => return Err(Error::blob(format!("node {index} terminal flag {other}"))),
        };
        let perms = Permission::from_bits(raw.perms)
            .ok_or_else(|| Error::blob(format!("node {index} has unknown permission bits")))?;
        if terminal == perms.is_empty() {
            return Err(Error::blob(format!(
                "node {index} permissions disagree with its terminal flag"
            )));
        }
        if index == ROOT as usize {
            if terminal || element != Element::new(NodeKind::Literal(0)) {
                return Err(Error::blob("root node must be an empty non-terminal"));
            }
        } else if !has_parent[index] {
            return Err(Error::blob(format!("node {index} is unreachable")));
        }
        if terminal {
            max_depth = max_depth.max(depths[index]);
        }

        let start = raw.child_start as usize;
        let end = start
            .checked_add(usize::from(raw.child_count))
            .filter(|&end| end <= e)
            .ok_or_else(|| Error::blob(format!("node {index} edge slice out of range")))?;
        for slot in start..end {
            let child = read_u32(bytes, edges_off + slot * 4)? as usize;
            if child <= index || child >= n {
                return Err(Error::blob(format!(
                    "edge from node {index} targets invalid node {child}"
                )));
            }
            if has_parent[child] {
                return Err(Error::blob(format!("node {child} has more than one parent")));
            }
            has_parent[child] = true;
            depths[child] = depths[index] + 1;
        }
    }
    if max_depth != stats.max_depth {
        return Err(Error::blob(format!(
            "header max depth {} does not match trie depth {max_depth}",
            stats.max_depth
        )));
    }
    Ok(Layout::Trie {
        num_nodes: n,
        edges_off,
    })
}

fn validate_dfa(bytes: &[u8]) -> Result<Layout> {
    let field = |index: usize| read_u32(bytes, HEADER_SIZE + index * 4);
    let num_states = field(0)? as usize;
    let num_classes = field(1)? as usize;
    let start = field(2)?;
    let accept_words = field(3)? as usize;
    let declared = [field(4)?, field(5)?, field(6)?, field(7)?];

    if num_states < 2 {
        return Err(Error::blob("DFA needs a dead state and a start state"));
    }
    if num_classes == 0 || num_classes > CLASSMAP_SIZE {
        return Err(Error::blob(format!("invalid DFA class count {num_classes}")));
    }
    if start == DEAD_STATE || start as usize >= num_states {
        return Err(Error::blob(format!("invalid DFA start state {start}")));
    }
    if accept_words != num_states.div_ceil(32) {
        return Err(Error::blob("accept bitset length does not match state count"));
    }
    let offsets = dfa_offsets(num_states, num_classes)
        .ok_or_else(|| Error::blob("DFA size overflows"))?;
    let expected = [
        CLASSMAP_OFFSET,
        offsets.accept,
        offsets.perms,
        offsets.transitions,
    ];
    if declared
        .iter()
        .zip(expected)
        .any(|(&declared, expected)| declared as usize != expected)
    {
        return Err(Error::blob("DFA sections are not tightly packed"));
    }
    if offsets.end != bytes.len() {
        return Err(Error::blob(format!(
            "DFA sections need {} bytes, blob has {}",
            offsets.end,
            bytes.len()
        )));
    }

    if bytes[CLASSMAP_OFFSET..ACCEPT_OFFSET]
        .iter()
        .any(|&class| usize::from(class) >= num_classes)
    {
        return Err(Error::blob("class map references an unknown class"));
    }

    let accept: Vec<u32> = (0..accept_words)
        .map(|word| le_u32(bytes, offsets.accept + word * 4))
        .collect();
    let tail_bits = num_states % 32;
    if tail_bits != 0 && accept[accept_words - 1] >> tail_bits != 0 {
        return Err(Error::blob("accept bits set beyond the last state"));
    }
    for state in 0..num_states {
        let perms = le_u32(bytes, offsets.perms + state * 4);
        let accepting = accept_bit(&accept, state as u32);
        match Permission::from_bits(perms) {
            None => return Err(Error::blob(format!("state {state} has unknown permission bits"))),
            Some(mask) if mask.is_empty() == accepting => {
                return Err(Error::blob(format!(
                    "state {state} permissions disagree with its accept bit"
                )));
            }
            Some(_) => {}
        }
    }

    for cell in 0..num_states * num_classes {
        let target = le_u32(bytes, offsets.transitions + cell * 4);
        if target as usize >= num_states {
            return Err(Error::blob(format!("transition {cell} targets state {target}")));
        }
        if cell < num_classes && target != DEAD_STATE {
            return Err(Error::blob("dead state must only transition to itself"));
        }
    }

    Ok(Layout::Dfa {
        num_classes,
        start,
        accept_off: offsets.accept,
        perms_off: offsets.perms,
        transitions_off: offsets.transitions,
    })
}
