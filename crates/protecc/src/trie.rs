use crate::error::{Error, Result};
use crate::pattern::{Element, NodeKind};
use crate::perms::Permission;
use std::collections::HashSet;

/// Index of the root node; the root never consumes input.
pub const ROOT: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieNode {
    pub element: Element,
    pub terminal: bool,
    pub perms: Permission,
    pub children: Vec<u32>,
    pub depth: u32,
}

impl TrieNode {
    fn new(element: Element, depth: u32) -> Self {
        Self {
            element,
            terminal: false,
            perms: Permission::NONE,
            children: Vec::new(),
            depth,
        }
    }
}

/// Pattern trie. Every pattern element is one node below the root and
/// identical siblings are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trie {
    nodes: Vec<TrieNode>,
    case_insensitive: bool,
    num_patterns: u32,
    max_depth: u32,
}

impl Trie {
    pub(crate) fn new(case_insensitive: bool) -> Self {
        Self {
            nodes: vec![TrieNode::new(
                Element::new(NodeKind::Literal(0)),
                0,
            )],
            case_insensitive,
            num_patterns: 0,
            max_depth: 0,
        }
    }

    pub(crate) fn from_parts(
        nodes: Vec<TrieNode>,
        case_insensitive: bool,
        num_patterns: u32,
        max_depth: u32,
    ) -> Self {
        Self {
            nodes,
            case_insensitive,
            num_patterns,
            max_depth,
        }
    }

    /// Adds a parsed pattern. A trailing `/**` also grants the directory
    /// itself.
    pub(crate) fn insert_pattern(&mut self, elements: &[Element], perms: Permission) -> Result<()> {
        if elements.is_empty() {
            return Err(Error::InvalidArgument("pattern has no elements".into()));
        }
        self.insert(elements, perms)?;
        if let [prefix @ .., slash, tail] = elements
            && !prefix.is_empty()
            && slash.kind == NodeKind::Literal(b'/')
            && tail.kind == NodeKind::AnyRecursive
        {
            self.insert(prefix, perms)?;
        }
        self.num_patterns = self.num_patterns.saturating_add(1);
        Ok(())
    }

    fn insert(&mut self, elements: &[Element], perms: Permission) -> Result<()> {
        let mut current = ROOT as usize;
        for element in elements {
            let existing = self.nodes[current]
                .children
                .iter()
                .copied()
                .find(|&child| self.nodes[child as usize].element == *element);
            current = match existing {
                Some(child) => child as usize,
                None => self.push_child(current, *element)?,
            };
        }
        let node = &mut self.nodes[current];
        node.terminal = true;
        node.perms |= perms;
        self.max_depth = self.max_depth.max(node.depth);
        Ok(())
    }

    fn push_child(&mut self, parent: usize, element: Element) -> Result<usize> {
        if self.nodes[parent].children.len() >= usize::from(u16::MAX) {
            return Err(Error::CompileFailed(format!(
                "node {parent} exceeds {} children",
                u16::MAX
            )));
        }
        let index = u32::try_from(self.nodes.len())
            .map_err(|_| Error::CompileFailed("trie node count exceeds u32".into()))?;
        self.nodes
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory("growing the pattern trie"))?;
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(TrieNode::new(element, depth));
        self.nodes[parent].children.push(index);
        Ok(index as usize)
    }

    pub fn nodes(&self) -> &[TrieNode] {
        &self.nodes
    }

    pub fn num_edges(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn num_patterns(&self) -> u32 {
        self.num_patterns
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Returns the mask of the deepest pattern accepting `input`, or
    /// [`Permission::NONE`].
    pub fn lookup(&self, input: &[u8]) -> Permission {
        search(self, input)
    }
}

/// Read access to a trie, either owned or borrowed from a blob.
pub(crate) trait TrieGraph {
    fn element(&self, node: u32) -> Element;
    fn terminal_perms(&self, node: u32) -> Option<Permission>;
    fn child_count(&self, node: u32) -> usize;
    fn child_at(&self, node: u32, index: usize) -> u32;
    fn case_insensitive(&self) -> bool;
}

impl TrieGraph for Trie {
    fn element(&self, node: u32) -> Element {
        self.nodes[node as usize].element
    }

    fn terminal_perms(&self, node: u32) -> Option<Permission> {
        let node = &self.nodes[node as usize];
        node.terminal.then_some(node.perms)
    }

    fn child_count(&self, node: u32) -> usize {
        self.nodes[node as usize].children.len()
    }

    fn child_at(&self, node: u32, index: usize) -> u32 {
        self.nodes[node as usize].children[index]
    }

    fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }
}

/// Iterative depth-first match. Frames are `(node, position, depth)`; a
/// frame is visited at most once.
pub(crate) fn search<G: TrieGraph + ?Sized>(graph: &G, input: &[u8]) -> Permission {
    let case_insensitive = graph.case_insensitive();
    let mut stack = vec![(ROOT, 0usize, 0u32)];
    let mut seen = HashSet::from([(ROOT, 0usize)]);
    let mut best: Option<(u32, Permission)> = None;
    let mut ends = Vec::new();

    while let Some((node, pos, depth)) = stack.pop() {
        if pos == input.len()
            && let Some(perms) = graph.terminal_perms(node)
        {
            best = match best {
                Some((deepest, mask)) if deepest > depth => Some((deepest, mask)),
                Some((deepest, mask)) if deepest == depth => Some((deepest, mask | perms)),
                _ => Some((depth, perms)),
            };
        }
        for index in 0..graph.child_count(node) {
            let child = graph.child_at(node, index);
            graph
                .element(child)
                .advance(input, pos, case_insensitive, &mut ends);
            for &end in &ends {
                if seen.insert((child, end)) {
                    stack.push((child, end, depth + 1));
                }
            }
        }
    }
    best.map_or(Permission::NONE, |(_, mask)| mask)
}
