use crate::error::{Error, Result};
use crate::perms::Permission;
use crate::trie::{ROOT, Trie, TrieNode};
use std::collections::{BTreeSet, HashMap};

/// State reached once no pattern can match any more.
pub const DEAD_STATE: u32 = 0;

/// Default bound on the number of states produced by subset construction.
pub const DEFAULT_MAX_STATES: usize = 8192;

/// Deterministic automaton built from a [`Trie`] by subset construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dfa {
    pub(crate) num_states: u32,
    pub(crate) num_classes: u32,
    pub(crate) start: u32,
    pub(crate) classmap: [u8; 256],
    pub(crate) accept: Vec<u32>,
    pub(crate) perms: Vec<u32>,
    pub(crate) transitions: Vec<u32>,
    pub(crate) case_insensitive: bool,
    pub(crate) num_patterns: u32,
    pub(crate) max_depth: u32,
    pub(crate) trie_nodes: u32,
}

impl Dfa {
    pub(crate) fn from_trie(trie: &Trie, max_states: usize) -> Result<Self> {
        let nodes = trie.nodes();
        let case_insensitive = trie.case_insensitive();
        let (classmap, representatives) = byte_classes(nodes, case_insensitive);
        let num_classes = representatives.len();

        let mut states: Vec<Vec<u32>> = vec![Vec::new()];
        let mut index: HashMap<Vec<u32>, u32> = HashMap::from([(Vec::new(), DEAD_STATE)]);
        let start_set = closure(nodes, BTreeSet::from([ROOT]));
        index.insert(start_set.clone(), 1);
        states.push(start_set);

        let mut transitions: Vec<u32> = Vec::new();
        let mut current = 0;
        while current < states.len() {
            for &byte in &representatives {
                let mut next = BTreeSet::new();
                for &id in &states[current] {
                    let node = &nodes[id as usize];
                    if id != ROOT
                        && node.element.repeats()
                        && node.element.accepts(byte, case_insensitive)
                    {
                        next.insert(id);
                    }
                    for &child in &node.children {
                        if nodes[child as usize]
                            .element
                            .accepts(byte, case_insensitive)
                        {
                            next.insert(child);
                        }
                    }
                }
                let key = closure(nodes, next);
                let target = match index.get(&key) {
                    Some(&target) => target,
                    None => {
                        if states.len() >= max_states {
                            log::error!(
                                target: "protecc",
                                "DFA construction exceeded {max_states} states"
                            );
                            return Err(Error::CompileFailed(format!(
                                "DFA exceeds {max_states} states"
                            )));
                        }
                        let target = states.len() as u32;
                        states
                            .try_reserve(1)
                            .map_err(|_| Error::OutOfMemory("growing the DFA state list"))?;
                        states.push(key.clone());
                        index.insert(key, target);
                        target
                    }
                };
                transitions
                    .try_reserve(1)
                    .map_err(|_| Error::OutOfMemory("growing the DFA transition table"))?;
                transitions.push(target);
            }
            current += 1;
        }

        let num_states = states.len();
        let mut accept = vec![0u32; num_states.div_ceil(32)];
        let mut perms = vec![0u32; num_states];
        for (state, set) in states.iter().enumerate() {
            if let Some(mask) = deepest_terminal(nodes, set) {
                accept[state / 32] |= 1 << (state % 32);
                perms[state] = mask.bits();
            }
        }

        log::debug!(
            target: "protecc",
            "built DFA with {num_states} states and {num_classes} classes from {} trie nodes",
            nodes.len()
        );

        Ok(Self {
            num_states: num_states as u32,
            num_classes: num_classes as u32,
            start: 1,
            classmap,
            accept,
            perms,
            transitions,
            case_insensitive,
            num_patterns: trie.num_patterns(),
            max_depth: trie.max_depth(),
            trie_nodes: nodes.len() as u32,
        })
    }

    pub fn num_states(&self) -> u32 {
        self.num_states
    }

    pub fn num_classes(&self) -> u32 {
        self.num_classes
    }

    pub fn start_state(&self) -> u32 {
        self.start
    }

    pub fn classmap(&self) -> &[u8; 256] {
        &self.classmap
    }

    pub fn transitions(&self) -> &[u32] {
        &self.transitions
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn is_accepting(&self, state: u32) -> bool {
        accept_bit(&self.accept, state)
    }

    /// Single pass over `input`.
    pub fn lookup(&self, input: &[u8]) -> Permission {
        let num_classes = self.num_classes as usize;
        let mut state = self.start;
        for &byte in input {
            let class = usize::from(self.classmap[usize::from(byte)]);
            state = self.transitions[state as usize * num_classes + class];
            if state == DEAD_STATE {
                return Permission::NONE;
            }
        }
        if self.is_accepting(state) {
            Permission::from_bits_truncate(self.perms[state as usize])
        } else {
            Permission::NONE
        }
    }
}

pub(crate) fn accept_bit(accept: &[u32], state: u32) -> bool {
    accept
        .get(state as usize / 32)
        .is_some_and(|word| word & (1 << (state % 32)) != 0)
}

/// Groups bytes that every node treats identically.
fn byte_classes(nodes: &[TrieNode], case_insensitive: bool) -> ([u8; 256], Vec<u8>) {
    let words = nodes.len().div_ceil(64);
    let mut signatures: HashMap<Vec<u64>, u8> = HashMap::new();
    let mut classmap = [0u8; 256];
    let mut representatives = Vec::new();
    for byte in 0..=u8::MAX {
        let mut signature = vec![0u64; words];
        for (id, node) in nodes.iter().enumerate().skip(1) {
            if node.element.accepts(byte, case_insensitive) {
                signature[id / 64] |= 1 << (id % 64);
            }
        }
        // At most 256 classes, so the index always fits.
        let next = representatives.len() as u8;
        let class = *signatures.entry(signature).or_insert_with(|| {
            representatives.push(byte);
            next
        });
        classmap[usize::from(byte)] = class;
    }
    (classmap, representatives)
}

/// Adds every node reachable through children that can match empty input.
fn closure(nodes: &[TrieNode], mut set: BTreeSet<u32>) -> Vec<u32> {
    let mut pending: Vec<u32> = set.iter().copied().collect();
    while let Some(id) = pending.pop() {
        for &child in &nodes[id as usize].children {
            if nodes[child as usize].element.nullable() && set.insert(child) {
                pending.push(child);
            }
        }
    }
    set.into_iter().collect()
}

fn deepest_terminal(nodes: &[TrieNode], set: &[u32]) -> Option<Permission> {
    let mut best: Option<(u32, Permission)> = None;
    for &id in set {
        let node = &nodes[id as usize];
        if !node.terminal {
            continue;
        }
        best = match best {
            Some((depth, mask)) if depth > node.depth => Some((depth, mask)),
            Some((depth, mask)) if depth == node.depth => Some((depth, mask | node.perms)),
            _ => Some((node.depth, node.perms)),
        };
    }
    best.map(|(_, mask)| mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pattern::parse;

    fn dfa(patterns: &[(&str, Permission)], case_insensitive: bool) -> Dfa {
        let mut trie = Trie::new(case_insensitive);
        for (pattern, perms) in patterns {
            trie.insert_pattern(&parse(pattern).unwrap(), *perms)
                .unwrap();
        }
        Dfa::from_trie(&trie, DEFAULT_MAX_STATES).unwrap()
    }

    #[test]
    fn every_transition_targets_a_valid_state() {
        let dfa = dfa(
            &[
                ("/usr/bin/*", Permission::READ | Permission::EXEC),
                ("/var/log/**", Permission::READ),
                ("/tmp/[a-z]+", Permission::WRITE),
            ],
            false,
        );
        assert_eq!(
            dfa.transitions().len(),
            (dfa.num_states() * dfa.num_classes()) as usize
        );
        assert!(dfa.transitions().iter().all(|&t| t < dfa.num_states()));
        assert!(dfa.classmap().iter().all(|&c| u32::from(c) < dfa.num_classes()));
    }

    #[test]
    fn literal_only_profile_collapses_classes() {
        let dfa = dfa(&[("/a", Permission::READ)], false);
        // '/', 'a', everything else
        assert_eq!(dfa.num_classes(), 3);
        assert_eq!(dfa.lookup(b"/a"), Permission::READ);
        assert_eq!(dfa.lookup(b"/b"), Permission::NONE);
        assert_eq!(dfa.lookup(b""), Permission::NONE);
    }

    #[test]
    fn deepest_match_survives_determinisation() {
        let dfa = dfa(
            &[
                ("/etc/*.conf", Permission::READ),
                ("/etc/app.conf", Permission::READ | Permission::WRITE),
            ],
            false,
        );
        assert_eq!(
            dfa.lookup(b"/etc/app.conf"),
            Permission::READ | Permission::WRITE
        );
        assert_eq!(dfa.lookup(b"/etc/x.conf"), Permission::READ);
    }

    #[test]
    fn case_insensitive_classes() {
        let dfa = dfa(&[("/Home/*", Permission::READ)], true);
        assert_eq!(dfa.lookup(b"/HOME/user"), Permission::READ);
        assert_eq!(dfa.lookup(b"/home/user"), Permission::READ);
    }

    #[test]
    fn state_limit_is_enforced() {
        let mut trie = Trie::new(false);
        trie.insert_pattern(&parse("/**a?????").unwrap(), Permission::READ)
            .unwrap();
        let err = Dfa::from_trie(&trie, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileFailed);
    }
}
