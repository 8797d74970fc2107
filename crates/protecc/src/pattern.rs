//! Glob pattern parsing.
//!
//! A pattern is split into [`Element`]s, each of which becomes one trie node.
//! Supported syntax:
//!
//! * `*` matches any run of bytes without `/`, `**` any run including `/`;
//! * `?` matches a single byte other than `/`;
//! * `[abc]`, `[a-z]`, `[!abc]`/`[^abc]` match one byte from a set;
//! * a bracket expression may be followed by `+` (one or more), `*` (zero or
//!   more) or `?` (optional);
//! * `\x` escapes the next byte.

use crate::error::{Error, Result};

/// What a single trie node consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Literal(u8),
    AnyChar,
    AnyRun,
    AnyRecursive,
    Charset([u8; 32]),
    Range(u8, u8),
}

impl NodeKind {
    pub(crate) const LITERAL: u8 = 0;
    pub(crate) const ANY_CHAR: u8 = 1;
    pub(crate) const ANY_RUN: u8 = 2;
    pub(crate) const ANY_RECURSIVE: u8 = 3;
    pub(crate) const CHARSET: u8 = 4;
    pub(crate) const RANGE: u8 = 5;

    pub(crate) fn type_code(&self) -> u8 {
        match self {
            Self::Literal(_) => Self::LITERAL,
            Self::AnyChar => Self::ANY_CHAR,
            Self::AnyRun => Self::ANY_RUN,
            Self::AnyRecursive => Self::ANY_RECURSIVE,
            Self::Charset(_) => Self::CHARSET,
            Self::Range(..) => Self::RANGE,
        }
    }

    /// Packs the kind payload into the 32-byte data area of a node record.
    pub(crate) fn data(&self) -> [u8; 32] {
        let mut data = [0u8; 32];
        match *self {
            Self::Literal(c) => data[0] = c,
            Self::Range(lo, hi) => {
                data[0] = lo;
                data[1] = hi;
            }
            Self::Charset(set) => data = set,
            Self::AnyChar | Self::AnyRun | Self::AnyRecursive => {}
        }
        data
    }

    pub(crate) fn from_parts(code: u8, data: &[u8; 32]) -> Option<Self> {
        match code {
            Self::LITERAL => Some(Self::Literal(data[0])),
            Self::ANY_CHAR => Some(Self::AnyChar),
            Self::ANY_RUN => Some(Self::AnyRun),
            Self::ANY_RECURSIVE => Some(Self::AnyRecursive),
            Self::CHARSET => Some(Self::Charset(*data)),
            Self::RANGE if data[0] <= data[1] => Some(Self::Range(data[0], data[1])),
            _ => None,
        }
    }
}

/// Repetition applied to a node.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Modifier {
    #[default]
    None = 0,
    Optional = 1,
    OneOrMore = 2,
    ZeroOrMore = 3,
}

impl Modifier {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Optional),
            2 => Some(Self::OneOrMore),
            3 => Some(Self::ZeroOrMore),
            _ => None,
        }
    }
}

/// One parsed pattern element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Element {
    pub kind: NodeKind,
    pub modifier: Modifier,
}

impl Element {
    pub(crate) fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            modifier: Modifier::None,
        }
    }

    /// Run wildcards carry their own repetition and take no modifier.
    pub(crate) fn is_consistent(&self) -> bool {
        !matches!(self.kind, NodeKind::AnyRun | NodeKind::AnyRecursive)
            || self.modifier == Modifier::None
    }

    /// Whether the element can match without consuming input.
    pub(crate) fn nullable(&self) -> bool {
        matches!(self.kind, NodeKind::AnyRun | NodeKind::AnyRecursive)
            || matches!(self.modifier, Modifier::Optional | Modifier::ZeroOrMore)
    }

    /// Whether the element may consume more than one byte.
    pub(crate) fn repeats(&self) -> bool {
        matches!(self.kind, NodeKind::AnyRun | NodeKind::AnyRecursive)
            || matches!(self.modifier, Modifier::OneOrMore | Modifier::ZeroOrMore)
    }

    pub(crate) fn accepts(&self, byte: u8, case_insensitive: bool) -> bool {
        let test = |b: u8| match self.kind {
            NodeKind::Literal(c) => c == b,
            NodeKind::AnyChar | NodeKind::AnyRun => b != b'/',
            NodeKind::AnyRecursive => true,
            NodeKind::Charset(set) => charset_contains(&set, b),
            NodeKind::Range(lo, hi) => (lo..=hi).contains(&b),
        };
        if test(byte) {
            return true;
        }
        case_insensitive
            && byte.is_ascii_alphabetic()
            && (test(byte.to_ascii_lowercase()) || test(byte.to_ascii_uppercase()))
    }

    /// Pushes every input position at which this element can finish when
    /// started at `pos`.
    pub(crate) fn advance(
        &self,
        input: &[u8],
        pos: usize,
        case_insensitive: bool,
        ends: &mut Vec<usize>,
    ) {
        ends.clear();
        match self.kind {
            NodeKind::AnyRecursive => ends.extend(pos..=input.len()),
            NodeKind::AnyRun => {
                let stop = input[pos..]
                    .iter()
                    .position(|&b| b == b'/')
                    .map_or(input.len(), |offset| pos + offset);
                ends.extend(pos..=stop);
            }
            _ => {
                let limit = if self.repeats() { input.len() - pos } else { 1 };
                let run = input[pos..]
                    .iter()
                    .take(limit)
                    .take_while(|&&b| self.accepts(b, case_insensitive))
                    .count();
                match self.modifier {
                    Modifier::None => {
                        if run >= 1 {
                            ends.push(pos + 1);
                        }
                    }
                    Modifier::Optional => {
                        ends.push(pos);
                        if run >= 1 {
                            ends.push(pos + 1);
                        }
                    }
                    Modifier::OneOrMore => ends.extend((1..=run).map(|k| pos + k)),
                    Modifier::ZeroOrMore => ends.extend((0..=run).map(|k| pos + k)),
                }
            }
        }
    }
}

pub(crate) fn charset_contains(set: &[u8; 32], byte: u8) -> bool {
    set[usize::from(byte / 8)] & (1 << (byte % 8)) != 0
}

fn charset_insert(set: &mut [u8; 32], byte: u8) {
    set[usize::from(byte / 8)] |= 1 << (byte % 8);
}

fn charset_remove(set: &mut [u8; 32], byte: u8) {
    set[usize::from(byte / 8)] &= !(1 << (byte % 8));
}

/// Splits a glob into elements.
pub fn parse(pattern: &str) -> Result<Vec<Element>> {
    if pattern.is_empty() {
        return Err(Error::InvalidArgument("pattern must not be empty".into()));
    }
    if pattern.contains('\0') {
        return Err(Error::pattern(pattern, "NUL byte in pattern"));
    }
    let bytes = pattern.as_bytes();
    let mut elements = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                let start = i;
                while bytes.get(i) == Some(&b'*') {
                    i += 1;
                }
                let kind = if i - start == 1 {
                    NodeKind::AnyRun
                } else {
                    NodeKind::AnyRecursive
                };
                elements.push(Element::new(kind));
            }
            b'?' => {
                elements.push(Element::new(NodeKind::AnyChar));
                i += 1;
            }
            b'[' => {
                let (kind, next) = parse_bracket(pattern, i)?;
                i = next;
                let modifier = match bytes.get(i) {
                    Some(b'+') => Modifier::OneOrMore,
                    Some(b'*') => Modifier::ZeroOrMore,
                    Some(b'?') => Modifier::Optional,
                    _ => Modifier::None,
                };
                if modifier != Modifier::None {
                    i += 1;
                }
                elements.push(Element { kind, modifier });
            }
            b']' => return Err(Error::pattern(pattern, "unbalanced ']'")),
            b'\\' => {
                let Some(&c) = bytes.get(i + 1) else {
                    return Err(Error::pattern(pattern, "dangling escape"));
                };
                elements.push(Element::new(NodeKind::Literal(c)));
                i += 2;
            }
            c => {
                elements.push(Element::new(NodeKind::Literal(c)));
                i += 1;
            }
        }
    }
    Ok(elements)
}

fn parse_bracket(pattern: &str, open: usize) -> Result<(NodeKind, usize)> {
    let bytes = pattern.as_bytes();
    let unterminated = || Error::pattern(pattern, "unterminated bracket expression");
    let mut i = open + 1;
    let negate = matches!(bytes.get(i), Some(b'!' | b'^'));
    if negate {
        i += 1;
    }

    let mut ranges: Vec<(u8, u8)> = Vec::new();
    let mut first = true;
    loop {
        let &c = bytes.get(i).ok_or_else(unterminated)?;
        if c == b']' && !first {
            i += 1;
            break;
        }
        first = false;
        let lo = if c == b'\\' {
            i += 1;
            *bytes.get(i).ok_or_else(unterminated)?
        } else {
            c
        };
        i += 1;
        if bytes.get(i) == Some(&b'-') && bytes.get(i + 1).is_some_and(|&n| n != b']') {
            let mut hi = bytes[i + 1];
            i += 2;
            if hi == b'\\' {
                hi = *bytes.get(i).ok_or_else(unterminated)?;
                i += 1;
            }
            if hi < lo {
                return Err(Error::pattern(
                    pattern,
                    format!("reversed range '{}-{}'", lo as char, hi as char),
                ));
            }
            ranges.push((lo, hi));
        } else {
            ranges.push((lo, lo));
        }
    }

    if !negate
        && let &[(lo, hi)] = ranges.as_slice()
        && lo != hi
    {
        return Ok((NodeKind::Range(lo, hi), i));
    }

    let mut set = [0u8; 32];
    for (lo, hi) in ranges {
        for b in lo..=hi {
            charset_insert(&mut set, b);
        }
    }
    if negate {
        for byte in set.iter_mut() {
            *byte = !*byte;
        }
        charset_remove(&mut set, b'/');
        charset_remove(&mut set, 0);
    }
    if set.iter().all(|&b| b == 0) {
        return Err(Error::pattern(pattern, "empty character set"));
    }
    Ok((NodeKind::Charset(set), i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn kinds(pattern: &str) -> Vec<NodeKind> {
        parse(pattern)
            .expect("pattern parses")
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    #[test]
    fn stars_collapse_into_run_or_recursive() {
        assert_eq!(
            kinds("/a/*"),
            vec![
                NodeKind::Literal(b'/'),
                NodeKind::Literal(b'a'),
                NodeKind::Literal(b'/'),
                NodeKind::AnyRun
            ]
        );
        assert_eq!(kinds("***").as_slice(), &[NodeKind::AnyRecursive]);
    }

    #[test]
    fn single_range_stays_range() {
        let elements = parse("[0-9]+").unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].kind, NodeKind::Range(b'0', b'9'));
        assert_eq!(elements[0].modifier, Modifier::OneOrMore);
    }

    #[test]
    fn negated_sets_never_match_slash() {
        let elements = parse("[!a]").unwrap();
        assert!(!elements[0].accepts(b'/', false));
        assert!(!elements[0].accepts(b'a', false));
        assert!(elements[0].accepts(b'b', false));
    }

    #[test]
    fn leading_bracket_is_a_member() {
        let elements = parse("[]a]").unwrap();
        assert!(elements[0].accepts(b']', false));
        assert!(elements[0].accepts(b'a', false));
    }

    #[test]
    fn escapes_produce_literals() {
        assert_eq!(
            kinds(r"\*\["),
            vec![NodeKind::Literal(b'*'), NodeKind::Literal(b'[')]
        );
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for pattern in ["[abc", "a]", "[z-a]", "[!", "abc\\", "a\0b"] {
            let err = parse(pattern).expect_err(pattern);
            assert_eq!(err.kind(), ErrorKind::InvalidPattern, "{pattern}");
        }
        assert_eq!(parse("").unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn case_insensitive_accepts_both_cases() {
        let element = Element::new(NodeKind::Range(b'a', b'f'));
        assert!(!element.accepts(b'C', false));
        assert!(element.accepts(b'C', true));
    }

    #[test]
    fn advance_enumerates_run_lengths() {
        let element = Element {
            kind: NodeKind::Range(b'0', b'9'),
            modifier: Modifier::OneOrMore,
        };
        let mut ends = Vec::new();
        element.advance(b"x123y", 1, false, &mut ends);
        assert_eq!(ends, vec![2, 3, 4]);

        Element::new(NodeKind::AnyRun).advance(b"ab/c", 0, false, &mut ends);
        assert_eq!(ends, vec![0, 1, 2]);
    }
}
