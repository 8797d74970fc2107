//! Basename rules: a wildcard pattern restricted to the last path segment.
//!
//! Tokens are literals, `[0-9]` (one digit) and `[0-9]+` (one or more
//! digits). A single `*` is allowed as the final character and accepts any
//! remaining suffix. Without it, the rule must end in a literal.
//!
//! `[0-9]*` is rejected: in a path pattern the `*` quantifies the bracket
//! (zero or more digits), which no basename token expresses.

use crate::error::{Error, Result};

const DIGIT_PLUS: &str = "[0-9]+";
const DIGIT_ONE: &str = "[0-9]";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BasenameToken {
    Literal(String),
    DigitOne,
    DigitPlus,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BasenameRule {
    tokens: Vec<BasenameToken>,
    tail_wildcard: bool,
}

impl BasenameRule {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidArgument("basename pattern must not be empty".into()));
        }
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut tail_wildcard = false;
        let mut rest = pattern;

        while let Some(c) = rest.chars().next() {
            if rest.starts_with(DIGIT_PLUS) || rest.starts_with(DIGIT_ONE) {
                if !literal.is_empty() {
                    tokens.push(BasenameToken::Literal(std::mem::take(&mut literal)));
                }
                if rest.starts_with(DIGIT_PLUS) {
                    tokens.push(BasenameToken::DigitPlus);
                    rest = &rest[DIGIT_PLUS.len()..];
                } else {
                    rest = &rest[DIGIT_ONE.len()..];
                    if rest.starts_with('*') {
                        return Err(Error::pattern(
                            pattern,
                            "'[0-9]*' repeats the digit set and is not a basename token",
                        ));
                    }
                    tokens.push(BasenameToken::DigitOne);
                }
                continue;
            }
            match c {
                '*' if rest.len() == 1 => tail_wildcard = true,
                '*' => {
                    return Err(Error::pattern(
                        pattern,
                        "'*' is only allowed at the end of a basename rule",
                    ));
                }
                '/' | '?' | '[' | ']' | '\\' | '\0' => {
                    return Err(Error::pattern(
                        pattern,
                        format!("character '{}' is not allowed in a basename rule", c.escape_default()),
                    ));
                }
                c => literal.push(c),
            }
            rest = &rest[c.len_utf8()..];
        }
        if !literal.is_empty() {
            tokens.push(BasenameToken::Literal(literal));
        }
        if !tail_wildcard && !matches!(tokens.last(), Some(BasenameToken::Literal(_))) {
            return Err(Error::pattern(
                pattern,
                "basename rule must end with a literal or '*'",
            ));
        }
        Ok(Self {
            tokens,
            tail_wildcard,
        })
    }

    pub fn tokens(&self) -> &[BasenameToken] {
        &self.tokens
    }

    pub fn tail_wildcard(&self) -> bool {
        self.tail_wildcard
    }

    /// Userspace evaluation of the rule against a single path segment.
    pub fn matches(&self, name: &str) -> bool {
        match_tokens(&self.tokens, name.as_bytes(), self.tail_wildcard)
    }
}

fn match_tokens(tokens: &[BasenameToken], name: &[u8], tail_wildcard: bool) -> bool {
    let Some((token, rest)) = tokens.split_first() else {
        return tail_wildcard || name.is_empty();
    };
    match token {
        BasenameToken::Literal(text) => name
            .strip_prefix(text.as_bytes())
            .is_some_and(|remaining| match_tokens(rest, remaining, tail_wildcard)),
        BasenameToken::DigitOne => {
            name.first().is_some_and(u8::is_ascii_digit)
                && match_tokens(rest, &name[1..], tail_wildcard)
        }
        BasenameToken::DigitPlus => {
            let run = name.iter().take_while(|b| b.is_ascii_digit()).count();
            (1..=run)
                .rev()
                .any(|len| match_tokens(rest, &name[len..], tail_wildcard))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn numbered_logs() {
        let rule = BasenameRule::parse("log-[0-9]+.txt").unwrap();
        assert_eq!(
            rule.tokens(),
            &[
                BasenameToken::Literal("log-".into()),
                BasenameToken::DigitPlus,
                BasenameToken::Literal(".txt".into()),
            ]
        );
        assert!(rule.matches("log-42.txt"));
        assert!(rule.matches("log-1.txt"));
        assert!(!rule.matches("log-.txt"));
        assert!(!rule.matches("log-1a.txt"));
    }

    #[test]
    fn single_digit_and_tail_wildcard() {
        let rule = BasenameRule::parse("pts[0-9]-*").unwrap();
        assert!(rule.tail_wildcard());
        assert!(rule.matches("pts1-"));
        assert!(rule.matches("pts1-extra"));
        assert!(!rule.matches("pts-1"));
        assert!(!rule.matches("pts12-x"));
    }

    #[test]
    fn repeated_digit_set_is_not_a_token() {
        let err = BasenameRule::parse("tty[0-9]*").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPattern);
    }

    #[test]
    fn accepted_rules_agree_with_the_path_matcher() {
        let names = ["log-", "log-1", "log-12.txt", "log-1.txt", "log-x", "core.7", "core.7-a"];
        for pattern in ["log-[0-9]+.txt", "log-[0-9]*", "core.[0-9]", "core.[0-9]-*", "log-*"] {
            let rule = match BasenameRule::parse(pattern) {
                Ok(rule) => rule,
                Err(_) => continue,
            };
            let mut builder = crate::ProfileBuilder::new();
            builder
                .add_pattern(&format!("/d/{pattern}"), crate::Permission::READ)
                .unwrap();
            let profile = builder.compile(&crate::CompileConfig::default()).unwrap();
            for name in names {
                assert_eq!(
                    rule.matches(name),
                    profile.check(&format!("/d/{name}"), crate::Permission::READ),
                    "{pattern} vs {name}"
                );
            }
        }
    }

    #[test]
    fn trailing_digits_need_literal_or_wildcard() {
        let err = BasenameRule::parse("core.[0-9]+").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPattern);
        assert!(BasenameRule::parse("core.[0-9]+*").is_ok());
    }

    #[test]
    fn disallowed_characters() {
        for pattern in ["a/b", "a?c", "[a-z].txt", "a*b", "x\\y"] {
            let err = BasenameRule::parse(pattern).expect_err(pattern);
            assert_eq!(err.kind(), ErrorKind::InvalidPattern, "{pattern}");
        }
        assert_eq!(
            BasenameRule::parse("").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
