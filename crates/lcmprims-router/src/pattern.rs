use std::fmt;

use crate::error::{Result, RouterError};

/// Wildcard token in patterns.
pub const WILDCARD: &str = "*";

/// How a `*` token matches channel tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WildcardMode {
    /// `*` matches one or more tokens: `foo.*` matches `foo.bar.baz`.
    #[default]
    MultiSegment,
    /// `*` matches exactly one token: `foo.*` matches `foo.bar` only.
    SingleSegment,
}

/// Glob matching rules shared by every pattern in a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchConfig {
    /// Token separator in channel names.
    pub separator: char,
    pub wildcard: WildcardMode,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            separator: '.',
            wildcard: WildcardMode::MultiSegment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Wildcard,
}

/// A parsed subscription pattern: an exact channel name or a glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    raw: String,
    /// `None` for exact patterns.
    tokens: Option<Vec<Token>>,
    config: MatchConfig,
}

impl ChannelPattern {
    /// Parse a pattern under the given matching rules.
    ///
    /// `*` must be a whole token; `fo*` and `a.*b` are rejected.
    pub fn parse(pattern: &str, config: MatchConfig) -> Result<Self> {
        let invalid = |reason| RouterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        if !pattern.contains(WILDCARD) {
            return Ok(Self {
                raw: pattern.to_string(),
                tokens: None,
                config,
            });
        }

        let tokens = pattern
            .split(config.separator)
            .map(|token| match token {
                WILDCARD => Ok(Token::Wildcard),
                "" => Err(invalid("glob pattern has an empty token")),
                t if t.contains(WILDCARD) => Err(invalid("wildcard must be a whole token")),
                t => Ok(Token::Literal(t.to_string())),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            tokens: Some(tokens),
            config,
        })
    }

    /// Parse with the default matching rules.
    pub fn new(pattern: &str) -> Result<Self> {
        Self::parse(pattern, MatchConfig::default())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_exact(&self) -> bool {
        self.tokens.is_none()
    }

    pub fn matches(&self, channel: &str) -> bool {
        match &self.tokens {
            None => self.raw == channel,
            Some(tokens) => {
                let parts: Vec<&str> = channel.split(self.config.separator).collect();
                match_tokens(tokens, &parts, self.config.wildcard)
            }
        }
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Greedy glob match in O(pattern x channel) steps.
///
/// A multi-segment `*` first takes one token. On a later mismatch the most
/// recent `*` takes one more token and matching resumes after it.
fn match_tokens(pattern: &[Token], channel: &[&str], mode: WildcardMode) -> bool {
    let (mut p, mut c) = (0, 0);
    // (pattern index after the last `*`, channel index where its tail starts)
    let mut resume: Option<(usize, usize)> = None;

    while c < channel.len() {
        match pattern.get(p) {
            Some(Token::Literal(literal)) if literal == channel[c] => {
                p += 1;
                c += 1;
            }
            Some(Token::Wildcard) => {
                p += 1;
                c += 1;
                if mode == WildcardMode::MultiSegment {
                    resume = Some((p, c));
                }
            }
            _ => match resume {
                Some((after_star, tail)) => {
                    p = after_star;
                    c = tail + 1;
                    resume = Some((after_star, c));
                }
                None => return false,
            },
        }
    }
    p == pattern.len()
}
