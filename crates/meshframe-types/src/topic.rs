//! Hierarchical dotted topics and wildcard subscription patterns.
//!
//! A topic is a dot-separated path such as `task.response.weather`. A
//! pattern may replace any single segment with `*` or a run of trailing (or
//! interior) segments with `**`. See `spec.md` §3 and §4.1 for the exact
//! matching semantics implemented here.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors raised while parsing a topic or topic pattern.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TopicError {
    /// The topic or pattern string contained an empty segment (e.g. `a..b`).
    #[error("topic '{0}' contains an empty segment")]
    EmptySegment(String),
    /// Two wildcard segments of kind `**` were adjacent, which is ambiguous.
    #[error("pattern '{0}' has adjacent '**' segments")]
    AdjacentDoubleWildcard(String),
}

/// A validated, concrete (non-wildcard) hierarchical topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Parse and validate a concrete topic string.
    pub fn new(raw: impl Into<String>) -> Result<Self, TopicError> {
        let raw = raw.into();
        if raw.is_empty() || raw.split('.').any(|seg| seg.is_empty()) {
            return Err(TopicError::EmptySegment(raw));
        }
        Ok(Self(raw))
    }

    /// Borrow the dotted-path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode this topic as a reverse-DNS CloudEvents `type`, e.g.
    /// `task.response.weather` under namespace `com.example` becomes
    /// `com.example.task.response.weather`. See DESIGN.md for why the
    /// reverse-DNS form is a bridging conversion rather than the default
    /// wire representation.
    pub fn to_reverse_dns(&self, namespace: &str) -> String {
        format!("{namespace}.{}", self.0)
    }

    /// Recover a topic from a reverse-DNS CloudEvents `type`, given the
    /// namespace prefix used to construct it. Returns `None` if `ty` does
    /// not start with `namespace.`.
    pub fn from_reverse_dns(ty: &str, namespace: &str) -> Option<Self> {
        let prefix = format!("{namespace}.");
        ty.strip_prefix(&prefix).map(|rest| Self(rest.to_string()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Star,
    DoubleStar,
}

/// A compiled hierarchical wildcard pattern against which topics are matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compile a pattern once; reuse the result for repeated matching.
    pub fn new(raw: impl Into<String>) -> Result<Self, TopicError> {
        let raw = raw.into();
        let segments = if raw.is_empty() {
            Vec::new()
        } else {
            let mut segs = Vec::new();
            for part in raw.split('.') {
                if part.is_empty() {
                    return Err(TopicError::EmptySegment(raw));
                }
                segs.push(match part {
                    "*" => Segment::Star,
                    "**" => Segment::DoubleStar,
                    lit => Segment::Literal(lit.to_string()),
                });
            }
            for pair in segs.windows(2) {
                if pair[0] == Segment::DoubleStar && pair[1] == Segment::DoubleStar {
                    return Err(TopicError::AdjacentDoubleWildcard(raw));
                }
            }
            segs
        };
        Ok(Self { raw, segments })
    }

    /// The original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `topic` matches this pattern. An empty pattern matches
    /// nothing, per `spec.md` §3.
    pub fn matches(&self, topic: &str) -> bool {
        if self.segments.is_empty() {
            return false;
        }
        let topic_segments: Vec<&str> = topic.split('.').collect();
        Self::match_from(&self.segments, &topic_segments)
    }

    fn match_from(pattern: &[Segment], topic: &[&str]) -> bool {
        match pattern.first() {
            None => topic.is_empty(),
            Some(Segment::Literal(lit)) => match topic.first() {
                Some(seg) if seg == lit => Self::match_from(&pattern[1..], &topic[1..]),
                _ => false,
            },
            Some(Segment::Star) => {
                if topic.is_empty() {
                    false
                } else {
                    Self::match_from(&pattern[1..], &topic[1..])
                }
            }
            Some(Segment::DoubleStar) => (0..=topic.len())
                .any(|take| Self::match_from(&pattern[1..], &topic[take..])),
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exact_topic_only() {
        let p = TopicPattern::new("task.response.weather").unwrap();
        assert!(p.matches("task.response.weather"));
        assert!(!p.matches("task.response.travel"));
    }

    #[test]
    fn single_star_matches_exactly_one_segment() {
        let p = TopicPattern::new("travel.*").unwrap();
        assert!(p.matches("travel.request"));
        assert!(!p.matches("travel.request.plan.step1"));
    }

    #[test]
    fn double_star_matches_trailing_suffix_including_empty() {
        let p = TopicPattern::new("travel.**").unwrap();
        assert!(p.matches("travel.request"));
        assert!(p.matches("travel.request.plan.step1"));
        assert!(p.matches("travel"));
    }

    #[test]
    fn double_star_matches_interior_gap() {
        let p = TopicPattern::new("task.**.dlq").unwrap();
        assert!(p.matches("task.dlq"));
        assert!(p.matches("task.response.weather.dlq"));
        assert!(!p.matches("task.response.weather"));
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        let p = TopicPattern::new("").unwrap();
        assert!(!p.matches(""));
        assert!(!p.matches("anything"));
    }

    #[test]
    fn rejects_adjacent_double_wildcards() {
        assert!(TopicPattern::new("a.**.**.b").is_err());
    }

    #[test]
    fn topic_reverse_dns_round_trips() {
        let topic = Topic::new("task.response.weather").unwrap();
        let encoded = topic.to_reverse_dns("com.example");
        assert_eq!(encoded, "com.example.task.response.weather");
        let decoded = Topic::from_reverse_dns(&encoded, "com.example").unwrap();
        assert_eq!(decoded, topic);
    }
}
