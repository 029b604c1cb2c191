//! Topic patterns for event subscriptions.
//!
//! Topics are dot-separated segments (`bucket.orders.inserted`). A pattern
//! may use `*` for any single segment; there is no multi-segment wildcard.

/// A compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

impl TopicPattern {
    /// Compile a pattern. Every `*` segment matches exactly one topic
    /// segment.
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|s| {
                if s == "*" {
                    Segment::Any
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    /// Match a concrete topic. Segment counts must agree.
    pub fn matches(&self, topic: &str) -> bool {
        let mut actual = topic.split('.');
        for segment in &self.segments {
            match (actual.next(), segment) {
                (Some(_), Segment::Any) => {}
                (Some(s), Segment::Literal(lit)) if s == lit => {}
                _ => return false,
            }
        }
        actual.next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        let p = TopicPattern::new("bucket.orders.inserted");
        assert!(p.matches("bucket.orders.inserted"));
        assert!(!p.matches("bucket.orders.deleted"));
        assert!(!p.matches("bucket.stock.inserted"));
    }

    #[test]
    fn test_single_segment_wildcard() {
        let p = TopicPattern::new("bucket.*.inserted");
        assert!(p.matches("bucket.orders.inserted"));
        assert!(p.matches("bucket.stock.inserted"));
        assert!(!p.matches("bucket.orders.updated"));
    }

    #[test]
    fn test_wildcard_matches_exactly_one_segment() {
        let p = TopicPattern::new("bucket.*");
        assert!(p.matches("bucket.orders"));
        assert!(!p.matches("bucket.orders.inserted"));
        assert!(!p.matches("bucket"));
    }

    #[test]
    fn test_all_wildcards() {
        let p = TopicPattern::new("bucket.*.*");
        assert!(p.matches("bucket.orders.inserted"));
        assert!(p.matches("bucket.cache.deleted"));
        assert!(!p.matches("query.orders.inserted"));
        assert!(!p.matches("bucket.orders"));
    }

    #[test]
    fn test_segment_count_must_agree() {
        let p = TopicPattern::new("*.*");
        assert!(p.matches("a.b"));
        assert!(!p.matches("a"));
        assert!(!p.matches("a.b.c"));
    }
}
