//! Wildcard matching for URL components used by filters and verifiers

/// A compiled `*` wildcard pattern.
///
/// `*` matches any sequence of characters (including none); every other
/// character is literal. Consecutive wildcards collapse into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatcher {
    pattern: String,
    segments: Vec<Segment>,
    ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Self {
        Self::build(pattern, false)
    }

    /// Pattern compared ASCII-case-insensitively, for hosts and schemes
    pub fn ignore_case(pattern: &str) -> Self {
        Self::build(pattern, true)
    }

    fn build(pattern: &str, ignore_case: bool) -> Self {
        let source = if ignore_case {
            pattern.to_ascii_lowercase()
        } else {
            pattern.to_string()
        };

        let mut segments = Vec::new();
        for (i, literal) in source.split('*').enumerate() {
            if i > 0 && segments.last() != Some(&Segment::Wildcard) {
                segments.push(Segment::Wildcard);
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }
        }

        Self {
            pattern: pattern.to_string(),
            segments,
            ignore_case,
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let lowered;
        let mut rest = if self.ignore_case {
            lowered = text.to_ascii_lowercase();
            lowered.as_str()
        } else {
            text
        };

        let mut segments = self.segments.as_slice();

        // Anchor the leading literal, if any
        if let Some(Segment::Literal(lit)) = segments.first() {
            match rest.strip_prefix(lit.as_str()) {
                Some(r) => rest = r,
                None => return false,
            }
            segments = &segments[1..];
        }

        // Anchor the trailing literal, if any
        let mut tail: Option<&str> = None;
        if let Some(Segment::Literal(lit)) = segments.last() {
            tail = Some(lit.as_str());
            segments = &segments[..segments.len() - 1];
        }
        if let Some(lit) = tail {
            match rest.strip_suffix(lit) {
                Some(r) => rest = r,
                None => return false,
            }
        }

        if segments.is_empty() {
            return rest.is_empty();
        }

        // Only `*lit*lit*...*` remains: leftmost match of each literal is optimal
        for segment in segments {
            if let Segment::Literal(lit) = segment {
                match rest.find(lit.as_str()) {
                    Some(idx) => rest = &rest[idx + lit.len()..],
                    None => return false,
                }
            }
        }
        true
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }
}
