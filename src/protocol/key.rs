//! Feedback keys
//!
//! A `FeedbackKey` identifies a subscribable attribute path on the endpoint.
//! Segments are normalised to lowercase on construction, so equality and
//! hashing are case-insensitive.

use std::fmt;

/// Normalised, ordered path of segments (e.g. `status/call`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedbackKey {
    segments: Vec<String>,
}

impl FeedbackKey {
    /// Create a key from individual segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Parse a slash-separated path (`/Status/Call`, `status/call`)
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('/'))
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, if any
    pub fn first(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Whether the key has no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Key extended by one more segment
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        let mut key = self.clone();
        let segment = segment.as_ref().trim().to_lowercase();
        if !segment.is_empty() {
            key.segments.push(segment);
        }
        key
    }

    /// Key extended by an item-qualified segment (`call[7]`)
    pub fn item_child(&self, segment: impl AsRef<str>, item: impl fmt::Display) -> Self {
        self.child(format!("{}[{}]", segment.as_ref(), item))
    }

    /// Slash-prefixed path form used in command text
    pub fn to_path(&self) -> String {
        let mut path = String::new();
        for segment in &self.segments {
            path.push('/');
            path.push_str(segment);
        }
        path
    }
}

impl fmt::Display for FeedbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl From<&str> for FeedbackKey {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_case_insensitive_equality() {
        let a = FeedbackKey::parse("/Status/Call");
        let b = FeedbackKey::new(["status", "CALL"]);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_empty_segments_dropped() {
        let key = FeedbackKey::parse("//Status//Audio/");
        assert_eq!(key.segments(), &["status", "audio"]);
        assert_eq!(key.to_path(), "/status/audio");
    }

    #[test]
    fn test_item_child() {
        let key = FeedbackKey::parse("Status").item_child("Call", 7);
        assert_eq!(key.to_string(), "status/call[7]");
        assert_eq!(key, FeedbackKey::parse("status/Call[7]"));
    }
}
