//! IMAP command tag generation.
//!
//! Tags match commands with their tagged completion responses.

use std::sync::atomic::{AtomicU32, Ordering};

/// Generates unique sequential tags in the format "A0001", "A0002", ...
#[derive(Debug, Default)]
pub struct TagGenerator {
    counter: AtomicU32,
}

impl TagGenerator {
    /// Creates a new tag generator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Generates the next tag.
    #[must_use]
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("A{:04}", n + 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_sequential() {
        let tags = TagGenerator::new();
        assert_eq!(tags.next(), "A0001");
        assert_eq!(tags.next(), "A0002");
        assert_eq!(tags.next(), "A0003");
    }
}
