//! Transcript aggregation for one direction of the conversation
//!
//! The Live API streams transcriptions as small fragments ("hel", "lo").
//! One aggregator per speaker accumulates them until the turn completes,
//! then hands back the finished text and starts over.
//!
//! # Aggregation Strategy
//!
//! - **Fragments**: Appended verbatim as they arrive (spacing is the service's)
//! - **Flush**: Trimmed; whitespace-only text counts as nothing said

/// Accumulates transcript fragments for a single speaker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptAggregator {
    /// Accumulated text since the last flush
    text: String,
    /// Count of non-empty fragments processed
    fragment_count: u64,
}

impl TranscriptAggregator {
    /// Create a new empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an incoming fragment
    ///
    /// Returns the new accumulated text.
    pub fn process_fragment(&mut self, fragment: &str) -> &str {
        if !fragment.is_empty() {
            self.text.push_str(fragment);
            self.fragment_count += 1;

            if self.fragment_count % 10 == 0 {
                log::debug!(
                    "TranscriptAggregator: {} fragments, {} chars accumulated",
                    self.fragment_count,
                    self.text.len()
                );
            }
        }
        &self.text
    }

    /// Accumulated text, untrimmed
    pub fn current_text(&self) -> &str {
        &self.text
    }

    /// True when there is something besides whitespace to flush
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    pub fn fragment_count(&self) -> u64 {
        self.fragment_count
    }

    /// Take the finished turn text and reset
    ///
    /// Returns `None` when nothing but whitespace was accumulated.
    pub fn take_text(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.text);
        self.fragment_count = 0;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Discard accumulated text
    pub fn reset(&mut self) {
        self.text.clear();
        self.fragment_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_aggregator_is_empty() {
        let agg = TranscriptAggregator::new();
        assert!(!agg.has_text());
        assert_eq!(agg.current_text(), "");
        assert_eq!(agg.fragment_count(), 0);
    }

    #[test]
    fn test_multiple_fragments() {
        let mut agg = TranscriptAggregator::new();
        agg.process_fragment("hel");
        let result = agg.process_fragment("lo");
        assert_eq!(result, "hello");
        assert_eq!(agg.fragment_count(), 2);
        assert!(agg.has_text());
    }

    #[test]
    fn test_empty_fragment_ignored() {
        let mut agg = TranscriptAggregator::new();
        agg.process_fragment("Hello");
        agg.process_fragment("");
        agg.process_fragment(" world");
        assert_eq!(agg.current_text(), "Hello world");
        assert_eq!(agg.fragment_count(), 2); // Empty fragment not counted
    }

    #[test]
    fn test_take_text_trims_and_resets() {
        let mut agg = TranscriptAggregator::new();
        agg.process_fragment(" How are");
        agg.process_fragment(" you? ");

        assert_eq!(agg.take_text().as_deref(), Some("How are you?"));
        assert!(!agg.has_text());
        assert_eq!(agg.fragment_count(), 0);
        assert_eq!(agg.take_text(), None);
    }

    #[test]
    fn test_whitespace_only_counts_as_empty() {
        let mut agg = TranscriptAggregator::new();
        agg.process_fragment("  ");
        agg.process_fragment("\n");
        assert!(!agg.has_text());
        assert_eq!(agg.take_text(), None);
        assert_eq!(agg.current_text(), "");
    }

    #[test]
    fn test_reset() {
        let mut agg = TranscriptAggregator::new();
        agg.process_fragment("Some text");
        agg.reset();
        assert!(!agg.has_text());
        assert_eq!(agg.fragment_count(), 0);
    }
}
