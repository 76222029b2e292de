use std::time::Duration as StdDuration;

use time::Duration;

/// Number of maximal whitespace-separated tokens in `text`.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Rules governing a checkout: how long it lasts and what a contribution
/// must look like to be accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutPolicy {
    pub checkout_duration: Duration,
    pub min_words: usize,
    pub max_words: usize,
    /// Cumulative word count at which a checkin finishes the story.
    pub finish_at_words: Option<u64>,
    /// Upper bound on any single call to the content store.
    pub remote_timeout: StdDuration,
}

impl Default for CheckoutPolicy {
    fn default() -> Self {
        // Contributions aim for 1000-1250 words.
        Self {
            checkout_duration: Duration::days(7),
            min_words: 50,
            max_words: 1312,
            finish_at_words: None,
            remote_timeout: StdDuration::from_secs(30),
        }
    }
}

impl CheckoutPolicy {
    pub fn accepts(&self, word_count: usize) -> bool {
        (self.min_words..=self.max_words).contains(&word_count)
    }

    pub fn finishes(&self, total_words: u64) -> bool {
        self.finish_at_words.is_some_and(|limit| total_words >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_words() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("   \n\t "), 0);
        assert_eq!(count_words("one"), 1);
        assert_eq!(count_words("  one  two\n\nthree\tfour  "), 4);
        assert_eq!(count_words("don't stop-now"), 2);
    }

    #[test]
    fn test_default_bounds_are_inclusive() {
        let policy = CheckoutPolicy::default();
        assert!(!policy.accepts(49));
        assert!(policy.accepts(50));
        assert!(policy.accepts(1312));
        assert!(!policy.accepts(1313));
    }

    #[test]
    fn test_finish_threshold() {
        let mut policy = CheckoutPolicy::default();
        assert!(!policy.finishes(1_000_000));
        policy.finish_at_words = Some(5000);
        assert!(!policy.finishes(4999));
        assert!(policy.finishes(5000));
    }
}
