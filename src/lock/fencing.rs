//! Fencing token issuance.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues strictly increasing fencing tokens per lock id, plus an
/// independent global sequence.
#[derive(Debug, Default)]
pub struct FencingTokenGenerator {
    /// Last issued (or observed) token per lock id.
    tokens: DashMap<String, u64>,
    global: AtomicU64,
}

impl FencingTokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next token for `lock_id`. The first token is 1.
    pub fn next_token(&self, lock_id: &str) -> u64 {
        let mut entry = self.tokens.entry(lock_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Last issued token for `lock_id`, 0 if none.
    pub fn current_token(&self, lock_id: &str) -> u64 {
        self.tokens.get(lock_id).map(|t| *t).unwrap_or(0)
    }

    /// Raise the watermark for `lock_id` to at least `observed`.
    /// Returns the resulting watermark.
    pub fn update_token(&self, lock_id: &str, observed: u64) -> u64 {
        let mut entry = self.tokens.entry(lock_id.to_string()).or_insert(0);
        if observed > *entry {
            *entry = observed;
        }
        *entry
    }

    /// Next value of the global sequence. The first value is 1.
    pub fn next_global_token(&self) -> u64 {
        self.global.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of lock ids with a recorded watermark.
    pub fn tracked_locks(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_sequences_are_per_lock() {
        let gen = FencingTokenGenerator::new();
        assert_eq!(gen.current_token("a"), 0);
        assert_eq!(gen.next_token("a"), 1);
        assert_eq!(gen.next_token("a"), 2);
        assert_eq!(gen.next_token("b"), 1);
        assert_eq!(gen.next_token("a"), 3);
        assert_eq!(gen.current_token("a"), 3);
        assert_eq!(gen.current_token("b"), 1);
    }

    #[test]
    fn test_update_never_regresses() {
        let gen = FencingTokenGenerator::new();
        gen.next_token("a");
        assert_eq!(gen.update_token("a", 10), 10);
        assert_eq!(gen.update_token("a", 4), 10);
        assert_eq!(gen.next_token("a"), 11);
    }

    #[test]
    fn test_global_sequence_independent() {
        let gen = FencingTokenGenerator::new();
        gen.next_token("a");
        gen.next_token("a");
        assert_eq!(gen.next_global_token(), 1);
        assert_eq!(gen.next_global_token(), 2);
        assert_eq!(gen.next_token("a"), 3);
    }

    #[tokio::test]
    async fn test_concurrent_issuance_has_no_duplicates() {
        let gen = Arc::new(FencingTokenGenerator::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let gen = Arc::clone(&gen);
            handles.push(tokio::spawn(async move {
                (0..250).map(|_| gen.next_token("hot")).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();

        assert_eq!(all.len(), 2000);
        assert_eq!(gen.current_token("hot"), 2000);
    }

    proptest! {
        #[test]
        fn prop_next_token_exceeds_every_observation(
            ops in proptest::collection::vec(
                prop_oneof![Just(None), (0u64..1000).prop_map(Some)],
                1..64,
            )
        ) {
            let gen = FencingTokenGenerator::new();
            let mut max_seen = 0u64;
            let mut last_issued = 0u64;

            for op in ops {
                match op {
                    Some(observed) => {
                        gen.update_token("k", observed);
                        max_seen = max_seen.max(observed);
                    }
                    None => {
                        let token = gen.next_token("k");
                        prop_assert!(token > last_issued);
                        prop_assert!(token > max_seen);
                        last_issued = token;
                        max_seen = max_seen.max(token);
                    }
                }
            }
        }
    }
}
