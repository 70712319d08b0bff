// matcher.rs — CPU reference brute-force Hamming matcher and the mutual
// cross-check filter.
//
// For each source descriptor: scan every target, keep the argmin Hamming
// distance, accept only strictly below the threshold, else the NO_MATCH
// sentinel. Ties resolve to the lowest target index because the scan only
// replaces on strict improvement. O(countA × countB) — this is the loop the
// GPU kernel (shaders/matcher.wgsl) parallelizes one source slot per thread.

use crate::descriptor::Descriptor;

/// Sentinel best-index meaning "no target within the threshold".
pub const NO_MATCH: i32 = -1;

/// Matching configuration.
#[derive(Clone, Copy, Debug)]
pub struct MatcherConfig {
    /// Acceptance is strict: distance < threshold.
    pub threshold: u32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig { threshold: 12 }
    }
}

impl MatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter for the acceptance threshold.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }
}

/// An accepted pair of slot indices into the original keypoint lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Correspondence {
    pub source: usize,
    pub target: usize,
}

/// Best-target index per source slot. Output length equals `source.len()`;
/// entries are either a valid index into `targets` or [`NO_MATCH`].
pub fn match_descriptors(
    sources: &[Descriptor],
    targets: &[Descriptor],
    config: &MatcherConfig,
) -> Vec<i32> {
    let mut out = Vec::with_capacity(sources.len());
    for src in sources {
        let mut best = NO_MATCH;
        let mut best_dist = u32::MAX;
        for (j, dst) in targets.iter().enumerate() {
            let d = src.hamming(dst);
            if d < best_dist {
                best_dist = d;
                best = j as i32;
            }
        }
        out.push(if best_dist < config.threshold { best } else { NO_MATCH });
    }
    out
}

/// Mutual-consistency filter: accept (i, j) iff `forward[i] == j` and
/// `backward[j] == i`. Results are emitted in ascending source order.
///
/// Entries of `forward` that are the sentinel or out of range for
/// `backward` are skipped; either array may come from an engine whose
/// capacity exceeds the actual descriptor count, so range checks are part
/// of the contract, not defensive slack.
pub fn cross_check(forward: &[i32], backward: &[i32]) -> Vec<Correspondence> {
    let mut out = Vec::new();
    for (i, &j) in forward.iter().enumerate() {
        if j < 0 || j as usize >= backward.len() {
            continue;
        }
        if backward[j as usize] == i as i32 {
            out.push(Correspondence { source: i, target: j as usize });
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::DESCRIPTOR_WORDS;

    /// Descriptor with the given number of leading bits set.
    fn desc_with_bits(n: u32) -> Descriptor {
        let mut words = [0u32; DESCRIPTOR_WORDS];
        let mut remaining = n;
        for w in words.iter_mut() {
            let take = remaining.min(32);
            if take > 0 {
                *w = if take == 32 { u32::MAX } else { (1u32 << take) - 1 };
            }
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        Descriptor(words)
    }

    #[test]
    fn test_exact_match_wins() {
        let a = vec![desc_with_bits(8)];
        let b = vec![desc_with_bits(40), desc_with_bits(8), desc_with_bits(100)];
        let m = match_descriptors(&a, &b, &MatcherConfig::default());
        assert_eq!(m, vec![1]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let a = vec![desc_with_bits(0)];
        let b = vec![desc_with_bits(12)]; // distance exactly 12
        let m = match_descriptors(&a, &b, &MatcherConfig::new().with_threshold(12));
        assert_eq!(m, vec![NO_MATCH]);
        let m = match_descriptors(&a, &b, &MatcherConfig::new().with_threshold(13));
        assert_eq!(m, vec![0]);
    }

    #[test]
    fn test_tie_breaks_to_lowest_index() {
        let a = vec![desc_with_bits(4)];
        // Both targets at distance 4; index 1 must win over index 2.
        let b = vec![desc_with_bits(32), desc_with_bits(8), desc_with_bits(8)];
        let m = match_descriptors(&a, &b, &MatcherConfig::new().with_threshold(64));
        assert_eq!(m, vec![1]);
    }

    #[test]
    fn test_empty_targets_yield_sentinels() {
        let a = vec![desc_with_bits(3), desc_with_bits(7)];
        let m = match_descriptors(&a, &[], &MatcherConfig::default());
        assert_eq!(m, vec![NO_MATCH, NO_MATCH]);
    }

    #[test]
    fn test_empty_sources_yield_empty() {
        let b = vec![desc_with_bits(3)];
        assert!(match_descriptors(&[], &b, &MatcherConfig::default()).is_empty());
    }

    #[test]
    fn test_output_length_equals_sources() {
        let a = vec![desc_with_bits(1); 5];
        let b = vec![desc_with_bits(2000); 3];
        let m = match_descriptors(&a, &b, &MatcherConfig::default());
        assert_eq!(m.len(), 5);
    }

    #[test]
    fn test_cross_check_mutual_pairs_only() {
        // forward: 0→1, 1→0, 2→2; backward: 0→1, 1→0, 2→0.
        // (0,1) and (1,0) are mutual; (2,2) is not (backward[2] == 0).
        let fwd = vec![1, 0, 2];
        let bwd = vec![1, 0, 0];
        let c = cross_check(&fwd, &bwd);
        assert_eq!(
            c,
            vec![
                Correspondence { source: 0, target: 1 },
                Correspondence { source: 1, target: 0 },
            ]
        );
    }

    #[test]
    fn test_cross_check_skips_sentinel_and_out_of_range() {
        let fwd = vec![NO_MATCH, 7, 0];
        let bwd = vec![2];
        let c = cross_check(&fwd, &bwd);
        // 7 is out of range for a 1-element backward array; only (2, 0).
        assert_eq!(c, vec![Correspondence { source: 2, target: 0 }]);
    }

    #[test]
    fn test_cross_check_ascending_source_order() {
        let fwd = vec![0, 1, 2, 3];
        let bwd = vec![0, 1, 2, 3];
        let c = cross_check(&fwd, &bwd);
        for (k, corr) in c.iter().enumerate() {
            assert_eq!(corr.source, k);
        }
    }

    #[test]
    fn test_self_match_identity() {
        let set: Vec<Descriptor> =
            (0..6).map(|i| desc_with_bits(i * 50)).collect();
        let cfg = MatcherConfig::new().with_threshold(1);
        let fwd = match_descriptors(&set, &set, &cfg);
        let bwd = match_descriptors(&set, &set, &cfg);
        let c = cross_check(&fwd, &bwd);
        assert_eq!(c.len(), set.len());
        for (i, corr) in c.iter().enumerate() {
            assert_eq!(corr.source, i);
            assert_eq!(corr.target, i);
        }
    }
}
