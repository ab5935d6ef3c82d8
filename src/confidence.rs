//! Per-token confidence from the entropy of the next-token distribution.
//!
//! Confidence is `1 - H / ln(V)` where `H` is the Shannon entropy of the softmax over
//! the raw logits and `V` the vocabulary size: 1.0 for a one-hot distribution, 0.0 for
//! a uniform one.

/// Measurements needed before a low running mean may request handoff.
pub const HANDOFF_MIN_SAMPLES: u32 = 3;

/// Sentinel for "not computed".
pub const NOT_COMPUTED: f32 = -1.0;

/// Probabilities at or below this contribute nothing to the entropy.
const MIN_PROB: f64 = 1e-10;

/// Normalized confidence of the distribution over `logits`, in [0, 1].
///
/// Returns [`NOT_COMPUTED`] for empty input or when no logit is finite.
pub fn normalized_confidence(logits: &[f32]) -> f32 {
    if logits.is_empty() {
        return NOT_COMPUTED;
    }
    if logits.len() == 1 {
        return 1.0;
    }

    let max = logits
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return NOT_COMPUTED;
    }

    let max = max as f64;
    let weight = |l: f32| if l.is_finite() { (l as f64 - max).exp() } else { 0.0 };
    let sum: f64 = logits.iter().map(|&l| weight(l)).sum();

    let entropy: f64 = logits
        .iter()
        .map(|&l| weight(l) / sum)
        .filter(|&p| p > MIN_PROB)
        .map(|p| -p * p.ln())
        .sum();

    let max_entropy = (logits.len() as f64).ln();
    (1.0 - entropy / max_entropy).clamp(0.0, 1.0) as f32
}

/// Running confidence statistics for one generation.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceTracker {
    sum: f64,
    count: u32,
    last: Option<f32>,
    needs_handoff: bool,
}

impl ConfidenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one measurement and re-evaluate handoff against `threshold`.
    ///
    /// Non-computable measurements are ignored. Handoff is sticky.
    pub fn record(&mut self, confidence: f32, threshold: f32) {
        if confidence < 0.0 {
            return;
        }
        self.sum += confidence as f64;
        self.count += 1;
        self.last = Some(confidence);

        if self.count >= HANDOFF_MIN_SAMPLES && self.average() < threshold {
            self.needs_handoff = true;
        }
    }

    pub fn last(&self) -> f32 {
        self.last.unwrap_or(NOT_COMPUTED)
    }

    pub fn average(&self) -> f32 {
        if self.count == 0 {
            NOT_COMPUTED
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn needs_handoff(&self) -> bool {
        self.needs_handoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_is_zero() {
        let c = normalized_confidence(&[0.5; 64]);
        assert!(c.abs() < 1e-5, "got {c}");
    }

    #[test]
    fn one_hot_is_one() {
        let mut logits = vec![0.0; 64];
        logits[7] = 100.0;
        let c = normalized_confidence(&logits);
        assert!((c - 1.0).abs() < 1e-5, "got {c}");
    }

    #[test]
    fn skewed_is_between() {
        let c = normalized_confidence(&[3.0, 1.0, 0.0, 0.0]);
        assert!(c > 0.0 && c < 1.0);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(normalized_confidence(&[]), NOT_COMPUTED);
        assert_eq!(normalized_confidence(&[2.0]), 1.0);
        assert_eq!(normalized_confidence(&[f32::NEG_INFINITY; 4]), NOT_COMPUTED);
        assert_eq!(normalized_confidence(&[f32::NAN, f32::NAN]), NOT_COMPUTED);
    }

    #[test]
    fn masked_entries_count_towards_vocab() {
        // Two equally likely tokens out of four.
        let c = normalized_confidence(&[0.0, 0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert!((c - 0.5).abs() < 1e-5, "got {c}");
    }

    #[test]
    fn tracker_needs_three_samples() {
        let mut t = ConfidenceTracker::new();
        t.record(0.1, 0.5);
        t.record(0.1, 0.5);
        assert!(!t.needs_handoff());
        t.record(0.1, 0.5);
        assert!(t.needs_handoff());
    }

    #[test]
    fn tracker_handoff_is_sticky() {
        let mut t = ConfidenceTracker::new();
        for _ in 0..3 {
            t.record(0.0, 0.5);
        }
        for _ in 0..10 {
            t.record(1.0, 0.5);
        }
        assert!(t.average() > 0.5);
        assert!(t.needs_handoff());
    }

    #[test]
    fn tracker_starts_uncomputed() {
        let t = ConfidenceTracker::new();
        assert_eq!(t.last(), NOT_COMPUTED);
        assert_eq!(t.average(), NOT_COMPUTED);
        assert_eq!(t.count(), 0);
    }
}
