//! Output guardrails for streamed responses.
//!
//! Structural abuse only: token caps, repeated-output loops and byte
//! budgets. No attempt is made to judge semantic quality.

use crate::config::GuardrailConfig;

/// Effective completion-token ceiling for one request: the client ask
/// clamped by policy and the model's own maximum. Requests running on
/// transferred credits are capped harder.
pub fn effective_output_cap(
    requested: Option<u32>,
    model_max: u32,
    config: &GuardrailConfig,
    transfer_funded: bool,
) -> u32 {
    let mut cap = requested
        .unwrap_or(config.policy_max_output_tokens)
        .min(config.policy_max_output_tokens)
        .min(model_max);
    if transfer_funded {
        cap = cap.min(config.transfer_funded_max_output_tokens);
    }
    cap
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardTrip {
    /// Trailing n-gram repeated past the threshold
    Loop,
    /// Total forwarded bytes exceeded the ceiling
    ByteBudget,
}

/// Stateful per-stream guard. Holds a bounded window of recent output for
/// loop detection and the running byte total.
pub struct StreamGuard {
    window: String,
    window_cap: usize,
    ngram: usize,
    threshold: u32,
    bytes_forwarded: usize,
    byte_budget: usize,
}

impl StreamGuard {
    pub fn new(config: &GuardrailConfig) -> Self {
        Self {
            window: String::new(),
            window_cap: config.loop_window_chars,
            ngram: config.loop_ngram_chars,
            threshold: config.loop_threshold,
            bytes_forwarded: 0,
            byte_budget: config.byte_budget,
        }
    }

    /// Observe one delta before it is forwarded. Returns the first guard
    /// that trips, if any.
    pub fn observe(&mut self, delta: &str) -> Option<GuardTrip> {
        self.bytes_forwarded += delta.len();
        if self.bytes_forwarded > self.byte_budget {
            return Some(GuardTrip::ByteBudget);
        }

        self.window.push_str(delta);
        self.shrink_window();

        if self.trailing_ngram_repeats() >= self.threshold {
            return Some(GuardTrip::Loop);
        }
        None
    }

    pub fn bytes_forwarded(&self) -> usize {
        self.bytes_forwarded
    }

    fn shrink_window(&mut self) {
        let mut excess = self.window.len().saturating_sub(self.window_cap);
        if excess == 0 {
            return;
        }
        while !self.window.is_char_boundary(excess) {
            excess += 1;
        }
        self.window.drain(..excess);
    }

    /// Occurrences (overlapping) of the trailing n-gram within the window.
    fn trailing_ngram_repeats(&self) -> u32 {
        let chars: Vec<char> = self.window.chars().collect();
        if chars.len() < self.ngram {
            return 0;
        }
        let tail: String = chars[chars.len() - self.ngram..].iter().collect();
        if tail.trim().is_empty() {
            // Whitespace runs are formatting, not loops.
            return 0;
        }

        let mut count = 0u32;
        let mut from = 0;
        while let Some(pos) = self.window[from..].find(&tail) {
            count += 1;
            from += pos + 1;
            if from >= self.window.len() {
                break;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ngram: usize, threshold: u32, byte_budget: usize) -> GuardrailConfig {
        serde_json::from_value(serde_json::json!({
            "loop_window_chars": 512,
            "loop_ngram_chars": ngram,
            "loop_threshold": threshold,
            "byte_budget": byte_budget,
        }))
        .unwrap()
    }

    #[test]
    fn test_effective_cap_clamps() {
        let cfg: GuardrailConfig = serde_json::from_value(serde_json::json!({
            "policy_max_output_tokens": 2048,
            "transfer_funded_max_output_tokens": 512,
        }))
        .unwrap();
        assert_eq!(effective_output_cap(Some(10_000), 8192, &cfg, false), 2048);
        assert_eq!(effective_output_cap(Some(100), 8192, &cfg, false), 100);
        assert_eq!(effective_output_cap(None, 1024, &cfg, false), 1024);
        assert_eq!(effective_output_cap(Some(10_000), 8192, &cfg, true), 512);
    }

    #[test]
    fn test_loop_detection_trips() {
        let mut guard = StreamGuard::new(&config(10, 3, 1_000_000));
        let phrase = "the same ten chars "; // repeated phrase
        let mut tripped = None;
        for _ in 0..5 {
            tripped = guard.observe(phrase);
            if tripped.is_some() {
                break;
            }
        }
        assert_eq!(tripped, Some(GuardTrip::Loop));
    }

    #[test]
    fn test_normal_text_passes() {
        let mut guard = StreamGuard::new(&config(16, 3, 1_000_000));
        let text = "Each sentence here is different from the last one, \
                    covering new ground as real model output does.";
        for chunk in text.split_inclusive(' ') {
            assert_eq!(guard.observe(chunk), None);
        }
    }

    #[test]
    fn test_byte_budget_trips() {
        let mut guard = StreamGuard::new(&config(16, 3, 10));
        assert_eq!(guard.observe("12345"), None);
        assert_eq!(guard.observe("6789AB"), Some(GuardTrip::ByteBudget));
    }

    #[test]
    fn test_window_shrinks_on_char_boundary() {
        let mut guard = StreamGuard::new(&config(64, 99, 1_000_000));
        // Multi-byte characters must not split the window mid-codepoint.
        for _ in 0..200 {
            assert_eq!(guard.observe("héllo wörld "), None);
        }
        assert!(guard.window.len() <= 512 + 4);
    }
}
