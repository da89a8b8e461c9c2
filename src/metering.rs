//! Metering engine.
//!
//! Token pre-estimation, streaming accumulation and cost calculation. All
//! money math is fixed-point credits; the provider-reported usage wins at
//! settlement when it is available.

use crate::canonical::{CanonicalRequest, Usage};
use crate::credits::Credits;
use crate::pricing::ModelEntry;
use crate::tokenizer::TokenCounter;

/// Tolerated divergence between the local count and the provider count
/// before settlement logs the discrepancy (the provider count wins anyway).
const DIVERGENCE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
pub struct Estimate {
    pub prompt_tokens: u32,
    pub expected_completion_tokens: u32,
}

impl Estimate {
    /// Worst-case cost this request could incur, used to size reservations.
    pub fn max_cost(&self, entry: &ModelEntry) -> Credits {
        cost(
            entry,
            self.prompt_tokens,
            self.expected_completion_tokens,
        )
    }
}

/// Pre-request estimate: tokenize the prompt, bound the completion by the
/// client request clamped to the policy cap and the model's own ceiling.
pub fn estimate(
    counter: &TokenCounter,
    entry: &ModelEntry,
    request: &CanonicalRequest,
    policy_cap: u32,
) -> Estimate {
    let prompt_tokens = counter.count_prompt(request);
    let requested = request.max_output_tokens.unwrap_or(policy_cap);
    let expected_completion_tokens = requested.min(policy_cap).min(entry.max_output_tokens);
    Estimate {
        prompt_tokens,
        expected_completion_tokens,
    }
}

pub fn cost(entry: &ModelEntry, tokens_in: u32, tokens_out: u32) -> Credits {
    Credits::per_thousand(entry.in_rate, tokens_in as u64)
        + Credits::per_thousand(entry.out_rate, tokens_out as u64)
}

/// Running token account for one in-flight request.
pub struct Meter<'t> {
    counter: &'t TokenCounter,
    prompt_tokens: u32,
    completion_tokens: u32,
    provider_usage: Option<Usage>,
}

impl<'t> Meter<'t> {
    pub fn new(counter: &'t TokenCounter, prompt_tokens: u32) -> Self {
        Self {
            counter,
            prompt_tokens,
            completion_tokens: 0,
            provider_usage: None,
        }
    }

    /// Count a streamed delta; returns the tokens it added.
    pub fn accumulate(&mut self, delta_text: &str) -> u32 {
        let delta = self.counter.count(delta_text);
        self.completion_tokens += delta;
        delta
    }

    pub fn completion_tokens(&self) -> u32 {
        self.completion_tokens
    }

    /// Record the provider's own final usage when it reports one.
    pub fn record_provider_usage(&mut self, usage: Usage) {
        self.provider_usage = Some(usage);
    }

    /// Usage to settle against: the provider count when present, otherwise
    /// the local count. Divergence beyond the tolerance is logged.
    pub fn settlement_usage(&self) -> Usage {
        match self.provider_usage {
            Some(provider) => {
                let local = self.completion_tokens as f64;
                let reported = provider.completion_tokens as f64;
                if reported > 0.0 && (local - reported).abs() / reported > DIVERGENCE_TOLERANCE {
                    tracing::warn!(
                        local_completion_tokens = self.completion_tokens,
                        provider_completion_tokens = provider.completion_tokens,
                        "local token count diverged from provider; provider count wins"
                    );
                }
                provider
            }
            None => Usage::new(self.prompt_tokens, self.completion_tokens),
        }
    }
}
