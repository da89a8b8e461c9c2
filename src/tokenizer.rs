//! Tokenizer registry.
//!
//! Maps a tokenizer name (carried on each model's pricing entry) to a
//! counting function used for pre-estimation and streaming accumulation.
//! BPE encoders are expensive to build, so the registry is constructed once
//! at startup and is immutable afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::canonical::CanonicalRequest;

/// Fixed per-message overhead applied to chat prompts, matching the usual
/// chat-markup accounting (role + separators), plus a reply primer.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;
const REPLY_PRIMER_TOKENS: u32 = 2;

#[derive(Clone)]
pub enum TokenCounter {
    Bpe(Arc<CoreBPE>),
    /// Providers without a published BPE; `chars_per_token` of 4 tracks
    /// English prose closely enough for the ±1% settlement rule to matter
    /// only when the provider reports no usage at all.
    Heuristic { chars_per_token: u32 },
}

impl TokenCounter {
    pub fn count(&self, text: &str) -> u32 {
        match self {
            TokenCounter::Bpe(bpe) => bpe.encode_ordinary(text).len() as u32,
            TokenCounter::Heuristic { chars_per_token } => {
                let chars = text.chars().count() as u32;
                chars.div_ceil(*chars_per_token)
            }
        }
    }

    /// Prompt tokens for a whole chat request, message overhead included.
    pub fn count_prompt(&self, request: &CanonicalRequest) -> u32 {
        let mut total = REPLY_PRIMER_TOKENS;
        for message in &request.messages {
            total += MESSAGE_OVERHEAD_TOKENS + self.count(&message.content);
        }
        total
    }
}

pub struct TokenizerRegistry {
    by_name: HashMap<String, TokenCounter>,
    fallback: TokenCounter,
}

impl TokenizerRegistry {
    pub fn bootstrap() -> Self {
        let mut by_name = HashMap::new();

        if let Ok(bpe) = tiktoken_rs::cl100k_base() {
            by_name.insert("cl100k".to_string(), TokenCounter::Bpe(Arc::new(bpe)));
        }
        if let Ok(bpe) = tiktoken_rs::o200k_base() {
            by_name.insert("o200k".to_string(), TokenCounter::Bpe(Arc::new(bpe)));
        }
        if let Ok(bpe) = tiktoken_rs::p50k_base() {
            by_name.insert("p50k".to_string(), TokenCounter::Bpe(Arc::new(bpe)));
        }
        by_name.insert(
            "heuristic".to_string(),
            TokenCounter::Heuristic { chars_per_token: 4 },
        );

        Self {
            by_name,
            fallback: TokenCounter::Heuristic { chars_per_token: 4 },
        }
    }

    /// Resolve a tokenizer by name; unknown names fall back to the
    /// heuristic counter rather than failing the request.
    pub fn resolve(&self, name: &str) -> &TokenCounter {
        self.by_name.get(name).unwrap_or(&self.fallback)
    }
}
