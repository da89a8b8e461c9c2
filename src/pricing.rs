//! Model and pricing registry.
//!
//! Derived from the gateway document on every snapshot build. Single source
//! of truth for which `(provider, model)` pairs exist, what they cost, which
//! tokenizer meters them, and where their failover chains point.

use std::collections::HashMap;
use std::fmt;

use crate::config::GatewayConfig;
use crate::credits::Credits;

/// A concrete `(provider, model)` pair, the unit of routing decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse a "provider/model" reference. Model ids may themselves contain
    /// slashes, so only the first one splits.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub provider: String,
    pub id: String,
    pub family: String,
    pub in_rate: Credits,
    pub out_rate: Credits,
    pub tokenizer: String,
    pub max_output_tokens: u32,
    pub fallbacks: Vec<ModelRef>,
    pub region: Option<String>,
}

impl ModelEntry {
    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(self.provider.clone(), self.id.clone())
    }
}

pub struct PricingTable {
    entries: Vec<ModelEntry>,
    by_key: HashMap<(String, String), usize>,
    by_family: HashMap<String, Vec<usize>>,
}

impl PricingTable {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut entries = Vec::new();
        let mut by_key = HashMap::new();
        let mut by_family: HashMap<String, Vec<usize>> = HashMap::new();

        for provider in &config.providers {
            for model in &provider.models {
                let index = entries.len();
                entries.push(ModelEntry {
                    provider: provider.name.clone(),
                    id: model.id.clone(),
                    family: model.family.clone(),
                    in_rate: Credits::from_decimal(model.in_rate),
                    out_rate: Credits::from_decimal(model.out_rate),
                    tokenizer: model.tokenizer.clone(),
                    max_output_tokens: model.max_output_tokens,
                    fallbacks: model
                        .fallbacks
                        .iter()
                        .filter_map(|f| ModelRef::parse(f))
                        .collect(),
                    region: provider.region.clone(),
                });
                by_key.insert((provider.name.clone(), model.id.clone()), index);
                by_family
                    .entry(model.family.clone())
                    .or_default()
                    .push(index);
            }
        }

        Self {
            entries,
            by_key,
            by_family,
        }
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelEntry> {
        self.by_key
            .get(&(provider.to_string(), model.to_string()))
            .map(|&i| &self.entries[i])
    }

    pub fn get_ref(&self, model_ref: &ModelRef) -> Option<&ModelEntry> {
        self.get(&model_ref.provider, &model_ref.model)
    }

    /// Configured candidates for a capability family, in document order.
    /// The first entry is the default SKU for the family.
    pub fn family_candidates(&self, family: &str) -> Vec<&ModelEntry> {
        self.by_family
            .get(family)
            .map(|indexes| indexes.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    pub fn families(&self) -> Vec<&str> {
        self.by_family.keys().map(String::as_str).collect()
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Primary candidate plus its configured fallback chain, resolved
    /// against this table and deduplicated in order.
    pub fn failover_chain(&self, primary: &ModelRef) -> Vec<&ModelEntry> {
        let mut chain = Vec::new();
        let mut seen = Vec::new();
        if let Some(entry) = self.get_ref(primary) {
            seen.push(primary.clone());
            chain.push(entry);
            for fallback in &entry.fallbacks {
                if seen.contains(fallback) {
                    continue;
                }
                if let Some(candidate) = self.get_ref(fallback) {
                    seen.push(fallback.clone());
                    chain.push(candidate);
                }
            }
        }
        chain
    }
}
