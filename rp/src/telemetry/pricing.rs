//! Model pricing lookup

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// USD per 1K tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl TokenPricing {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }
}

/// Source of per-model prices; `None` means the model is unpriced
pub trait PricingProvider: Send + Sync {
    fn pricing(&self, model: &str) -> Option<TokenPricing>;
}

/// Price table keyed by model name
///
/// Lookup tries an exact match first, then the longest key that prefixes the
/// model name, so dated variants (`gpt-4o-2024-08-06`) resolve to their family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    models: BTreeMap<String, TokenPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approximate OpenAI list prices
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.insert("gpt-4o", TokenPricing::new(0.005, 0.015));
        table.insert("gpt-4o-mini", TokenPricing::new(0.00015, 0.0006));
        table.insert("gpt-4.1", TokenPricing::new(0.01, 0.03));
        table.insert("gpt-3.5-turbo", TokenPricing::new(0.0005, 0.0015));
        table
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: TokenPricing) -> &mut Self {
        self.models.insert(model.into(), pricing);
        self
    }

    /// Overlay `overrides` on top of this table
    pub fn merged(mut self, overrides: &PricingTable) -> Self {
        for (model, pricing) in &overrides.models {
            self.models.insert(model.clone(), *pricing);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TokenPricing)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl PricingProvider for PricingTable {
    fn pricing(&self, model: &str) -> Option<TokenPricing> {
        if let Some(p) = self.models.get(model) {
            return Some(*p);
        }
        let found = self
            .models
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, p)| *p);
        if found.is_none() {
            debug!(%model, "PricingTable: no pricing for model");
        }
        found
    }
}

/// `(tokens / 1000) * per_1k`
pub fn tokens_to_usd(tokens: u64, per_1k: f64) -> f64 {
    (tokens as f64 / 1000.0) * per_1k
}

/// Round to 6 decimal places
pub fn round_usd(amount: f64) -> f64 {
    (amount * 1e6).round() / 1e6
}
