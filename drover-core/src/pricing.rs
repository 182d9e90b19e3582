//! Model pricing for worker spend

use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// USD per 1M tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    /// Cost per 1M input tokens
    pub input_per_million: f64,
    /// Cost per 1M output tokens
    pub output_per_million: f64,
}

impl ModelRate {
    /// Create a rate
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Prices token usage per model.
///
/// Lookup tries the exact model id, then the model family (`opus`, `sonnet`,
/// `haiku`) contained in the id, then the fallback rate.
pub struct ModelPricing {
    rates: HashMap<String, ModelRate>,
    fallback: ModelRate,
}

impl ModelPricing {
    /// Create a pricing table with default rates
    pub fn new() -> Self {
        let mut rates = HashMap::new();

        // Approximate list prices
        rates.insert("opus".to_string(), ModelRate::new(15.0, 75.0));
        rates.insert("sonnet".to_string(), ModelRate::new(3.0, 15.0));
        rates.insert("haiku".to_string(), ModelRate::new(0.8, 4.0));

        Self {
            rates,
            fallback: ModelRate::new(3.0, 15.0),
        }
    }

    /// Default rates plus configured overrides
    pub fn with_overrides(overrides: &HashMap<String, ModelRate>) -> Self {
        let mut pricing = Self::new();
        for (model, rate) in overrides {
            pricing.set_rate(model, *rate);
        }
        pricing
    }

    /// Add or update pricing for a model
    pub fn set_rate(&mut self, model: &str, rate: ModelRate) {
        self.rates.insert(model.to_string(), rate);
    }

    /// Rate applied to a model id
    pub fn rate_for(&self, model: &str) -> ModelRate {
        if let Some(rate) = self.rates.get(model) {
            return *rate;
        }
        let lower = model.to_lowercase();
        ["opus", "sonnet", "haiku"]
            .iter()
            .find(|family| lower.contains(*family))
            .and_then(|family| self.rates.get(*family))
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Calculate cost for token usage
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        let rate = self.rate_for(model);
        let input_cost = (usage.input as f64 / 1_000_000.0) * rate.input_per_million;
        let output_cost = (usage.output as f64 / 1_000_000.0) * rate.output_per_million;
        input_cost + output_cost
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new()
    }
}
