use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use relay_domain::config::ModelPricing;

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Accumulates usage across the turns of one session and estimates
/// cumulative cost from the per-model pricing table.
///
/// Cost is `None` when the model is unknown or has no pricing entry —
/// the terminator then skips its cost-aware tiers entirely, which is
/// the intended behavior for self-hosted models.
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    total: Usage,
    model: Option<String>,
}

impl UsageTracker {
    pub fn new(model: Option<String>) -> Self {
        Self {
            total: Usage::default(),
            model,
        }
    }

    pub fn accumulate(&mut self, usage: &Usage) {
        self.total.input_tokens += usage.input_tokens;
        self.total.output_tokens += usage.output_tokens;
    }

    pub fn total(&self) -> Usage {
        self.total
    }

    pub fn estimate_cost(&self, pricing: &HashMap<String, ModelPricing>) -> Option<f64> {
        let model = self.model.as_deref()?;
        let entry = pricing.get(model)?;
        Some(entry.estimate_cost(self.total.input_tokens, self.total.output_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing_table() -> HashMap<String, ModelPricing> {
        let mut table = HashMap::new();
        table.insert(
            "relay-large".to_string(),
            ModelPricing {
                input_per_1m: 3.0,
                output_per_1m: 15.0,
            },
        );
        table
    }

    #[test]
    fn accumulates_across_turns() {
        let mut tracker = UsageTracker::new(Some("relay-large".into()));
        tracker.accumulate(&Usage {
            input_tokens: 100,
            output_tokens: 50,
        });
        tracker.accumulate(&Usage {
            input_tokens: 200,
            output_tokens: 25,
        });
        assert_eq!(tracker.total().input_tokens, 300);
        assert_eq!(tracker.total().output_tokens, 75);
        assert_eq!(tracker.total().total(), 375);
    }

    #[test]
    fn cost_known_model() {
        let mut tracker = UsageTracker::new(Some("relay-large".into()));
        tracker.accumulate(&Usage {
            input_tokens: 1_000_000,
            output_tokens: 0,
        });
        let cost = tracker.estimate_cost(&pricing_table()).unwrap();
        assert!((cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn cost_unknown_model_is_none() {
        let mut tracker = UsageTracker::new(Some("self-hosted".into()));
        tracker.accumulate(&Usage {
            input_tokens: 10,
            output_tokens: 10,
        });
        assert!(tracker.estimate_cost(&pricing_table()).is_none());

        let anon = UsageTracker::new(None);
        assert!(anon.estimate_cost(&pricing_table()).is_none());
    }
}
