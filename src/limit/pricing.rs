//! Model pricing - per-million-token prices used for cost accounting

use crate::llm::types::TokenUsage;

/// Per-model pricing, in USD per million tokens
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Model id prefix this entry applies to (longest match wins)
    pub model_prefix: &'static str,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Fallback used for models the table does not know. Documented behavior,
/// not a silent assumption: unknown models are billed at this entry's rates.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing {
    model_prefix: "",
    input_per_million: 3.0,
    output_per_million: 15.0,
};

/// Compile-time pricing table. Prefix keys so dated releases
/// ("claude-sonnet-4-20250514") resolve without per-date rows.
static PRICING_TABLE: &[ModelPricing] = &[
    ModelPricing {
        model_prefix: "claude-opus-4",
        input_per_million: 15.0,
        output_per_million: 75.0,
    },
    ModelPricing {
        model_prefix: "claude-sonnet-4",
        input_per_million: 3.0,
        output_per_million: 15.0,
    },
    ModelPricing {
        model_prefix: "claude-haiku-4",
        input_per_million: 1.0,
        output_per_million: 5.0,
    },
    ModelPricing {
        model_prefix: "claude-3-5-sonnet",
        input_per_million: 3.0,
        output_per_million: 15.0,
    },
    ModelPricing {
        model_prefix: "claude-3-5-haiku",
        input_per_million: 0.8,
        output_per_million: 4.0,
    },
    ModelPricing {
        model_prefix: "claude-3-opus",
        input_per_million: 15.0,
        output_per_million: 75.0,
    },
    ModelPricing {
        model_prefix: "claude-3-haiku",
        input_per_million: 0.25,
        output_per_million: 1.25,
    },
];

/// Cache reads are billed at 10% of the input price.
const CACHE_READ_DISCOUNT: f64 = 0.1;

/// Look up pricing for a model id. Longest matching prefix wins; unknown
/// models fall back to [`DEFAULT_PRICING`].
pub fn pricing_for(model: &str) -> &'static ModelPricing {
    PRICING_TABLE
        .iter()
        .filter(|p| model.starts_with(p.model_prefix))
        .max_by_key(|p| p.model_prefix.len())
        .unwrap_or(&DEFAULT_PRICING)
}

/// Compute the USD cost of one response's realized usage.
pub fn cost_usd(usage: &TokenUsage, pricing: &ModelPricing) -> f64 {
    let cache_read = usage.cache_read_tokens.min(usage.input_tokens) as f64;
    let uncached_input = usage.input_tokens.saturating_sub(usage.cache_read_tokens) as f64;
    let output = usage.output_tokens as f64;

    (cache_read * pricing.input_per_million * CACHE_READ_DISCOUNT
        + uncached_input * pricing.input_per_million
        + output * pricing.output_per_million)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_resolves_dated_releases() {
        let pricing = pricing_for("claude-sonnet-4-20250514");
        assert_eq!(pricing.input_per_million, 3.0);
        assert_eq!(pricing.output_per_million, 15.0);
    }

    #[test]
    fn longest_prefix_wins() {
        // "claude-3-5-haiku" must beat the shorter "claude-3-haiku"... they
        // do not overlap, but "claude-opus-4" vs default exercises ordering.
        let pricing = pricing_for("claude-3-5-haiku-20241022");
        assert_eq!(pricing.input_per_million, 0.8);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let pricing = pricing_for("mystery-model-9000");
        assert_eq!(pricing.input_per_million, DEFAULT_PRICING.input_per_million);
        assert_eq!(
            pricing.output_per_million,
            DEFAULT_PRICING.output_per_million
        );
    }

    #[test]
    fn cost_applies_cache_read_discount() {
        let pricing = pricing_for("claude-sonnet-4-20250514");
        let usage = TokenUsage {
            input_tokens: 10_000,
            output_tokens: 1_000,
            cache_read_tokens: 4_000,
            cache_creation_tokens: 0,
        };
        // 4k cached at 0.3/M + 6k uncached at 3/M + 1k out at 15/M
        let expected = (4_000.0 * 3.0 * 0.1 + 6_000.0 * 3.0 + 1_000.0 * 15.0) / 1_000_000.0;
        assert!((cost_usd(&usage, pricing) - expected).abs() < 1e-12);
    }

    #[test]
    fn cost_of_plain_usage() {
        let pricing = pricing_for("claude-sonnet-4-20250514");
        let usage = TokenUsage {
            input_tokens: 10_000,
            output_tokens: 0,
            ..Default::default()
        };
        assert!((cost_usd(&usage, pricing) - 0.03).abs() < 1e-12);
    }
}
