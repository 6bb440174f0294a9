//! 模型计价
//!
//! 按模型名前缀匹配价格条目（最长前缀优先），价格单位为 USD / 百万 Token。

use serde::{Deserialize, Serialize};

use crate::token_stats::LogRecord;

const PER_MILLION: f64 = 1_000_000.0;

/// 单个模型前缀的价格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    /// 写入日志的 pricing_template_id
    pub id: String,
    pub model_prefix: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_write_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
}

impl ModelPricing {
    fn new(id: &str, prefix: &str, input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            id: id.to_string(),
            model_prefix: prefix.to_string(),
            input_per_million: input,
            output_per_million: output,
            cache_write_per_million: cache_write,
            cache_read_per_million: cache_read,
        }
    }
}

/// 内置价格表
pub fn default_pricing() -> Vec<ModelPricing> {
    vec![
        ModelPricing::new("claude-opus-4", "claude-opus-4", 15.0, 75.0, 18.75, 1.5),
        ModelPricing::new("claude-sonnet-4", "claude-sonnet-4", 3.0, 15.0, 3.75, 0.3),
        ModelPricing::new("claude-haiku-4", "claude-haiku-4", 1.0, 5.0, 1.25, 0.1),
        ModelPricing::new("gpt-5", "gpt-5", 1.25, 10.0, 0.0, 0.125),
        ModelPricing::new("gemini-2.5-pro", "gemini-2.5-pro", 1.25, 10.0, 0.0, 0.31),
        ModelPricing::new("gemini-2.5-flash", "gemini-2.5-flash", 0.3, 2.5, 0.0, 0.075),
    ]
}

/// 一条日志的成本拆分（USD）
#[derive(Debug, Clone, PartialEq)]
pub struct CostBreakdown {
    pub template_id: String,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_write_cost: f64,
    pub cache_read_cost: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_write_cost + self.cache_read_cost
    }
}

/// 价格表
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: Vec<ModelPricing>,
}

impl PricingTable {
    pub fn new(mut entries: Vec<ModelPricing>) -> Self {
        // 最长前缀优先
        entries.sort_by(|a, b| b.model_prefix.len().cmp(&a.model_prefix.len()));
        Self { entries }
    }

    pub fn lookup(&self, model: &str) -> Option<&ModelPricing> {
        self.entries
            .iter()
            .find(|entry| model.starts_with(&entry.model_prefix))
    }

    pub fn cost(
        &self,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        cache_creation_tokens: i64,
        cache_read_tokens: i64,
    ) -> Option<CostBreakdown> {
        let pricing = self.lookup(model)?;
        let cost = |tokens: i64, per_million: f64| tokens.max(0) as f64 * per_million / PER_MILLION;
        Some(CostBreakdown {
            template_id: pricing.id.clone(),
            input_cost: cost(input_tokens, pricing.input_per_million),
            output_cost: cost(output_tokens, pricing.output_per_million),
            cache_write_cost: cost(cache_creation_tokens, pricing.cache_write_per_million),
            cache_read_cost: cost(cache_read_tokens, pricing.cache_read_per_million),
        })
    }

    /// 为日志填写价格字段，未匹配到模型时价格为空、总成本为 0
    pub fn apply(&self, record: &mut LogRecord) {
        match self.cost(
            &record.model,
            record.input_tokens,
            record.output_tokens,
            record.cache_creation_tokens,
            record.cache_read_tokens,
        ) {
            Some(breakdown) => {
                record.total_cost = breakdown.total();
                record.input_price = Some(breakdown.input_cost);
                record.output_price = Some(breakdown.output_cost);
                record.cache_write_price = Some(breakdown.cache_write_cost);
                record.cache_read_price = Some(breakdown.cache_read_cost);
                record.pricing_template_id = Some(breakdown.template_id);
            }
            None => {
                tracing::warn!(model = %record.model, "未找到模型价格，成本记为 0");
                record.total_cost = 0.0;
            }
        }
    }
}
