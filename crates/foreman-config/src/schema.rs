use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub models: ModelsConfig,
    pub providers: ProvidersConfig,
    pub tokens: TokensConfig,
    pub pricing: PricingConfig,
    pub budgets: BudgetsConfig,
    pub limits: LimitsConfig,
    pub memory: MemoryConfig,
    pub storage: StorageConfig,
}

/// Model assignment per tier. Fast handles classification and simple tasks;
/// Deep handles multi-step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelsConfig {
    pub fast: ModelRef,
    pub deep: ModelRef,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            fast: ModelRef {
                provider: "anthropic".into(),
                model: "claude-haiku-4-5".into(),
            },
            deep: ModelRef {
                provider: "anthropic".into(),
                model: "claude-sonnet-4-5".into(),
            },
        }
    }
}

/// Reference to a provider + model combination for a tier.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
    pub ollama: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

/// Per-call token budgets for each tier, plus the classification call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokensConfig {
    pub fast: TokenBudget,
    pub deep: TokenBudget,
    pub route_max_output: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            fast: TokenBudget {
                max_input: 2_000,
                max_output: 500,
            },
            deep: TokenBudget {
                max_input: 12_000,
                max_output: 4_000,
            },
            route_max_output: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenBudget {
    pub max_input: u64,
    pub max_output: u64,
}

/// USD per million tokens, per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingConfig {
    pub fast: TierPricing,
    pub deep: TierPricing,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            fast: TierPricing {
                input: 0.80,
                output: 4.00,
            },
            deep: TierPricing {
                input: 3.00,
                output: 15.00,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TierPricing {
    pub input: f64,
    pub output: f64,
}

/// Hard spend ceilings in USD. Breaching any one blocks further calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetsConfig {
    pub per_task_usd: f64,
    pub daily_usd: f64,
    pub monthly_usd: f64,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            per_task_usd: 0.75,
            daily_usd: 2.00,
            monthly_usd: 30.00,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub max_steps: u32,
    /// Fraction of max_steps at which the loop pauses for confirmation.
    pub checkpoint_ratio: f64,
    pub tool_timeout_secs: u64,
    pub tool_output_max_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            checkpoint_ratio: 0.7,
            tool_timeout_secs: 60,
            tool_output_max_bytes: 16_384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Fraction of the tier's input token budget available to memory context.
    pub context_fraction: f64,
    pub max_session_items: usize,
    pub max_pinned_items: usize,
    pub max_search_items: usize,
    /// Promote a task summary to long-term memory when a task completes.
    pub archive_on_complete: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_fraction: 0.25,
            max_session_items: 8,
            max_pinned_items: 2,
            max_search_items: 3,
            archive_on_complete: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.foreman".into(),
        }
    }
}
