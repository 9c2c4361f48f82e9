pub mod loader;
pub mod schema;

pub use loader::{find_config_path, load_config, resolve_data_dir, save_config};
pub use schema::{
    BudgetsConfig, Config, LimitsConfig, MemoryConfig, ModelRef, ModelsConfig, PricingConfig,
    ProviderConfig, ProvidersConfig, StorageConfig, TierPricing, TokenBudget, TokensConfig,
};
