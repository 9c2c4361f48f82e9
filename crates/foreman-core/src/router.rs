use std::sync::Arc;

use anyhow::Result;
use foreman_config::Config;
use tracing::{debug, warn};

use crate::ledger::{call_cost, CostLogEntry, Ledger};
use crate::provider::{ModelProvider, Prompt, Turn};
use crate::task::Tier;

/// Strip a leading `!fast` / `!deep` override token from task text.
pub fn parse_override(text: &str) -> (Option<Tier>, &str) {
    let trimmed = text.trim_start();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("!fast") {
        (Some(Tier::Fast), trimmed[5..].trim_start())
    } else if lower.starts_with("!deep") {
        (Some(Tier::Deep), trimmed[5..].trim_start())
    } else {
        (None, text)
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub tier: Tier,
    /// Task text with any override prefix stripped.
    pub text: String,
    pub classification_cost: f64,
}

fn classify_prompt(task_text: &str) -> String {
    format!(
        "Classify this task into exactly one category. Respond with ONLY the \
         category name, nothing else.\n\n\
         FAST — file reads, status checks, simple formatting, short summaries, \
         listing files, simple questions\n\
         DEEP — writing, analysis, experiment design, code debugging, multi-step \
         reasoning, research, data interpretation\n\n\
         Task: {task_text}"
    )
}

/// Resolves a task to a model tier. An explicit override bypasses
/// classification; otherwise one Fast-tier call labels the task, and an
/// unparseable label fails open to Deep rather than dropping the task.
/// Always records exactly one CostLogEntry (zero-cost on override).
pub struct Router {
    provider: Arc<dyn ModelProvider>,
    ledger: Ledger,
    cfg: Config,
}

impl Router {
    pub fn new(provider: Arc<dyn ModelProvider>, ledger: Ledger, cfg: Config) -> Self {
        Self {
            provider,
            ledger,
            cfg,
        }
    }

    pub async fn route(
        &self,
        task_id: &str,
        text: &str,
        explicit: Option<Tier>,
    ) -> Result<RouteDecision> {
        let (prefix_tier, stripped) = parse_override(text);

        if let Some(tier) = explicit.or(prefix_tier) {
            debug!("[{task_id}] tier override: {}", tier.as_str());
            self.ledger
                .record(CostLogEntry::now(
                    task_id,
                    tier,
                    self.provider.model_name(tier),
                    0,
                    0,
                    0.0,
                ))
                .await?;
            return Ok(RouteDecision {
                tier,
                text: stripped.to_string(),
                classification_cost: 0.0,
            });
        }

        let prompt = Prompt {
            system: String::new(),
            turns: vec![Turn::User {
                text: classify_prompt(text),
            }],
        };

        match self
            .provider
            .call(Tier::Fast, &prompt, &[], self.cfg.tokens.route_max_output)
            .await
        {
            Ok(resp) => {
                let cost = call_cost(
                    resp.usage.input_tokens,
                    resp.usage.output_tokens,
                    &self.cfg.pricing.fast,
                );
                self.ledger
                    .record(CostLogEntry::now(
                        task_id,
                        Tier::Fast,
                        self.provider.model_name(Tier::Fast),
                        resp.usage.input_tokens,
                        resp.usage.output_tokens,
                        cost,
                    ))
                    .await?;

                let label = resp.text.trim().to_uppercase();
                let tier = if label.contains("FAST") {
                    Tier::Fast
                } else if label.contains("DEEP") {
                    Tier::Deep
                } else {
                    warn!("[{task_id}] unparseable classification '{label}', failing open to deep");
                    Tier::Deep
                };
                debug!("[{task_id}] classified as {} (${cost:.6})", tier.as_str());

                Ok(RouteDecision {
                    tier,
                    text: text.to_string(),
                    classification_cost: cost,
                })
            }
            Err(e) => {
                warn!("[{task_id}] classification call failed ({e}), failing open to deep");
                self.ledger
                    .record(CostLogEntry::now(
                        task_id,
                        Tier::Fast,
                        self.provider.model_name(Tier::Fast),
                        0,
                        0,
                        0.0,
                    ))
                    .await?;
                Ok(RouteDecision {
                    tier: Tier::Deep,
                    text: text.to_string(),
                    classification_cost: 0.0,
                })
            }
        }
    }
}
