use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use foreman_config::{find_config_path, load_config, resolve_data_dir, Config};
use foreman_core::ledger::{Ledger, LedgerStore};
use foreman_core::memory::{LongTermItem, MemoryStore};
use foreman_core::orchestrator::StatusSummary;
use foreman_core::{EventKind, Orchestrator, RegistryDispatcher, RigProvider, TaskStatus, Tier, ToolDispatcher};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, ollama, openai, openrouter};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Render markdown text to the terminal using termimad.
fn render_markdown(text: &str) {
    let skin = termimad::MadSkin::default();
    skin.print_text(text);
}

#[derive(Parser)]
#[command(name = "foreman", about = "Budget-supervised task agent", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and follow it to completion
    Run {
        /// Task text; prefix with !fast or !deep to pin the model tier
        task: String,

        /// Origin tag recorded with the task
        #[arg(short, long, default_value = "cli:local")]
        origin: String,

        /// Pin the model tier (fast|deep), skipping classification
        #[arg(short, long)]
        tier: Option<String>,
    },
    /// Show live tasks and current spend
    Status,
    /// Show spend reports from the cost ledger
    Usage {
        /// Days of history to show
        #[arg(short, long, default_value_t = 14)]
        days: usize,
    },
    /// Manage long-term memory
    Memory {
        #[command(subcommand)]
        action: MemoryCommands,
    },
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// List recent items
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Search items by keyword
    Search { keywords: Vec<String> },
    /// Write a fact directly to long-term memory
    Add {
        content: String,

        /// Comma-separated keyword tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        #[arg(short, long, default_value = "cli:local")]
        origin: String,
    },
    /// Delete an item by id
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(base_filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);
    let config = load_config(&config_path)?;
    let data_dir = resolve_data_dir(&config.storage.data_dir);

    match cli.command {
        Commands::Run { task, origin, tier } => {
            run_task(&config, &data_dir, &task, &origin, tier).await
        }
        Commands::Status => run_status(&data_dir),
        Commands::Usage { days } => run_usage(&data_dir, days),
        Commands::Memory { action } => run_memory(&data_dir, action),
    }
}

async fn run_task(
    config: &Config,
    data_dir: &Path,
    task_text: &str,
    origin: &str,
    tier: Option<String>,
) -> Result<()> {
    let tier_override = tier
        .as_deref()
        .map(|t| {
            Tier::from_str(t)
                .ok_or_else(|| anyhow::anyhow!("unknown tier '{t}' (expected fast or deep)"))
        })
        .transpose()?;

    let provider = Arc::new(build_provider(config)?);
    // Tools are registered by the embedding deployment; a bare CLI run has
    // none, so the model answers from context alone.
    let dispatcher: Arc<dyn ToolDispatcher> =
        Arc::new(RegistryDispatcher::new(config.limits.tool_output_max_bytes));
    let ledger_store = LedgerStore::new(&data_dir.join("ledger.sqlite"))?;
    let ledger = Ledger::spawn(ledger_store, config.budgets.clone());
    let memory = Arc::new(MemoryStore::new(&data_dir.join("memory.sqlite"))?);

    let orchestrator = Orchestrator::new(
        config.clone(),
        provider,
        dispatcher,
        ledger,
        memory,
    );
    for id in orchestrator.recover_stale()? {
        println!("Recovered stale task {id}");
    }

    let mut events = orchestrator.subscribe();
    let task_id = orchestrator.submit(task_text, origin, tier_override).await?;
    println!("Task {task_id} submitted.");

    loop {
        let event = events.recv().await?;
        if event.task_id != task_id {
            continue;
        }
        match event.kind {
            EventKind::Progress => println!("  {}", event.payload),
            EventKind::CheckpointQuestion => {
                println!();
                render_markdown(&event.payload);
                let mut editor = DefaultEditor::new()?;
                match editor.readline("resume (empty or 'cancel' to stop)> ") {
                    Ok(line) => {
                        let line = line.trim();
                        if line.is_empty() || line.eq_ignore_ascii_case("cancel") {
                            orchestrator.cancel(&task_id).await?;
                        } else {
                            orchestrator.resume(&task_id, line).await?;
                        }
                    }
                    Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                        orchestrator.cancel(&task_id).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            EventKind::FinalResult => {
                println!();
                render_markdown(&event.payload);
                break;
            }
            EventKind::Error => {
                eprintln!("Task failed: {}", event.payload);
                break;
            }
        }
    }

    Ok(())
}

fn run_status(data_dir: &Path) -> Result<()> {
    let memory = MemoryStore::new(&data_dir.join("memory.sqlite"))?;
    let ledger = LedgerStore::new(&data_dir.join("ledger.sqlite"))?;

    let active = memory.active_tasks()?;
    let count = |status: TaskStatus| {
        active
            .iter()
            .filter(|t| t.status == status.as_str())
            .count()
    };
    let summary = StatusSummary {
        pending: count(TaskStatus::Pending),
        running: count(TaskStatus::Running),
        checkpoint_wait: count(TaskStatus::CheckpointWait),
        today_usd: ledger.prefix_total(&chrono::Utc::now().format("%Y-%m-%d").to_string())?,
        month_usd: ledger.prefix_total(&chrono::Utc::now().format("%Y-%m").to_string())?,
    };
    println!("{summary}");

    if !active.is_empty() {
        println!();
        for task in active {
            let description: String = task.description.chars().take(60).collect();
            println!(
                "  {}  {:<15} step {:>2}  ${:.4}  {}",
                task.id, task.status, task.steps, task.cost_usd, description
            );
        }
    }
    Ok(())
}

fn run_usage(data_dir: &Path, days: usize) -> Result<()> {
    let ledger = LedgerStore::new(&data_dir.join("ledger.sqlite"))?;

    let daily = ledger.daily_report(days)?;
    if daily.is_empty() {
        println!("No usage recorded yet.");
        return Ok(());
    }

    println!("Daily spend:");
    for row in daily {
        println!("  {}  {:>4} calls  ${:.4}", row.day, row.calls, row.cost_usd);
    }

    println!("\nRecent tasks:");
    for row in ledger.task_report(10)? {
        println!(
            "  {}  {:>4} calls  ${:.4}",
            row.task_id, row.calls, row.cost_usd
        );
    }
    Ok(())
}

fn run_memory(data_dir: &Path, action: MemoryCommands) -> Result<()> {
    let memory = MemoryStore::new(&data_dir.join("memory.sqlite"))?;

    match action {
        MemoryCommands::List { limit } => {
            for item in memory.list_long_term(limit)? {
                println!("  {}  [{}]  {}", item.id, item.tags.join(","), item.content);
            }
        }
        MemoryCommands::Search { keywords } => {
            if keywords.is_empty() {
                anyhow::bail!("at least one keyword required");
            }
            for item in memory.search_long_term(&keywords, 10)? {
                println!("  {}  [{}]  {}", item.id, item.tags.join(","), item.content);
            }
        }
        MemoryCommands::Add {
            content,
            tags,
            origin,
        } => {
            let item = LongTermItem::new(&content, tags, &origin);
            memory.promote_long_term(&item)?;
            println!("Saved {}", item.id);
        }
        MemoryCommands::Delete { id } => {
            if memory.delete_long_term(&id)? {
                println!("Deleted {id}");
            } else {
                println!("No item with id {id}");
            }
        }
    }
    Ok(())
}

fn build_provider(config: &Config) -> Result<RigProvider> {
    let fast = create_model_for(&config.models.fast.provider, &config.models.fast.model, config)?;
    let deep = create_model_for(&config.models.deep.provider, &config.models.deep.model, config)?;
    Ok(RigProvider::new(
        fast,
        config.models.fast.model.clone(),
        deep,
        config.models.deep.model.clone(),
    ))
}

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(
    provider_cfg: &Option<foreman_config::ProviderConfig>,
    env_var: &str,
) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

/// Create a completion model for a specific provider + model combination.
///
/// Errors clearly if the provider is unknown or has no API key.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &Config,
) -> Result<CompletionModelHandle<'static>> {
    if provider.is_empty() {
        anyhow::bail!("No provider configured. Valid providers: anthropic, openai, openrouter, ollama");
    }
    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }

    match provider {
        "anthropic" => {
            let key = resolve_api_key(&config.providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Anthropic provider selected but no API key found. \
                     Set providers.anthropic.apiKey in config.json or ANTHROPIC_API_KEY env var."
                    )
                })?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            tracing::info!(
                "Using Anthropic provider with model '{model_name}' (prompt caching enabled)"
            );
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openai" => {
            let key =
                resolve_api_key(&config.providers.openai, "OPENAI_API_KEY").ok_or_else(|| {
                    anyhow::anyhow!(
                        "OpenAI provider selected but no API key found. \
                     Set providers.openai.apiKey in config.json or OPENAI_API_KEY env var."
                    )
                })?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(ref base) = config
                .providers
                .openai
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
                tracing::info!("Using OpenAI provider with custom base: {base}");
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openrouter" => {
            let key = resolve_api_key(&config.providers.openrouter, "OPENROUTER_API_KEY")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "OpenRouter provider selected but no API key found. \
                     Set providers.openrouter.apiKey in config.json or OPENROUTER_API_KEY env var."
                    )
                })?;
            let client: openrouter::Client = openrouter::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenRouter provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(ref base) = config
                .providers
                .ollama
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        other => anyhow::bail!(
            "Unknown provider '{other}'. Valid providers: anthropic, openai, openrouter, ollama"
        ),
    }
}
