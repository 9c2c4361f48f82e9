use std::sync::Arc;

use anyhow::Result;
use foreman_config::MemoryConfig;

use crate::dispatch::ToolSchema;
use crate::memory::MemoryStore;
use crate::provider::{Prompt, Turn};
use crate::task::Task;

/// Words skipped during keyword extraction.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "shall",
    "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "about", "between",
    "through", "after", "before", "during", "without", "it", "its", "this", "that", "these",
    "those", "i", "you", "he", "she", "we", "they", "my", "your", "his", "her", "our", "their",
    "me", "him", "and", "or", "but", "not", "so", "if", "then", "than", "also", "just", "please",
    "help", "want", "need", "make", "get", "run",
];

/// Extract up to `max` search keywords from task text, skipping stop words.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();
    for word in text.to_lowercase().split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        if word.len() <= 2 || STOP_WORDS.contains(&word) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
            if keywords.len() >= max {
                break;
            }
        }
    }
    keywords
}

/// Rough token count for budget arithmetic.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Merge the three memory tiers in precedence order under a token cap.
/// Whole items from lower-precedence tiers are dropped first; within a
/// tier, items past the cap are dropped from the end.
pub fn assemble_memory(
    session: &[String],
    pinned: &[String],
    searched: &[String],
    cap_tokens: usize,
) -> String {
    let sections: [(&str, &[String]); 3] = [
        ("Notes from this task (most recent first):", session),
        ("Pinned context:", pinned),
        ("Related past work:", searched),
    ];

    let mut remaining = cap_tokens;
    let mut out = String::new();
    for (header, items) in sections {
        let mut section = String::new();
        for item in items {
            let line = format!("- {item}\n");
            let tokens = estimate_tokens(&line);
            if tokens > remaining {
                break;
            }
            remaining -= tokens;
            section.push_str(&line);
        }
        if !section.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(header);
            out.push('\n');
            out.push_str(&section);
        }
    }
    out
}

fn render_tool_list(tools: &[ToolSchema]) -> String {
    if tools.is_empty() {
        return "(no tools available)".to_string();
    }
    tools
        .iter()
        .map(|t| {
            let args: Vec<&str> = t
                .parameters
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|props| props.keys().map(String::as_str).collect())
                .unwrap_or_default();
            if args.is_empty() {
                format!("- {}: {}", t.name, t.description)
            } else {
                format!("- {}: {} (args: {})", t.name, t.description, args.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds the full prompt for each model call: fixed instructions, the tool
/// list, the tiered memory block, and the transcript so far.
pub struct ContextBuilder {
    memory: Arc<MemoryStore>,
    cfg: MemoryConfig,
}

impl ContextBuilder {
    pub fn new(memory: Arc<MemoryStore>, cfg: MemoryConfig) -> Self {
        Self { memory, cfg }
    }

    pub fn build(
        &self,
        task: &Task,
        transcript: &[Turn],
        tools: &[ToolSchema],
        input_token_budget: u64,
    ) -> Result<Prompt> {
        // Tier 1: this task's session notes, most recent first.
        let mut session: Vec<String> = self
            .memory
            .session_items(&task.id)?
            .into_iter()
            .map(|i| i.content)
            .collect();
        session.reverse();
        session.truncate(self.cfg.max_session_items);

        // Tier 2: long-term items pinned for this origin.
        let pinned = self.memory.pinned_for(&task.origin, self.cfg.max_pinned_items)?;

        // Tier 3: keyword hits, deduplicated against tier 2.
        let keywords = extract_keywords(&task.description, 5);
        let searched: Vec<_> = self
            .memory
            .search_long_term(&keywords, self.cfg.max_search_items + pinned.len())?
            .into_iter()
            .filter(|hit| pinned.iter().all(|p| p.id != hit.id))
            .take(self.cfg.max_search_items)
            .collect();

        let cap = (input_token_budget as f64 * self.cfg.context_fraction) as usize;
        let memory_block = assemble_memory(
            &session,
            &pinned.iter().map(|i| i.content.clone()).collect::<Vec<_>>(),
            &searched.iter().map(|i| i.content.clone()).collect::<Vec<_>>(),
            cap,
        );

        let system = format!(
            r#"You are Foreman, an autonomous task-execution agent working on behalf of {origin}.

RULES:
- Be concise. You run inside a metered loop; every token costs money.
- When uncertain, say so explicitly. The loop will pause and ask the user.
- Use tools for facts and side effects; never invent tool results.
- Report what you did, not what you could do.

AVAILABLE TOOLS:
{tools}

MEMORY:
{memory}"#,
            origin = task.origin,
            tools = render_tool_list(tools),
            memory = if memory_block.is_empty() {
                "(none)".to_string()
            } else {
                memory_block
            },
        );

        Ok(Prompt {
            system,
            turns: transcript.to_vec(),
        })
    }
}
