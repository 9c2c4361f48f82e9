use anyhow::Result;
use async_trait::async_trait;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::completion::{CompletionModel, CompletionRequest, Message, ToolDefinition};
use rig::message::{
    AssistantContent, Text, ToolCall, ToolFunction, ToolResult, ToolResultContent, UserContent,
};
use rig::OneOrMany;
use serde::{Deserialize, Serialize};

use crate::dispatch::ToolSchema;
use crate::task::Tier;

/// Actual token counts reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub call_id: Option<String>,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One tool result echoed back into the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultTurn {
    pub id: String,
    pub call_id: Option<String>,
    pub name: String,
    pub content: String,
}

/// One transcript turn. Within a task, turns are strictly ordered; step N+1
/// always sees step N's completed results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum Turn {
    User { text: String },
    Assistant {
        text: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResults { results: Vec<ToolResultTurn> },
}

/// Full model-call input: system prompt plus the ordered transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub turns: Vec<Turn>,
}

/// Parsed provider output for one call.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
}

/// Interface to the hosted model. The orchestrator only sees this trait;
/// tests script it, production wraps rig.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model_name(&self, tier: Tier) -> &str;

    async fn call(
        &self,
        tier: Tier,
        prompt: &Prompt,
        tools: &[ToolSchema],
        max_tokens: u64,
    ) -> Result<ModelResponse>;
}

/// Production provider: one rig completion model per tier.
#[allow(deprecated)]
pub struct RigProvider {
    fast: (CompletionModelHandle<'static>, String),
    deep: (CompletionModelHandle<'static>, String),
}

#[allow(deprecated)]
impl RigProvider {
    pub fn new(
        fast: CompletionModelHandle<'static>,
        fast_name: String,
        deep: CompletionModelHandle<'static>,
        deep_name: String,
    ) -> Self {
        Self {
            fast: (fast, fast_name),
            deep: (deep, deep_name),
        }
    }

    fn tier_model(&self, tier: Tier) -> &(CompletionModelHandle<'static>, String) {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Deep => &self.deep,
        }
    }
}

fn to_rig_messages(turns: &[Turn]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(turns.len());
    for turn in turns {
        match turn {
            Turn::User { text } => {
                messages.push(Message::User {
                    content: OneOrMany::one(UserContent::Text(Text { text: text.clone() })),
                });
            }
            Turn::Assistant { text, tool_calls } => {
                let mut parts: Vec<AssistantContent> = Vec::new();
                if !text.is_empty() {
                    parts.push(AssistantContent::Text(Text { text: text.clone() }));
                }
                for tc in tool_calls {
                    parts.push(AssistantContent::ToolCall(ToolCall {
                        id: tc.id.clone(),
                        call_id: tc.call_id.clone(),
                        function: ToolFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                        signature: None,
                        additional_params: None,
                    }));
                }
                let content = OneOrMany::many(parts).unwrap_or_else(|_| {
                    OneOrMany::one(AssistantContent::Text(Text { text: text.clone() }))
                });
                messages.push(Message::Assistant { id: None, content });
            }
            Turn::ToolResults { results } => {
                let parts: Vec<UserContent> = results
                    .iter()
                    .map(|r| {
                        UserContent::ToolResult(ToolResult {
                            id: r.id.clone(),
                            call_id: r.call_id.clone(),
                            content: OneOrMany::one(ToolResultContent::Text(Text {
                                text: r.content.clone(),
                            })),
                        })
                    })
                    .collect();
                let content = OneOrMany::many(parts).unwrap_or_else(|_| {
                    OneOrMany::one(UserContent::Text(Text { text: String::new() }))
                });
                messages.push(Message::User { content });
            }
        }
    }
    messages
}

#[allow(deprecated)]
#[async_trait]
impl ModelProvider for RigProvider {
    fn model_name(&self, tier: Tier) -> &str {
        &self.tier_model(tier).1
    }

    async fn call(
        &self,
        tier: Tier,
        prompt: &Prompt,
        tools: &[ToolSchema],
        max_tokens: u64,
    ) -> Result<ModelResponse> {
        let (model, model_name) = self.tier_model(tier);

        let messages = to_rig_messages(&prompt.turns);
        let chat_history = OneOrMany::many(messages).map_err(|_| {
            anyhow::anyhow!("model call requires at least one transcript turn")
        })?;

        let tool_defs: Vec<ToolDefinition> = tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        let request = CompletionRequest {
            preamble: Some(prompt.system.clone()),
            chat_history,
            documents: Vec::new(),
            tools: tool_defs,
            temperature: None,
            max_tokens: Some(max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        tracing::debug!(
            "model call [{model_name}]: {} turns, max_tokens={max_tokens}",
            prompt.turns.len()
        );

        let response = model
            .completion(request)
            .await
            .map_err(|e| anyhow::anyhow!("model completion error: {e}"))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(t) => text.push_str(&t.text),
                AssistantContent::ToolCall(tc) => tool_calls.push(ToolCallRequest {
                    id: tc.id.clone(),
                    call_id: tc.call_id.clone(),
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                }),
                _ => {}
            }
        }

        Ok(ModelResponse {
            text,
            tool_calls,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
        })
    }
}
