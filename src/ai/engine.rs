//! Tool-use loop over a pluggable model client.
//!
//! [`ToolLoopEngine`] is a [`ReasoningEngine`] that shows a
//! [`ModelProvider`] the turn so far as a [`Transcript`], runs whatever
//! tools the model asks for through the turn's [`ToolInvoker`] and asks
//! again, until the model answers or the step budget runs out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::agent::{AgentTool, AgentToolCall, ReasoningEngine, ToolInvoker, TurnInput};
use crate::conversation::Sender;
use crate::core::AgentConfig;

/// One entry of the transcript a model is shown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// System instructions followed by the tool list
    Instructions { content: String },

    /// Something the user said
    User { content: String },

    /// Something the model said, with the tools it asked for
    Model {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<AgentToolCall>,
    },

    /// Output of one requested tool call
    ToolOutput { tool_call_id: String, content: String },
}

/// Everything a model sees when asked for its next step.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub entries: Vec<TranscriptEntry>,
    /// Tools the model may ask for; empty when the provider cannot use tools
    pub tools: Vec<AgentTool>,
    /// Number of the step being asked for, starting at 1
    pub step: usize,
    pub max_steps: usize,
}

impl Transcript {
    /// The most recent entry.
    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    /// Text of the latest non-empty model message.
    pub fn final_answer(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|entry| match entry {
            TranscriptEntry::Model { content: Some(text), .. } if !text.trim().is_empty() => {
                Some(text.as_str())
            }
            _ => None,
        })
    }

    fn push_model(&mut self, content: Option<String>, tool_calls: Vec<AgentToolCall>) {
        self.entries.push(TranscriptEntry::Model { content, tool_calls });
    }
}

/// What a model decided to do next.
#[derive(Debug, Clone)]
pub enum ModelStep {
    /// The turn is over
    Answer(String),
    /// Run these tools and ask again; `note` is any text sent along
    UseTools { note: Option<String>, calls: Vec<AgentToolCall> },
}

/// A model client that decides one step of a turn.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn next_step(&self, transcript: &Transcript) -> anyhow::Result<ModelStep>;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether the tool list should be offered at all.
    fn supports_tools(&self) -> bool {
        true
    }
}

/// Default instructions when none are configured.
pub const DEFAULT_INSTRUCTIONS: &str = "You are Bull Vision, a stock trading assistant. \
Use the available tools to look up current information before answering, ask for a ticker \
symbol or time period when the request lacks one, and keep answers balanced and aware of risk.";

/// Runs the model/tool loop for one turn.
pub struct ToolLoopEngine<P: ModelProvider> {
    provider: P,
    instructions: String,
    max_steps: usize,
}

impl<P: ModelProvider> ToolLoopEngine<P> {
    /// Create an engine with the default instructions and 10 steps.
    pub fn new(provider: P) -> Self {
        let defaults = AgentConfig::default();
        Self {
            provider,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            max_steps: defaults.max_iterations,
        }
    }

    /// Apply the `[agent]` section of the configuration.
    pub fn with_config(self, config: &AgentConfig) -> Self {
        let engine = self.with_max_iterations(config.max_iterations);
        match &config.instructions {
            Some(instructions) => engine.with_instructions(instructions.clone()),
            None => engine,
        }
    }

    /// Replace the system instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Set how many model steps one turn may take (at least one).
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_steps = max.max(1);
        self
    }

    /// The underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn transcript_for(&self, turn: &TurnInput<'_>) -> Transcript {
        let tools = if self.provider.supports_tools() {
            turn.catalog.agent_tools()
        } else {
            Vec::new()
        };

        let mut entries = Vec::with_capacity(turn.history.len() + 2);
        entries.push(TranscriptEntry::Instructions {
            content: build_system_prompt(&self.instructions, &tools),
        });
        entries.extend(turn.history.iter().map(|message| match message.sender {
            Sender::User => TranscriptEntry::User { content: message.content.clone() },
            Sender::Bot => TranscriptEntry::Model {
                content: Some(message.content.clone()),
                tool_calls: Vec::new(),
            },
        }));
        entries.push(TranscriptEntry::User { content: turn.input.to_string() });

        Transcript { entries, tools, step: 0, max_steps: self.max_steps }
    }
}

#[async_trait]
impl<P: ModelProvider> ReasoningEngine for ToolLoopEngine<P> {
    async fn run_turn(
        &self,
        turn: &TurnInput<'_>,
        tools: &dyn ToolInvoker,
    ) -> anyhow::Result<String> {
        let mut transcript = self.transcript_for(turn);

        for step in 1..=self.max_steps {
            transcript.step = step;
            tracing::debug!(provider = self.provider.name(), step, "Model step");

            match self.provider.next_step(&transcript).await? {
                ModelStep::Answer(text) => {
                    transcript.push_model(Some(text), Vec::new());
                    return transcript
                        .final_answer()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow::anyhow!("the model produced no answer"));
                }
                ModelStep::UseTools { note, calls } => {
                    transcript.push_model(note, calls.clone());
                    for call in &calls {
                        tracing::info!(tool = %call.name, "Executing tool");
                        let result = tools.invoke(call).await;
                        transcript.entries.push(TranscriptEntry::ToolOutput {
                            tool_call_id: result.tool_call_id,
                            content: result.output,
                        });
                    }
                }
            }
        }

        tracing::warn!(max = self.max_steps, "Model hit the step limit");
        transcript
            .final_answer()
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow::anyhow!("the model produced no answer in {} steps", self.max_steps)
            })
    }
}

/// Build the system prompt for the agent.
fn build_system_prompt(instructions: &str, tools: &[AgentTool]) -> String {
    let mut prompt = instructions.trim().to_string();

    if !tools.is_empty() {
        prompt.push_str("\n\n## Available Tools\n");
        for tool in tools {
            prompt.push_str(&format!("- {}", tool.name));
            if let Some(ref desc) = tool.description {
                prompt.push_str(&format!(": {}", desc));
            }
            prompt.push('\n');
        }
    }

    prompt
}
