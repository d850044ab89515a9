//! Agent layer.
//!
//! Turns a user message into an answer by letting a reasoning engine use
//! the tools of the running tool servers.
//!
//! - [`AgentDispatcher`] runs one turn: catalog, engine, result packaging
//! - [`ToolLoopEngine`] is a ready-made engine over any [`ModelProvider`]
//! - [`SessionToolInvoker`] executes the engine's tool calls

mod agent;
mod engine;
mod executor;

pub use agent::{
    AgentDispatcher, AgentTool, AgentToolCall, AgentToolResult, AgentTurnResult, CatalogEntry,
    DispatchError, ReasoningEngine, ToolCallRecord, ToolCatalog, ToolInvoker, TurnInput,
};
pub use engine::{
    ModelProvider, ModelStep, ToolLoopEngine, Transcript, TranscriptEntry, DEFAULT_INSTRUCTIONS,
};
pub use executor::SessionToolInvoker;
