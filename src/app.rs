//! Application context.
//!
//! Owns everything a running Bull Vision process shares across users: the
//! tool server sessions, the conversation contexts, the dispatcher and the
//! news store. Created once at startup and torn down with [`AppContext::shutdown`].

use std::sync::Arc;

use crate::ai::{AgentDispatcher, ModelProvider, ReasoningEngine, ToolLoopEngine};
use crate::conversation::{ConversationContextStore, Sender, UserId};
use crate::core::Config;
use crate::mcp::{ServerHandle, ServerSessionManager};
use crate::news::{store_new_articles, NewsArticle, NewsDedupStore};

/// Reply shown when a turn could not run at all.
pub const APOLOGY: &str =
    "Sorry, I can't reach my market data tools right now. Please try again in a moment.";

/// Answer to one user message.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Text to show the user
    pub text: String,
    /// Articles seen for the first time during this turn
    pub new_articles: Vec<NewsArticle>,
}

/// Process-wide state.
pub struct AppContext {
    manager: Arc<ServerSessionManager>,
    handles: Vec<ServerHandle>,
    contexts: ConversationContextStore,
    dispatcher: AgentDispatcher,
    news_store: Arc<dyn NewsDedupStore>,
}

impl AppContext {
    /// Start every configured server and wire up the context.
    pub async fn start(
        config: &Config,
        engine: Arc<dyn ReasoningEngine>,
        news_store: Arc<dyn NewsDedupStore>,
    ) -> anyhow::Result<Self> {
        let specs = config.server_specs()?;
        let manager = Arc::new(ServerSessionManager::new(config.session_settings()));

        let handles = manager.start(specs).await.map_err(|e| {
            tracing::error!(error = %e, "Tool servers failed to start");
            e
        })?;
        tracing::info!(servers = handles.len(), "Application context ready");

        Ok(Self {
            dispatcher: AgentDispatcher::new(Arc::clone(&manager), engine),
            manager,
            handles,
            contexts: ConversationContextStore::new(),
            news_store,
        })
    }

    /// Start with a [`ToolLoopEngine`] over `provider`, set up from the
    /// `[agent]` section of `config`.
    pub async fn start_with_provider<P: ModelProvider + 'static>(
        config: &Config,
        provider: P,
        news_store: Arc<dyn NewsDedupStore>,
    ) -> anyhow::Result<Self> {
        let engine = ToolLoopEngine::new(provider).with_config(&config.agent);
        Self::start(config, Arc::new(engine), news_store).await
    }

    /// The session manager.
    pub fn manager(&self) -> &Arc<ServerSessionManager> {
        &self.manager
    }

    /// Handles of the started servers, in configuration order.
    pub fn handles(&self) -> &[ServerHandle] {
        &self.handles
    }

    /// Conversation contexts of all users.
    pub fn contexts(&self) -> &ConversationContextStore {
        &self.contexts
    }

    /// Answer a user message.
    ///
    /// The exchange is recorded in the user's context only when the turn ran.
    pub async fn handle_message(&self, user_id: &UserId, text: &str) -> Reply {
        let context = self.contexts.get(user_id);

        match self.dispatcher.run(text, &context, &self.handles).await {
            Ok(result) => {
                context.append(Sender::User, text);
                context.append(Sender::Bot, result.output.clone());

                let new_articles =
                    store_new_articles(self.news_store.as_ref(), &result.artifacts).await;

                tracing::debug!(
                    user = %user_id,
                    tool_calls = result.tool_calls.len(),
                    new_articles = new_articles.len(),
                    "Turn complete"
                );

                Reply { text: result.output, new_articles }
            }
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Turn could not run");
                Reply { text: APOLOGY.to_string(), new_articles: Vec::new() }
            }
        }
    }

    /// Stop every server.
    pub async fn shutdown(&self) {
        self.manager.stop().await;
    }
}
