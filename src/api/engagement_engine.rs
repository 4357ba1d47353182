use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    api::{
        api_types::ChatMessage,
        collaborators::{Cache, ChatPlatform, LanguageModel},
    },
    config::Config,
    engagement::engine_loop,
    model::{
        engagement::{EngagementMode, UserEngagement},
        registry::Registry,
        types::UserId,
    },
};

/// Shared by every engagement task.
pub(crate) struct EngagementContext {
    pub config: Config,
    pub cache: Arc<dyn Cache>,
    pub llm: Arc<dyn LanguageModel>,
    pub platform: Arc<dyn ChatPlatform>,
    pub users: Registry<UserId, UserEngagement>,
}

/// Decides, per incoming text message, whether and how to answer it.
///
/// Each message runs on its own task.  Users never wait on each
/// other; messages from the same user are serialized by that user's
/// lock, and a newer one always supersedes an older one.
pub struct EngagementEngine {
    ctx: Arc<EngagementContext>,
}

impl EngagementEngine {
    pub fn new(
        config: Config,
        cache: Arc<dyn Cache>,
        llm: Arc<dyn LanguageModel>,
        platform: Arc<dyn ChatPlatform>,
    ) -> Self {
        Self {
            ctx: Arc::new(EngagementContext {
                config: config.sanitized(),
                cache,
                llm,
                platform,
                users: Registry::new(),
            }),
        }
    }

    /// Starts handling `message` in the background.  Returns `None` if
    /// the message came from a bot, which includes ourselves.
    pub fn on_message(&self, message: ChatMessage) -> Option<JoinHandle<()>> {
        if !self.should_engage(&message) {
            debug!(message_id = message.id, "ignoring bot message");
            return None;
        }
        let user = self.ctx.users.get_or_create(message.author_id);
        Some(tokio::spawn(engine_loop::handle_message(
            self.ctx.clone(),
            user,
            message,
        )))
    }

    /// Handles `message` on the caller's task.
    pub async fn handle_message(&self, message: ChatMessage) {
        if !self.should_engage(&message) {
            return;
        }
        let user = self.ctx.users.get_or_create(message.author_id);
        engine_loop::handle_message(self.ctx.clone(), user, message).await;
    }

    pub fn user(&self, user_id: UserId) -> Option<Arc<UserEngagement>> {
        self.ctx.users.get(user_id)
    }

    /// Idle for users we have never heard from.
    pub fn state_of(&self, user_id: UserId) -> EngagementMode {
        self.user(user_id)
            .map(|user| user.mode())
            .unwrap_or_default()
    }

    fn should_engage(&self, message: &ChatMessage) -> bool {
        !message.author_is_bot && Some(message.author_id) != self.ctx.config.self_user_id
    }
}
