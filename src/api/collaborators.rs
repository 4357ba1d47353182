//! The engine's view of the outside world.  Each collaborator is a
//! narrow async trait so the platform layer (or a test) can plug in
//! its own implementation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::{
    api::api_types::{
        ChatMessage, CompletionRequest, EngagementDecision, GuildStateSnapshot, MessageRef,
    },
    error::Result,
    events::voice::VoiceEvent,
    model::{
        engagement::ResponseHandle,
        types::{ChannelId, GuildId, UserId},
    },
};

/// Shared key/value store for session state, audio, and message history.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn save_guild_state(&self, guild_id: GuildId, state: &GuildStateSnapshot) -> Result<()>;

    async fn load_guild_state(&self, guild_id: GuildId) -> Result<Option<GuildStateSnapshot>>;

    async fn save_audio(&self, key: &str, audio: Bytes, ttl: Duration) -> Result<()>;

    async fn get_audio(&self, key: &str) -> Result<Bytes>;

    async fn delete_audio(&self, key: &str) -> Result<()>;

    async fn add_message(&self, key: &str, message: &ChatMessage) -> Result<()>;

    async fn bulk_insert_messages(&self, key: &str, messages: &[ChatMessage]) -> Result<()>;

    /// The newest `n` messages under `key`, oldest first.
    async fn get_last_n_messages(&self, key: &str, n: usize) -> Result<Vec<ChatMessage>>;
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Converts one finalized Ogg/Opus segment to text.
    async fn transcribe(&self, audio: Bytes) -> Result<String>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// `recent` is in chronological order.
    async fn engagement_decision(&self, recent: &[ChatMessage]) -> Result<EngagementDecision>;

    async fn generate_context_block(&self) -> Result<String>;

    /// Streams a reply into a chat message.  As soon as the message
    /// exists the implementation must announce it via `response.bind`.
    /// Must return `Err(Error::Cancelled)` promptly once `cancel` fires.
    async fn stream_chat_completion(
        &self,
        cancel: CancellationToken,
        request: CompletionRequest,
        response: ResponseHandle,
    ) -> Result<ChatMessage>;
}

/// The text side of the chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn send_message(&self, channel_id: ChannelId, content: &str) -> Result<MessageRef>;

    async fn edit_message(&self, message: MessageRef, content: &str) -> Result<()>;

    async fn delete_message(&self, message: MessageRef) -> Result<()>;

    async fn add_reaction(&self, message: MessageRef, emoji: &str) -> Result<()>;

    async fn trigger_typing(&self, channel_id: ChannelId) -> Result<()>;

    async fn is_bot(&self, user_id: UserId) -> Result<bool>;
}

/// A live voice connection.
pub trait VoiceConnection: Send + Sync {
    /// The channel the connection is currently in, as last reported
    /// by the voice server.
    fn current_channel(&self) -> Option<ChannelId>;

    /// Request the connection close.  Must be safe to call repeatedly.
    fn leave(&self);
}

/// A connection plus the stream of events it produces.
pub struct VoiceLink {
    pub connection: Arc<dyn VoiceConnection>,
    pub events: UnboundedReceiver<VoiceEvent>,
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceLink>;
}
