use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::model::types::{ChannelId, GuildId, MessageId, Ssrc, UserId};

/// Identifies a message the bot can later edit or delete.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// A chat message as stored in the shared message history.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    /// None for direct messages.
    pub guild_id: Option<GuildId>,
    pub author_id: UserId,
    pub author_is_bot: bool,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            channel_id: self.channel_id,
            message_id: self.id,
        }
    }

    /// Key of the message-history list this message belongs to.
    pub fn cache_key(&self) -> String {
        message_cache_key(self.guild_id, self.channel_id)
    }
}

pub fn message_cache_key(guild_id: Option<GuildId>, channel_id: ChannelId) -> String {
    match guild_id {
        Some(guild_id) => format!("messages:guild:{}:channel:{}", guild_id, channel_id),
        None => format!("messages:dm:{}", channel_id),
    }
}

/// Cache key of a finalized segment's audio, given its storage key.
pub fn audio_cache_key(storage_key: &str) -> String {
    format!("audio:{}.ogg", storage_key)
}

/// One transcribed utterance.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub user_id: UserId,
    pub text: String,
    /// wall-clock time the speaker started talking
    pub started_at: DateTime<Utc>,
    pub audio_duration_ms: u64,
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Reply,
    React,
    Stop,
    Continue,
    Ignore,
}

/// The language model's verdict on a new text message.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct EngagementDecision {
    pub decision: Decision,
    /// e.g. the emoji for REACT
    pub argument: Option<String>,
}

impl EngagementDecision {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            argument: None,
        }
    }

    pub fn with_argument(decision: Decision, argument: impl Into<String>) -> Self {
        Self {
            decision,
            argument: Some(argument.into()),
        }
    }
}

/// Everything a streamed completion needs.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub trigger: ChatMessage,
    pub history: Vec<ChatMessage>,
    pub context: String,
}

/// Persisted form of a guild voice session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildStateSnapshot {
    pub guild_id: GuildId,
    pub connection_channel_id: Option<ChannelId>,
    pub connection_start_time: Option<DateTime<Utc>>,
    pub connection_message_ref: Option<MessageRef>,
    pub speaker_map: BTreeMap<Ssrc, UserId>,
    pub unmapped_sources: BTreeSet<Ssrc>,
    pub transcript_history: BTreeMap<ChannelId, VecDeque<TranscriptEntry>>,
}

/// A point-in-time view of a session, for the status message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub connected_for_secs: u64,
    pub active_segments: usize,
    pub speakers: BTreeSet<UserId>,
    pub sources: usize,
    pub unmapped_sources: usize,
}

/// Composed when a session is torn down.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisconnectSummary {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub duration_secs: u64,
    pub distinct_speakers: usize,
    pub sources: usize,
    pub unmapped_sources: usize,
    pub segments_finalized: usize,
}
