//! Recording fakes for every collaborator, shared by the unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{
        api_types::{
            ChatMessage, CompletionRequest, Decision, EngagementDecision, GuildStateSnapshot,
            MessageRef,
        },
        collaborators::{
            Cache, ChatPlatform, LanguageModel, SpeechToText, VoiceConnection, VoiceGateway,
            VoiceLink,
        },
    },
    error::{Error, Result},
    events::voice::VoiceEvent,
    model::{
        engagement::ResponseHandle,
        types::{ChannelId, GuildId, UserId},
    },
};

/// The service's own identity in tests.
pub(crate) const BOT_ID: UserId = 999;

pub(crate) fn message(id: u64, author_id: UserId, content: &str) -> ChatMessage {
    ChatMessage {
        id,
        channel_id: 1,
        guild_id: Some(1),
        author_id,
        author_is_bot: author_id == BOT_ID,
        content: content.to_string(),
        timestamp: Utc::now(),
    }
}

/// Sends log output through the test harness, filtered by `RUST_LOG`
/// (warnings by default).  Safe to call from every test.
pub(crate) fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds.  Works with paused time too,
/// since the sleep lets the clock auto-advance.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// ----- cache -----

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CacheCall {
    SaveGuildState(GuildId),
    LoadGuildState(GuildId),
    SaveAudio(String),
    GetAudio(String),
    DeleteAudio(String),
    AddMessage(String),
    BulkInsert(String),
    GetLastN(String),
}

#[derive(Default)]
struct FakeCacheInner {
    calls: Vec<CacheCall>,
    guild_states: HashMap<GuildId, GuildStateSnapshot>,
    audio: HashMap<String, Bytes>,
    audio_ttls: HashMap<String, Duration>,
    messages: HashMap<String, Vec<ChatMessage>>,
}

#[derive(Default)]
pub(crate) struct FakeCache {
    inner: Mutex<FakeCacheInner>,
    failing: AtomicBool,
}

impl FakeCache {
    /// Makes every call after this one fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<CacheCall> {
        self.inner.lock().calls.clone()
    }

    pub fn messages(&self, key: &str) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .messages
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// The expiry audio was saved with, even after it was deleted.
    pub fn audio_ttl(&self, key: &str) -> Option<Duration> {
        self.inner.lock().audio_ttls.get(key).copied()
    }

    pub fn stored_audio_count(&self) -> usize {
        self.inner.lock().audio.len()
    }

    pub fn guild_state(&self, guild_id: GuildId) -> Option<GuildStateSnapshot> {
        self.inner.lock().guild_states.get(&guild_id).cloned()
    }

    pub fn set_guild_state_sync(&self, state: GuildStateSnapshot) {
        self.inner.lock().guild_states.insert(state.guild_id, state);
    }

    pub fn add_message_sync(&self, key: &str, message: ChatMessage) {
        self.inner
            .lock()
            .messages
            .entry(key.to_string())
            .or_default()
            .push(message);
    }

    fn record(&self, call: CacheCall) -> Result<()> {
        self.inner.lock().calls.push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Cache("cache unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for FakeCache {
    async fn save_guild_state(&self, guild_id: GuildId, state: &GuildStateSnapshot) -> Result<()> {
        self.record(CacheCall::SaveGuildState(guild_id))?;
        self.inner.lock().guild_states.insert(guild_id, state.clone());
        Ok(())
    }

    async fn load_guild_state(&self, guild_id: GuildId) -> Result<Option<GuildStateSnapshot>> {
        self.record(CacheCall::LoadGuildState(guild_id))?;
        Ok(self.inner.lock().guild_states.get(&guild_id).cloned())
    }

    async fn save_audio(&self, key: &str, audio: Bytes, ttl: Duration) -> Result<()> {
        self.record(CacheCall::SaveAudio(key.to_string()))?;
        let mut inner = self.inner.lock();
        inner.audio.insert(key.to_string(), audio);
        inner.audio_ttls.insert(key.to_string(), ttl);
        Ok(())
    }

    async fn get_audio(&self, key: &str) -> Result<Bytes> {
        self.record(CacheCall::GetAudio(key.to_string()))?;
        self.inner
            .lock()
            .audio
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Cache(format!("no audio under {}", key)))
    }

    async fn delete_audio(&self, key: &str) -> Result<()> {
        self.record(CacheCall::DeleteAudio(key.to_string()))?;
        self.inner.lock().audio.remove(key);
        Ok(())
    }

    async fn add_message(&self, key: &str, message: &ChatMessage) -> Result<()> {
        self.record(CacheCall::AddMessage(key.to_string()))?;
        self.add_message_sync(key, message.clone());
        Ok(())
    }

    async fn bulk_insert_messages(&self, key: &str, messages: &[ChatMessage]) -> Result<()> {
        self.record(CacheCall::BulkInsert(key.to_string()))?;
        for message in messages {
            self.add_message_sync(key, message.clone());
        }
        Ok(())
    }

    async fn get_last_n_messages(&self, key: &str, n: usize) -> Result<Vec<ChatMessage>> {
        self.record(CacheCall::GetLastN(key.to_string()))?;
        let messages = self.messages(key);
        let skip = messages.len().saturating_sub(n);
        Ok(messages.into_iter().skip(skip).collect())
    }
}

// ----- speech to text -----

pub(crate) struct FakeStt {
    reply: Option<String>,
    calls: AtomicUsize,
}

impl FakeStt {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for FakeStt {
    async fn transcribe(&self, _audio: Bytes) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply
            .clone()
            .ok_or_else(|| Error::Transcription("model exploded".to_string()))
    }
}

// ----- chat platform -----

pub(crate) struct FakePlatform {
    next_id: AtomicU64,
    typing: AtomicUsize,
    sent: Mutex<Vec<(ChannelId, String)>>,
    edited: Mutex<Vec<(MessageRef, String)>>,
    deleted: Mutex<Vec<MessageRef>>,
    reactions: Mutex<Vec<(MessageRef, String)>>,
    bots: Mutex<HashSet<UserId>>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(5000),
            typing: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            edited: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
            bots: Mutex::new(HashSet::new()),
        }
    }
}

impl FakePlatform {
    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().clone()
    }

    pub fn edited(&self) -> Vec<(MessageRef, String)> {
        self.edited.lock().clone()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.deleted.lock().clone()
    }

    pub fn reactions(&self) -> Vec<(MessageRef, String)> {
        self.reactions.lock().clone()
    }

    pub fn mark_bot(&self, user_id: UserId) {
        self.bots.lock().insert(user_id);
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    async fn send_message(&self, channel_id: ChannelId, content: &str) -> Result<MessageRef> {
        self.sent.lock().push((channel_id, content.to_string()));
        Ok(MessageRef {
            channel_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_message(&self, message: MessageRef, content: &str) -> Result<()> {
        self.edited.lock().push((message, content.to_string()));
        Ok(())
    }

    async fn delete_message(&self, message: MessageRef) -> Result<()> {
        self.deleted.lock().push(message);
        Ok(())
    }

    async fn add_reaction(&self, message: MessageRef, emoji: &str) -> Result<()> {
        self.reactions.lock().push((message, emoji.to_string()));
        Ok(())
    }

    async fn trigger_typing(&self, _channel_id: ChannelId) -> Result<()> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_bot(&self, user_id: UserId) -> Result<bool> {
        Ok(user_id == BOT_ID || self.bots.lock().contains(&user_id))
    }
}

// ----- language model -----

#[derive(Clone, Copy, Debug)]
pub(crate) enum StreamMode {
    /// Post the reply and return straight away.
    Immediate,
    /// Post a partial reply, then wait to be cancelled.
    UntilCancelled,
    Fail,
}

pub(crate) struct FakeLlm {
    platform: Arc<FakePlatform>,
    decisions: Mutex<VecDeque<EngagementDecision>>,
    stream_modes: Mutex<VecDeque<StreamMode>>,
    decision_calls: AtomicUsize,
    fail_decisions: AtomicBool,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeLlm {
    pub fn new(platform: Arc<FakePlatform>) -> Self {
        Self {
            platform,
            decisions: Mutex::new(VecDeque::new()),
            stream_modes: Mutex::new(VecDeque::new()),
            decision_calls: AtomicUsize::new(0),
            fail_decisions: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_decision(&self, decision: EngagementDecision) {
        self.decisions.lock().push_back(decision);
    }

    pub fn push_stream_mode(&self, mode: StreamMode) {
        self.stream_modes.lock().push_back(mode);
    }

    pub fn fail_decisions(&self) {
        self.fail_decisions.store(true, Ordering::SeqCst);
    }

    pub fn decision_calls(&self) -> usize {
        self.decision_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    async fn engagement_decision(&self, _recent: &[ChatMessage]) -> Result<EngagementDecision> {
        self.decision_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_decisions.load(Ordering::SeqCst) {
            return Err(Error::LanguageModel("rate limited".to_string()));
        }
        Ok(self
            .decisions
            .lock()
            .pop_front()
            .unwrap_or_else(|| EngagementDecision::new(Decision::Ignore)))
    }

    async fn generate_context_block(&self) -> Result<String> {
        Ok("context".to_string())
    }

    async fn stream_chat_completion(
        &self,
        cancel: CancellationToken,
        request: CompletionRequest,
        response: ResponseHandle,
    ) -> Result<ChatMessage> {
        let mode = self
            .stream_modes
            .lock()
            .pop_front()
            .unwrap_or(StreamMode::Immediate);
        let channel_id = request.trigger.channel_id;
        let guild_id = request.trigger.guild_id;
        self.requests.lock().push(request);

        let posted = self.platform.send_message(channel_id, "thinking...").await?;
        response.bind(posted);

        match mode {
            StreamMode::Immediate => Ok(ChatMessage {
                id: posted.message_id,
                channel_id,
                guild_id,
                author_id: BOT_ID,
                author_is_bot: true,
                content: "a reply".to_string(),
                timestamp: Utc::now(),
            }),
            StreamMode::UntilCancelled => {
                cancel.cancelled().await;
                Err(Error::Cancelled)
            }
            StreamMode::Fail => Err(Error::LanguageModel("stream dropped".to_string())),
        }
    }
}

// ----- voice -----

#[derive(Default)]
pub(crate) struct FakeConnection {
    channel: Mutex<Option<ChannelId>>,
    leaves: AtomicUsize,
}

impl FakeConnection {
    pub fn move_to(&self, channel_id: ChannelId) {
        *self.channel.lock() = Some(channel_id);
    }

    pub fn leave_count(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }
}

impl VoiceConnection for FakeConnection {
    fn current_channel(&self) -> Option<ChannelId> {
        *self.channel.lock()
    }

    fn leave(&self) {
        self.leaves.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeGateway {
    failures_left: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
    links: Mutex<Vec<(Arc<FakeConnection>, UnboundedSender<VoiceEvent>)>>,
}

impl FakeGateway {
    /// A gateway whose first `failures` joins fail.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// The connection and event sender of the most recent join.
    pub fn last_link(&self) -> (Arc<FakeConnection>, UnboundedSender<VoiceEvent>) {
        self.links
            .lock()
            .last()
            .cloned()
            .expect("nothing has joined")
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn join(&self, _guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceLink> {
        self.attempts.lock().push(Instant::now());
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transport("voice server timed out".to_string()));
        }
        let connection = Arc::new(FakeConnection::default());
        connection.move_to(channel_id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().push((connection.clone(), tx));
        Ok(VoiceLink {
            connection,
            events: rx,
        })
    }
}
