use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    api::{
        api_types::DisconnectSummary,
        collaborators::{Cache, ChatPlatform, SpeechToText, VoiceGateway},
    },
    capture::{
        capture_loop::{persist_session, teardown, CaptureLoop},
        connect::connect_with_backoff,
        status,
    },
    config::Config,
    error::{Error, Result},
    model::{
        guild_session::GuildVoiceSession,
        registry::Registry,
        types::{ChannelId, GuildId},
    },
};

/// Shared by every capture task.
pub(crate) struct VoiceContext {
    pub config: Config,
    pub cache: Arc<dyn Cache>,
    pub stt: Option<Arc<dyn SpeechToText>>,
    pub platform: Arc<dyn ChatPlatform>,
    pub gateway: Arc<dyn VoiceGateway>,
    pub sessions: Registry<GuildId, GuildVoiceSession>,
}

impl VoiceContext {
    pub(crate) fn new(
        config: Config,
        cache: Arc<dyn Cache>,
        stt: Option<Arc<dyn SpeechToText>>,
        platform: Arc<dyn ChatPlatform>,
        gateway: Arc<dyn VoiceGateway>,
    ) -> Self {
        Self {
            config,
            cache,
            stt,
            platform,
            gateway,
            sessions: Registry::new(),
        }
    }
}

/// Records voice channels, one session per guild, and publishes what
/// was said into the shared message history.
pub struct VoiceEngine {
    ctx: Arc<VoiceContext>,
}

impl VoiceEngine {
    /// Without `stt`, finalized audio is discarded untranscribed.
    pub fn new(
        config: Config,
        cache: Arc<dyn Cache>,
        stt: Option<Arc<dyn SpeechToText>>,
        platform: Arc<dyn ChatPlatform>,
        gateway: Arc<dyn VoiceGateway>,
    ) -> Self {
        Self {
            ctx: Arc::new(VoiceContext::new(
                config.sanitized(),
                cache,
                stt,
                platform,
                gateway,
            )),
        }
    }

    /// Joins `channel_id` and starts capturing.  Progress is reported
    /// in a status message posted to `status_channel`.
    ///
    /// Joining the channel we are already in returns the live session.
    /// Joining another channel ends the current session first.
    pub async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        status_channel: ChannelId,
    ) -> Result<Arc<GuildVoiceSession>> {
        if let Some(existing) = self.ctx.sessions.get(guild_id) {
            if !existing.is_cancelled() && existing.connection_channel_id() == Some(channel_id) {
                debug!(guild_id, channel_id, "already in channel");
                return Ok(existing);
            }
            teardown(&self.ctx, &existing).await;
        }

        let session = self.ctx.sessions.get_or_create_with(guild_id, || {
            GuildVoiceSession::new(guild_id, self.ctx.config.transcript_history_len)
        });
        match self
            .ctx
            .platform
            .send_message(status_channel, &status::connecting(channel_id))
            .await
        {
            Ok(message) => session.set_message_ref(Some(message)),
            Err(e) => warn!(guild_id, error = %e, "could not post status message"),
        }

        let link = connect_with_backoff(&self.ctx, &session, channel_id, status_channel).await?;
        if session.is_cancelled() {
            // left while the join was completing
            link.connection.leave();
            return Err(Error::Cancelled);
        }
        session.set_channel(link.connection.current_channel().unwrap_or(channel_id));
        session.set_connection(link.connection);

        self.restore(&session).await;
        persist_session(&self.ctx, &session);
        status::edit_status(
            self.ctx.platform.as_ref(),
            session.message_ref(),
            &status::connected(&session.status()),
        )
        .await;

        info!(guild_id, channel_id, "voice session started");
        CaptureLoop::monitor(self.ctx.clone(), session.clone(), link.events);
        Ok(session)
    }

    /// Ends the guild's session.  Returns `None` if there was none.
    pub async fn leave(&self, guild_id: GuildId) -> Option<DisconnectSummary> {
        let session = self.ctx.sessions.get(guild_id)?;
        teardown(&self.ctx, &session).await
    }

    pub fn session(&self, guild_id: GuildId) -> Option<Arc<GuildVoiceSession>> {
        self.ctx.sessions.get(guild_id)
    }

    pub fn sessions(&self) -> Vec<GuildId> {
        self.ctx.sessions.keys()
    }

    /// Tells the engine the bot's voice channel changed in `guild_id`.
    ///
    /// `None` means the bot was disconnected, which ends the session.
    /// Otherwise the capture loop checks the connection right away
    /// instead of waiting for its next status tick.
    pub async fn on_channel_update(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
    ) -> Option<DisconnectSummary> {
        let session = self.ctx.sessions.get(guild_id)?;
        match channel_id {
            None => teardown(&self.ctx, &session).await,
            Some(channel_id) => {
                if session.connection_channel_id() != Some(channel_id) {
                    debug!(guild_id, channel_id, "voice channel changed");
                    session.nudge_status();
                }
                None
            }
        }
    }

    /// Seeds speakers from a cached snapshot of this same channel.
    async fn restore(&self, session: &GuildVoiceSession) {
        let guild_id = session.guild_id();
        match self.ctx.cache.load_guild_state(guild_id).await {
            Ok(Some(snapshot)) => {
                let speakers = snapshot.speaker_map.len();
                if session.restore(snapshot) {
                    info!(guild_id, speakers, "restored session state");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(guild_id, error = %e, "could not load session state"),
        }
    }
}
