use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    api::{api_types::DisconnectSummary, voice_engine::VoiceContext},
    capture::{finalize::finalize_segment, status},
    events::voice::{SpeakingUpdate, VoiceEvent, VoicePacket},
    model::{
        audio_segment::AudioSegment,
        guild_session::{GuildVoiceSession, PacketOutcome},
        types::{ChannelId, UserId},
    },
};

/// Why one run of the loop ended.
enum LoopExit {
    Cancelled,
    /// The transport closed the connection.
    Closed,
    /// The connection now reports a different channel.
    Moved(ChannelId),
}

/// The per-guild task that turns voice events into segments.
///
/// A single task consumes every event of a connection, so packets from
/// one source are always handled in arrival order.
pub(crate) struct CaptureLoop {
    ctx: Arc<VoiceContext>,
    session: Arc<GuildVoiceSession>,

    /// finalizations still caching or transcribing
    pending_transcriptions: FuturesUnordered<JoinHandle<()>>,

    /// answers from `is_bot`, so speaking updates don't hit the platform
    /// every time
    known_bots: HashMap<UserId, bool>,
}

impl CaptureLoop {
    pub(crate) fn monitor(
        ctx: Arc<VoiceContext>,
        session: Arc<GuildVoiceSession>,
        events: UnboundedReceiver<VoiceEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(
            Self {
                ctx,
                session,
                pending_transcriptions: FuturesUnordered::new(),
                known_bots: HashMap::new(),
            }
            .loop_forever(events),
        )
    }

    async fn loop_forever(mut self, mut events: UnboundedReceiver<VoiceEvent>) {
        loop {
            match self.run(&mut events).await {
                LoopExit::Cancelled => {
                    debug!(guild_id = self.session.guild_id(), "capture loop cancelled");
                    // normally teardown has drained these already
                    for segment in self.session.take_all_segments() {
                        self.finalize(segment);
                    }
                    break;
                }
                LoopExit::Closed => {
                    info!(guild_id = self.session.guild_id(), "voice connection closed");
                    teardown(&self.ctx, &self.session).await;
                    break;
                }
                LoopExit::Moved(channel_id) => {
                    // the next run starts fresh timers for the new session
                    self.relocate(channel_id);
                    self.refresh_status().await;
                }
            }
        }
    }

    async fn run(&mut self, events: &mut UnboundedReceiver<VoiceEvent>) -> LoopExit {
        let session = self.session.clone();
        let cancel = session.cancel_token();
        let timeout = self.ctx.config.voice_timeout_for(session.guild_id());

        let mut sweep = time::interval(timeout);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let refresh = self.ctx.config.status_refresh;
        let mut status_refresh = time::interval_at(Instant::now() + refresh, refresh);
        status_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return LoopExit::Cancelled,
                // timers ahead of events, or a steady packet stream would starve them
                _ = sweep.tick() => self.sweep(timeout),
                _ = status_refresh.tick() => {
                    if let Some(channel_id) = self.moved_to() {
                        return LoopExit::Moved(channel_id);
                    }
                    self.refresh_status().await;
                }
                _ = session.status_nudged() => {
                    if let Some(channel_id) = self.moved_to() {
                        return LoopExit::Moved(channel_id);
                    }
                }
                event = events.recv() => match event {
                    Some(VoiceEvent::Packet(packet)) => self.on_packet(packet),
                    Some(VoiceEvent::Speaking(update)) => self.on_speaking(update).await,
                    Some(VoiceEvent::Closed) | None => return LoopExit::Closed,
                },
                Some(result) = self.pending_transcriptions.next(), if !self.pending_transcriptions.is_empty() => {
                    if let Err(e) = result {
                        warn!(guild_id = session.guild_id(), error = %e, "transcription task failed");
                    }
                }
            }
        }
    }

    fn on_packet(&mut self, packet: VoicePacket) {
        if let PacketOutcome::Restarted(old) = self.session.route_packet(&packet, Instant::now()) {
            debug!(
                guild_id = self.session.guild_id(),
                ssrc = packet.ssrc,
                "source changed speaker, finalizing old segment"
            );
            self.finalize(old);
        }
    }

    /// Binds the source whether the user started or stopped speaking:
    /// the platform sends this on join, before anyone says anything.
    async fn on_speaking(&mut self, update: SpeakingUpdate) {
        if Some(update.user_id) == self.ctx.config.self_user_id || self.is_bot(update.user_id).await
        {
            return;
        }
        if self.session.bind_speaker(update.ssrc, update.user_id) {
            debug!(
                guild_id = self.session.guild_id(),
                ssrc = update.ssrc,
                user_id = update.user_id,
                "bound speaker"
            );
        }
        persist_session(&self.ctx, &self.session);
    }

    async fn is_bot(&mut self, user_id: UserId) -> bool {
        if let Some(is_bot) = self.known_bots.get(&user_id) {
            return *is_bot;
        }
        match self.ctx.platform.is_bot(user_id).await {
            Ok(is_bot) => {
                self.known_bots.insert(user_id, is_bot);
                is_bot
            }
            Err(e) => {
                // don't remember this, we'll ask again next time
                warn!(user_id, error = %e, "could not look up user");
                false
            }
        }
    }

    fn sweep(&mut self, timeout: Duration) {
        for segment in self.session.take_timed_out(Instant::now(), timeout) {
            self.finalize(segment);
        }
    }

    fn finalize(&mut self, segment: AudioSegment) {
        self.pending_transcriptions
            .push(finalize_segment(&self.ctx, &self.session, segment));
    }

    fn moved_to(&self) -> Option<ChannelId> {
        let live = self.session.live_channel_id()?;
        (Some(live) != self.session.connection_channel_id()).then_some(live)
    }

    async fn refresh_status(&self) {
        status::edit_status(
            self.ctx.platform.as_ref(),
            self.session.message_ref(),
            &status::connected(&self.session.status()),
        )
        .await;
    }

    /// Retires the current session and continues with a fresh one for
    /// `channel_id`, keeping the connection and status message.
    fn relocate(&mut self, channel_id: ChannelId) {
        let old = self.session.clone();
        let guild_id = old.guild_id();
        info!(
            guild_id,
            from = ?old.connection_channel_id(),
            to = channel_id,
            "voice channel moved"
        );

        for segment in old.take_all_segments() {
            self.finalize(segment);
        }
        old.cancel();
        self.ctx.sessions.delete_if_same(guild_id, &old);

        let fresh = self.ctx.sessions.get_or_create_with(guild_id, || {
            GuildVoiceSession::new(guild_id, self.ctx.config.transcript_history_len)
        });
        fresh.set_channel(channel_id);
        fresh.set_message_ref(old.message_ref());
        if let Some(connection) = old.take_connection() {
            fresh.set_connection(connection);
        }
        persist_session(&self.ctx, &fresh);
        self.session = fresh;
    }
}

/// Stores the session's snapshot in the background.  Failures are logged.
pub(crate) fn persist_session(ctx: &VoiceContext, session: &GuildVoiceSession) {
    let guild_id = session.guild_id();
    let snapshot = session.snapshot();
    let cache = ctx.cache.clone();
    tokio::spawn(async move {
        if let Err(e) = cache.save_guild_state(guild_id, &snapshot).await {
            warn!(guild_id, error = %e, "could not persist session");
        }
    });
}

/// Ends a session: stops its loop, closes the connection, finalizes
/// whatever is still recording and posts a summary.
///
/// Safe to call more than once.  Only the call which actually removed
/// the session (or finalized something) returns a summary.
pub(crate) async fn teardown(
    ctx: &Arc<VoiceContext>,
    session: &Arc<GuildVoiceSession>,
) -> Option<DisconnectSummary> {
    let guild_id = session.guild_id();
    session.cancel();
    if let Some(connection) = session.take_connection() {
        connection.leave();
    }

    let segments = session.take_all_segments();
    let finalized = segments.len();
    for segment in segments {
        finalize_segment(ctx, session, segment);
    }

    let removed = ctx.sessions.delete_if_same(guild_id, session);
    if !removed && finalized == 0 {
        return None;
    }

    let summary = session.summary(finalized);
    info!(
        guild_id,
        duration_secs = summary.duration_secs,
        speakers = summary.distinct_speakers,
        segments = finalized,
        "voice session ended"
    );
    status::edit_status(
        ctx.platform.as_ref(),
        session.message_ref(),
        &status::summary(&summary),
    )
    .await;
    Some(summary)
}
