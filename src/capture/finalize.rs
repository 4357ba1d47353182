//! Finalization of a segment and the transcription that follows it.
//!
//! The cached audio lives exactly as long as one transcription
//! attempt: it is saved first, then deleted once, whatever happens
//! in between.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    api::{
        api_types::{message_cache_key, ChatMessage, TranscriptEntry},
        voice_engine::VoiceContext,
    },
    error::Error,
    model::{
        audio_segment::{AudioSegment, FinishedSegment},
        constants::DISCORD_EPOCH_MILLIS,
        guild_session::GuildVoiceSession,
        types::{MessageId, Ssrc},
    },
};

/// Closes the segment's encoder and hands it off to a background task
/// which caches the audio and transcribes it.
pub(crate) fn finalize_segment(
    ctx: &Arc<VoiceContext>,
    session: &Arc<GuildVoiceSession>,
    segment: AudioSegment,
) -> JoinHandle<()> {
    let finished = segment.finish();
    debug!(
        guild_id = session.guild_id(),
        user_id = finished.user_id,
        key = %finished.cache_key(),
        frames = finished.frames,
        "finalized segment"
    );
    let ctx = ctx.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let key = finished.cache_key();
        if let Err(e) = ctx
            .cache
            .save_audio(&key, finished.audio.clone(), ctx.config.audio_ttl())
            .await
        {
            warn!(key = %key, error = %e, "could not cache segment audio");
        }
        transcribe_segment(&ctx, &session, finished).await;
    })
}

async fn transcribe_segment(
    ctx: &VoiceContext,
    session: &GuildVoiceSession,
    finished: FinishedSegment,
) {
    let key = finished.cache_key();
    let Some(stt) = ctx.stt.as_ref() else {
        debug!(key = %key, "no speech-to-text configured, discarding audio");
        delete_audio(ctx, &key).await;
        return;
    };

    let result = match ctx.cache.get_audio(&key).await {
        Ok(audio) => stt.transcribe(audio).await,
        Err(e) => Err(e),
    };
    delete_audio(ctx, &key).await;

    let text = match result {
        Ok(text) => text,
        Err(Error::Cancelled) => return,
        Err(e) => {
            warn!(
                guild_id = session.guild_id(),
                user_id = finished.user_id,
                key = %key,
                error = %e,
                "transcription failed"
            );
            return;
        }
    };
    let text = text.trim();
    if text.is_empty() {
        debug!(key = %key, "empty transcript");
        return;
    }

    let guild_id = session.guild_id();
    let channel_id = finished.source_channel_id;
    info!(guild_id, user_id = finished.user_id, channel_id, text, "transcribed");

    session.append_transcript(
        channel_id,
        TranscriptEntry {
            user_id: finished.user_id,
            text: text.to_string(),
            started_at: finished.started_at,
            audio_duration_ms: finished.duration.as_millis() as u64,
        },
    );

    let message = ChatMessage {
        id: transcript_message_id(finished.started_at, finished.ssrc),
        channel_id,
        guild_id: Some(guild_id),
        author_id: finished.user_id,
        author_is_bot: false,
        content: text.to_string(),
        timestamp: finished.started_at,
    };
    if let Err(e) = ctx
        .cache
        .add_message(&message_cache_key(Some(guild_id), channel_id), &message)
        .await
    {
        warn!(guild_id, channel_id, error = %e, "could not record transcript");
    }
}

async fn delete_audio(ctx: &VoiceContext, key: &str) {
    if let Err(e) = ctx.cache.delete_audio(key).await {
        warn!(key, error = %e, "could not delete segment audio");
    }
}

/// Transcripts never existed on the platform, so they get a
/// snowflake-shaped id of their own: the segment's start time in the
/// timestamp bits, and the source in the low bits.
fn transcript_message_id(started_at: DateTime<Utc>, ssrc: Ssrc) -> MessageId {
    let millis = (started_at.timestamp_millis() - DISCORD_EPOCH_MILLIS).max(0) as u64;
    (millis << 22) | (ssrc as u64 & 0x3f_ffff)
}
