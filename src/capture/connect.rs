use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    api::{collaborators::VoiceLink, voice_engine::VoiceContext},
    capture::status,
    error::{Error, Result},
    model::{guild_session::GuildVoiceSession, types::ChannelId},
};

/// Joins `channel_id`, retrying with exponential backoff.
///
/// After each failed attempt the status message is updated and we wait
/// `join_backoff * 2^n` before going on.  Once every attempt has failed
/// the session is cancelled and removed, and a failure notice is posted
/// to `status_channel`.  Cancelling the session stops the retries.
pub(crate) async fn connect_with_backoff(
    ctx: &Arc<VoiceContext>,
    session: &Arc<GuildVoiceSession>,
    channel_id: ChannelId,
    status_channel: ChannelId,
) -> Result<VoiceLink> {
    let guild_id = session.guild_id();
    let cancel = session.cancel_token();
    let attempts = ctx.config.join_attempts;

    for attempt in 0..attempts {
        let joined = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            joined = ctx.gateway.join(guild_id, channel_id) => joined,
        };
        let error = match joined {
            Ok(link) => {
                info!(guild_id, channel_id, attempt = attempt + 1, "joined voice channel");
                return Ok(link);
            }
            Err(e) => e,
        };

        let delay = ctx.config.join_backoff_after(attempt);
        warn!(
            guild_id,
            channel_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "voice join failed"
        );
        status::edit_status(
            ctx.platform.as_ref(),
            session.message_ref(),
            &status::retrying(attempt + 1, attempts, delay),
        )
        .await;

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    warn!(guild_id, channel_id, attempts, "giving up on voice join");
    session.cancel();
    ctx.sessions.delete_if_same(guild_id, session);
    if let Err(e) = ctx
        .platform
        .send_message(status_channel, &status::join_failed(channel_id, attempts))
        .await
    {
        warn!(guild_id, error = %e, "could not post join failure");
    }
    Err(Error::JoinFailed { guild_id, attempts })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::{
        api::api_types::MessageRef,
        config::Config,
        testing::{init_tracing, FakeCache, FakeGateway, FakePlatform},
    };

    struct Harness {
        ctx: Arc<VoiceContext>,
        gateway: Arc<FakeGateway>,
        platform: Arc<FakePlatform>,
    }

    fn harness(failures: u32) -> Harness {
        init_tracing();
        let gateway = Arc::new(FakeGateway::failing(failures));
        let platform = Arc::new(FakePlatform::default());
        let ctx = Arc::new(VoiceContext::new(
            Config::default(),
            Arc::new(FakeCache::default()),
            None,
            platform.clone(),
            gateway.clone(),
        ));
        Harness {
            ctx,
            gateway,
            platform,
        }
    }

    fn registered_session(ctx: &VoiceContext) -> Arc<GuildVoiceSession> {
        let session = ctx.sessions.get_or_create_with(1, || GuildVoiceSession::new(1, 10));
        session.set_message_ref(Some(MessageRef {
            channel_id: 50,
            message_id: 60,
        }));
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_teardown() {
        let h = harness(u32::MAX);
        let session = registered_session(&h.ctx);
        let start = Instant::now();

        let result = connect_with_backoff(&h.ctx, &session, 10, 50).await;

        assert!(matches!(
            result,
            Err(Error::JoinFailed {
                guild_id: 1,
                attempts: 3
            })
        ));
        let attempts = h.gateway.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(1));
        assert_eq!(attempts[2] - attempts[1], Duration::from_secs(2));
        assert_eq!(Instant::now() - start, Duration::from_secs(7));

        // one status edit per failure, then the notice
        let edits = h.platform.edited();
        assert_eq!(edits.len(), 3);
        assert!(edits[2].1.contains("attempt 3/3"));
        let sent = h.platform.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 50);

        assert!(session.is_cancelled());
        assert!(h.ctx.sessions.is_empty());

        // nothing left to wake up
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.gateway.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_a_failure() {
        let h = harness(1);
        let session = registered_session(&h.ctx);
        let start = Instant::now();

        let link = connect_with_backoff(&h.ctx, &session, 10, 50).await.unwrap();

        assert_eq!(link.connection.current_channel(), Some(10));
        assert_eq!(Instant::now() - start, Duration::from_secs(1));
        assert_eq!(h.platform.edited().len(), 1);
        assert!(h.platform.sent().is_empty());
        assert_eq!(h.ctx.sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retries() {
        let h = harness(u32::MAX);
        let session = registered_session(&h.ctx);

        let task = {
            let ctx = h.ctx.clone();
            let session = session.clone();
            tokio::spawn(async move { connect_with_backoff(&ctx, &session, 10, 50).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        session.cancel();

        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(h.gateway.attempts().len(), 2);
        assert!(h.platform.sent().is_empty());
    }
}
