use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{
        api_types::{ChatMessage, CompletionRequest, Decision, EngagementDecision},
        engagement_engine::EngagementContext,
    },
    engagement::{history, keep_alive::KeepAlive},
    model::engagement::{EngagementMode, ResponseHandle, ResumeSnapshot, UserEngagement},
};

/// Runs one engagement cycle for a single incoming message.
pub(crate) async fn handle_message(
    ctx: Arc<EngagementContext>,
    user: Arc<UserEngagement>,
    message: ChatMessage,
) {
    if let Err(e) = ctx.cache.add_message(&message.cache_key(), &message).await {
        warn!(message_id = message.id, error = %e, "could not record message");
    }

    let cancel = CancellationToken::new();
    let cycle = {
        let mut state = user.lock();
        match state.mode {
            EngagementMode::Pending | EngagementMode::Streaming => Err(state.interrupt()),
            EngagementMode::Idle => Ok(state.begin_pending(
                KeepAlive::start(
                    ctx.platform.clone(),
                    message.channel_id,
                    ctx.config.keep_alive_period,
                ),
                cancel.clone(),
            )),
        }
    };
    let generation = match cycle {
        Ok(generation) => generation,
        Err(interrupted) => {
            debug!(
                user_id = message.author_id,
                was = ?interrupted.was,
                "newer message superseded engagement"
            );
            if let Some(response) = interrupted.response {
                if let Err(e) = ctx.platform.delete_message(response).await {
                    warn!(message_id = response.message_id, error = %e, "could not delete interrupted response");
                }
            }
            return;
        }
    };

    // a newer message during this dwell supersedes us without a model call
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(ctx.config.decision_debounce) => {}
    }

    let recent = history::fetch_decision_window(
        ctx.cache.as_ref(),
        &message,
        ctx.config.self_user_id,
        ctx.config.decision_window,
    )
    .await;
    if cancel.is_cancelled() {
        return;
    }

    let decision = tokio::select! {
        _ = cancel.cancelled() => return,
        decision = ctx.llm.engagement_decision(&recent) => decision,
    };
    let EngagementDecision { decision, argument } = match decision {
        Ok(decision) => decision,
        Err(e) => {
            warn!(user_id = message.author_id, error = %e, "engagement decision failed");
            user.lock().finish(generation, true);
            return;
        }
    };
    if !user.is_current(generation) {
        return;
    }
    info!(user_id = message.author_id, ?decision, "engagement decision");

    match decision {
        Decision::Reply => reply(&ctx, &user, generation, message).await,
        Decision::React => {
            if let Some(emoji) = argument {
                if let Err(e) = ctx.platform.add_reaction(message.message_ref(), &emoji).await {
                    warn!(message_id = message.id, error = %e, "could not react");
                }
            }
            user.lock().finish(generation, true);
        }
        Decision::Stop | Decision::Ignore => {
            user.lock().finish(generation, true);
        }
        Decision::Continue => resume(&ctx, &user, generation, message).await,
    }
}

async fn reply(
    ctx: &Arc<EngagementContext>,
    user: &Arc<UserEngagement>,
    generation: u64,
    message: ChatMessage,
) {
    let history =
        history::fetch_reply_history(ctx.cache.as_ref(), &message, ctx.config.reply_history_depth)
            .await;
    let context = match ctx.llm.generate_context_block().await {
        Ok(context) => context,
        Err(e) => {
            warn!(error = %e, "could not build context block");
            String::new()
        }
    };

    let snapshot = ResumeSnapshot { history, context };
    let cancel = {
        let mut state = user.lock();
        let Some(cancel) = state.begin_streaming(generation) else {
            return;
        };
        state.saved = Some(snapshot.clone());
        cancel
    };
    stream(ctx, user, generation, cancel, message, snapshot).await;
}

async fn resume(
    ctx: &Arc<EngagementContext>,
    user: &Arc<UserEngagement>,
    generation: u64,
    message: ChatMessage,
) {
    let (cancel, snapshot) = {
        let mut state = user.lock();
        let Some(snapshot) = state.saved.clone() else {
            debug!(user_id = message.author_id, "nothing to continue");
            state.finish(generation, true);
            return;
        };
        let Some(cancel) = state.begin_streaming(generation) else {
            return;
        };
        (cancel, snapshot)
    };
    stream(ctx, user, generation, cancel, message, snapshot).await;
}

async fn stream(
    ctx: &Arc<EngagementContext>,
    user: &Arc<UserEngagement>,
    generation: u64,
    cancel: CancellationToken,
    trigger: ChatMessage,
    snapshot: ResumeSnapshot,
) {
    let handle = ResponseHandle::new(user.clone(), generation);
    let request = CompletionRequest {
        trigger,
        history: snapshot.history,
        context: snapshot.context,
    };
    let result = ctx
        .llm
        .stream_chat_completion(cancel, request, handle.clone())
        .await;

    match result {
        Ok(response) => {
            let finished = {
                let mut state = user.lock();
                let finished = state.finish(generation, true);
                if finished {
                    state.last_response = Some(response.message_ref());
                }
                finished
            };
            if finished {
                if let Err(e) = ctx.cache.add_message(&response.cache_key(), &response).await {
                    warn!(message_id = response.id, error = %e, "could not record response");
                }
            }
        }
        Err(e) if e.is_cancelled() => {
            // the snapshot stays so the reply can be continued
            debug!("response generation cancelled");
            user.lock().finish(generation, false);
        }
        Err(e) => {
            warn!(error = %e, "response generation failed");
            user.lock().finish(generation, true);
        }
    }

    if let Some(orphan) = handle.take_orphan() {
        if let Err(e) = ctx.platform.delete_message(orphan).await {
            warn!(message_id = orphan.message_id, error = %e, "could not delete orphaned response");
        }
    }
}
