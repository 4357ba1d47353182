use tracing::warn;

use crate::{
    api::{api_types::ChatMessage, collaborators::Cache},
    error::Result,
    model::{constants::MAX_HISTORY_FETCH, types::UserId},
};

/// Picks the messages shown to the engagement decision.
///
/// Walks back from the newest of `prior`, taking at most `window`
/// messages and stopping once the bot's own last message has been
/// taken.  `prior` and the result are oldest first.
pub(crate) fn decision_window(
    prior: Vec<ChatMessage>,
    self_user_id: Option<UserId>,
    window: usize,
) -> Vec<ChatMessage> {
    let mut selected = Vec::with_capacity(window);
    for message in prior.into_iter().rev() {
        if selected.len() >= window {
            break;
        }
        let is_own = Some(message.author_id) == self_user_id;
        selected.push(message);
        if is_own {
            break;
        }
    }
    selected.reverse();
    selected
}

/// The messages which came before `trigger`, oldest first.
///
/// Anything after the trigger in the list was posted while we were
/// deciding and is dropped.  If the trigger isn't in the list at all,
/// its timestamp marks the cut instead.
pub(crate) fn messages_before(
    mut messages: Vec<ChatMessage>,
    trigger: &ChatMessage,
) -> Vec<ChatMessage> {
    match messages.iter().position(|message| message.id == trigger.id) {
        Some(index) => {
            messages.truncate(index);
            messages
        }
        None => messages
            .into_iter()
            .filter(|message| message.timestamp <= trigger.timestamp)
            .collect(),
    }
}

/// Up to `depth` messages from before `trigger`, oldest first.
///
/// Messages posted after the trigger take up room in the newest-n
/// fetch, so keep doubling it until `depth` earlier ones fit or the
/// channel has nothing older.
async fn fetch_prior(
    cache: &dyn Cache,
    trigger: &ChatMessage,
    depth: usize,
) -> Result<Vec<ChatMessage>> {
    let key = trigger.cache_key();
    let mut n = depth + 1;
    loop {
        let messages = cache.get_last_n_messages(&key, n).await?;
        let exhausted = messages.len() < n || n >= MAX_HISTORY_FETCH;
        let found = messages.iter().position(|message| message.id == trigger.id);
        if exhausted || found.is_some_and(|index| index >= depth) {
            let mut prior = messages_before(messages, trigger);
            if prior.len() > depth {
                prior.drain(..prior.len() - depth);
            }
            return Ok(prior);
        }
        n = (n * 2).min(MAX_HISTORY_FETCH);
    }
}

pub(crate) async fn fetch_decision_window(
    cache: &dyn Cache,
    trigger: &ChatMessage,
    self_user_id: Option<UserId>,
    window: usize,
) -> Vec<ChatMessage> {
    match fetch_prior(cache, trigger, window).await {
        Ok(prior) => decision_window(prior, self_user_id, window),
        Err(e) => {
            warn!(channel_id = trigger.channel_id, error = %e, "could not load recent messages");
            Vec::new()
        }
    }
}

pub(crate) async fn fetch_reply_history(
    cache: &dyn Cache,
    trigger: &ChatMessage,
    depth: usize,
) -> Vec<ChatMessage> {
    match fetch_prior(cache, trigger, depth).await {
        Ok(prior) => prior,
        Err(e) => {
            warn!(channel_id = trigger.channel_id, error = %e, "could not load reply history");
            Vec::new()
        }
    }
}
