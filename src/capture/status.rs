//! Text of the status message kept up to date for each session.

use std::time::Duration;

use tracing::warn;

use crate::{
    api::{
        api_types::{DisconnectSummary, MessageRef, SessionStatus},
        collaborators::ChatPlatform,
    },
    model::types::ChannelId,
};

pub(crate) fn connecting(channel_id: ChannelId) -> String {
    format!("🎙️ Connecting to <#{}>...", channel_id)
}

pub(crate) fn retrying(attempt: u32, attempts: u32, delay: Duration) -> String {
    format!(
        "⚠️ Voice connection failed (attempt {}/{}), waiting {}s",
        attempt,
        attempts,
        delay.as_secs()
    )
}

pub(crate) fn join_failed(channel_id: ChannelId, attempts: u32) -> String {
    format!(
        "❌ Could not join <#{}> after {} attempts",
        channel_id, attempts
    )
}

pub(crate) fn connected(status: &SessionStatus) -> String {
    let channel = status
        .channel_id
        .map(|id| format!("<#{}>", id))
        .unwrap_or_else(|| "voice".to_string());
    let mut text = format!(
        "🎙️ Listening in {} for {}\nSpeakers: {} | Sources: {} | Recording: {}",
        channel,
        format_duration(status.connected_for_secs),
        status.speakers.len(),
        status.sources,
        status.active_segments,
    );
    if status.unmapped_sources > 0 {
        text.push_str(&format!(" | Unidentified: {}", status.unmapped_sources));
    }
    text
}

pub(crate) fn summary(summary: &DisconnectSummary) -> String {
    let channel = summary
        .channel_id
        .map(|id| format!("<#{}>", id))
        .unwrap_or_else(|| "voice".to_string());
    format!(
        "👋 Left {} after {}\nSpeakers: {} | Sources: {} | Unidentified: {} | Segments: {}",
        channel,
        format_duration(summary.duration_secs),
        summary.distinct_speakers,
        summary.sources,
        summary.unmapped_sources,
        summary.segments_finalized,
    )
}

fn format_duration(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Best-effort edit of the status message, if there is one.
pub(crate) async fn edit_status(
    platform: &dyn ChatPlatform,
    message: Option<MessageRef>,
    content: &str,
) {
    let Some(message) = message else {
        return;
    };
    if let Err(e) = platform.edit_message(message, content).await {
        warn!(message_id = message.message_id, error = %e, "could not update status message");
    }
}
