use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{api::collaborators::ChatPlatform, model::types::ChannelId};

/// Keeps the "typing" indicator alive in a channel until dropped.
///
/// Fires once immediately and then every `period`.
pub(crate) struct KeepAlive {
    shutdown_token: CancellationToken,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        // make our worker task exit
        self.shutdown_token.cancel();
    }
}

impl KeepAlive {
    pub fn start(platform: Arc<dyn ChatPlatform>, channel_id: ChannelId, period: Duration) -> Self {
        let shutdown_token = CancellationToken::new();
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = platform.trigger_typing(channel_id).await {
                    warn!(channel_id, error = %e, "typing indicator failed");
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        debug!(channel_id, "typing keep-alive");
                    }
                }
            }
        });
        Self { shutdown_token }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown_token.is_cancelled()
    }
}
