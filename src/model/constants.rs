use std::time::Duration;

/// How long a speaker may be silent before their segment is finalized.
pub(crate) const VOICE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long finalized audio is kept in the cache.
pub(crate) const AUDIO_TTL: Duration = Duration::from_secs(10 * 60);

pub(crate) const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Voice joins are attempted this many times, waiting
/// JOIN_BACKOFF_BASE * 2^n after the n-th failure.
pub(crate) const JOIN_ATTEMPTS: u32 = 3;
pub(crate) const JOIN_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// keep this many transcript entries per channel, oldest are dropped.
pub(crate) const TRANSCRIPT_HISTORY_LEN: usize = 50;

/// At most this many prior messages are shown to the engagement decision.
pub(crate) const DECISION_WINDOW: usize = 5;

pub(crate) const REPLY_HISTORY_DEPTH: usize = 30;

/// Discord shows "typing" for ~10s after each trigger.
pub(crate) const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(8);

/// Pending dwells this long before asking for a decision, so that
/// a quick follow-up message supersedes it without a model call.
pub(crate) const DECISION_DEBOUNCE: Duration = Duration::from_millis(500);

/// Ogg pages are flushed after this many opus frames (about one second).
pub(crate) const FRAMES_PER_OGG_PAGE: u32 = 50;

/// First millisecond of 2015, the start of Discord's snowflake clock.
pub(crate) const DISCORD_EPOCH_MILLIS: i64 = 1_420_070_400_000;

/// Upper bound on how many messages one history lookup fetches.
pub(crate) const MAX_HISTORY_FETCH: usize = 200;
