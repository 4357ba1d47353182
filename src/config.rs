use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::warn;

use crate::{
    error::{Error, Result},
    model::{
        constants,
        types::{GuildId, UserId},
    },
};

/// Per-guild overrides.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GuildConfig {
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub voice_timeout: Option<Duration>,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Silence after which a speaker's segment is finalized.
    /// Also the period of the sweep which checks for it.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub voice_timeout: Duration,

    /// Expiry of cached audio, in minutes.
    pub audio_ttl_minutes: u64,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub status_refresh: Duration,

    pub join_attempts: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub join_backoff: Duration,

    pub transcript_history_len: usize,

    pub decision_window: usize,

    pub reply_history_depth: usize,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive_period: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub decision_debounce: Duration,

    /// The bot's own user id.  Never bound as a speaker, and marks
    /// where the engagement decision window stops.
    pub self_user_id: Option<UserId>,

    pub guilds: HashMap<GuildId, GuildConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            voice_timeout: constants::VOICE_TIMEOUT,
            audio_ttl_minutes: constants::AUDIO_TTL.as_secs() / 60,
            status_refresh: constants::STATUS_REFRESH_INTERVAL,
            join_attempts: constants::JOIN_ATTEMPTS,
            join_backoff: constants::JOIN_BACKOFF_BASE,
            transcript_history_len: constants::TRANSCRIPT_HISTORY_LEN,
            decision_window: constants::DECISION_WINDOW,
            reply_history_depth: constants::REPLY_HISTORY_DEPTH,
            keep_alive_period: constants::KEEP_ALIVE_PERIOD,
            decision_debounce: constants::DECISION_DEBOUNCE,
            self_user_id: None,
            guilds: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.voice_timeout.is_zero() {
            return Err(Error::Config("voice_timeout must be positive".to_string()));
        }
        if self.status_refresh.is_zero() {
            return Err(Error::Config("status_refresh must be positive".to_string()));
        }
        if self.join_attempts == 0 {
            return Err(Error::Config("join_attempts must be at least 1".to_string()));
        }
        if self.keep_alive_period.is_zero() {
            return Err(Error::Config(
                "keep_alive_period must be positive".to_string(),
            ));
        }
        if let Some((guild_id, _)) = self
            .guilds
            .iter()
            .find(|(_, guild)| guild.voice_timeout.is_some_and(|t| t.is_zero()))
        {
            return Err(Error::Config(format!(
                "voice_timeout for guild {} must be positive",
                guild_id
            )));
        }
        Ok(())
    }

    /// Replaces values the engines can't run with, such as zero timer
    /// periods, by their defaults.  `from_json` rejects these outright,
    /// but a `Config` built in code never went through it.
    pub(crate) fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.voice_timeout.is_zero() {
            warn!("voice_timeout is zero, using the default");
            self.voice_timeout = defaults.voice_timeout;
        }
        if self.status_refresh.is_zero() {
            warn!("status_refresh is zero, using the default");
            self.status_refresh = defaults.status_refresh;
        }
        if self.keep_alive_period.is_zero() {
            warn!("keep_alive_period is zero, using the default");
            self.keep_alive_period = defaults.keep_alive_period;
        }
        if self.join_attempts == 0 {
            warn!("join_attempts is zero, using the default");
            self.join_attempts = defaults.join_attempts;
        }
        for (guild_id, guild) in self.guilds.iter_mut() {
            if guild.voice_timeout.is_some_and(|t| t.is_zero()) {
                warn!(guild_id, "voice_timeout override is zero, ignoring it");
                guild.voice_timeout = None;
            }
        }
        self
    }

    /// The silence timeout for the given guild, taking overrides into account.
    pub fn voice_timeout_for(&self, guild_id: GuildId) -> Duration {
        self.guilds
            .get(&guild_id)
            .and_then(|guild| guild.voice_timeout)
            .unwrap_or(self.voice_timeout)
    }

    pub fn audio_ttl(&self) -> Duration {
        Duration::from_secs(self.audio_ttl_minutes * 60)
    }

    /// Delay after the n-th failed join attempt (0-based).
    pub fn join_backoff_after(&self, failed_attempt: u32) -> Duration {
        self.join_backoff * 2u32.saturating_pow(failed_attempt)
    }
}
