use thiserror::Error;

use crate::model::types::GuildId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cache error: {0}")]
    Cache(String),

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("voice transport error: {0}")]
    Transport(String),

    #[error("audio encoder error: {0}")]
    Encoder(String),

    #[error("could not join voice in guild {guild_id} after {attempts} attempts")]
    JoinFailed { guild_id: GuildId, attempts: u32 },

    /// The operation was cancelled cooperatively.  This is not a failure.
    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
