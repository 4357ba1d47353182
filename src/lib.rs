pub mod api {
    pub mod api_types;
    pub mod collaborators;
    pub mod engagement_engine;
    pub mod voice_engine;
}
mod capture {
    pub(crate) mod capture_loop;
    pub(crate) mod connect;
    pub(crate) mod finalize;
    pub(crate) mod status;
}
pub mod config;
mod engagement {
    pub(crate) mod engine_loop;
    pub(crate) mod history;
    pub(crate) mod keep_alive;
}
pub mod error;
pub mod events {
    pub mod voice;
}
pub mod model {
    pub(crate) mod audio_segment;
    pub(crate) mod constants;
    pub mod engagement;
    pub mod guild_session;
    pub(crate) mod ogg_opus;
    pub mod registry;
    pub mod types;
}
pub mod songbird_client {
    pub mod gateway;
}
#[cfg(test)]
mod testing;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use api::{
    api_types::{ChatMessage, Decision, DisconnectSummary, EngagementDecision, MessageRef},
    collaborators::{Cache, ChatPlatform, LanguageModel, SpeechToText, VoiceGateway},
    engagement_engine::EngagementEngine,
    voice_engine::VoiceEngine,
};
pub use config::Config;
pub use error::{Error, Result};
