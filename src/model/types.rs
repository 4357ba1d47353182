// Discord sends 20ms opus frames, stereo at 48kHz, and stamps each
// RTP packet with a 48kHz sample clock.

use std::num::Wrapping;

pub const DISCORD_AUDIO_CHANNELS: u8 = 2;

pub const DISCORD_SAMPLES_PER_SECOND: u32 = 48000;

/// Samples per channel in a single 20ms opus frame.
pub const DISCORD_SAMPLES_PER_FRAME: u64 = 960;

pub type DiscordRtcTimestampInner = u32;
pub type DiscordRtcTimestamp = Wrapping<DiscordRtcTimestampInner>;
pub type DiscordRtpSequence = Wrapping<u16>;

pub type ChannelId = u64;
pub type GuildId = u64;
pub type MessageId = u64;
pub type Ssrc = u32;
pub type UserId = u64;
