use bytes::Bytes;

use crate::model::types::{DiscordRtcTimestamp, DiscordRtpSequence, Ssrc, UserId};

/// One received RTP packet, already decrypted.
#[derive(Clone, Debug)]
pub struct VoicePacket {
    pub ssrc: Ssrc,
    pub sequence: DiscordRtpSequence,
    pub timestamp: DiscordRtcTimestamp,
    /// a single opus frame
    pub opus_frame: Bytes,
}

/// Sent by Discord whenever a user's speaking flags change, and also
/// once when a user joins the channel.  This is the only place we
/// learn which user owns an SSRC.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpeakingUpdate {
    pub ssrc: Ssrc,
    pub user_id: UserId,
    pub speaking: bool,
}

#[derive(Clone, Debug)]
pub enum VoiceEvent {
    Packet(VoicePacket),
    Speaking(SpeakingUpdate),
    /// The underlying connection went away.
    Closed,
}
