use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::warn;

use crate::{
    api::api_types::audio_cache_key,
    error::Result,
    events::voice::VoicePacket,
    model::{
        ogg_opus::OggOpusWriter,
        types::{ChannelId, Ssrc, UserId},
    },
};

/// One continuous recording of a single speaker, from their first
/// packet until they have been silent for longer than the timeout.
pub(crate) struct AudioSegment {
    pub user_id: UserId,
    pub ssrc: Ssrc,
    pub source_channel_id: ChannelId,

    /// `<user id>-<start time in nanoseconds>`, unique per segment
    pub storage_key: String,

    pub started_at: DateTime<Utc>,
    pub start_time: Instant,
    pub last_packet_time: Instant,

    encoder: OggOpusWriter,
}

/// A segment whose encoder has been closed.
#[derive(Debug)]
pub(crate) struct FinishedSegment {
    pub user_id: UserId,
    pub ssrc: Ssrc,
    pub source_channel_id: ChannelId,
    pub storage_key: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub frames: u64,
    pub audio: Bytes,
}

impl FinishedSegment {
    pub fn cache_key(&self) -> String {
        audio_cache_key(&self.storage_key)
    }
}

impl AudioSegment {
    pub fn new(
        user_id: UserId,
        ssrc: Ssrc,
        source_channel_id: ChannelId,
        now: Instant,
    ) -> Result<Self> {
        let started_at = Utc::now();
        let start_nanos = started_at.timestamp_nanos_opt().unwrap_or_default();
        Ok(Self {
            user_id,
            ssrc,
            source_channel_id,
            storage_key: format!("{}-{}", user_id, start_nanos),
            started_at,
            start_time: now,
            last_packet_time: now,
            encoder: OggOpusWriter::new(ssrc)?,
        })
    }

    /// Records a packet.  The packet still counts as activity even
    /// if the encoder rejects it.
    pub fn add_packet(&mut self, packet: &VoicePacket, now: Instant) -> Result<()> {
        self.last_packet_time = now;
        self.encoder.write_frame(&packet.opus_frame, packet.timestamp)
    }

    /// True once the speaker has been silent for longer than `timeout`.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_packet_time) > timeout
    }

    pub fn frames(&self) -> u64 {
        self.encoder.frames()
    }

    /// Closes the encoder.  Consumes the segment so that it can
    /// never be written to again.
    pub fn finish(self) -> FinishedSegment {
        let frames = self.encoder.frames();
        let audio = match self.encoder.finish() {
            Ok(audio) => audio,
            Err(e) => {
                warn!(user_id = self.user_id, ssrc = self.ssrc, error = %e, "failed to close segment encoder");
                Bytes::new()
            }
        };
        FinishedSegment {
            user_id: self.user_id,
            ssrc: self.ssrc,
            source_channel_id: self.source_channel_id,
            storage_key: self.storage_key,
            started_at: self.started_at,
            duration: self
                .last_packet_time
                .saturating_duration_since(self.start_time),
            frames,
            audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::Wrapping;

    use super::*;

    fn packet(ssrc: Ssrc, seq: u16, ts: u32) -> VoicePacket {
        VoicePacket {
            ssrc,
            sequence: Wrapping(seq),
            timestamp: Wrapping(ts),
            opus_frame: Bytes::from_static(&[0xf8, 0xff, 0xfe]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_segment_lifecycle() {
        let start = Instant::now();
        let mut segment = AudioSegment::new(42, 111, 9, start).unwrap();
        assert!(segment.storage_key.starts_with("42-"));

        segment.add_packet(&packet(111, 1, 0), start).unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        let later = Instant::now();
        segment.add_packet(&packet(111, 2, 960), later).unwrap();
        assert_eq!(segment.last_packet_time, later);
        assert_eq!(segment.frames(), 2);

        let timeout = Duration::from_secs(2);
        assert!(!segment.is_timed_out(later + timeout, timeout));
        assert!(segment.is_timed_out(later + timeout + Duration::from_millis(1), timeout));

        let finished = segment.finish();
        assert_eq!(finished.frames, 2);
        assert_eq!(finished.duration, Duration::from_millis(20));
        assert!(finished.audio.starts_with(b"OggS"));
        assert_eq!(
            finished.cache_key(),
            format!("audio:{}.ogg", finished.storage_key)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_encoder_error_still_counts_as_activity() {
        let start = Instant::now();
        let mut segment = AudioSegment::new(1, 2, 3, start).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let mut empty = packet(2, 1, 0);
        empty.opus_frame = Bytes::new();
        assert!(segment.add_packet(&empty, Instant::now()).is_err());
        assert_eq!(segment.last_packet_time, Instant::now());
        assert_eq!(segment.frames(), 0);
    }
}
