// Wraps the opus frames Discord sends us in an Ogg container (RFC 7845)
// without re-encoding them.

use bytes::Bytes;
use ogg::writing::{PacketWriteEndInfo, PacketWriter};

use crate::{
    error::{Error, Result},
    model::{
        constants::FRAMES_PER_OGG_PAGE,
        types::{
            DiscordRtcTimestamp, DiscordRtcTimestampInner, DISCORD_AUDIO_CHANNELS,
            DISCORD_SAMPLES_PER_FRAME, DISCORD_SAMPLES_PER_SECOND,
        },
    },
};

const VENDOR: &str = "voicebridge";

fn opus_head() -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(DISCORD_AUDIO_CHANNELS);
    head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
    head.extend_from_slice(&DISCORD_SAMPLES_PER_SECOND.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let mut tags = Vec::with_capacity(16 + VENDOR.len());
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    tags.extend_from_slice(VENDOR.as_bytes());
    tags.extend_from_slice(&0u32.to_le_bytes()); // no user comments
    tags
}

/// Writes opus frames into an in-memory Ogg stream.
///
/// The last frame is held back until the next one arrives (or the
/// stream is finished) so that it can be marked end-of-stream.
pub(crate) struct OggOpusWriter {
    writer: PacketWriter<'static, Vec<u8>>,
    serial: u32,
    first_timestamp: Option<DiscordRtcTimestamp>,
    granule: u64,
    pending: Option<(Vec<u8>, u64)>,
    frames_in_page: u32,
    frames_written: u64,
}

impl OggOpusWriter {
    pub fn new(serial: u32) -> Result<Self> {
        let mut writer = PacketWriter::new(Vec::new());
        writer
            .write_packet(opus_head(), serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| Error::Encoder(e.to_string()))?;
        writer
            .write_packet(opus_tags(), serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| Error::Encoder(e.to_string()))?;
        Ok(Self {
            writer,
            serial,
            first_timestamp: None,
            granule: 0,
            pending: None,
            frames_in_page: 0,
            frames_written: 0,
        })
    }

    /// Adds one opus frame.  `timestamp` is the packet's RTP timestamp,
    /// which counts 48kHz samples, so gaps in speech keep their length.
    pub fn write_frame(&mut self, frame: &[u8], timestamp: DiscordRtcTimestamp) -> Result<()> {
        if frame.is_empty() {
            return Err(Error::Encoder("empty opus frame".to_string()));
        }
        let first = *self.first_timestamp.get_or_insert(timestamp);
        let delta = (timestamp - first).0;
        // a "negative" difference wraps to a huge one: the packet is
        // older than the first, so it just takes the next frame slot
        let offset = if delta > DiscordRtcTimestampInner::MAX / 2 {
            0
        } else {
            u64::from(delta)
        };
        // reordered packets must not move the granule backwards
        self.granule = (offset + DISCORD_SAMPLES_PER_FRAME)
            .max(self.granule + DISCORD_SAMPLES_PER_FRAME * u64::from(self.pending.is_some()));

        if let Some((data, granule)) = self.pending.take() {
            self.frames_in_page += 1;
            let end_info = if self.frames_in_page >= FRAMES_PER_OGG_PAGE {
                self.frames_in_page = 0;
                PacketWriteEndInfo::EndPage
            } else {
                PacketWriteEndInfo::NormalPacket
            };
            self.write_packet(data, end_info, granule)?;
        }
        self.pending = Some((frame.to_vec(), self.granule));
        Ok(())
    }

    /// Number of frames accepted so far.
    pub fn frames(&self) -> u64 {
        self.frames_written + u64::from(self.pending.is_some())
    }

    /// Closes the stream and returns the encoded bytes.
    pub fn finish(mut self) -> Result<Bytes> {
        if let Some((data, granule)) = self.pending.take() {
            self.write_packet(data, PacketWriteEndInfo::EndStream, granule)?;
        }
        Ok(Bytes::from(self.writer.into_inner()))
    }

    fn write_packet(
        &mut self,
        data: Vec<u8>,
        end_info: PacketWriteEndInfo,
        granule: u64,
    ) -> Result<()> {
        self.writer
            .write_packet(data, self.serial, end_info, granule)
            .map_err(|e| Error::Encoder(e.to_string()))?;
        self.frames_written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, num::Wrapping};

    use ogg::PacketReader;

    use super::*;

    #[test]
    fn test_stream_layout() {
        let mut writer = OggOpusWriter::new(7).unwrap();
        writer.write_frame(&[1, 2, 3], Wrapping(1000)).unwrap();
        writer.write_frame(&[4, 5], Wrapping(1960)).unwrap();
        // a gap of one second of silence
        writer.write_frame(&[6], Wrapping(1960 + 48000)).unwrap();
        assert_eq!(writer.frames(), 3);
        let bytes = writer.finish().unwrap();

        let mut reader = PacketReader::new(Cursor::new(bytes.to_vec()));
        let head = reader.read_packet().unwrap().unwrap();
        assert!(head.data.starts_with(b"OpusHead"));
        assert_eq!(head.data[9], 2);
        let tags = reader.read_packet().unwrap().unwrap();
        assert!(tags.data.starts_with(b"OpusTags"));

        let mut frames = Vec::new();
        while let Some(packet) = reader.read_packet().unwrap() {
            frames.push(packet);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data, vec![1, 2, 3]);
        assert_eq!(frames[2].data, vec![6]);
        assert!(frames[2].last_in_stream());
        assert_eq!(frames[2].absgp_page(), 960 + 48000 + 960);
    }

    #[test]
    fn test_reordered_packet_keeps_granule_monotonic() {
        let mut writer = OggOpusWriter::new(1).unwrap();
        writer.write_frame(&[1], Wrapping(u32::MAX - 100)).unwrap();
        // wraps around the RTP clock
        writer.write_frame(&[2], Wrapping(860)).unwrap();
        let after_wrap = writer.granule;
        assert_eq!(after_wrap, 961 + 960);
        // older than the previous packet
        writer.write_frame(&[3], Wrapping(u32::MAX - 50)).unwrap();
        assert!(writer.granule > after_wrap);
    }

    #[test]
    fn test_packet_older_than_first_advances_one_frame() {
        let mut writer = OggOpusWriter::new(1).unwrap();
        writer.write_frame(&[1], Wrapping(1920)).unwrap();
        writer.write_frame(&[2], Wrapping(960)).unwrap();
        assert_eq!(writer.granule, 960 + 960);
        writer.write_frame(&[3], Wrapping(2880)).unwrap();
        assert_eq!(writer.granule, 960 + 960 + 960);

        let bytes = writer.finish().unwrap();
        let mut reader = PacketReader::new(Cursor::new(bytes.to_vec()));
        let mut last = None;
        while let Some(packet) = reader.read_packet().unwrap() {
            last = Some(packet);
        }
        assert_eq!(last.unwrap().absgp_page(), 2880);
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let mut writer = OggOpusWriter::new(1).unwrap();
        assert!(matches!(
            writer.write_frame(&[], Wrapping(0)),
            Err(Error::Encoder(_))
        ));
        assert_eq!(writer.frames(), 0);
        assert!(!writer.finish().unwrap().is_empty());
    }
}
