use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    api::{
        api_types::{
            DisconnectSummary, GuildStateSnapshot, MessageRef, SessionStatus, TranscriptEntry,
        },
        collaborators::VoiceConnection,
    },
    events::voice::VoicePacket,
    model::{
        audio_segment::AudioSegment,
        types::{ChannelId, GuildId, Ssrc, UserId},
    },
};

/// Everything about a session except its live segments.
#[derive(Default)]
struct SessionMetadata {
    connection_channel_id: Option<ChannelId>,
    connection_start_time: Option<DateTime<Utc>>,
    connected_at: Option<Instant>,
    connection_message_ref: Option<MessageRef>,
    connection: Option<Arc<dyn VoiceConnection>>,

    /// populated only by speaking updates, never from audio
    speaker_map: HashMap<Ssrc, UserId>,

    /// sources which sent audio before we knew who they were
    unmapped_sources: HashSet<Ssrc>,

    transcript_history: HashMap<ChannelId, VecDeque<TranscriptEntry>>,
}

/// What happened to a packet routed through a session.
pub(crate) enum PacketOutcome {
    /// No speaker is bound to the source; no segment was created.
    Unmapped,
    Created,
    Appended,
    /// The source was re-bound to a different user since its segment
    /// started.  The old segment is returned for finalization and a
    /// new one was started.
    Restarted(AudioSegment),
    /// The segment could not be created.
    Dropped,
}

/// Per-guild voice state.
///
/// Metadata and live segments sit behind separate locks so that
/// packet-rate segment updates never block status readers.  Neither
/// lock is held while the other is taken.
pub struct GuildVoiceSession {
    guild_id: GuildId,
    history_len: usize,
    metadata: RwLock<SessionMetadata>,
    segments: Mutex<HashMap<Ssrc, AudioSegment>>,
    cancel: CancellationToken,
    status_nudge: Notify,
}

impl GuildVoiceSession {
    pub(crate) fn new(guild_id: GuildId, history_len: usize) -> Self {
        Self {
            guild_id,
            history_len,
            metadata: RwLock::new(SessionMetadata::default()),
            segments: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            status_nudge: Notify::new(),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    // ----- connection metadata -----

    pub(crate) fn set_channel(&self, channel_id: ChannelId) {
        let mut metadata = self.metadata.write();
        metadata.connection_channel_id = Some(channel_id);
        metadata.connection_start_time = Some(Utc::now());
        metadata.connected_at = Some(Instant::now());
    }

    pub(crate) fn set_connection(&self, connection: Arc<dyn VoiceConnection>) {
        self.metadata.write().connection = Some(connection);
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn VoiceConnection>> {
        self.metadata.read().connection.clone()
    }

    /// The channel the live connection reports, which may differ from
    /// `connection_channel_id` after the bot was moved.
    pub fn live_channel_id(&self) -> Option<ChannelId> {
        self.connection()
            .and_then(|connection| connection.current_channel())
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<dyn VoiceConnection>> {
        self.metadata.write().connection.take()
    }

    pub(crate) fn set_message_ref(&self, message: Option<MessageRef>) {
        self.metadata.write().connection_message_ref = message;
    }

    pub fn message_ref(&self) -> Option<MessageRef> {
        self.metadata.read().connection_message_ref
    }

    pub fn connection_channel_id(&self) -> Option<ChannelId> {
        self.metadata.read().connection_channel_id
    }

    // ----- cancellation -----

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Asks the capture loop to run its status check now.
    pub(crate) fn nudge_status(&self) {
        self.status_nudge.notify_one();
    }

    pub(crate) async fn status_nudged(&self) {
        self.status_nudge.notified().await
    }

    // ----- speakers -----

    /// Binds a source to a user.  Returns true if the binding changed.
    pub(crate) fn bind_speaker(&self, ssrc: Ssrc, user_id: UserId) -> bool {
        let mut metadata = self.metadata.write();
        metadata.unmapped_sources.remove(&ssrc);
        metadata.speaker_map.insert(ssrc, user_id) != Some(user_id)
    }

    pub fn speaker_for(&self, ssrc: Ssrc) -> Option<UserId> {
        self.metadata.read().speaker_map.get(&ssrc).copied()
    }

    pub fn unmapped_sources(&self) -> BTreeSet<Ssrc> {
        self.metadata.read().unmapped_sources.iter().copied().collect()
    }

    // ----- segments -----

    /// Sends a packet to its speaker's segment, creating the segment
    /// on the first packet from a bound source.
    pub(crate) fn route_packet(&self, packet: &VoicePacket, now: Instant) -> PacketOutcome {
        let (speaker, channel_id) = {
            let metadata = self.metadata.read();
            (
                metadata.speaker_map.get(&packet.ssrc).copied(),
                metadata.connection_channel_id.unwrap_or_default(),
            )
        };

        let Some(user_id) = speaker else {
            if self.metadata.write().unmapped_sources.insert(packet.ssrc) {
                debug!(guild_id = self.guild_id, ssrc = packet.ssrc, "audio from unmapped source");
            }
            return PacketOutcome::Unmapped;
        };

        let mut segments = self.segments.lock();
        // teardown cancels before it drains, so a session retired under
        // us can't be handed a segment nobody will finalize
        if self.cancel.is_cancelled() {
            debug!(guild_id = self.guild_id, ssrc = packet.ssrc, "packet for retired session");
            return PacketOutcome::Dropped;
        }
        let mut outcome = PacketOutcome::Appended;
        if segments
            .get(&packet.ssrc)
            .is_some_and(|segment| segment.user_id != user_id)
        {
            if let Some(old) = segments.remove(&packet.ssrc) {
                outcome = PacketOutcome::Restarted(old);
            }
        }

        let segment = match segments.entry(packet.ssrc) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                match AudioSegment::new(user_id, packet.ssrc, channel_id, now) {
                    Ok(segment) => {
                        debug!(
                            guild_id = self.guild_id,
                            user_id,
                            ssrc = packet.ssrc,
                            key = %segment.storage_key,
                            "started segment"
                        );
                        if matches!(outcome, PacketOutcome::Appended) {
                            outcome = PacketOutcome::Created;
                        }
                        entry.insert(segment)
                    }
                    Err(e) => {
                        warn!(guild_id = self.guild_id, ssrc = packet.ssrc, error = %e, "could not start segment");
                        return match outcome {
                            PacketOutcome::Restarted(old) => PacketOutcome::Restarted(old),
                            _ => PacketOutcome::Dropped,
                        };
                    }
                }
            }
        };

        if let Err(e) = segment.add_packet(packet, now) {
            warn!(
                guild_id = self.guild_id,
                ssrc = packet.ssrc,
                sequence = packet.sequence.0,
                error = %e,
                "dropping audio frame"
            );
        }
        outcome
    }

    /// Removes and returns every segment silent for longer than `timeout`.
    pub(crate) fn take_timed_out(&self, now: Instant, timeout: Duration) -> Vec<AudioSegment> {
        let mut segments = self.segments.lock();
        let expired: Vec<Ssrc> = segments
            .iter()
            .filter(|(_, segment)| segment.is_timed_out(now, timeout))
            .map(|(ssrc, _)| *ssrc)
            .collect();
        expired
            .into_iter()
            .filter_map(|ssrc| segments.remove(&ssrc))
            .collect()
    }

    /// Removes and returns all live segments.  A second call returns
    /// nothing, so teardown never finalizes a segment twice.
    pub(crate) fn take_all_segments(&self) -> Vec<AudioSegment> {
        self.segments.lock().drain().map(|(_, segment)| segment).collect()
    }

    pub fn active_segment_count(&self) -> usize {
        self.segments.lock().len()
    }

    pub(crate) fn with_segment<T>(&self, ssrc: Ssrc, f: impl FnOnce(&AudioSegment) -> T) -> Option<T> {
        self.segments.lock().get(&ssrc).map(f)
    }

    // ----- transcripts -----

    pub(crate) fn append_transcript(&self, channel_id: ChannelId, entry: TranscriptEntry) {
        let mut metadata = self.metadata.write();
        let history = metadata.transcript_history.entry(channel_id).or_default();
        history.push_back(entry);
        while history.len() > self.history_len {
            history.pop_front();
        }
    }

    /// Transcript entries for a channel, oldest first.
    pub fn transcript(&self, channel_id: ChannelId) -> Vec<TranscriptEntry> {
        self.metadata
            .read()
            .transcript_history
            .get(&channel_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ----- persistence and reporting -----

    pub fn snapshot(&self) -> GuildStateSnapshot {
        let metadata = self.metadata.read();
        GuildStateSnapshot {
            guild_id: self.guild_id,
            connection_channel_id: metadata.connection_channel_id,
            connection_start_time: metadata.connection_start_time,
            connection_message_ref: metadata.connection_message_ref,
            speaker_map: metadata.speaker_map.iter().map(|(k, v)| (*k, *v)).collect(),
            unmapped_sources: metadata.unmapped_sources.iter().copied().collect(),
            transcript_history: metadata
                .transcript_history
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }

    /// Seeds speakers and transcripts from a persisted snapshot of
    /// the same channel.  Bindings we already know take precedence.
    /// Returns false if the snapshot was for another channel.
    pub(crate) fn restore(&self, snapshot: GuildStateSnapshot) -> bool {
        let mut metadata = self.metadata.write();
        if snapshot.guild_id != self.guild_id
            || snapshot.connection_channel_id.is_none()
            || snapshot.connection_channel_id != metadata.connection_channel_id
        {
            return false;
        }
        for (ssrc, user_id) in snapshot.speaker_map {
            metadata.speaker_map.entry(ssrc).or_insert(user_id);
        }
        for (channel_id, entries) in snapshot.transcript_history {
            let history = metadata.transcript_history.entry(channel_id).or_default();
            if history.is_empty() {
                *history = entries;
                while history.len() > self.history_len {
                    history.pop_front();
                }
            }
        }
        true
    }

    pub fn status(&self) -> SessionStatus {
        let active_segments = self.active_segment_count();
        let metadata = self.metadata.read();
        SessionStatus {
            guild_id: self.guild_id,
            channel_id: metadata.connection_channel_id,
            connected_for_secs: metadata
                .connected_at
                .map(|at| at.elapsed().as_secs())
                .unwrap_or_default(),
            active_segments,
            speakers: metadata.speaker_map.values().copied().collect(),
            sources: metadata.speaker_map.len(),
            unmapped_sources: metadata.unmapped_sources.len(),
        }
    }

    pub(crate) fn summary(&self, segments_finalized: usize) -> DisconnectSummary {
        let status = self.status();
        DisconnectSummary {
            guild_id: self.guild_id,
            channel_id: status.channel_id,
            duration_secs: status.connected_for_secs,
            distinct_speakers: status.speakers.len(),
            sources: status.sources,
            unmapped_sources: status.unmapped_sources,
            segments_finalized,
        }
    }
}
