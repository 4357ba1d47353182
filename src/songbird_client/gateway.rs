//! A [`VoiceGateway`] backed by songbird's voice driver.
//!
//! The driver runs in pass-through mode: we never decode audio here,
//! the opus frames go straight into the segment's ogg container.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use songbird::{
    driver::DecodeMode,
    events::context_data::{ConnectData, DisconnectData, DisconnectKind, DisconnectReason, VoiceData},
    id,
    model::payload::Speaking,
    ConnectionInfo, CoreEvent, Driver, EventContext,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::{
    api::collaborators::{VoiceConnection, VoiceGateway, VoiceLink},
    error::{Error, Result},
    events::voice::{SpeakingUpdate, VoiceEvent, VoicePacket},
    model::types::{ChannelId, GuildId, UserId},
};

/// What the voice server told the main gateway about a join.
#[derive(Clone, Debug)]
pub struct VoiceServerInfo {
    pub endpoint: String,
    pub session_id: String,
    pub token: String,
    /// our own user id
    pub user_id: UserId,
}

/// The voice handshake happens on the platform's main gateway, which
/// this crate doesn't own.  Whoever does supplies the result here.
#[async_trait]
pub trait VoiceServerSource: Send + Sync {
    async fn voice_server_info(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<VoiceServerInfo>;
}

pub struct SongbirdGateway<S> {
    source: S,
}

impl<S> SongbirdGateway<S>
where
    S: VoiceServerSource,
{
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S> VoiceGateway for SongbirdGateway<S>
where
    S: VoiceServerSource,
{
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceLink> {
        let server = self.source.voice_server_info(guild_id, channel_id).await?;

        let mut config = songbird::Config::default();
        config.decode_mode = DecodeMode::Pass; // keep incoming audio as opus
        let mut driver = Driver::new(config);

        let (tx_events, rx_events) = mpsc::unbounded_channel::<VoiceEvent>();
        let channel = Arc::new(Mutex::new(Some(channel_id)));
        PacketHandler::register(
            &mut driver,
            Arc::new(PacketHandler {
                events: tx_events,
                channel: channel.clone(),
            }),
        );

        let connection_info = ConnectionInfo {
            channel_id: Some(id::ChannelId::from(channel_id)),
            endpoint: server.endpoint,
            guild_id: id::GuildId::from(guild_id),
            session_id: server.session_id,
            token: server.token,
            user_id: id::UserId::from(server.user_id),
        };
        driver
            .connect(connection_info)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(guild_id, channel_id, "voice driver connected");

        Ok(VoiceLink {
            connection: Arc::new(SongbirdConnection {
                driver: Mutex::new(driver),
                channel,
            }),
            events: rx_events,
        })
    }
}

/// Owns the driver: dropping it shuts the connection down.
pub struct SongbirdConnection {
    driver: Mutex<Driver>,
    channel: Arc<Mutex<Option<ChannelId>>>,
}

impl VoiceConnection for SongbirdConnection {
    fn current_channel(&self) -> Option<ChannelId> {
        *self.channel.lock()
    }

    fn leave(&self) {
        self.driver.lock().leave();
    }
}

/// Turns driver events into [`VoiceEvent`]s.
///
/// Deliberately holds no reference to the driver, which owns it.
struct PacketHandler {
    events: UnboundedSender<VoiceEvent>,
    channel: Arc<Mutex<Option<ChannelId>>>,
}

impl PacketHandler {
    fn register(driver: &mut Driver, handler: Arc<Self>) {
        driver.add_global_event(
            CoreEvent::SpeakingStateUpdate.into(),
            EventForwarder::new(handler.clone(), |ctx, handler| {
                if let EventContext::SpeakingStateUpdate(Speaking {
                    speaking,
                    ssrc,
                    user_id,
                    ..
                }) = ctx
                {
                    // sent when a user joins too, so bind even if not speaking yet
                    match user_id {
                        Some(user_id) => handler.on_speaking(SpeakingUpdate {
                            ssrc: *ssrc,
                            user_id: user_id.0,
                            speaking: speaking.microphone(),
                        }),
                        None => debug!(ssrc, "speaking update without user id"),
                    }
                }
            }),
        );
        driver.add_global_event(
            CoreEvent::VoicePacket.into(),
            EventForwarder::new(handler.clone(), |ctx, handler| {
                if let EventContext::VoicePacket(VoiceData {
                    packet,
                    payload_offset,
                    payload_end_pad,
                    ..
                }) = ctx
                {
                    match opus_payload(&packet.payload, *payload_offset, *payload_end_pad) {
                        Some(frame) => handler.on_packet(VoicePacket {
                            ssrc: packet.ssrc,
                            sequence: packet.sequence.0,
                            timestamp: packet.timestamp.0,
                            opus_frame: Bytes::copy_from_slice(frame),
                        }),
                        None => debug!(ssrc = packet.ssrc, "packet without opus payload"),
                    }
                }
            }),
        );
        driver.add_global_event(
            CoreEvent::DriverConnect.into(),
            EventForwarder::new(handler.clone(), |ctx, handler| {
                if let EventContext::DriverConnect(ConnectData { channel_id, .. }) = ctx {
                    handler.on_channel(channel_id.map(|c| c.0));
                }
            }),
        );
        driver.add_global_event(
            CoreEvent::DriverReconnect.into(),
            EventForwarder::new(handler.clone(), |ctx, handler| {
                if let EventContext::DriverReconnect(ConnectData { channel_id, .. }) = ctx {
                    handler.on_channel(channel_id.map(|c| c.0));
                }
            }),
        );
        driver.add_global_event(
            CoreEvent::DriverDisconnect.into(),
            EventForwarder::new(handler, |ctx, handler| {
                if let EventContext::DriverDisconnect(DisconnectData { kind, reason, .. }) = ctx {
                    if closes_connection(*kind, *reason) {
                        warn!(?kind, ?reason, "voice driver disconnected");
                        handler.on_closed();
                    } else {
                        debug!(?kind, "voice driver disconnected, expecting reconnect");
                    }
                }
            }),
        );
    }

    // the receiver is gone once the capture loop has exited, which is fine

    fn on_speaking(&self, update: SpeakingUpdate) {
        self.events.send(VoiceEvent::Speaking(update)).ok();
    }

    fn on_packet(&self, packet: VoicePacket) {
        self.events.send(VoiceEvent::Packet(packet)).ok();
    }

    fn on_channel(&self, channel_id: Option<ChannelId>) {
        *self.channel.lock() = channel_id;
    }

    fn on_closed(&self) {
        self.events.send(VoiceEvent::Closed).ok();
    }
}

/// The opus frame inside an RTP payload, past any header extension
/// and before any padding.
fn opus_payload(payload: &[u8], offset: usize, end_pad: usize) -> Option<&[u8]> {
    let end = payload.len().checked_sub(end_pad)?;
    payload.get(offset..end).filter(|frame| !frame.is_empty())
}

/// A disconnect ends the session unless it was a runtime drop with no
/// reason given, which the driver reports when it is being moved.
fn closes_connection(kind: DisconnectKind, reason: Option<DisconnectReason>) -> bool {
    reason.is_some() || matches!(kind, DisconnectKind::Connect | DisconnectKind::Reconnect)
}

struct EventForwarder<T>
where
    T: Fn(&EventContext, &PacketHandler) + Send + Sync,
{
    handler: T,
    packet_handler: Arc<PacketHandler>,
}

impl<T> EventForwarder<T>
where
    T: Fn(&EventContext, &PacketHandler) + Send + Sync,
{
    fn new(packet_handler: Arc<PacketHandler>, handler: T) -> Self {
        Self {
            packet_handler,
            handler,
        }
    }
}

#[async_trait]
impl<T> songbird::EventHandler for EventForwarder<T>
where
    T: Fn(&EventContext, &PacketHandler) + Send + Sync,
{
    async fn act(&self, ctx: &EventContext<'_>) -> Option<songbird::Event> {
        (self.handler)(ctx, &self.packet_handler);
        None
    }
}
