//! Application packet format.
//!
//! Every packet on the wire is framed as:
//! - Length(2, big-endian): payload length, header excluded
//! - Endpoint(2, big-endian)
//! - Payload(Length)

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::{Error, Result};

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 4;

/// Size of the length prefix at the start of the header.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Known protocol endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Endpoint {
    /// Clock get/set.
    Time = 11,
    /// Watch version and capabilities.
    Version = 16,
    /// Host version exchange.
    PhoneVersion = 17,
    /// System messages (firmware update start, ...).
    SystemMessage = 18,
    /// Music control.
    MusicControl = 32,
    /// Phone call control.
    PhoneControl = 33,
    /// Application messages.
    AppMessage = 48,
    /// Legacy app launcher.
    Launcher = 49,
    /// Application run state.
    AppRunState = 52,
    /// Log stream.
    Logs = 2000,
    /// Ping/pong.
    Ping = 2001,
    /// Log dump.
    LogDump = 2002,
    /// Reset.
    Reset = 2003,
    /// Application logs.
    AppLogs = 2006,
    /// Legacy notifications.
    Notification = 3000,
    /// Application fetch.
    AppFetch = 6001,
    /// Data logging.
    DataLog = 6778,
    /// Screenshot.
    Screenshot = 8000,
    /// Core dump and file retrieval.
    GetBytes = 9000,
    /// Audio streaming.
    Audio = 10000,
    /// Voice control.
    Voice = 11000,
    /// Timeline actions.
    TimelineActions = 11440,
    /// App reordering.
    AppReorder = 43981,
    /// BlobDB v1.
    BlobDb = 45531,
    /// BlobDB v2.
    BlobDbV2 = 45787,
    /// Binary upload.
    PutBytes = 48879,
}

impl Endpoint {
    /// Create from the raw endpoint value, if it is known.
    pub fn from_raw(value: u16) -> Option<Self> {
        let endpoint = match value {
            11 => Self::Time,
            16 => Self::Version,
            17 => Self::PhoneVersion,
            18 => Self::SystemMessage,
            32 => Self::MusicControl,
            33 => Self::PhoneControl,
            48 => Self::AppMessage,
            49 => Self::Launcher,
            52 => Self::AppRunState,
            2000 => Self::Logs,
            2001 => Self::Ping,
            2002 => Self::LogDump,
            2003 => Self::Reset,
            2006 => Self::AppLogs,
            3000 => Self::Notification,
            6001 => Self::AppFetch,
            6778 => Self::DataLog,
            8000 => Self::Screenshot,
            9000 => Self::GetBytes,
            10000 => Self::Audio,
            11000 => Self::Voice,
            11440 => Self::TimelineActions,
            43981 => Self::AppReorder,
            45531 => Self::BlobDb,
            45787 => Self::BlobDbV2,
            48879 => Self::PutBytes,
            _ => return None,
        };
        Some(endpoint)
    }

    /// Convert to the raw endpoint value.
    pub fn to_raw(&self) -> u16 {
        *self as u16
    }
}

/// A decoded application packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolPacket {
    /// Destination endpoint.
    pub endpoint: Endpoint,
    /// Payload without the header.
    pub payload: Bytes,
}

impl ProtocolPacket {
    /// Create a new packet.
    pub fn new(endpoint: Endpoint, payload: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            payload: payload.into(),
        }
    }

    /// Serialize with the frame header.
    pub fn to_bytes(&self) -> Result<Bytes> {
        encode_frame(self.endpoint, &self.payload)
    }
}

/// Parses one complete frame into a typed packet.
pub trait PacketDecoder: Send + Sync {
    /// Decode a frame, header included.
    fn decode(&self, frame: &[u8]) -> Result<ProtocolPacket>;
}

/// Decoder that accepts any frame addressed to a known endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointDecoder;

impl PacketDecoder for EndpointDecoder {
    fn decode(&self, frame: &[u8]) -> Result<ProtocolPacket> {
        if frame.len() < HEADER_SIZE {
            return Err(Error::InvalidData {
                context: format!("Frame too short: {} bytes", frame.len()),
            });
        }

        let length = payload_length(frame) as usize;
        if frame.len() != HEADER_SIZE + length {
            return Err(Error::InvalidData {
                context: format!(
                    "Frame length mismatch: header says {}, got {}",
                    length,
                    frame.len() - HEADER_SIZE
                ),
            });
        }

        let raw_endpoint = u16::from_be_bytes([frame[2], frame[3]]);
        let endpoint = Endpoint::from_raw(raw_endpoint).ok_or_else(|| Error::InvalidData {
            context: format!("Unknown endpoint {}", raw_endpoint),
        })?;

        Ok(ProtocolPacket {
            endpoint,
            payload: Bytes::copy_from_slice(&frame[HEADER_SIZE..]),
        })
    }
}

/// Read the payload length from the first two bytes of a frame.
///
/// The caller must supply at least [`LENGTH_PREFIX_SIZE`] bytes.
pub fn payload_length(header: &[u8]) -> u16 {
    u16::from_be_bytes([header[0], header[1]])
}

/// Build a frame for `payload` addressed to `endpoint`.
pub fn encode_frame(endpoint: Endpoint, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidParameter {
            name: "payload".to_string(),
            value: format!("{} bytes", payload.len()),
        });
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.put_u16(endpoint.to_raw());
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// A packet received from the watch together with its raw frame.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The decoded packet.
    pub packet: ProtocolPacket,
    /// The frame as received, header included.
    pub raw: Bytes,
}

/// Encodes outbound packets onto the live byte channel.
#[derive(Debug, Clone)]
pub struct PacketSender {
    outbound: mpsc::Sender<Bytes>,
}

impl PacketSender {
    /// Wrap the outbound half of a live channel.
    pub fn new(outbound: mpsc::Sender<Bytes>) -> Self {
        Self { outbound }
    }

    /// Send a payload to `endpoint`.
    pub async fn send(&self, endpoint: Endpoint, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(endpoint, payload)?;
        self.send_raw(frame).await
    }

    /// Send a packet.
    pub async fn send_packet(&self, packet: &ProtocolPacket) -> Result<()> {
        self.send(packet.endpoint, &packet.payload).await
    }

    /// Send an already framed message.
    pub async fn send_raw(&self, frame: Bytes) -> Result<()> {
        trace!("Sending {} byte frame", frame.len());
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::StreamClosed)
    }
}

/// Inbound fan-out plus outbound sender, shared by every service of one
/// connection.
#[derive(Debug, Clone)]
pub struct PacketBus {
    inbound: broadcast::Sender<InboundMessage>,
    sender: PacketSender,
}

impl PacketBus {
    /// Create a bus over the outbound half of a live channel.
    pub fn new(outbound: mpsc::Sender<Bytes>) -> Self {
        let (inbound, _) = broadcast::channel(256);
        Self {
            inbound,
            sender: PacketSender::new(outbound),
        }
    }

    /// Sender that the framer publishes decoded packets to.
    pub fn inbound_sender(&self) -> broadcast::Sender<InboundMessage> {
        self.inbound.clone()
    }

    /// Receive every inbound packet from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    /// The outbound sender.
    pub fn sender(&self) -> &PacketSender {
        &self.sender
    }

    /// Send a payload to `endpoint`.
    pub async fn send(&self, endpoint: Endpoint, payload: &[u8]) -> Result<()> {
        self.sender.send(endpoint, payload).await
    }
}
