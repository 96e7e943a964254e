//! Protocol module for framing, encoding and decoding application packets.
//!
//! This module contains the implementations for:
//! - Frame header layout and endpoint table
//! - Stream framing of inbound bytes
//! - Firmware version parsing and recovery-mode decision

pub mod firmware;
pub mod framer;
pub mod packet;

pub use firmware::{recovery_reason, FirmwareVersion, RecoveryReason, WatchInfo};
pub use framer::PacketFramer;
pub use packet::{
    encode_frame, Endpoint, EndpointDecoder, InboundMessage, PacketBus, PacketDecoder,
    PacketSender, ProtocolPacket, HEADER_SIZE,
};
