//! GATT client abstraction.
//!
//! The session establishment code talks to the watch through these traits so
//! the same sequence runs against btleplug, another platform stack, or a
//! test double.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConnectionFailureReason, Result};

/// GATT characteristic property bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Readable.
    pub const READ: Self = Self(0x02);
    /// Writable without response.
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    /// Writable with response.
    pub const WRITE: Self = Self(0x08);
    /// Notifies.
    pub const NOTIFY: Self = Self(0x10);

    /// Create from the raw property byte.
    pub fn from_raw(value: u8) -> Self {
        Self(value)
    }

    /// Convert to the raw property byte.
    pub fn to_raw(&self) -> u8 {
        self.0
    }

    /// Check if all bits of `other` are set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any write property is set.
    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::WRITE_NO_RESPONSE)
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattWriteType {
    /// Wait for the peer's write response.
    WithResponse,
    /// Fire and forget.
    NoResponse,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property bits.
    pub properties: CharacteristicProperties,
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in this service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Find a characteristic within a list of services.
pub fn find_characteristic<'a>(
    services: &'a [GattService],
    service: &Uuid,
    characteristic: &Uuid,
) -> Option<&'a GattCharacteristic> {
    services
        .iter()
        .find(|s| s.uuid == *service)
        .and_then(|s| s.characteristic(characteristic))
}

/// Stream of characteristic notifications. An `Err` item ends collection.
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>>>;

/// An open GATT connection to one watch.
#[async_trait]
pub trait ConnectedGattClient: Send + Sync {
    /// Discover services and cache them.
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Services from the last discovery.
    fn services(&self) -> Vec<GattService>;

    /// Enable notifications and return them as a stream.
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream>;

    /// Read a characteristic value.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value.
    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: GattWriteType,
    ) -> Result<()>;

    /// Ask the platform for a larger MTU. Returns the MTU granted.
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// Current MTU.
    async fn mtu(&self) -> Result<u16>;
}

/// Opens and closes the physical link for one transport.
#[async_trait]
pub trait GattConnector: Send + Sync {
    /// Open the link.
    async fn connect(
        &self,
    ) -> std::result::Result<Arc<dyn ConnectedGattClient>, ConnectionFailureReason>;

    /// Close the link. Safe to call when not connected.
    async fn disconnect(&self);

    /// Cancelled once the link has closed, for whatever reason.
    fn link_closed(&self) -> CancellationToken;
}
