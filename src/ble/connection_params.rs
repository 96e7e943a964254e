//! Connection parameter negotiation.
//!
//! Writing `[0, 1]` to the connection parameters characteristic asks the
//! watch to switch to its fast connection interval. Older firmware does not
//! expose the characteristic, so failures are reported but not fatal.

use futures::stream::StreamExt;
use std::sync::Arc;
use tracing::debug;

use crate::ble::gatt::{ConnectedGattClient, GattWriteType};
use crate::ble::uuids::{CONNECTION_PARAMETERS_CHARACTERISTIC_UUID, PAIRING_SERVICE_UUID};
use crate::connection::scope::ConnectionScope;
use crate::error::Result;

/// Value requesting the fast connection interval.
pub const FAST_CONNECTION_PARAMS: [u8; 2] = [0, 1];

/// Subscribe to parameter changes and request fast parameters.
pub async fn subscribe_and_configure(
    client: &Arc<dyn ConnectedGattClient>,
    scope: &ConnectionScope,
) -> Result<()> {
    let mut changes = client
        .subscribe(PAIRING_SERVICE_UUID, CONNECTION_PARAMETERS_CHARACTERISTIC_UUID)
        .await?;

    scope.spawn("connection-params", async move {
        while let Some(Ok(value)) = changes.next().await {
            debug!("Connection params changed: {:02X?}", value);
        }
    });

    client
        .write(
            PAIRING_SERVICE_UUID,
            CONNECTION_PARAMETERS_CHARACTERISTIC_UUID,
            &FAST_CONNECTION_PARAMS,
            GattWriteType::WithResponse,
        )
        .await
}
