//! Datagram telemetry ingest.

use citygate_core::{Envelope, protocol};
use jiff::Timestamp;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::registry::{DeviceRegistry, Telemetry};

/// Largest datagram accepted. Anything longer is truncated by the OS and
/// fails to decode.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Decode one datagram and apply it. Updates for unknown devices are dropped;
/// telemetry never registers a device.
pub async fn handle_datagram(registry: &DeviceRegistry, datagram: &[u8]) {
    let update = match protocol::decode_payload::<Envelope>(datagram) {
        Ok(Envelope::DeviceUpdate(update)) => update,
        Ok(other) => {
            warn!(tag = other.tag(), "ignoring non-telemetry datagram");
            return;
        }
        Err(e) => {
            warn!(error = %e, len = datagram.len(), "malformed datagram");
            return;
        }
    };

    let telemetry = Telemetry::from(&update);
    if registry
        .apply_telemetry(&update.device_id, telemetry, Timestamp::now())
        .await
        .is_ok()
    {
        debug!(device_id = %update.device_id, status = %update.current_status, "telemetry applied");
    }
}

#[instrument(name = "udp_ingest", skip_all, fields(addr = ?socket.local_addr().ok()))]
pub async fn run(socket: UdpSocket, registry: DeviceRegistry, cancel: CancellationToken) {
    info!("udp ingest started");
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("udp ingest shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        debug!(%peer, len = n, "datagram received");
                        handle_datagram(&registry, &buf[..n]).await;
                    }
                    Err(e) => warn!(error = %e, "udp receive failed"),
                }
            }
        }
    }
}
