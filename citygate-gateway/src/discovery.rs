//! Multicast announcement of the gateway's endpoints.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use citygate_core::{DiscoveryAnnouncement, Envelope, protocol};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Announcements never leave the local network segment.
const MULTICAST_TTL: u32 = 1;

/// Address of the interface that routes to the outside world. Falls back to
/// loopback when there is no route.
pub async fn detect_local_ip() -> IpAddr {
    async fn probe() -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        // Connecting a datagram socket sends nothing; it only selects a route.
        socket.connect(("8.8.8.8", 80)).await?;
        Ok(socket.local_addr()?.ip())
    }

    match probe().await {
        Ok(ip) => ip,
        Err(e) => {
            warn!(error = %e, "could not detect local address, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

pub struct DiscoveryBroadcaster {
    socket: UdpSocket,
    group: SocketAddr,
    interval: Duration,
    payload: Vec<u8>,
}

impl DiscoveryBroadcaster {
    pub async fn bind(
        group: SocketAddr,
        interval: Duration,
        announcement: &DiscoveryAnnouncement,
    ) -> color_eyre::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        // Our own announcements are not looped back to local listeners.
        socket.set_multicast_loop_v4(false)?;

        let payload =
            protocol::encode_payload(&Envelope::DiscoveryAnnouncement(announcement.clone()))?;

        Ok(Self {
            socket,
            group,
            interval,
            payload,
        })
    }

    /// Send one announcement per interval until cancelled. A failed send is
    /// logged and retried on the next tick.
    #[instrument(name = "discovery", skip_all, fields(group = %self.group))]
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "discovery broadcaster started");

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("discovery broadcaster shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.socket.send_to(&self.payload, self.group).await {
                        Ok(_) => debug!("discovery announcement sent"),
                        Err(e) => warn!(error = %e, "failed to send discovery announcement"),
                    }
                }
            }
        }
    }
}
