use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{Decision, LeaseEngine, LeaseEvent};
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::packet::{BOOTREQUEST, DhcpPacket};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Serves one address pool on one interface.
pub struct DhcpServer {
    engine: Arc<Mutex<LeaseEngine>>,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    /// Binds `0.0.0.0:67` (pinned to `config.interface` when set) and builds
    /// an engine for the pool.
    ///
    /// The returned receiver yields a [`LeaseEvent`] per committed lease; it
    /// may be dropped if nobody is interested.
    pub async fn new(config: Config) -> Result<(Self, mpsc::Receiver<LeaseEvent>)> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = Self::create_socket(&config)?;

        info!(
            "DHCP server starting on {}:{}{}",
            config.server_ip,
            DHCP_SERVER_PORT,
            config
                .interface
                .as_deref()
                .map(|name| format!(" ({})", name))
                .unwrap_or_default()
        );
        info!(
            "IP pool: {} - {} ({} addresses)",
            config.pool_start,
            config.pool_end(),
            config.pool_size()
        );

        let (tx, rx) = mpsc::channel(config.notification_capacity);
        let engine = LeaseEngine::new(config).with_notifier(tx);

        Ok((Self::from_parts(engine, socket), rx))
    }

    /// Serves `engine` on an already bound socket.
    pub fn from_parts(engine: LeaseEngine, socket: UdpSocket) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            socket: Arc::new(socket),
        }
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if let Some(interface) = &config.interface {
            #[cfg(target_os = "linux")]
            socket.bind_device(Some(interface.as_bytes())).map_err(|error| {
                Error::Socket(format!("Failed to bind to device {}: {}", interface, error))
            })?;

            #[cfg(not(target_os = "linux"))]
            warn!(
                "interface ({}) is only supported on Linux and will be ignored",
                interface
            );
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    /// Receives and answers datagrams until `shutdown` turns true or its
    /// sender is dropped. Expired leases are purged every minute.
    ///
    /// Each datagram is handled on its own task; replies already in flight
    /// may still be sent after this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let mut purge = tokio::time::interval(PURGE_INTERVAL);

        info!("DHCP server ready and listening");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = purge.tick() => {
                    let purged = self.engine.lock().await.purge_expired();
                    if purged > 0 {
                        debug!("Purged {} expired lease(s)", purged);
                    }
                }
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((size, source)) => {
                        let data = buffer[..size].to_vec();
                        let handler = PacketHandler {
                            engine: Arc::clone(&self.engine),
                            socket: Arc::clone(&self.socket),
                        };

                        tokio::spawn(async move {
                            if let Err(error) = handler.handle_packet(&data, source).await {
                                warn!("Error handling packet from {}: {}", source, error);
                            }
                        });
                    }
                    Err(error) => {
                        error!("Error receiving packet: {}", error);
                    }
                },
            }
        }

        info!("DHCP server stopped");
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Snapshot of the unexpired leases.
    pub async fn leases(&self) -> Vec<Lease> {
        self.engine.lock().await.live_leases()
    }
}

struct PacketHandler {
    engine: Arc<Mutex<LeaseEngine>>,
    socket: Arc<UdpSocket>,
}

impl PacketHandler {
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let Some((reply, destination)) = self.process(data, source).await? else {
            return Ok(());
        };

        self.socket.send_to(&reply.encode(), destination).await?;
        Ok(())
    }

    /// Decodes a datagram and runs it through the engine. Returns the reply
    /// and where to send it.
    async fn process(
        &self,
        data: &[u8],
        source: SocketAddr,
    ) -> Result<Option<(DhcpPacket, SocketAddr)>> {
        let request = DhcpPacket::parse(data)?;

        if request.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        debug!(
            "{} from {} ({})",
            request
                .message_type()
                .map(|message_type| message_type.to_string())
                .unwrap_or_else(|| "BOOTP".to_string()),
            request.hardware_addr(),
            source
        );

        let decision = self.engine.lock().await.handle(&request);
        let destination = reply_destination(&request, &decision);

        Ok(decision.into_reply().map(|reply| (reply, destination)))
    }
}

/// NAKs, broadcast-flagged requests and clients without an address are
/// answered by broadcast; everyone else by unicast to `ciaddr`.
fn reply_destination(request: &DhcpPacket, decision: &Decision) -> SocketAddr {
    let target = if decision.is_nak()
        || request.is_broadcast()
        || request.ciaddr == Ipv4Addr::UNSPECIFIED
    {
        Ipv4Addr::BROADCAST
    } else {
        request.ciaddr
    };
    SocketAddr::new(IpAddr::V4(target), DHCP_CLIENT_PORT)
}
