//! The lease state machine.
//!
//! [`LeaseEngine::handle`] takes one decoded client message and returns a
//! [`Decision`]: the reply to send (OFFER, ACK or NAK) or the reason no
//! reply is sent. It never performs I/O and never suspends, so callers that
//! share an engine between tasks only need to hold a lock around `handle`.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, sanitize_hostname};
use crate::lease::{Lease, LeaseTable};
use crate::options::{MessageType, OptionSet};
use crate::packet::{DhcpPacket, HardwareAddr};

/// Emitted after every committed lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEvent {
    pub host_name: Option<String>,
    pub address: Ipv4Addr,
    pub client_id: HardwareAddr,
}

/// Why a REQUEST was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    /// Neither option 50 nor `ciaddr` named an address.
    NoAddress,
    OutsidePool,
    /// A live lease of another client holds the address.
    LeasedToOther,
}

impl fmt::Display for NakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoAddress => "no address requested",
            Self::OutsidePool => "address outside pool",
            Self::LeasedToOther => "address leased to another client",
        };
        f.write_str(reason)
    }
}

/// Why no reply is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Silence {
    /// DISCOVER found no free offset.
    PoolExhausted,
    /// The REQUEST accepts another server's offer.
    ServerMismatch,
    /// RELEASE or DECLINE; `freed` counts the removed leases.
    Released {
        message_type: MessageType,
        freed: usize,
    },
    /// A message type this server does not answer, or no option 53 at all.
    NotServed(Option<MessageType>),
}

/// Outcome of handling one client message.
#[derive(Debug, Clone)]
pub enum Decision {
    Offer(DhcpPacket),
    Ack(DhcpPacket),
    Nak { reply: DhcpPacket, reason: NakReason },
    Silent(Silence),
}

impl Decision {
    pub fn into_reply(self) -> Option<DhcpPacket> {
        match self {
            Self::Offer(reply) | Self::Ack(reply) | Self::Nak { reply, .. } => Some(reply),
            Self::Silent(_) => None,
        }
    }

    pub fn is_nak(&self) -> bool {
        matches!(self, Self::Nak { .. })
    }
}

/// Server side of the DISCOVER/REQUEST/RELEASE/DECLINE exchange for one pool.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use aplease::{Config, Decision, DhcpPacket, HardwareAddr, LeaseEngine, MessageType};
///
/// let mut engine = LeaseEngine::new(Arc::new(Config::default()));
/// let client = HardwareAddr::from([0x02, 0, 0, 0, 0, 1]);
/// let discover = DhcpPacket::new_request(MessageType::Discover, client, 1, vec![]);
///
/// assert!(matches!(engine.handle(&discover), Decision::Offer(_)));
/// ```
#[derive(Debug)]
pub struct LeaseEngine {
    config: Arc<Config>,
    options: OptionSet,
    table: LeaseTable,
    clock: Box<dyn Clock>,
    rng: StdRng,
    notifier: Option<mpsc::Sender<LeaseEvent>>,
}

impl LeaseEngine {
    /// Creates an engine with an empty table, wall-clock time and an
    /// entropy-seeded random source.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            options: OptionSet::from_config(&config),
            table: LeaseTable::new(config.pool_size()),
            config,
            clock: Box::new(SystemClock),
            rng: StdRng::from_entropy(),
            notifier: None,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Sends a [`LeaseEvent`] for every committed lease. Events are dropped
    /// when the channel is full or closed.
    pub fn with_notifier(mut self, notifier: mpsc::Sender<LeaseEvent>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &LeaseTable {
        &self.table
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Unexpired leases, in pool order.
    pub fn live_leases(&self) -> Vec<Lease> {
        let now = self.clock.now();
        self.table
            .iter()
            .filter(|(_, lease)| !lease.is_expired(now))
            .map(|(_, lease)| lease.clone())
            .collect()
    }

    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        self.table.purge_expired(now)
    }

    pub fn handle(&mut self, request: &DhcpPacket) -> Decision {
        let client = request.hardware_addr();
        let now = self.clock.now();

        match request.message_type() {
            Some(MessageType::Discover) => self.handle_discover(request, client, now),
            Some(MessageType::Request) => self.handle_request(request, client, now),
            Some(message_type @ (MessageType::Release | MessageType::Decline)) => {
                let freed = self.table.release(&client);
                info!("{} from {}: freed {} lease(s)", message_type, client, freed);
                Decision::Silent(Silence::Released {
                    message_type,
                    freed,
                })
            }
            other => {
                debug!("Ignoring {:?} from {}", other, client);
                Decision::Silent(Silence::NotServed(other))
            }
        }
    }

    fn handle_discover(
        &mut self,
        request: &DhcpPacket,
        client: HardwareAddr,
        now: DateTime<Utc>,
    ) -> Decision {
        let offset = match self.table.live_offset_of(&client, now) {
            Some(offset) => Some(offset),
            None => self.table.free_offset(&mut self.rng, now),
        };

        let Some(offset) = offset else {
            debug!("Pool exhausted, cannot offer an address to {}", client);
            return Decision::Silent(Silence::PoolExhausted);
        };

        let offered_ip = self.config.address_at(offset);
        info!("OFFER {} to {}", offered_ip, client);
        Decision::Offer(self.build_reply(request, MessageType::Offer, offered_ip))
    }

    fn handle_request(
        &mut self,
        request: &DhcpPacket,
        client: HardwareAddr,
        now: DateTime<Utc>,
    ) -> Decision {
        if let Some(server_id) = request.server_identifier()
            && server_id != self.config.server_ip
        {
            debug!("REQUEST from {} is for different server {}", client, server_id);
            return Decision::Silent(Silence::ServerMismatch);
        }

        let requested_ip = request.requested_ip().unwrap_or(request.ciaddr);
        if requested_ip.is_unspecified() {
            return self.nak(request, client, NakReason::NoAddress);
        }

        let Some(offset) = self.config.offset_of(requested_ip) else {
            return self.nak(request, client, NakReason::OutsidePool);
        };

        if let Some(held) = self.table.get(offset)
            && held.client_id != client
            && !held.is_expired(now)
        {
            return self.nak(request, client, NakReason::LeasedToOther);
        }

        let host_name = request
            .hostname()
            .map(sanitize_hostname)
            .filter(|name| !name.is_empty());
        let lease = Lease::new(client, requested_ip, now, self.config.lease_duration())
            .with_host_name(host_name.clone());
        self.table.commit(offset, lease);

        info!(
            "ACK {} to {} ({})",
            requested_ip,
            client,
            host_name.as_deref().unwrap_or("unknown")
        );
        self.notify(LeaseEvent {
            host_name,
            address: requested_ip,
            client_id: client,
        });

        Decision::Ack(self.build_reply(request, MessageType::Ack, requested_ip))
    }

    fn build_reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
    ) -> DhcpPacket {
        DhcpPacket::reply(
            request,
            message_type,
            your_ip,
            self.config.server_ip,
            Some(self.config.lease_duration_seconds),
            self.options.select(request.parameter_request_list()),
        )
    }

    fn nak(&self, request: &DhcpPacket, client: HardwareAddr, reason: NakReason) -> Decision {
        warn!("NAK to {}: {}", client, reason);
        let reply = DhcpPacket::reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_ip,
            None,
            Vec::new(),
        );
        Decision::Nak { reply, reason }
    }

    fn notify(&self, event: LeaseEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        match notifier.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Notification channel full, dropping event for {}", event.address);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Notification receiver gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::options::{DhcpOption, OptionCode};
    use chrono::TimeDelta;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            server_ip: Ipv4Addr::new(192, 0, 2, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 0, 2, 10),
            lease_range: 4,
            lease_duration_seconds: 3600,
            ..Default::default()
        })
    }

    fn test_engine() -> (LeaseEngine, ManualClock) {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let engine = LeaseEngine::new(test_config())
            .with_clock(clock.clone())
            .with_rng(StdRng::seed_from_u64(3));
        (engine, clock)
    }

    fn client(last: u8) -> HardwareAddr {
        HardwareAddr::from([0xaa, 0xaa, 0, 0, 0, last])
    }

    fn discover(client: HardwareAddr) -> DhcpPacket {
        DhcpPacket::new_request(MessageType::Discover, client, 0x1000, vec![])
    }

    fn request(client: HardwareAddr, ip: Ipv4Addr) -> DhcpPacket {
        DhcpPacket::new_request(
            MessageType::Request,
            client,
            0x2000,
            vec![DhcpOption::RequestedIpAddress(ip)],
        )
    }

    fn offered(decision: &Decision) -> Ipv4Addr {
        match decision {
            Decision::Offer(reply) => reply.yiaddr,
            other => panic!("expected OFFER, got {:?}", other),
        }
    }

    #[test]
    fn test_discover_offers_pool_address_without_committing() {
        let (mut engine, _) = test_engine();
        let decision = engine.handle(&discover(client(1)));

        let ip = offered(&decision);
        assert!(engine.config().ip_in_pool(ip));
        assert_eq!(engine.table().iter().count(), 0);

        let reply = decision.into_reply().unwrap();
        assert_eq!(reply.xid, 0x1000);
        assert_eq!(reply.server_identifier(), Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(reply.lease_time(), Some(3600));
    }

    #[test]
    fn test_request_commits_and_acks() {
        let (mut engine, _) = test_engine();
        let ip = Ipv4Addr::new(192, 0, 2, 12);

        let decision = engine.handle(&request(client(1), ip));
        let Decision::Ack(reply) = decision else {
            panic!("expected ACK");
        };
        assert_eq!(reply.yiaddr, ip);
        assert_eq!(reply.message_type(), Some(MessageType::Ack));
        assert_eq!(engine.table().live_offset_of(&client(1), engine.now()), Some(2));
    }

    #[test]
    fn test_sticky_discover() {
        let (mut engine, _) = test_engine();
        let ip = Ipv4Addr::new(192, 0, 2, 13);
        engine.handle(&request(client(1), ip));

        for _ in 0..10 {
            assert_eq!(offered(&engine.handle(&discover(client(1)))), ip);
        }
    }

    #[test]
    fn test_request_falls_back_to_ciaddr() {
        let (mut engine, _) = test_engine();
        let mut renew = DhcpPacket::new_request(MessageType::Request, client(1), 9, vec![]);
        renew.ciaddr = Ipv4Addr::new(192, 0, 2, 11);

        assert!(matches!(engine.handle(&renew), Decision::Ack(_)));

        renew.ciaddr = Ipv4Addr::UNSPECIFIED;
        match engine.handle(&renew) {
            Decision::Nak { reply, reason } => {
                assert_eq!(reason, NakReason::NoAddress);
                assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
                assert_eq!(reply.options.len(), 2);
            }
            other => panic!("expected NAK, got {:?}", other),
        }
    }

    #[test]
    fn test_request_naks() {
        let (mut engine, _) = test_engine();

        let outside = engine.handle(&request(client(1), Ipv4Addr::new(192, 0, 2, 14)));
        assert!(matches!(
            outside,
            Decision::Nak {
                reason: NakReason::OutsidePool,
                ..
            }
        ));

        engine.handle(&request(client(1), Ipv4Addr::new(192, 0, 2, 10)));
        let taken = engine.handle(&request(client(2), Ipv4Addr::new(192, 0, 2, 10)));
        assert!(matches!(
            taken,
            Decision::Nak {
                reason: NakReason::LeasedToOther,
                ..
            }
        ));
    }

    #[test]
    fn test_request_for_other_server_is_silent() {
        let (mut engine, _) = test_engine();
        let packet = DhcpPacket::new_request(
            MessageType::Request,
            client(1),
            1,
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 0, 2, 10)),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 0, 2, 254)),
            ],
        );

        assert!(matches!(
            engine.handle(&packet),
            Decision::Silent(Silence::ServerMismatch)
        ));
        assert_eq!(engine.table().iter().count(), 0);
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let (mut engine, clock) = test_engine();
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        engine.handle(&request(client(1), ip));

        clock.advance(TimeDelta::seconds(3601));
        assert!(matches!(engine.handle(&request(client(2), ip)), Decision::Ack(_)));
        assert_eq!(engine.live_leases()[0].client_id, client(2));
    }

    #[test]
    fn test_release_and_decline_free_the_slot() {
        let (mut engine, _) = test_engine();
        engine.handle(&request(client(1), Ipv4Addr::new(192, 0, 2, 10)));

        let release = DhcpPacket::new_request(MessageType::Decline, client(1), 5, vec![]);
        match engine.handle(&release) {
            Decision::Silent(Silence::Released {
                message_type,
                freed,
            }) => {
                assert_eq!(message_type, MessageType::Decline);
                assert_eq!(freed, 1);
            }
            other => panic!("expected silence, got {:?}", other),
        }
        assert!(engine.live_leases().is_empty());
    }

    #[test]
    fn test_unserved_messages() {
        let (mut engine, _) = test_engine();
        let inform = DhcpPacket::new_request(MessageType::Inform, client(1), 5, vec![]);
        assert!(matches!(
            engine.handle(&inform),
            Decision::Silent(Silence::NotServed(Some(MessageType::Inform)))
        ));

        let mut bootp = inform.clone();
        bootp.options.clear();
        assert!(matches!(
            engine.handle(&bootp),
            Decision::Silent(Silence::NotServed(None))
        ));
    }

    #[test]
    fn test_offer_options_follow_parameter_request_list() {
        let (mut engine, _) = test_engine();
        let packet = DhcpPacket::new_request(
            MessageType::Discover,
            client(1),
            1,
            vec![DhcpOption::ParameterRequestList(vec![
                OptionCode::DnsServer as u8,
                OptionCode::SubnetMask as u8,
            ])],
        );

        let reply = engine.handle(&packet).into_reply().unwrap();
        let codes: Vec<u8> = reply.options.iter().map(DhcpOption::option_code).collect();
        assert_eq!(codes, vec![53, 54, 51, 6, 1]);
    }

    #[test]
    fn test_notification_carries_sanitized_host_name() {
        let (tx, mut rx) = mpsc::channel(4);
        let (engine, _) = test_engine();
        let mut engine = engine.with_notifier(tx);

        let packet = DhcpPacket::new_request(
            MessageType::Request,
            client(1),
            1,
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 0, 2, 11)),
                DhcpOption::Hostname("my phone!".to_string()),
            ],
        );
        engine.handle(&packet);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.host_name.as_deref(), Some("myphone"));
        assert_eq!(event.address, Ipv4Addr::new(192, 0, 2, 11));
        assert_eq!(event.client_id, client(1));
    }

    #[test]
    fn test_full_or_closed_notifier_does_not_block() {
        let (tx, rx) = mpsc::channel(1);
        let (engine, _) = test_engine();
        let mut engine = engine.with_notifier(tx);

        for last in 0..3u8 {
            let ip = Ipv4Addr::new(192, 0, 2, 10 + last);
            assert!(matches!(engine.handle(&request(client(last), ip)), Decision::Ack(_)));
        }

        drop(rx);
        let ip = Ipv4Addr::new(192, 0, 2, 13);
        assert!(matches!(engine.handle(&request(client(9), ip)), Decision::Ack(_)));
    }
}
