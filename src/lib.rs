//! # aplease
//!
//! The DHCP server of a software access point: hands addresses from a single
//! pool to clients that join the AP's interface (RFC 2131 server side).
//!
//! ## Features
//!
//! - DISCOVER/OFFER, REQUEST/ACK/NAK, RELEASE and DECLINE
//! - Random-start address search with sticky re-offers for returning clients
//! - In-memory lease table, rebuilt empty on every start
//! - Non-blocking lease notifications
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use aplease::{Config, DhcpServer};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> aplease::Result<()> {
//!     let config = Config::from_cidr("192.168.100.1/24")?;
//!     let (server, _events) = DhcpServer::new(config).await?;
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     server.run(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`LeaseEngine`] - the protocol state machine; one [`Decision`] per message
//! - [`LeaseTable`] - one slot per pool offset
//! - [`DhcpServer`] - UDP port 67 loop around a shared engine
//! - [`DhcpPacket`] / [`DhcpOption`] - wire codec
//! - [`Config`] - pool, lease duration and the options handed to clients
//! - [`Clock`] - time source, swappable for [`ManualClock`] in tests

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{Decision, LeaseEngine, LeaseEvent, NakReason, Silence};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseTable};
pub use options::{DhcpOption, MessageType, OptionSet};
pub use packet::{DhcpPacket, HardwareAddr};
pub use server::DhcpServer;
