use std::net::Ipv4Addr;
use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest host name kept from option 12 (one DNS label).
const MAX_HOSTNAME_LENGTH: usize = 63;

/// Largest pool served by one engine (a /16). The lease table holds one
/// slot per offset, allocated up front.
pub const MAX_LEASE_RANGE: u32 = 65_536;

/// Server configuration, fixed for the lifetime of an engine.
///
/// The assignable pool is `pool_start .. pool_start + lease_range`; a lease
/// is identified by its offset into that range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Interface to pin the socket to (`SO_BINDTODEVICE`), e.g. the AP's
    /// virtual interface.
    #[serde(default)]
    pub interface: Option<String>,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub lease_range: u32,
    pub lease_duration_seconds: u32,
    /// Router handed to clients; the server itself when unset.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: Option<String>,
    /// Buffered lease notifications before new ones are dropped.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_notification_capacity() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            server_ip: Ipv4Addr::new(192, 168, 100, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 100, 2),
            lease_range: 253,
            lease_duration_seconds: 5 * 3600,
            gateway: None,
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
            domain_name: None,
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl Config {
    /// Derives mask and pool from the server's address and prefix length.
    ///
    /// The pool covers every host address after `server_ip` up to the last
    /// host before the broadcast address, capped at [`MAX_LEASE_RANGE`]
    /// addresses.
    pub fn for_subnet(server_ip: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 30 {
            return Err(Error::InvalidConfig(format!(
                "prefix /{} leaves no assignable addresses",
                prefix_len
            )));
        }

        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        };
        let server = u32::from(server_ip);
        let network = server & mask;
        let broadcast = network | !mask;

        if server == network || server == broadcast {
            return Err(Error::InvalidConfig(format!(
                "{}/{} is not a host address",
                server_ip, prefix_len
            )));
        }

        let first = server + 1;
        let last = broadcast - 1;
        if first > last {
            return Err(Error::InvalidConfig(format!(
                "no addresses left after {} in /{}",
                server_ip, prefix_len
            )));
        }

        let lease_range = (last - first + 1).min(MAX_LEASE_RANGE);

        Ok(Self {
            server_ip,
            subnet_mask: Ipv4Addr::from(mask),
            pool_start: Ipv4Addr::from(first),
            lease_range,
            ..Self::default()
        })
    }

    /// Parses `a.b.c.d/len` and delegates to [`for_subnet`](Self::for_subnet).
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| Error::InvalidConfig(format!("{} is not in a.b.c.d/len form", cidr)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid address in {}", cidr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid prefix length in {}", cidr)))?;
        Self::for_subnet(addr, prefix)
    }

    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_range == 0 {
            return Err(Error::InvalidConfig(
                "lease_range must be greater than 0".to_string(),
            ));
        }

        if self.lease_range > MAX_LEASE_RANGE {
            return Err(Error::InvalidConfig(format!(
                "lease_range {} exceeds the maximum of {}",
                self.lease_range, MAX_LEASE_RANGE
            )));
        }

        if u32::from(self.pool_start)
            .checked_add(self.lease_range - 1)
            .is_none()
        {
            return Err(Error::InvalidConfig(format!(
                "pool of {} addresses starting at {} runs past 255.255.255.255",
                self.lease_range, self.pool_start
            )));
        }

        if self.ip_in_pool(self.server_ip) {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if let Some(gateway) = self.gateway
            && self.ip_in_pool(gateway)
        {
            return Err(Error::InvalidConfig(
                "gateway must not be within the pool range".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.notification_capacity == 0 {
            return Err(Error::InvalidConfig(
                "notification_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Maps an address to its pool offset, or `None` outside the pool.
    pub fn offset_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let offset = u32::from(ip).checked_sub(u32::from(self.pool_start))?;
        (offset < self.lease_range).then_some(offset as usize)
    }

    /// Address at a pool offset. Callers keep `offset < lease_range`.
    pub fn address_at(&self, offset: usize) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.pool_start).wrapping_add(offset as u32))
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        self.offset_of(ip).is_some()
    }

    pub fn pool_size(&self) -> usize {
        self.lease_range as usize
    }

    pub fn pool_end(&self) -> Ipv4Addr {
        self.address_at(self.pool_size().saturating_sub(1))
    }

    pub fn router(&self) -> Ipv4Addr {
        self.gateway.unwrap_or(self.server_ip)
    }

    pub fn lease_duration(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.lease_duration_seconds))
    }
}

/// Reduces a client-supplied host name to something safe to log and display.
///
/// Keeps ASCII letters, digits, `-`, `.` and `_`, trims separators from
/// both ends and caps the result at 63 bytes.
pub fn sanitize_hostname(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
        .take(MAX_HOSTNAME_LENGTH)
        .collect();
    cleaned.trim_matches(|c| matches!(c, '-' | '.')).to_string()
}
