//! DHCP options (RFC 2132) understood by the lease server.
//!
//! Each option on the wire is a code byte, a length byte and `length` bytes
//! of data. Codes the server has no use for are kept as
//! [`DhcpOption::Unknown`] so a packet still round-trips.
//!
//! [`OptionSet`] holds the network parameters handed to every client and
//! picks the ones a client asked for.

use std::net::Ipv4Addr;

use crate::config::Config;
use crate::error::{Error, Result};

/// Router (3) and DNS (6) carry at most 255 / 4 addresses.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Option codes handled explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    ClientIdentifier = 61,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::Hostname),
            15 => Ok(Self::DomainName),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            61 => Ok(Self::ClientIdentifier),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// Option overload flags (option 52): which header fields carry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl OverloadFlag {
    pub fn covers_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    pub fn covers_sname(self) -> bool {
        matches!(self, Self::Sname | Self::Both)
    }
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A decoded DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn invalid(what: &str, data: &[u8]) -> Error {
    Error::InvalidPacket(format!("Invalid {} length: {}", what, data.len()))
}

fn parse_addr(what: &str, data: &[u8]) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data.try_into().map_err(|_| invalid(what, data))?;
    Ok(Ipv4Addr::from(octets))
}

fn parse_addr_list(what: &str, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(invalid(what, data));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_u32(what: &str, data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| invalid(what, data))?;
    Ok(u32::from_be_bytes(bytes))
}

fn parse_byte(what: &str, data: &[u8]) -> Result<u8> {
    match data {
        [byte] => Ok(*byte),
        _ => Err(invalid(what, data)),
    }
}

/// Writes one TLV, truncating data to the 255-byte length limit.
fn tlv(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(u8::MAX as usize);
    let mut result = Vec::with_capacity(len + 2);
    result.push(code);
    result.push(len as u8);
    result.extend_from_slice(&data[..len]);
    result
}

fn addr_list_bytes(addrs: &[Ipv4Addr]) -> Vec<u8> {
    addrs
        .iter()
        .take(MAX_ADDRESSES_PER_OPTION)
        .flat_map(|addr| addr.octets())
        .collect()
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Decodes the data part of one option.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the data length does not fit the
    /// option, or for Pad/End which carry no data.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let option = match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Self::SubnetMask(parse_addr("subnet mask", data)?),
            Ok(OptionCode::Router) => Self::Router(parse_addr_list("router", data)?),
            Ok(OptionCode::DnsServer) => Self::DnsServer(parse_addr_list("DNS server", data)?),
            Ok(OptionCode::Hostname) => Self::Hostname(String::from_utf8_lossy(data).into_owned()),
            Ok(OptionCode::DomainName) => {
                Self::DomainName(String::from_utf8_lossy(data).into_owned())
            }
            Ok(OptionCode::RequestedIpAddress) => {
                Self::RequestedIpAddress(parse_addr("requested IP address", data)?)
            }
            Ok(OptionCode::LeaseTime) => Self::LeaseTime(parse_u32("lease time", data)?),
            Ok(OptionCode::OptionOverload) => {
                let value = parse_byte("option overload", data)?;
                let flag = OverloadFlag::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Invalid option overload value: {}", value))
                })?;
                Self::OptionOverload(flag)
            }
            Ok(OptionCode::MessageType) => {
                let value = parse_byte("message type", data)?;
                let message_type = MessageType::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(message_type)
            }
            Ok(OptionCode::ServerIdentifier) => {
                Self::ServerIdentifier(parse_addr("server identifier", data)?)
            }
            Ok(OptionCode::ParameterRequestList) => Self::ParameterRequestList(data.to_vec()),
            Ok(OptionCode::ClientIdentifier) => Self::ClientIdentifier(data.to_vec()),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => {
                return Err(Error::InvalidPacket(
                    "Pad/End should not be parsed as options".to_string(),
                ));
            }
            Err(unknown_code) => Self::Unknown(unknown_code, data.to_vec()),
        };
        Ok(option)
    }

    /// Encodes code, length and data.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => tlv(code, &addr.octets()),
            Self::Router(addrs) | Self::DnsServer(addrs) => tlv(code, &addr_list_bytes(addrs)),
            Self::Hostname(name) | Self::DomainName(name) => tlv(code, name.as_bytes()),
            Self::LeaseTime(seconds) => tlv(code, &seconds.to_be_bytes()),
            Self::OptionOverload(flag) => tlv(code, &[*flag as u8]),
            Self::MessageType(message_type) => tlv(code, &[*message_type as u8]),
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unknown(_, data) => tlv(code, data),
        }
    }
}

/// The network parameters every client receives.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    options: Vec<DhcpOption>,
}

impl OptionSet {
    pub fn new(options: Vec<DhcpOption>) -> Self {
        Self { options }
    }

    /// Subnet mask, router, DNS servers and, when configured, domain name.
    pub fn from_config(config: &Config) -> Self {
        let mut options = vec![
            DhcpOption::SubnetMask(config.subnet_mask),
            DhcpOption::Router(vec![config.router()]),
        ];
        if !config.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(config.dns_servers.clone()));
        }
        if let Some(domain) = &config.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }
        Self { options }
    }

    /// Options in the order of the client's parameter request list, or all
    /// of them when the client sent no list.
    ///
    /// Requested codes the set does not hold are skipped; duplicates in the
    /// list are answered once.
    pub fn select(&self, parameter_request_list: Option<&[u8]>) -> Vec<DhcpOption> {
        let Some(requested) = parameter_request_list else {
            return self.options.clone();
        };

        let mut selected: Vec<DhcpOption> = Vec::new();
        for code in requested {
            if selected.iter().any(|opt| opt.option_code() == *code) {
                continue;
            }
            if let Some(option) = self.options.iter().find(|opt| opt.option_code() == *code) {
                selected.push(option.clone());
            }
        }
        selected
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversions() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_option_encode_decode_roundtrip() {
        let options: Vec<DhcpOption> = vec![
            DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
            DhcpOption::Router(vec![Ipv4Addr::new(192, 168, 1, 1)]),
            DhcpOption::DnsServer(vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]),
            DhcpOption::Hostname("phone".to_string()),
            DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 100)),
            DhcpOption::LeaseTime(18000),
            DhcpOption::MessageType(MessageType::Request),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 1)),
            DhcpOption::ParameterRequestList(vec![1, 3, 6, 15]),
        ];

        for original in options {
            let encoded = original.encode();
            assert_eq!(encoded[1] as usize, encoded.len() - 2);
            let decoded = DhcpOption::parse(encoded[0], &encoded[2..]).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_option_invalid_lengths() {
        assert!(DhcpOption::parse(1, &[255, 255, 255]).is_err());
        assert!(DhcpOption::parse(3, &[]).is_err());
        assert!(DhcpOption::parse(6, &[1, 1, 1, 1, 8]).is_err());
        assert!(DhcpOption::parse(51, &[0, 0, 0]).is_err());
        assert!(DhcpOption::parse(53, &[1, 2]).is_err());
        assert!(DhcpOption::parse(53, &[42]).is_err());
        assert!(DhcpOption::parse(52, &[7]).is_err());
        assert!(DhcpOption::parse(0, &[]).is_err());
    }

    #[test]
    fn test_unknown_option() {
        let decoded = DhcpOption::parse(100, &[1, 2, 3, 4]).unwrap();
        assert_eq!(decoded, DhcpOption::Unknown(100, vec![1, 2, 3, 4]));
        assert_eq!(decoded.encode(), vec![100, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_long_values_are_truncated() {
        let encoded = DhcpOption::Hostname("a".repeat(300)).encode();
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded.len(), 257);

        let many = vec![Ipv4Addr::new(10, 0, 0, 1); 100];
        let encoded = DhcpOption::DnsServer(many).encode();
        assert_eq!(encoded[1] as usize, MAX_ADDRESSES_PER_OPTION * 4);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::Discover.to_string(), "DISCOVER");
        assert_eq!(MessageType::Nak.to_string(), "NAK");
        assert_eq!(MessageType::Release.to_string(), "RELEASE");
    }

    #[test]
    fn test_option_set_from_config() {
        let config = Config {
            domain_name: Some("ap.lan".to_string()),
            ..Default::default()
        };
        let set = OptionSet::from_config(&config);
        let all = set.select(None);

        assert_eq!(all.len(), 4);
        assert_eq!(all[0], DhcpOption::SubnetMask(config.subnet_mask));
        assert_eq!(all[1], DhcpOption::Router(vec![config.server_ip]));
        assert_eq!(all[2], DhcpOption::DnsServer(vec![Ipv4Addr::new(1, 1, 1, 1)]));
        assert_eq!(all[3], DhcpOption::DomainName("ap.lan".to_string()));
    }

    #[test]
    fn test_option_set_without_dns() {
        let config = Config {
            dns_servers: vec![],
            ..Default::default()
        };
        let set = OptionSet::from_config(&config);
        assert_eq!(set.len(), 2);
        assert!(set.select(Some(&[6])).is_empty());
    }

    #[test]
    fn test_select_follows_request_order() {
        let set = OptionSet::from_config(&Config::default());

        let codes: Vec<u8> = set
            .select(Some(&[6, 1, 42, 3, 6]))
            .iter()
            .map(DhcpOption::option_code)
            .collect();
        assert_eq!(codes, vec![6, 1, 3]);

        assert!(set.select(Some(&[])).is_empty());
        assert_eq!(set.select(None).len(), set.len());
    }
}
