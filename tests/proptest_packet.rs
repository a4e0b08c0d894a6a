use proptest::prelude::*;

use aplease::{DhcpPacket, OptionSet};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_FIXED_HEADER_SIZE: usize = 240;

fn valid_header() -> Vec<u8> {
    let mut packet = vec![0u8; DHCP_FIXED_HEADER_SIZE];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    packet
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = valid_header();
        packet.extend_from_slice(&options_data);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_random_option_lengths(
        option_code in 1u8..254,
        option_length in any::<u8>(),
        option_data in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut packet = valid_header();
        packet.push(option_code);
        packet.push(option_length);
        let actual_len = (option_length as usize).min(option_data.len());
        packet.extend_from_slice(&option_data[..actual_len]);
        packet.push(255);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_overloaded_areas(
        overload_flag in 1u8..=3,
        sname_data in prop::collection::vec(any::<u8>(), 64..=64),
        file_data in prop::collection::vec(any::<u8>(), 128..=128)
    ) {
        let mut packet = valid_header();
        packet[44..108].copy_from_slice(&sname_data);
        packet[108..236].copy_from_slice(&file_data);
        packet.push(52);
        packet.push(1);
        packet.push(overload_flag);
        packet.push(255);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn hardware_addr_never_exceeds_chaddr(
        htype in 2u8..=255,
        hlen in any::<u8>(),
        chaddr in any::<[u8; 16]>(),
    ) {
        let mut packet = valid_header();
        packet[1] = htype;
        packet[2] = hlen;
        packet[28..44].copy_from_slice(&chaddr);
        packet.push(255);

        let parsed = DhcpPacket::parse(&packet).unwrap();
        let hardware = parsed.hardware_addr();
        let expected = (hlen as usize).min(16);
        prop_assert_eq!(hardware.as_bytes(), &chaddr[..expected]);
    }

    #[test]
    fn header_fields_survive_reencoding(
        xid in any::<u32>(),
        flags in any::<u16>(),
        ciaddr in any::<[u8; 4]>(),
        giaddr in any::<[u8; 4]>(),
        chaddr in any::<[u8; 16]>(),
    ) {
        let mut packet = valid_header();
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet[10..12].copy_from_slice(&flags.to_be_bytes());
        packet[12..16].copy_from_slice(&ciaddr);
        packet[24..28].copy_from_slice(&giaddr);
        packet[28..44].copy_from_slice(&chaddr);
        packet.push(255);

        let parsed = DhcpPacket::parse(&packet).unwrap();
        let encoded = parsed.encode();
        prop_assert!(encoded.len() >= 300);

        let reparsed = DhcpPacket::parse(&encoded).unwrap();
        prop_assert_eq!(parsed.xid, reparsed.xid);
        prop_assert_eq!(parsed.flags, reparsed.flags);
        prop_assert_eq!(parsed.ciaddr, reparsed.ciaddr);
        prop_assert_eq!(parsed.giaddr, reparsed.giaddr);
        prop_assert_eq!(parsed.chaddr, reparsed.chaddr);
    }

    #[test]
    fn short_packets_always_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        let result = DhcpPacket::parse(&data);
        prop_assert!(result.is_err());
    }

    #[test]
    fn bad_magic_cookie_always_rejected(
        cookie in any::<[u8; 4]>()
    ) {
        prop_assume!(cookie != DHCP_MAGIC_COOKIE);

        let mut packet = valid_header();
        packet[236..240].copy_from_slice(&cookie);
        packet.push(255);

        let result = DhcpPacket::parse(&packet);
        prop_assert!(result.is_err());
    }

    #[test]
    fn excessive_hops_always_rejected(
        hops in 17u8..=255
    ) {
        let mut packet = valid_header();
        packet[3] = hops;
        packet.push(255);

        let result = DhcpPacket::parse(&packet);
        prop_assert!(result.is_err());
    }

    #[test]
    fn selected_options_follow_request_order(
        requested in prop::collection::vec(any::<u8>(), 0..32)
    ) {
        let options = OptionSet::from_config(&aplease::Config {
            domain_name: Some("ap.lan".to_string()),
            ..Default::default()
        });

        let codes: Vec<u8> = options
            .select(Some(&requested))
            .iter()
            .map(|option| option.option_code())
            .collect();

        let mut expected: Vec<u8> = Vec::new();
        for code in &requested {
            if [1, 3, 6, 15].contains(code) && !expected.contains(code) {
                expected.push(*code);
            }
        }
        prop_assert_eq!(codes, expected);
    }
}
