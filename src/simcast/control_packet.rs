//! Wire format of the control plane: discovery pings, discovery acks (with piggybacked gossip
//!  about other members) and departure notices.
//!
//! ```ascii
//!  0: magic (u64 LE, 0x72F967C8345A065B)
//!  8: command code (u32 LE)
//! 12: gossip entries (acks only), 22 bytes each:
//!       0: low 64 bits of the (IPv4-mapped) IPv6 address (u64 LE)
//!       8: high 64 bits of the address (u64 LE)
//!      16: milliseconds since the sender last heard from this member (u32 LE, saturated)
//!      20: port (u16 LE)
//! ```
//!
//! Anything that does not start with the magic number is user data and has no header at all.

use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::safe_converter::{SafeCast, SaturatingCast};

pub const CONTROL_PACKET_MAGIC: u64 = 0x72F9_67C8_345A_065B;
pub const CONTROL_HEADER_LEN: usize = size_of::<u64>() + size_of::<u32>();
pub const GOSSIP_ENTRY_LEN: usize = 2*size_of::<u64>() + size_of::<u32>() + size_of::<u16>();

/// upper bound for the number of members reported in a single discovery ack
pub const MAX_GOSSIP_ENTRIES_PER_ACK: usize = 10;

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ControlCommand {
    DiscoveryPing = 1,
    DiscoveryAck = 2,
    DepartureNotice = 3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlPacketError {
    /// too short or wrong magic: the packet is opaque user data
    NotAControlPacket,
    /// correct magic, but a command code we do not understand
    UnknownCommand(u32),
}
impl Display for ControlPacketError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPacketError::NotAControlPacket => write!(f, "not a control packet"),
            ControlPacketError::UnknownCommand(code) => write!(f, "unknown control command {}", code),
        }
    }
}
impl std::error::Error for ControlPacketError {}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DecodedControlPacket {
    pub command: ControlCommand,
    /// members reported by the sender, with the last-heard timestamp reconstructed on the
    ///  receiver's clock
    pub gossip: Vec<(SocketAddr, u64)>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct GossipEntry {
    endpoint: SocketAddr,
    elapsed_millis: u32,
}
impl GossipEntry {
    fn ser(&self, buf: &mut BytesMut) {
        let bits = match self.endpoint.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().to_bits(),
            IpAddr::V6(ip) => ip.to_bits(),
        };
        buf.put_u64_le(bits as u64);
        buf.put_u64_le((bits >> 64) as u64);
        buf.put_u32_le(self.elapsed_millis);
        buf.put_u16_le(self.endpoint.port());
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<GossipEntry> {
        if buf.remaining() < GOSSIP_ENTRY_LEN {
            bail!("truncated gossip entry: {} bytes remaining", buf.remaining());
        }

        let low = buf.get_u64_le() as u128;
        let high = buf.get_u64_le() as u128;
        let elapsed_millis = buf.get_u32_le();
        let port = buf.get_u16_le();

        let ip = Ipv6Addr::from_bits((high << 64) | low);
        let ip = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip),
        };
        if ip.is_unspecified() || port == 0 {
            bail!("gossip entry with invalid endpoint {}:{}", ip, port);
        }

        Ok(GossipEntry {
            endpoint: SocketAddr::new(ip, port),
            elapsed_millis,
        })
    }
}

/// Serializes a control packet for `destination`. Gossip is attached to discovery acks only,
///  and not to packets addressed to the group itself. `snapshot` holds members with their
///  last-heard timestamps (same clock as `now`); the destination is never reported to itself.
pub fn encode_control_packet(command: ControlCommand, now: u64, destination: SocketAddr, group: SocketAddr, snapshot: &[(SocketAddr, u64)], max_gossip_entries: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + GOSSIP_ENTRY_LEN * max_gossip_entries);
    buf.put_u64_le(CONTROL_PACKET_MAGIC);
    buf.put_u32_le(command.into());

    if command == ControlCommand::DiscoveryAck && destination != group {
        let entries = snapshot.iter()
            .filter(|(endpoint, _)| *endpoint != destination)
            .take(max_gossip_entries);

        for &(endpoint, last_heard) in entries {
            GossipEntry {
                endpoint,
                elapsed_millis: (now.saturating_sub(last_heard) / 1000).saturating_cast(),
            }.ser(&mut buf);
        }
    }
    buf
}

/// Inverse of [encode_control_packet]. Gossip parsing stops at the first entry that fails to
///  parse, keeping the entries before it.
pub fn decode_control_packet(mut buf: &[u8], now: u64) -> Result<DecodedControlPacket, ControlPacketError> {
    if buf.len() < CONTROL_HEADER_LEN {
        return Err(ControlPacketError::NotAControlPacket);
    }
    if buf.get_u64_le() != CONTROL_PACKET_MAGIC {
        return Err(ControlPacketError::NotAControlPacket);
    }

    let raw_command = buf.get_u32_le();
    let command = ControlCommand::try_from(raw_command)
        .map_err(|_| ControlPacketError::UnknownCommand(raw_command))?;

    let mut gossip = Vec::new();
    while buf.has_remaining() {
        match GossipEntry::try_deser(&mut buf) {
            Ok(entry) => {
                let elapsed_millis: u64 = entry.elapsed_millis.safe_cast();
                gossip.push((entry.endpoint, now.saturating_sub(elapsed_millis * 1000)));
            }
            Err(_) => break,
        }
    }

    Ok(DecodedControlPacket {
        command,
        gossip,
    })
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4, SocketAddrV6};
    use rstest::rstest;
    use super::*;
    use crate::test_util::endpoint::{test_endpoint_from_number, test_group_addr};

    const NOW: u64 = 100_000_000;

    #[rstest]
    #[case::ping(ControlCommand::DiscoveryPing)]
    #[case::ack(ControlCommand::DiscoveryAck)]
    #[case::bye(ControlCommand::DepartureNotice)]
    fn test_command_survives_encoding(#[case] command: ControlCommand) {
        let snapshot = vec![(test_endpoint_from_number(3), NOW - 5_000)];
        let buf = encode_control_packet(command, NOW, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);

        let decoded = decode_control_packet(&buf, NOW).unwrap();
        assert_eq!(decoded.command, command);
    }

    #[test]
    fn test_header_layout() {
        let buf = encode_control_packet(ControlCommand::DiscoveryPing, NOW, test_group_addr(), test_group_addr(), &[], MAX_GOSSIP_ENTRIES_PER_ACK);
        assert_eq!(buf.as_ref(), &[0x5B, 0x06, 0x5A, 0x34, 0xC8, 0x67, 0xF9, 0x72, 1, 0, 0, 0]);
    }

    #[test]
    fn test_gossip_entry_layout() {
        let endpoint = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 0x1234));
        let buf = encode_control_packet(ControlCommand::DiscoveryAck, NOW, test_endpoint_from_number(2), test_group_addr(), &[(endpoint, NOW - 2_000_000)], MAX_GOSSIP_ENTRIES_PER_ACK);

        assert_eq!(buf.len(), CONTROL_HEADER_LEN + GOSSIP_ENTRY_LEN);
        assert_eq!(&buf[CONTROL_HEADER_LEN..], &[
            7, 0, 0, 10, 0xff, 0xff, 0, 0,  // low 64 bits of ::ffff:10.0.0.7
            0, 0, 0, 0, 0, 0, 0, 0,         // high 64 bits
            0xd0, 0x07, 0, 0,               // 2000 ms
            0x34, 0x12,                     // port
        ][..]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_byte(vec![0x5b])]
    #[case::eleven_bytes(vec![0x5B, 0x06, 0x5A, 0x34, 0xC8, 0x67, 0xF9, 0x72, 1, 0, 0])]
    #[case::wrong_magic(vec![0x5B, 0x06, 0x5A, 0x34, 0xC8, 0x67, 0xF9, 0x73, 1, 0, 0, 0])]
    #[case::user_text(b"hello, simulated multicast".to_vec())]
    fn test_not_a_control_packet(#[case] buf: Vec<u8>) {
        assert_eq!(decode_control_packet(&buf, NOW), Err(ControlPacketError::NotAControlPacket));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::four(4)]
    #[case::big(1936548965)]
    fn test_unknown_command(#[case] code: u32) {
        let mut buf = BytesMut::new();
        buf.put_u64_le(CONTROL_PACKET_MAGIC);
        buf.put_u32_le(code);
        assert_eq!(decode_control_packet(&buf, NOW), Err(ControlPacketError::UnknownCommand(code)));
    }

    #[test]
    fn test_gossip_only_for_ack() {
        let snapshot = vec![(test_endpoint_from_number(3), NOW)];
        for command in [ControlCommand::DiscoveryPing, ControlCommand::DepartureNotice] {
            let buf = encode_control_packet(command, NOW, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);
            assert_eq!(buf.len(), CONTROL_HEADER_LEN);
        }
    }

    #[test]
    fn test_no_gossip_to_group() {
        let snapshot = vec![(test_endpoint_from_number(3), NOW)];
        let buf = encode_control_packet(ControlCommand::DiscoveryAck, NOW, test_group_addr(), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);
        assert_eq!(buf.len(), CONTROL_HEADER_LEN);
    }

    #[test]
    fn test_destination_is_not_reported_to_itself() {
        let snapshot = vec![
            (test_endpoint_from_number(2), NOW),
            (test_endpoint_from_number(3), NOW),
        ];
        let buf = encode_control_packet(ControlCommand::DiscoveryAck, NOW, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);

        let decoded = decode_control_packet(&buf, NOW).unwrap();
        assert_eq!(decoded.gossip, vec![(test_endpoint_from_number(3), NOW)]);
    }

    #[rstest]
    #[case::none(0, 0)]
    #[case::few(3, 3)]
    #[case::exactly_max(10, 10)]
    #[case::more_than_max(25, 10)]
    fn test_gossip_entries_are_capped(#[case] num_members: u16, #[case] expected: usize) {
        let snapshot = (0..num_members)
            .map(|n| (test_endpoint_from_number(100 + n), NOW))
            .collect::<Vec<_>>();
        let buf = encode_control_packet(ControlCommand::DiscoveryAck, NOW, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);

        assert_eq!(buf.len(), CONTROL_HEADER_LEN + expected * GOSSIP_ENTRY_LEN);
        assert_eq!(decode_control_packet(&buf, NOW).unwrap().gossip.len(), expected);
    }

    #[test]
    fn test_last_heard_is_reconstructed_on_receiver_clock() {
        let sender_now = 50_000_000;
        let snapshot = vec![
            (test_endpoint_from_number(3), sender_now - 1_500_000),
            (test_endpoint_from_number(4), sender_now),
        ];
        let buf = encode_control_packet(ControlCommand::DiscoveryAck, sender_now, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);

        let receiver_now = 7_000_000;
        let decoded = decode_control_packet(&buf, receiver_now).unwrap();
        assert_eq!(decoded.gossip, vec![
            (test_endpoint_from_number(3), receiver_now - 1_500_000),
            (test_endpoint_from_number(4), receiver_now),
        ]);
    }

    #[test]
    fn test_elapsed_time_saturates() {
        let snapshot = vec![(test_endpoint_from_number(3), 0)];
        let now = (u32::MAX as u64 + 10) * 1000;
        let buf = encode_control_packet(ControlCommand::DiscoveryAck, now, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);

        assert_eq!(&buf[CONTROL_HEADER_LEN+16..CONTROL_HEADER_LEN+20], &[0xff, 0xff, 0xff, 0xff]);

        let decoded = decode_control_packet(&buf, 1_000).unwrap();
        assert_eq!(decoded.gossip, vec![(test_endpoint_from_number(3), 0)]);
    }

    #[test]
    fn test_ipv6_gossip_entry() {
        let endpoint = SocketAddr::V6(SocketAddrV6::new("fe80::1:2:3".parse().unwrap(), 9999, 0, 0));
        let buf = encode_control_packet(ControlCommand::DiscoveryAck, NOW, test_endpoint_from_number(2), test_group_addr(), &[(endpoint, NOW)], MAX_GOSSIP_ENTRIES_PER_ACK);

        let decoded = decode_control_packet(&buf, NOW).unwrap();
        assert_eq!(decoded.gossip, vec![(endpoint, NOW)]);
    }

    #[test]
    fn test_truncated_gossip_entry_is_ignored() {
        let snapshot = vec![
            (test_endpoint_from_number(3), NOW),
            (test_endpoint_from_number(4), NOW),
        ];
        let mut buf = encode_control_packet(ControlCommand::DiscoveryAck, NOW, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);
        buf.extend_from_slice(&[1, 2, 3]);

        let decoded = decode_control_packet(&buf, NOW).unwrap();
        assert_eq!(decoded.gossip, snapshot);
    }

    #[rstest]
    #[case::unspecified_address("0.0.0.0:1234")]
    #[case::unspecified_ipv6("[::]:1234")]
    #[case::port_zero("10.1.1.1:0")]
    fn test_parsing_stops_at_invalid_gossip_entry(#[case] invalid: &str) {
        let snapshot = vec![
            (test_endpoint_from_number(3), NOW),
            (test_endpoint_from_number(4), NOW),
        ];
        let mut buf = encode_control_packet(ControlCommand::DiscoveryAck, NOW, test_endpoint_from_number(2), test_group_addr(), &snapshot, MAX_GOSSIP_ENTRIES_PER_ACK);
        GossipEntry { endpoint: invalid.parse().unwrap(), elapsed_millis: 0 }.ser(&mut buf);
        GossipEntry { endpoint: test_endpoint_from_number(5), elapsed_millis: 0 }.ser(&mut buf);

        let decoded = decode_control_packet(&buf, NOW).unwrap();
        assert_eq!(decoded.command, ControlCommand::DiscoveryAck);
        assert_eq!(decoded.gossip, snapshot);
    }
}
