//! Packet decoding and process attribution
//!
//! Turns raw captured frames into classified traffic events: who the bytes
//! are charged to, and in which direction. Classification never fails
//! loudly; a frame we cannot decode or attribute is dropped from
//! accounting so the capture loop keeps running at packet rate.

use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::resolver::PortResolver;

/// Who a packet's bytes are charged to. Synthetic variants cover traffic
/// no local process claims; they become display strings only at the point
/// where names leave the core (live rates, logs, persisted totals).
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum Attribution {
    /// A local process resolved via the OS connection table.
    Process(String),
    /// TCP/UDP traffic neither port could attribute.
    Unknown,
    /// ICMP / ICMPv6 echo traffic.
    Icmp,
    /// Any other IP protocol, by protocol number.
    Protocol(u8),
    /// Link-layer ARP, no IP header at all.
    Arp,
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribution::Process(name) => write!(f, "{}", name),
            Attribution::Unknown => write!(f, "System (Unknown)"),
            Attribution::Icmp => write!(f, "System (ICMP/Ping)"),
            Attribution::Protocol(id) => write!(f, "System (Proto {})", id),
            Attribution::Arp => write!(f, "System (ARP)"),
        }
    }
}

/// Identity of one accounted flow bucket.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TrafficKey {
    pub attribution: Attribution,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// One classified packet, ready for accounting.
#[derive(Debug, Clone)]
pub struct TrafficEvent {
    pub key: TrafficKey,
    pub size: u64,
    pub direction: Direction,
}

/// What to do with frames that have no owning process at all.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyPolicy {
    /// Charge ARP frames to a synthetic bucket instead of dropping them.
    pub account_arp: bool,
    /// Charge non-TCP/UDP/ICMP IP protocols to per-protocol buckets.
    pub account_unknown_protocols: bool,
}

impl Default for ClassifyPolicy {
    fn default() -> Self {
        Self {
            account_arp: true,
            account_unknown_protocols: true,
        }
    }
}

/// Classifies captured frames. Shared across capture threads; the only
/// interior state is the resolver's port cache.
pub struct PacketClassifier {
    resolver: PortResolver,
    policy: ClassifyPolicy,
}

impl PacketClassifier {
    pub fn new(resolver: PortResolver, policy: ClassifyPolicy) -> Self {
        Self { resolver, policy }
    }

    /// Classify one captured frame. `None` means the frame is excluded
    /// from accounting (unparseable, or dropped by policy). The accounted
    /// size is the full frame length, headers included.
    pub fn classify(&self, frame: &[u8]) -> Option<TrafficEvent> {
        let ethernet = EthernetPacket::new(frame)?;
        let size = frame.len() as u64;

        match ethernet.get_ethertype() {
            EtherTypes::Ipv4 => {
                let ipv4 = Ipv4Packet::new(ethernet.payload())?;
                let src_addr = IpAddr::V4(ipv4.get_source());
                let dst_addr = IpAddr::V4(ipv4.get_destination());
                self.classify_transport(
                    ipv4.get_next_level_protocol(),
                    ipv4.payload(),
                    src_addr,
                    dst_addr,
                    size,
                )
            }
            EtherTypes::Ipv6 => {
                let ipv6 = Ipv6Packet::new(ethernet.payload())?;
                let src_addr = IpAddr::V6(ipv6.get_source());
                let dst_addr = IpAddr::V6(ipv6.get_destination());
                self.classify_transport(
                    ipv6.get_next_header(),
                    ipv6.payload(),
                    src_addr,
                    dst_addr,
                    size,
                )
            }
            EtherTypes::Arp => {
                if !self.policy.account_arp {
                    return None;
                }
                // ARP carries no IP endpoints; the bucket is keyed with
                // unspecified addresses.
                let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
                Some(TrafficEvent {
                    key: TrafficKey {
                        attribution: Attribution::Arp,
                        src_addr: unspecified,
                        dst_addr: unspecified,
                    },
                    size,
                    direction: Direction::Download,
                })
            }
            _ => None,
        }
    }

    fn classify_transport(
        &self,
        protocol: IpNextHeaderProtocol,
        payload: &[u8],
        src_addr: IpAddr,
        dst_addr: IpAddr,
        size: u64,
    ) -> Option<TrafficEvent> {
        let (attribution, direction) = match protocol {
            IpNextHeaderProtocols::Tcp => {
                let tcp = TcpPacket::new(payload)?;
                self.attribute_ports(tcp.get_source(), tcp.get_destination())
            }
            IpNextHeaderProtocols::Udp => {
                let udp = UdpPacket::new(payload)?;
                self.attribute_ports(udp.get_source(), udp.get_destination())
            }
            IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => {
                (Attribution::Icmp, Direction::Download)
            }
            other => {
                if !self.policy.account_unknown_protocols {
                    return None;
                }
                (Attribution::Protocol(other.0), Direction::Download)
            }
        };

        Some(TrafficEvent {
            key: TrafficKey {
                attribution,
                src_addr,
                dst_addr,
            },
            size,
            direction,
        })
    }

    /// Destination port wins: traffic toward a local listener is that
    /// process's download, even when the source port would also resolve.
    fn attribute_ports(&self, src_port: u16, dst_port: u16) -> (Attribution, Direction) {
        if let Some(name) = self.resolver.resolve(dst_port) {
            return (Attribution::Process(name), Direction::Download);
        }
        if let Some(name) = self.resolver.resolve(src_port) {
            return (Attribution::Process(name), Direction::Upload);
        }
        (Attribution::Unknown, Direction::Download)
    }
}
