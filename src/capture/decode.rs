/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::net::IpAddr;

use pcap_parser::Linktype;
use pnet::packet::{
    ethernet::{EtherType, EtherTypes, EthernetPacket},
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    vlan::VlanPacket,
    Packet,
};

use super::{PacketEvent, SkipReason, L4};

const SLL_HEADER_LEN: usize = 16;
const SLL_PROTOCOL_OFFSET: usize = 14;
const NULL_HEADER_LEN: usize = 4;

// BSD loopback address families, the ipv6 one differs per platform
const BSD_AF_INET: u32 = 2;
const BSD_AF_INET6: [u32; 3] = [24, 28, 30];

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DEST_OPTIONS: u8 = 60;
const IPV6_FRAGMENT_HEADER_LEN: usize = 8;

/// Decodes one captured frame down to layer 4.
///
/// Payload lengths come from the ip length fields, so a frame cut short by the capture
/// snap length still reports the bytes that were on the wire. The tcp header itself has to
/// be captured.
pub fn decode(linktype: Linktype, data: &[u8]) -> Result<PacketEvent, SkipReason> {
    match linktype {
        Linktype::ETHERNET => decode_ethernet(data),
        Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => decode_ip(data),
        Linktype::LINUX_SLL => {
            if data.len() < SLL_HEADER_LEN {
                return Err(SkipReason::Truncated("linux sll"));
            }
            let protocol =
                u16::from_be_bytes([data[SLL_PROTOCOL_OFFSET], data[SLL_PROTOCOL_OFFSET + 1]]);
            decode_ethertype(EtherType(protocol), &data[SLL_HEADER_LEN..])
        }
        Linktype::NULL => {
            if data.len() < NULL_HEADER_LEN {
                return Err(SkipReason::Truncated("loopback"));
            }
            // written in the byte order of the capturing host
            let mut family = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            if family > 0xffff {
                family = family.swap_bytes();
            }
            match family {
                BSD_AF_INET => decode_ipv4(&data[NULL_HEADER_LEN..]),
                f if BSD_AF_INET6.contains(&f) => decode_ipv6(&data[NULL_HEADER_LEN..]),
                _ => Err(SkipReason::NotIp(family as u16)),
            }
        }
        other => Err(SkipReason::UnsupportedLinkType(other.0)),
    }
}

fn decode_ethernet(data: &[u8]) -> Result<PacketEvent, SkipReason> {
    let ethernet = EthernetPacket::new(data).ok_or(SkipReason::Truncated("ethernet"))?;
    decode_ethertype(ethernet.get_ethertype(), ethernet.payload())
}

fn decode_ethertype(ethertype: EtherType, payload: &[u8]) -> Result<PacketEvent, SkipReason> {
    match ethertype {
        EtherTypes::Ipv4 => decode_ipv4(payload),
        EtherTypes::Ipv6 => decode_ipv6(payload),
        EtherTypes::Vlan | EtherTypes::PBridge | EtherTypes::QinQ => {
            let vlan = VlanPacket::new(payload).ok_or(SkipReason::Truncated("vlan"))?;
            decode_ethertype(vlan.get_ethertype(), vlan.payload())
        }
        other => Err(SkipReason::NotIp(other.0)),
    }
}

fn decode_ip(data: &[u8]) -> Result<PacketEvent, SkipReason> {
    match data.first().map(|b| b >> 4) {
        Some(4) => decode_ipv4(data),
        Some(6) => decode_ipv6(data),
        Some(_) => Err(SkipReason::Malformed("ip version")),
        None => Err(SkipReason::Truncated("ip")),
    }
}

fn decode_ipv4(data: &[u8]) -> Result<PacketEvent, SkipReason> {
    let ip = Ipv4Packet::new(data).ok_or(SkipReason::Truncated("ipv4"))?;
    if ip.get_version() != 4 {
        return Err(SkipReason::Malformed("ipv4"));
    }
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(SkipReason::Malformed("ipv4"));
    }
    if header_len > data.len() {
        return Err(SkipReason::Truncated("ipv4"));
    }
    if ip.get_fragment_offset() != 0 {
        return Err(SkipReason::Fragment);
    }
    let total_len = ip.get_total_length() as usize;
    // zero total length shows up with tcp segmentation offload
    let wire_len = if total_len == 0 {
        data.len() - header_len
    } else if total_len < header_len {
        return Err(SkipReason::Malformed("ipv4"));
    } else {
        total_len - header_len
    };
    let captured = &data[header_len..data.len().min(header_len + wire_len)];
    decode_l4(
        IpAddr::V4(ip.get_source()),
        IpAddr::V4(ip.get_destination()),
        ip.get_next_level_protocol(),
        captured,
        wire_len,
    )
}

fn decode_ipv6(data: &[u8]) -> Result<PacketEvent, SkipReason> {
    let ip = Ipv6Packet::new(data).ok_or(SkipReason::Truncated("ipv6"))?;
    if ip.get_version() != 6 {
        return Err(SkipReason::Malformed("ipv6"));
    }
    let payload_len = ip.get_payload_length() as usize;
    let mut wire_len = if payload_len == 0 {
        data.len() - IPV6_HEADER_LEN
    } else {
        payload_len
    };
    let mut captured = &data[IPV6_HEADER_LEN..data.len().min(IPV6_HEADER_LEN + wire_len)];
    let mut next_header = ip.get_next_header();

    loop {
        let ext_len = match next_header.0 {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTIONS => {
                if captured.len() < 2 {
                    return Err(SkipReason::Truncated("ipv6 extension"));
                }
                (captured[1] as usize + 1) * 8
            }
            IPV6_FRAGMENT => {
                if captured.len() < IPV6_FRAGMENT_HEADER_LEN {
                    return Err(SkipReason::Truncated("ipv6 fragment"));
                }
                let offset = u16::from_be_bytes([captured[2], captured[3]]) >> 3;
                if offset != 0 {
                    return Err(SkipReason::Fragment);
                }
                IPV6_FRAGMENT_HEADER_LEN
            }
            _ => break,
        };
        if ext_len > captured.len() || ext_len > wire_len {
            return Err(SkipReason::Truncated("ipv6 extension"));
        }
        next_header = IpNextHeaderProtocol(captured[0]);
        captured = &captured[ext_len..];
        wire_len -= ext_len;
    }

    decode_l4(
        IpAddr::V6(ip.get_source()),
        IpAddr::V6(ip.get_destination()),
        next_header,
        captured,
        wire_len,
    )
}

fn decode_l4(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    protocol: IpNextHeaderProtocol,
    captured: &[u8],
    wire_len: usize,
) -> Result<PacketEvent, SkipReason> {
    if protocol != IpNextHeaderProtocols::Tcp {
        return Ok(PacketEvent {
            src_ip,
            dst_ip,
            l4: L4::Other(protocol.0),
            payload_len: wire_len as u32,
        });
    }

    let tcp = TcpPacket::new(captured).ok_or(SkipReason::Truncated("tcp"))?;
    let header_len = tcp.get_data_offset() as usize * 4;
    if header_len < TCP_MIN_HEADER_LEN || header_len > wire_len {
        return Err(SkipReason::Malformed("tcp"));
    }
    Ok(PacketEvent {
        src_ip,
        dst_ip,
        l4: L4::Tcp {
            src_port: tcp.get_source(),
            dst_port: tcp.get_destination(),
        },
        payload_len: (wire_len - header_len) as u32,
    })
}
