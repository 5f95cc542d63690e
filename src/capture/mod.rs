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

//! Capture sources: where decoded packet events come from.
//!
//! A source hands out one [`Captured`] item per call. End of stream and read failures are
//! distinct outcomes so the ingestion loop can decide how to treat each of them.

mod decode;
mod pcap_file;

pub use decode::decode;
pub use pcap_file::PcapFileSource;

use std::net::IpAddr;

use thiserror::Error;

use crate::common::FlowKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("open capture {path} failed: {reason}")]
    Open { path: String, reason: String },
    #[error("read capture failed: {0}")]
    Read(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a packet did not produce a [`PacketEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("unsupported link type {0}")]
    UnsupportedLinkType(i32),
    #[error("packet on undeclared interface {0}")]
    UnknownInterface(u32),
    #[error("{0} header truncated")]
    Truncated(&'static str),
    #[error("{0} header malformed")]
    Malformed(&'static str),
    #[error("not an ip packet, ethertype {0:#06x}")]
    NotIp(u16),
    #[error("non-first ip fragment")]
    Fragment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4 {
    Tcp { src_port: u16, dst_port: u16 },
    // ip protocol number
    Other(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketEvent {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub l4: L4,
    // bytes on the wire after the tcp header, or the whole layer 4 segment for other protocols
    pub payload_len: u32,
}

impl PacketEvent {
    pub fn flow_key(&self) -> Option<FlowKey> {
        match self.l4 {
            L4::Tcp { src_port, dst_port } => Some(FlowKey::new(
                self.src_ip,
                self.dst_ip,
                src_port,
                dst_port,
            )),
            L4::Other(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Captured {
    Packet(PacketEvent),
    Skipped(SkipReason),
    EndOfStream,
}

pub trait CaptureSource {
    /// Blocks until the next item is available. After `EndOfStream` or an error the source
    /// must not be polled again.
    fn next_packet(&mut self) -> Result<Captured>;
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn next_packet(&mut self) -> Result<Captured> {
        (**self).next_packet()
    }
}
