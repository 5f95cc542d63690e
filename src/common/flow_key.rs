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

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Identity of a unidirectional TCP conversation.
///
/// The derived ordering (source ip, destination ip, source port, destination port, with
/// addresses compared numerically and every IPv4 address before any IPv6 address) is the
/// tie-break used when ranking flows of equal volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            src_ip: Ipv4Addr::UNSPECIFIED.into(),
            dst_ip: Ipv4Addr::UNSPECIFIED.into(),
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.src_ip, self.dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => write!(
                f,
                "{}:{} > {}:{}",
                src, self.src_port, dst, self.dst_port
            ),
            _ => write!(
                f,
                "[{}]:{} > [{}]:{}",
                self.src_ip, self.src_port, self.dst_ip, self.dst_port
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankedFlow {
    pub key: FlowKey,
    pub bytes: u64,
}

/// Result of one extraction cycle, heaviest flow first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopNSnapshot {
    // sequence number of the cycle, starting from 1
    pub cycle: u64,
    // tcp packets processed when the cycle was fired
    pub packets: u64,
    pub flows: Vec<RankedFlow>,
}

impl TopNSnapshot {
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankedFlow> {
        self.flows.iter()
    }

    pub fn total_bytes(&self) -> u64 {
        self.flows.iter().map(|f| f.bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    #[test]
    fn direction_matters() {
        let a = FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 1).into(),
            Ipv4Addr::new(10, 0, 0, 2).into(),
            40000,
            80,
        );
        let b = FlowKey::new(a.dst_ip, a.src_ip, a.dst_port, a.src_port);
        assert_ne!(a, b);
    }

    #[test]
    fn ordering_is_numeric_and_v4_first() {
        let low = FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 9).into(),
            Ipv4Addr::new(10, 0, 0, 1).into(),
            1,
            1,
        );
        let high = FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 10).into(),
            Ipv4Addr::new(10, 0, 0, 1).into(),
            1,
            1,
        );
        let v6 = FlowKey::new(Ipv6Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into(), 1, 1);
        assert!(low < high);
        assert!(high < v6);
    }

    #[test]
    fn display() {
        let key = FlowKey::new(
            Ipv4Addr::new(192, 168, 1, 2).into(),
            Ipv4Addr::new(1, 1, 1, 1).into(),
            51000,
            443,
        );
        assert_eq!(key.to_string(), "192.168.1.2:51000 > 1.1.1.1:443");
        let key = FlowKey::new(Ipv6Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into(), 1, 2);
        assert_eq!(key.to_string(), "[::1]:1 > [::1]:2");
    }
}
