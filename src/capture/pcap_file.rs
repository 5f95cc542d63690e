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

use std::fs::File;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use pcap_parser::{
    create_reader, traits::PcapReaderIterator, Block, Linktype, PcapBlockOwned, PcapError,
};

use super::{decode, CaptureSource, Captured, Error, Result, SkipReason};

enum Step {
    // offset to consume, and what the block produced if it was a packet
    Consume(usize, Option<Captured>),
    Refill,
}

/// Reads a classic pcap or pcapng file sequentially.
pub struct PcapFileSource {
    path: PathBuf,
    reader: Box<dyn PcapReaderIterator>,
    // link type per interface id, classic pcap files have exactly one
    interfaces: Vec<i32>,
    read_count: u64,
}

impl PcapFileSource {
    const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let reader = create_reader(Self::DEFAULT_BUFFER_SIZE, file).map_err(|e| Error::Open {
            path: path.display().to_string(),
            reason: format!("{:?}", e),
        })?;
        debug!("opened capture {}", path.display());
        Ok(Self {
            path,
            reader,
            interfaces: vec![],
            read_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // number of packet blocks read so far, decodable or not
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    fn handle_block(interfaces: &mut Vec<i32>, block: PcapBlockOwned) -> Option<Captured> {
        match block {
            PcapBlockOwned::LegacyHeader(header) => {
                interfaces.clear();
                interfaces.push(header.network.0);
                None
            }
            PcapBlockOwned::Legacy(block) => Some(Self::decode_on(interfaces, 0, block.data)),
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                // interface ids are scoped to their section
                interfaces.clear();
                None
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                interfaces.push(idb.linktype.0);
                None
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let caplen = (epb.caplen as usize).min(epb.data.len());
                Some(Self::decode_on(interfaces, epb.if_id, &epb.data[..caplen]))
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                let len = (spb.origlen as usize).min(spb.data.len());
                Some(Self::decode_on(interfaces, 0, &spb.data[..len]))
            }
            _ => None,
        }
    }

    fn decode_on(interfaces: &[i32], if_id: u32, data: &[u8]) -> Captured {
        let Some(&linktype) = interfaces.get(if_id as usize) else {
            return Captured::Skipped(SkipReason::UnknownInterface(if_id));
        };
        match decode(Linktype(linktype), data) {
            Ok(event) => Captured::Packet(event),
            Err(reason) => Captured::Skipped(reason),
        }
    }
}

impl CaptureSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Captured> {
        let mut refilled = false;
        loop {
            let step = match self.reader.next() {
                Ok((offset, block)) => {
                    Step::Consume(offset, Self::handle_block(&mut self.interfaces, block))
                }
                Err(PcapError::Eof) => return Ok(Captured::EndOfStream),
                Err(PcapError::Incomplete(_)) => Step::Refill,
                Err(PcapError::UnexpectedEof) => {
                    return Err(Error::Read(format!(
                        "{} ends in the middle of a block",
                        self.path.display()
                    )))
                }
                Err(e) => return Err(Error::Read(format!("{:?}", e))),
            };

            match step {
                Step::Consume(offset, captured) => {
                    self.reader.consume(offset);
                    refilled = false;
                    if let Some(captured) = captured {
                        self.read_count += 1;
                        if let Captured::Skipped(reason) = &captured {
                            trace!("skip packet #{}: {}", self.read_count, reason);
                        }
                        return Ok(captured);
                    }
                }
                Step::Refill => {
                    if refilled {
                        // a refill brought nothing new, the last block is cut short
                        return Err(Error::Read(format!(
                            "{} ends in the middle of a block",
                            self.path.display()
                        )));
                    }
                    self.reader
                        .refill()
                        .map_err(|e| Error::Read(format!("{:?}", e)))?;
                    refilled = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::capture::L4;
    use crate::utils::test::{
        tcp_frame, udp_frame, PcapBuilder, PcapNgBuilder, LINKTYPE_ETHERNET,
    };

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn drain(source: &mut PcapFileSource) -> Vec<Captured> {
        let mut items = vec![];
        loop {
            match source.next_packet().unwrap() {
                Captured::EndOfStream => return items,
                other => items.push(other),
            }
        }
    }

    #[test]
    fn reads_classic_pcap() {
        let file = write_temp(
            &PcapBuilder::new(LINKTYPE_ETHERNET)
                .packet(&tcp_frame(1, 2, 1000, 80, 120))
                .packet(&udp_frame(1, 2, 30))
                .packet(&[0u8; 6])
                .packet(&tcp_frame(2, 1, 80, 1000, 1460))
                .build(),
        );
        let mut source = PcapFileSource::open(file.path()).unwrap();
        let items = drain(&mut source);
        assert_eq!(items.len(), 4);
        assert_eq!(source.read_count(), 4);

        let Captured::Packet(first) = &items[0] else {
            panic!("unexpected {:?}", items[0]);
        };
        assert_eq!(first.payload_len, 120);
        assert!(matches!(items[1], Captured::Packet(e) if e.l4 == L4::Other(17)));
        assert_eq!(
            items[2],
            Captured::Skipped(SkipReason::Truncated("ethernet"))
        );
        assert!(matches!(items[3], Captured::Packet(e) if e.payload_len == 1460));
    }

    #[test]
    fn reads_pcapng() {
        let file = write_temp(
            &PcapNgBuilder::new()
                .interface(LINKTYPE_ETHERNET as u16)
                .packet(0, &tcp_frame(1, 2, 1000, 80, 7))
                .packet(3, &tcp_frame(1, 2, 1000, 80, 7))
                .build(),
        );
        let mut source = PcapFileSource::open(file.path()).unwrap();
        let items = drain(&mut source);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Captured::Packet(e) if e.payload_len == 7));
        assert_eq!(items[1], Captured::Skipped(SkipReason::UnknownInterface(3)));
    }

    #[test]
    fn open_failures() {
        let missing = PcapFileSource::open("/nonexistent/dir/capture.pcap");
        assert!(matches!(missing, Err(Error::Open { .. })));

        let garbage = write_temp(b"this is not a capture file at all");
        assert!(matches!(
            PcapFileSource::open(garbage.path()),
            Err(Error::Open { .. })
        ));
    }

    #[test]
    fn truncated_tail_is_a_read_error() {
        let mut bytes = PcapBuilder::new(LINKTYPE_ETHERNET)
            .packet(&tcp_frame(1, 2, 1000, 80, 100))
            .packet(&tcp_frame(1, 2, 1000, 80, 100))
            .build();
        bytes.truncate(bytes.len() - 40);
        let file = write_temp(&bytes);

        let mut source = PcapFileSource::open(file.path()).unwrap();
        assert!(matches!(source.next_packet(), Ok(Captured::Packet(_))));
        assert!(matches!(source.next_packet(), Err(Error::Read(_))));
    }
}
