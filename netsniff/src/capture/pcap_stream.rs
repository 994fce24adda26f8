//! Incremental reader for a classic pcap byte stream.
//!
//! Backends write to a pipe, so data arrives in arbitrary chunks.
//! `LegacyPcapReader` refills from the pipe until a whole record is buffered.
use chrono::{DateTime, TimeZone, Utc};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use std::io::{Chain, Cursor, ErrorKind, Read};

use crate::analyser::containers::{FrameOrigin, RawFrame};
use crate::analyser::frame::ETHERTYPE_IPV4;
use crate::error::{CaptureError, CaptureResult};

const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

/// Anything larger is treated as stream corruption.
pub const MAX_RECORD_LEN: usize = 256 * 1024;

pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;
pub const LINKTYPE_LINUX_SLL: u32 = 113;
pub const LINKTYPE_IPV4: u32 = 228;

const PCAP_MAGICS: [[u8; 4]; 4] = [
    [0xd4, 0xc3, 0xb2, 0xa1],
    [0xa1, 0xb2, 0xc3, 0xd4],
    [0x4d, 0x3c, 0xb2, 0xa1],
    [0xa1, 0xb2, 0x3c, 0x4d],
];

/// The global header is read up front, since `LegacyPcapReader::new` parses
/// it from a single read and a pipe may hand it over in pieces.
type Stream<R> = LegacyPcapReader<Chain<Cursor<[u8; GLOBAL_HEADER_LEN]>, R>>;

enum State<R: Read> {
    Pending(R),
    Reading(Stream<R>),
    Finished,
}

pub struct PcapStreamReader<R: Read> {
    state: State<R>,
    linktype: Option<u32>,
    nanos: bool,
}

fn timestamp(nanos: bool, seconds: u32, fraction: u32) -> DateTime<Utc> {
    let nanos = if nanos { fraction } else { fraction.saturating_mul(1000) };
    Utc.timestamp_opt(seconds as i64, nanos.min(999_999_999))
        .single()
        .unwrap_or_else(Utc::now)
}

fn malformed(detail: impl std::fmt::Display) -> CaptureError {
    CaptureError::MalformedFrame(detail.to_string())
}

impl<R: Read> PcapStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            state: State::Pending(inner),
            linktype: None,
            nanos: false,
        }
    }

    pub fn linktype(&self) -> Option<u32> {
        self.linktype
    }

    /// Blocks for the global header. `None` if the stream ended first.
    fn open(mut inner: R) -> CaptureResult<Option<Stream<R>>> {
        let mut header = [0u8; GLOBAL_HEADER_LEN];
        match inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let magic = [header[0], header[1], header[2], header[3]];
        if !PCAP_MAGICS.contains(&magic) {
            return Err(malformed(format!("not a pcap stream (magic {})", hex::encode(magic))));
        }
        let stream = Cursor::new(header).chain(inner);
        LegacyPcapReader::new(MAX_RECORD_LEN + RECORD_HEADER_LEN, stream)
            .map(Some)
            .map_err(|e| malformed(format!("unreadable pcap header: {e}")))
    }

    pub fn next_frame(&mut self) -> CaptureResult<Option<RawFrame>> {
        let result = self.read_frame();
        if !matches!(result, Ok(Some(_))) {
            self.state = State::Finished;
        }
        result
    }

    fn read_frame(&mut self) -> CaptureResult<Option<RawFrame>> {
        if let State::Pending(_) = self.state {
            let State::Pending(inner) = std::mem::replace(&mut self.state, State::Finished) else {
                return Ok(None);
            };
            match Self::open(inner)? {
                Some(stream) => self.state = State::Reading(stream),
                None => return Ok(None),
            }
        }
        let State::Reading(reader) = &mut self.state else {
            return Ok(None);
        };

        loop {
            match reader.next() {
                Ok((offset, PcapBlockOwned::LegacyHeader(header))) => {
                    self.linktype = Some(header.network.0 as u32);
                    self.nanos = header.is_nanosecond_precision();
                    log::debug!("pcap stream: linktype {}, nanosecond timestamps: {}", header.network.0, self.nanos);
                    reader.consume(offset);
                }
                Ok((offset, PcapBlockOwned::Legacy(packet))) => {
                    if packet.caplen as usize > MAX_RECORD_LEN {
                        return Err(malformed(format!("record claims {} bytes", packet.caplen)));
                    }
                    let (seconds, fraction) = (packet.ts_sec, packet.ts_usec);
                    let linktype = self.linktype.unwrap_or(LINKTYPE_ETHERNET);
                    let normalized = normalize_link(linktype, packet.data);
                    reader.consume(offset);

                    let timestamp = timestamp(self.nanos, seconds, fraction);
                    return normalized
                        .map(|(data, origin)| Some(RawFrame::new(timestamp, data, origin)))
                        .ok_or_else(|| malformed(format!("unusable linktype {linktype} record")));
                }
                Ok((offset, _)) => reader.consume(offset),
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::UnexpectedEof) => {
                    log::debug!("pcap stream ended inside a record");
                    return Ok(None);
                }
                Err(PcapError::Incomplete(_)) => {
                    reader.refill().map_err(|e| malformed(format!("pcap refill failed: {e}")))?;
                }
                Err(e) => return Err(malformed(format!("pcap parse error: {e}"))),
            }
        }
    }
}

/// Rewrites non-Ethernet link layers into an Ethernet II frame.
///
/// Ethernet passes through untouched as a wire frame; anything rewritten is
/// marked reconstructed.
pub fn normalize_link(linktype: u32, body: &[u8]) -> Option<(Vec<u8>, FrameOrigin)> {
    let (ethertype, network) = match linktype {
        LINKTYPE_ETHERNET => return Some((body.to_vec(), FrameOrigin::Wire)),
        LINKTYPE_LINUX_SLL => {
            let proto = body.get(14..16)?;
            (u16::from_be_bytes([proto[0], proto[1]]), body.get(16..)?)
        }
        LINKTYPE_RAW | LINKTYPE_IPV4 => {
            let version = body.first()? >> 4;
            if version != 4 {
                return None;
            }
            (ETHERTYPE_IPV4, body)
        }
        _ => return None,
    };

    let mut frame = Vec::with_capacity(14 + network.len());
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(network);
    Some((frame, FrameOrigin::Reconstructed))
}

impl<R: Read + Send> super::backend::FrameSource for PcapStreamReader<R> {
    fn next_frame(&mut self) -> CaptureResult<Option<RawFrame>> {
        PcapStreamReader::next_frame(self)
    }
}
