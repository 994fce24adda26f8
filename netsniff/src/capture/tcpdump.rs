//! tcpdump backend: line-oriented hex dumps (`-xx`) reassembled into frames.
use chrono::{DateTime, TimeZone, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::backend::{filter_words, spawn_piped, CaptureBackend, FrameSource, Launched, ProcessHandle, ToolLocator};
use super::pcap_stream::{normalize_link, LINKTYPE_ETHERNET, LINKTYPE_LINUX_SLL};
use crate::analyser::containers::RawFrame;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, CaptureResult};

/// tcpdump prints 16 bytes per row.
const ROW_LEN: usize = 16;

/// A frame whose last row was full is flushed after this long without output.
const IDLE_FLUSH: Duration = Duration::from_millis(200);

/// Lines buffered between the pipe reader and the assembler.
const LINE_QUEUE: usize = 1024;

const KNOWN_PATHS: &[&str] = &["/usr/sbin/tcpdump", "/usr/bin/tcpdump", "/sbin/tcpdump", "/usr/local/sbin/tcpdump", "/opt/homebrew/sbin/tcpdump"];

pub struct TcpdumpBackend;

impl TcpdumpBackend {
    fn arguments(config: &CaptureConfig, interface: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-l", "-n", "-tt", "-xx", "-i", interface].iter().map(|s| s.to_string()).collect();
        if !config.promiscuous {
            args.push("-p".into());
        }
        args.extend(filter_words(config.effective_filter()));
        args
    }
}

impl CaptureBackend for TcpdumpBackend {
    fn name(&self) -> &'static str {
        "tcpdump"
    }

    fn locate(&self, locator: &ToolLocator) -> Option<PathBuf> {
        locator.locate("tcpdump", KNOWN_PATHS)
    }

    fn launch(&self, executable: &Path, config: &CaptureConfig, interface: &str) -> CaptureResult<Launched> {
        let args = Self::arguments(config, interface);
        let (child, stdout, tail) = spawn_piped(self.name(), executable, &args, config.admin)?;
        // The "any" pseudo-device uses Linux cooked headers instead of Ethernet
        let linktype = if interface == "any" { LINKTYPE_LINUX_SLL } else { LINKTYPE_ETHERNET };
        Ok(Launched {
            source: Box::new(HexDumpSource::new(stdout, linktype)),
            handle: ProcessHandle::Child(child),
            diagnostics: Some(tail),
        })
    }
}

/// Groups tcpdump's per-packet header line and the hex rows beneath it.
///
/// A row shorter than 16 bytes ends its frame. After a full row the frame
/// stays open until the next header line, end of output, or [`finish`].
///
/// [`finish`]: HexDumpAssembler::finish
#[derive(Default)]
pub struct HexDumpAssembler {
    current: Option<PendingFrame>,
}

struct PendingFrame {
    timestamp: DateTime<Utc>,
    bytes: Vec<u8>,
    corrupt: bool,
}

impl PendingFrame {
    fn finish(self) -> CaptureResult<(DateTime<Utc>, Vec<u8>)> {
        if self.corrupt || self.bytes.is_empty() {
            return Err(CaptureError::MalformedFrame("unreadable hex dump".into()));
        }
        Ok((self.timestamp, self.bytes))
    }
}

impl HexDumpAssembler {
    /// Feeds one output line; returns the frame it completed, if any.
    pub fn push_line(&mut self, line: &str) -> Option<CaptureResult<(DateTime<Utc>, Vec<u8>)>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        if line.starts_with(char::is_whitespace) {
            let pending = self.current.as_mut()?;
            match parse_hex_row(line) {
                Some(bytes) if bytes.len() < ROW_LEN => {
                    pending.bytes.extend(bytes);
                    return self.finish();
                }
                Some(bytes) => pending.bytes.extend(bytes),
                None => pending.corrupt = true,
            }
            return None;
        }

        let completed = self.current.take().map(PendingFrame::finish);
        self.current = Some(PendingFrame {
            timestamp: parse_epoch(line.split_whitespace().next().unwrap_or("")).unwrap_or_else(Utc::now),
            bytes: Vec::new(),
            corrupt: false,
        });
        completed
    }

    pub fn has_pending(&self) -> bool {
        self.current.is_some()
    }

    /// Flushes the frame in progress.
    pub fn finish(&mut self) -> Option<CaptureResult<(DateTime<Utc>, Vec<u8>)>> {
        self.current.take().map(PendingFrame::finish)
    }
}

/// `1700000000.123456` → timestamp.
fn parse_epoch(token: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = token.split_once('.').unwrap_or((token, "0"));
    let secs: i64 = secs.parse().ok()?;
    if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos: u32 = format!("{frac:0<9}").parse().ok()?;
    Utc.timestamp_opt(secs, nanos).single()
}

/// `\t0x0010:  4500 0034 1c46 4000` → bytes. `None` if the row is not hex.
fn parse_hex_row(line: &str) -> Option<Vec<u8>> {
    let (offset, data) = line.trim_start().split_once(':')?;
    if !offset.starts_with("0x") {
        return None;
    }
    let mut bytes = Vec::with_capacity(16);
    for group in data.split_whitespace() {
        if group.len() % 2 != 0 || group.len() > 4 {
            return None;
        }
        bytes.extend(hex::decode(group).ok()?);
    }
    Some(bytes)
}

type Assembled = CaptureResult<(DateTime<Utc>, Vec<u8>)>;

/// Reads tcpdump text output line by line.
///
/// A thread drains the pipe so that a frame left open by a quiet link can
/// be flushed on a timeout instead of waiting for the next packet.
pub struct HexDumpSource {
    lines: Receiver<io::Result<String>>,
    assembler: HexDumpAssembler,
    linktype: u32,
    ready: VecDeque<Assembled>,
    done: bool,
}

impl HexDumpSource {
    pub fn new<R: Read + Send + 'static>(inner: R, linktype: u32) -> Self {
        let (sender, lines) = channel::bounded(LINE_QUEUE);
        thread::spawn(move || {
            let mut reader = BufReader::new(inner);
            let mut line = Vec::new();
            loop {
                line.clear();
                let message = match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => Ok(String::from_utf8_lossy(&line).into_owned()),
                    Err(e) => Err(e),
                };
                let failed = message.is_err();
                if sender.send(message).is_err() || failed {
                    break;
                }
            }
        });
        Self {
            lines,
            assembler: HexDumpAssembler::default(),
            linktype,
            ready: VecDeque::new(),
            done: false,
        }
    }

    fn to_frame(&self, assembled: Assembled) -> CaptureResult<RawFrame> {
        let (timestamp, bytes) = assembled?;
        let (data, origin) = normalize_link(self.linktype, &bytes)
            .ok_or_else(|| CaptureError::MalformedFrame("unsupported link layer".into()))?;
        Ok(RawFrame::new(timestamp, data, origin))
    }

    fn end_of_output(&mut self, error: Option<io::Error>) {
        self.done = true;
        self.ready.extend(self.assembler.finish());
        if let Some(e) = error {
            self.ready.push_back(Err(e.into()));
        }
    }
}

impl FrameSource for HexDumpSource {
    fn next_frame(&mut self) -> CaptureResult<Option<RawFrame>> {
        while self.ready.is_empty() && !self.done {
            let received = if self.assembler.has_pending() {
                self.lines.recv_timeout(IDLE_FLUSH)
            } else {
                self.lines.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };
            match received {
                Ok(Ok(line)) => self.ready.extend(self.assembler.push_line(&line)),
                Ok(Err(e)) => self.end_of_output(Some(e)),
                Err(RecvTimeoutError::Timeout) => self.ready.extend(self.assembler.finish()),
                Err(RecvTimeoutError::Disconnected) => self.end_of_output(None),
            }
        }

        match self.ready.pop_front() {
            Some(assembled) => self.to_frame(assembled).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::frame::{decode, tests::tcp_frame};
    use crossbeam::channel::Sender;
    use std::io::Cursor;
    use std::time::Instant;

    fn dump(ts: &str, frame: &[u8]) -> String {
        let mut out = format!("{ts} IP 10.0.0.1.5000 > 10.0.0.2.80: Flags [S], length 0\n");
        for (i, row) in frame.chunks(16).enumerate() {
            let groups: Vec<String> = row.chunks(2).map(hex::encode).collect();
            out.push_str(&format!("\t0x{:04x}:  {}\n", i * 16, groups.join(" ")));
        }
        out
    }

    #[test]
    fn test_frames_complete_on_next_header_and_eof() {
        let first = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 80, 0x02, b"");
        let second = tcp_frame([10, 0, 0, 2], [10, 0, 0, 1], 80, 5000, 0x12, b"abc");
        let text = dump("1700000000.500000", &first) + &dump("1700000001.000001", &second);

        let mut source = HexDumpSource::new(Cursor::new(text.into_bytes()), LINKTYPE_ETHERNET);
        let a = source.next_frame().unwrap().unwrap();
        assert_eq!(a.data, first);
        assert_eq!(a.timestamp.timestamp_subsec_micros(), 500_000);

        let b = source.next_frame().unwrap().unwrap();
        assert_eq!(b.data, second);
        assert_eq!(decode(&b.data).unwrap().payload(&b.data), b"abc");
        assert_eq!(b.timestamp.timestamp(), 1_700_000_001);

        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_bad_rows_drop_only_their_frame() {
        let good = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 80, 0x02, b"");
        let text = "1700000000.000001 IP truncated\n\t0x0000:  zzzz 0000\n".to_string() + &dump("1700000000.000002", &good);

        let mut source = HexDumpSource::new(Cursor::new(text.into_bytes()), LINKTYPE_ETHERNET);
        assert!(matches!(source.next_frame(), Err(CaptureError::MalformedFrame(_))));
        assert_eq!(source.next_frame().unwrap().unwrap().data, good);
        assert!(source.next_frame().unwrap().is_none());
    }

    /// A pipe that stays open until the sender is dropped.
    struct OpenPipe {
        chunks: Receiver<Vec<u8>>,
        current: Cursor<Vec<u8>>,
    }

    impl Read for OpenPipe {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            loop {
                let n = self.current.read(out)?;
                if n > 0 {
                    return Ok(n);
                }
                match self.chunks.recv() {
                    Ok(chunk) => self.current = Cursor::new(chunk),
                    Err(_) => return Ok(0),
                }
            }
        }
    }

    fn open_pipe() -> (Sender<Vec<u8>>, HexDumpSource) {
        let (sender, chunks) = channel::unbounded();
        let pipe = OpenPipe { chunks, current: Cursor::new(Vec::new()) };
        (sender, HexDumpSource::new(pipe, LINKTYPE_ETHERNET))
    }

    #[test]
    fn test_single_frame_on_a_quiet_link_is_delivered() {
        // 64 bytes: every row is full, so only the idle gap ends the frame
        let full_rows = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 80, 0x18, b"0123456789");
        assert_eq!(full_rows.len() % ROW_LEN, 0);
        let short_row = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 80, 0x18, b"abc");

        let (pipe, mut source) = open_pipe();
        pipe.send(dump("1700000000.000001", &full_rows).into_bytes()).unwrap();
        let started = Instant::now();
        assert_eq!(source.next_frame().unwrap().unwrap().data, full_rows);
        assert!(started.elapsed() < Duration::from_secs(2));

        pipe.send(dump("1700000000.000002", &short_row).into_bytes()).unwrap();
        assert_eq!(source.next_frame().unwrap().unwrap().data, short_row);

        drop(pipe);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_short_row_completes_the_frame() {
        let mut assembler = HexDumpAssembler::default();
        assert!(assembler.push_line("1700000000.000001 IP x > y").is_none());
        assert!(assembler.push_line("\t0x0000:  0011 2233 4455 6677 8899 aabb ccdd eeff").is_none());
        let (_, bytes) = assembler.push_line("\t0x0010:  0102").unwrap().unwrap();
        assert_eq!(bytes.len(), 18);
        assert!(!assembler.has_pending());
    }

    #[test]
    fn test_rows_before_any_header_are_ignored() {
        let mut assembler = HexDumpAssembler::default();
        assert!(assembler.push_line("\t0x0000:  4500 0034").is_none());
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_hex_row("\t0x0000:  0011 2233 44"), Some(vec![0x00, 0x11, 0x22, 0x33, 0x44]));
        assert_eq!(parse_hex_row("\t0x0000:  001122"), None);
        assert_eq!(parse_hex_row("\tlisting:  00"), None);
        assert_eq!(parse_epoch("12.5").unwrap().timestamp_subsec_millis(), 500);
        assert!(parse_epoch("12:00:01.000").is_none());
    }

    #[test]
    fn test_arguments() {
        let config = CaptureConfig {
            promiscuous: false,
            filter: Some("tcp port 80".into()),
            ..Default::default()
        };
        assert_eq!(
            TcpdumpBackend::arguments(&config, "eth0"),
            vec!["-l", "-n", "-tt", "-xx", "-i", "eth0", "-p", "tcp", "port", "80"]
        );
    }
}
