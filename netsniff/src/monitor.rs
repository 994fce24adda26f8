//! Local activity monitor: a degraded producer that infers traffic from the
//! OS connection table when wire capture is unavailable.
//!
//! Records built here carry a placeholder link header and a text body, never
//! real wire bytes, and are tagged [`FrameOrigin::LocalMonitor`].
use chrono::Utc;
#[cfg(target_os = "linux")]
use procfs::net::{TcpNetEntries, TcpNetEntry, TcpState, UdpNetEntries, UdpNetEntry, UdpState};
#[cfg(target_os = "linux")]
use procfs::FromReadSI;
use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
#[cfg(target_os = "linux")]
use std::net::SocketAddr;
#[cfg(target_os = "linux")]
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::analyser::containers::{synthetic_frame_bytes, FrameOrigin, PacketRecord, ProtocolInfo, RecordParts};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Udp,
}

/// One established connection as seen by the OS.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Connection {
    pub kind: SocketKind,
    pub local: (Ipv4Addr, u16),
    pub remote: (Ipv4Addr, u16),
}

/// Source of established connections.
pub trait ConnectionTable: Send + Sync {
    fn established(&self) -> io::Result<Vec<Connection>>;
}

/// Reads `/proc/net/tcp` and `/proc/net/udp` through procfs.
#[cfg(target_os = "linux")]
pub struct ProcNetTable {
    /// `None` reads the live tables.
    root: Option<PathBuf>,
}

#[cfg(target_os = "linux")]
impl ProcNetTable {
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Reads `tcp` and `udp` tables from `root` instead of `/proc/net`.
    pub fn at(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }

    fn tcp(&self) -> procfs::ProcResult<Vec<TcpNetEntry>> {
        match &self.root {
            Some(root) => TcpNetEntries::from_file(root.join("tcp"), procfs::current_system_info()).map(|t| t.0),
            None => procfs::net::tcp(),
        }
    }

    fn udp(&self) -> procfs::ProcResult<Vec<UdpNetEntry>> {
        match &self.root {
            Some(root) => UdpNetEntries::from_file(root.join("udp"), procfs::current_system_info()).map(|t| t.0),
            None => procfs::net::udp(),
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcNetTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl ConnectionTable for ProcNetTable {
    fn established(&self) -> io::Result<Vec<Connection>> {
        let tcp = self.tcp().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut connections: Vec<Connection> = tcp
            .iter()
            .filter(|entry| entry.state == TcpState::Established)
            .filter_map(|entry| connection(SocketKind::Tcp, entry.local_address, entry.remote_address))
            .collect();
        // UDP is optional; connected sockets there are a bonus
        match self.udp() {
            Ok(udp) => connections.extend(
                udp.iter()
                    .filter(|entry| entry.state == UdpState::Established)
                    .filter_map(|entry| connection(SocketKind::Udp, entry.local_address, entry.remote_address)),
            ),
            Err(e) => log::debug!("No UDP connection table: {e}"),
        }
        Ok(connections)
    }
}

/// `netstat -an`, for systems without procfs.
pub struct NetstatTable;

impl ConnectionTable for NetstatTable {
    fn established(&self) -> io::Result<Vec<Connection>> {
        let output = Command::new("netstat").arg("-an").output()?;
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::Other, "netstat exited with an error"));
        }
        Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// procfs when present, netstat otherwise.
pub fn system_table() -> Arc<dyn ConnectionTable> {
    #[cfg(target_os = "linux")]
    {
        if Path::new("/proc/net/tcp").exists() {
            return Arc::new(ProcNetTable::new());
        }
    }
    Arc::new(NetstatTable)
}

/// IPv4 endpoints with a known peer; IPv6 and unconnected sockets are skipped.
#[cfg(target_os = "linux")]
fn connection(kind: SocketKind, local: SocketAddr, remote: SocketAddr) -> Option<Connection> {
    match (local, remote) {
        (SocketAddr::V4(local), SocketAddr::V4(remote)) if !remote.ip().is_unspecified() => Some(Connection {
            kind,
            local: (*local.ip(), local.port()),
            remote: (*remote.ip(), remote.port()),
        }),
        _ => None,
    }
}

/// `10.0.0.2:443`, `10.0.0.2.443` (BSD) → endpoint.
fn parse_netstat_endpoint(text: &str) -> Option<(Ipv4Addr, u16)> {
    let (addr, port) = text.rsplit_once(':').or_else(|| text.rsplit_once('.'))?;
    Some((addr.parse().ok()?, port.parse().ok()?))
}

fn parse_netstat(text: &str) -> Vec<Connection> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let proto = fields.first()?.to_ascii_lowercase();
            let kind = match proto.as_str() {
                "tcp" | "tcp4" => SocketKind::Tcp,
                "udp" | "udp4" => SocketKind::Udp,
                _ => return None,
            };
            if kind == SocketKind::Tcp && !fields.iter().any(|f| f.eq_ignore_ascii_case("ESTABLISHED")) {
                return None;
            }
            let mut endpoints = fields.iter().filter_map(|f| parse_netstat_endpoint(f));
            let local = endpoints.next()?;
            let remote = endpoints.next()?;
            if remote.0.is_unspecified() {
                return None;
            }
            Some(Connection { kind, local, remote })
        })
        .collect()
}

/// Application protocol guessed from a well-known remote port.
pub fn infer_protocol(port: u16) -> &'static str {
    match port {
        20 | 21 => "FTP",
        22 => "SSH",
        23 => "Telnet",
        25 | 587 => "SMTP",
        53 => "DNS",
        80 | 8080 => "HTTP",
        110 => "POP3",
        143 => "IMAP",
        443 | 8443 => "HTTPS",
        993 => "IMAPS",
        995 => "POP3S",
        1883 => "MQTT",
        3306 => "MySQL",
        3389 => "RDP",
        5432 => "PostgreSQL",
        6379 => "Redis",
        27017 => "MongoDB",
        _ => "Unknown",
    }
}

const CANCEL_CHECK: Duration = Duration::from_millis(50);

/// Turns connection-table snapshots into synthetic records.
///
/// Each connection is reported once when first seen; one that disappears
/// and later comes back is reported again.
pub struct LocalActivityMonitor {
    table: Arc<dyn ConnectionTable>,
    seen: HashSet<Connection>,
}

impl LocalActivityMonitor {
    pub fn new(table: Arc<dyn ConnectionTable>) -> Self {
        Self {
            table,
            seen: HashSet::new(),
        }
    }

    /// Records for connections that appeared since the previous poll.
    pub fn poll(&mut self) -> io::Result<Vec<PacketRecord>> {
        let current: Vec<Connection> = self.table.established()?;
        let fresh: Vec<PacketRecord> = current
            .iter()
            .filter(|c| !self.seen.contains(*c))
            .map(synthesize)
            .collect();
        self.seen = current.into_iter().collect();
        Ok(fresh)
    }

    /// Polls every `interval` until `cancel` is raised or `emit` returns false.
    ///
    /// A failed poll is logged and retried on the next tick.
    pub fn run(&mut self, interval: Duration, cancel: &AtomicBool, mut emit: impl FnMut(PacketRecord) -> bool) {
        log::info!("Local activity monitor polling every {}ms", interval.as_millis());
        while !cancel.load(Ordering::SeqCst) {
            match self.poll() {
                Ok(records) => {
                    for record in records {
                        if !emit(record) {
                            return;
                        }
                    }
                }
                Err(e) => log::warn!("Could not read the connection table: {e}"),
            }

            let wake = Instant::now() + interval;
            while Instant::now() < wake {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(CANCEL_CHECK.min(wake.saturating_duration_since(Instant::now())));
            }
        }
    }
}

fn synthesize(connection: &Connection) -> PacketRecord {
    let application = infer_protocol(connection.remote.1);
    let transport = match connection.kind {
        SocketKind::Tcp => "TCP",
        SocketKind::Udp => "UDP",
    };
    let description = format!(
        "local activity: {transport} {}:{} -> {}:{} ({application}), inferred from the OS connection table",
        connection.local.0, connection.local.1, connection.remote.0, connection.remote.1
    );

    let mut record = PacketRecord::new(RecordParts {
        timestamp: Utc::now(),
        source_ip: connection.local.0,
        dest_ip: connection.remote.0,
        ports: Some((connection.local.1, connection.remote.1)),
        protocol_name: transport.into(),
        raw_bytes: synthetic_frame_bytes(&description),
        origin: FrameOrigin::LocalMonitor,
    });
    record.protocol_info = Some(ProtocolInfo::labelled(application));
    record.flags = vec!["SYNTHETIC".into()];
    record
}
