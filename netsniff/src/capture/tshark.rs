//! tshark backend, driven through rtshark.
//!
//! tshark hands us dissected fields rather than bytes, so each packet is
//! rebuilt into an Ethernet/IPv4 frame from those fields and marked as
//! reconstructed.
use chrono::{DateTime, TimeZone, Utc};
use rtshark::{Packet, RTShark};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use super::backend::{CaptureBackend, FrameSource, Launched, ProcessHandle, ToolLocator};
use crate::analyser::containers::{FrameOrigin, RawFrame};
use crate::analyser::frame::{build_frame, FrameSpec, IPPROTO_TCP, IPPROTO_UDP};
use crate::config::CaptureConfig;
use crate::error::{looks_like_privilege_error, CaptureError, CaptureResult};

const NAME: &str = "tshark";

const KNOWN_PATHS: &[&str] = &[
    "/usr/bin/tshark",
    "/usr/local/bin/tshark",
    "/opt/homebrew/bin/tshark",
    "/Applications/Wireshark.app/Contents/MacOS/tshark",
    "C:\\Program Files\\Wireshark\\tshark.exe",
];

/// Read access to dissected fields, so reconstruction does not depend on a live tshark.
pub trait PacketFields {
    fn field(&self, layer: &str, name: &str) -> Option<&str>;
    fn captured_at_micros(&self) -> Option<i64>;
}

impl PacketFields for Packet {
    fn field(&self, layer: &str, name: &str) -> Option<&str> {
        self.layer_name(layer)?.metadata(name).map(|m| m.value())
    }

    fn captured_at_micros(&self) -> Option<i64> {
        self.timestamp_micros()
    }
}

pub struct TsharkBackend;

impl CaptureBackend for TsharkBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn locate(&self, locator: &ToolLocator) -> Option<PathBuf> {
        locator.locate("tshark", KNOWN_PATHS)
    }

    fn launch(&self, executable: &Path, config: &CaptureConfig, interface: &str) -> CaptureResult<Launched> {
        if config.admin {
            log::warn!("tshark cannot be elevated directly; relying on dumpcap's own capture rights");
        }
        let filter = config.effective_filter();
        // rtshark resolves tshark through PATH, so point it at the directory we found
        let search_dir = executable.parent().map(|p| p.to_string_lossy().into_owned());

        let mut builder = rtshark::RTSharkBuilder::builder().input_path(interface).live_capture();
        if let Some(filter) = filter.as_deref() {
            builder = builder.capture_filter(filter);
        }
        if let Some(dir) = search_dir.as_deref() {
            builder = builder.env_path(dir);
        }

        log::info!("Starting {NAME} on {interface}");
        let rtshark = builder.spawn().map_err(|source| {
            if looks_like_privilege_error(&source.to_string()) {
                CaptureError::PrivilegeDenied { backend: NAME, detail: source.to_string() }
            } else {
                CaptureError::SpawnFailed { backend: NAME, source }
            }
        })?;

        let handle = rtshark.pid().map(ProcessHandle::Pid).unwrap_or(ProcessHandle::None);
        Ok(Launched {
            source: Box::new(TsharkSource { rtshark }),
            handle,
            diagnostics: None,
        })
    }
}

struct TsharkSource {
    rtshark: RTShark,
}

impl FrameSource for TsharkSource {
    fn next_frame(&mut self) -> CaptureResult<Option<RawFrame>> {
        match self.rtshark.read() {
            Ok(Some(packet)) => reconstruct(&packet).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                let detail = e.to_string();
                if looks_like_privilege_error(&detail) {
                    Err(CaptureError::PrivilegeDenied { backend: NAME, detail })
                } else {
                    Err(CaptureError::SubprocessCrash { backend: NAME, detail })
                }
            }
        }
    }
}

impl Drop for TsharkSource {
    fn drop(&mut self) {
        self.rtshark.kill();
    }
}

fn parse_number<T: TryFrom<u64>>(value: &str) -> Option<T> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => value.parse::<u64>().ok()?,
    };
    T::try_from(parsed).ok()
}

fn parse_mac(value: Option<&str>) -> [u8; 6] {
    let mut mac = [0u8; 6];
    if let Some(Ok(bytes)) = value.map(|v| hex::decode(v.replace(':', ""))) {
        if bytes.len() == 6 {
            mac.copy_from_slice(&bytes);
        }
    }
    mac
}

fn parse_hex_payload(value: &str) -> Option<Vec<u8>> {
    hex::decode(value.trim().replace(':', "")).ok()
}

fn timestamp_of(fields: &impl PacketFields) -> DateTime<Utc> {
    fields
        .captured_at_micros()
        .and_then(|us| {
            let nanos = (us.rem_euclid(1_000_000) * 1000) as u32;
            Utc.timestamp_opt(us.div_euclid(1_000_000), nanos).single()
        })
        .unwrap_or_else(Utc::now)
}

/// Rebuilds the frame tshark dissected. Non-IPv4 packets are reported as malformed.
pub fn reconstruct(fields: &impl PacketFields) -> CaptureResult<RawFrame> {
    let ip = |name: &str| -> Option<Ipv4Addr> { fields.field("ip", name)?.parse().ok() };
    let (source_ip, dest_ip) = match (ip("ip.src"), ip("ip.dst")) {
        (Some(src), Some(dst)) => (src, dst),
        _ => return Err(CaptureError::MalformedFrame("no IPv4 layer in dissection".into())),
    };
    let protocol: u8 = fields
        .field("ip", "ip.proto")
        .and_then(parse_number)
        .ok_or_else(|| CaptureError::MalformedFrame("missing ip.proto".into()))?;
    let ttl: u8 = fields.field("ip", "ip.ttl").and_then(parse_number).unwrap_or(64);

    let layer = match protocol {
        IPPROTO_TCP => Some("tcp"),
        IPPROTO_UDP => Some("udp"),
        _ => None,
    };
    let ports = match layer {
        Some(layer) => {
            let port = |name: String| fields.field(layer, &name).and_then(parse_number::<u16>);
            match (port(format!("{layer}.srcport")), port(format!("{layer}.dstport"))) {
                (Some(src), Some(dst)) => Some((src, dst)),
                _ => return Err(CaptureError::MalformedFrame(format!("{layer} layer without ports"))),
            }
        }
        None => None,
    };
    let tcp_flags: u8 = fields.field("tcp", "tcp.flags").and_then(parse_number).unwrap_or(0);

    let payload_field = layer
        .and_then(|l| fields.field(l, &format!("{l}.payload")))
        .or_else(|| fields.field("data", "data.data"));
    let payload = match payload_field {
        Some(text) => parse_hex_payload(text).unwrap_or_else(|| {
            log::debug!("tshark: undecodable payload field, keeping headers only");
            Vec::new()
        }),
        None => Vec::new(),
    };

    let data = build_frame(&FrameSpec {
        source_mac: parse_mac(fields.field("eth", "eth.src")),
        dest_mac: parse_mac(fields.field("eth", "eth.dst")),
        source_ip,
        dest_ip,
        protocol,
        ports,
        tcp_flags,
        ttl,
        payload: &payload,
    })?;
    Ok(RawFrame::new(timestamp_of(fields), data, FrameOrigin::Reconstructed))
}
