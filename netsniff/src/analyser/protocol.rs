//! Application protocol classification and shallow parsing.
//!
//! Payloads come straight off the wire, so nothing in here returns an error:
//! whatever cannot be understood is reported as "Unknown".
use lazy_static::lazy_static;
use std::collections::HashSet;

use super::containers::{HttpRequest, HttpResponse, ProtocolInfo};
use super::credentials;
use super::frame::Transport;

lazy_static! {
    static ref HTTP_METHODS: HashSet<&'static str> = [
        "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
    ]
    .into_iter()
    .collect();
}

/// Longest DNS name we bother to assemble.
const DNS_MAX_NAME: usize = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AppProtocol {
    Http,
    Https,
    Dns,
    Ssh,
}

fn by_port(port: u16) -> Option<AppProtocol> {
    match port {
        80 | 8080 => Some(AppProtocol::Http),
        443 => Some(AppProtocol::Https),
        53 => Some(AppProtocol::Dns),
        22 => Some(AppProtocol::Ssh),
        _ => None,
    }
}

/// Classifies `payload` by port and content.
///
/// The destination port decides first; the source port is consulted so that
/// server responses are labelled too. `cleartext` is what a decryption hook
/// recovered, if anything.
pub fn detect(payload: &[u8], transport: &Transport, cleartext: Option<&[u8]>) -> ProtocolInfo {
    let (src_port, dst_port) = match transport.ports() {
        Some(ports) => ports,
        None => return ProtocolInfo::unknown(),
    };

    match by_port(dst_port).or_else(|| by_port(src_port)) {
        Some(AppProtocol::Http) => parse_http(payload, "HTTP").unwrap_or_else(ProtocolInfo::unknown),
        Some(AppProtocol::Https) => cleartext
            .and_then(|text| parse_http(text, "HTTPS"))
            .unwrap_or_else(|| ProtocolInfo::labelled("HTTPS")),
        Some(AppProtocol::Dns) => parse_dns(payload, transport.is_tcp()),
        Some(AppProtocol::Ssh) => parse_ssh(payload),
        None => ProtocolInfo::unknown(),
    }
}

/// Start line plus headers up to the first blank line.
///
/// An empty payload (bare SYN/ACK) keeps the label with no headers; text
/// that does not open with a request or status line is not HTTP.
fn parse_http(payload: &[u8], label: &str) -> Option<ProtocolInfo> {
    let mut info = ProtocolInfo::labelled(label);
    if payload.is_empty() {
        return Some(info);
    }

    let mut lines = header_block(payload).split('\n').map(|l| l.trim_end_matches('\r'));
    let start = lines.next()?;

    if let Some(response) = parse_status_line(start) {
        info.response = Some(response);
    } else if let Some(request) = parse_request_line(start) {
        info.request = Some(request);
    } else {
        return None;
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() {
            continue;
        }

        if name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("proxy-authorization") {
            info.extracted_credentials.extend(credentials::from_authorization(value));
        } else if name.eq_ignore_ascii_case("cookie") {
            info.extracted_credentials.extend(credentials::from_cookie(value));
        }

        info.parsed_headers
            .entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    Some(info)
}

/// Text before the first blank line. The body may be binary and the
/// block may be cut mid-character by segmentation, so only the valid
/// UTF-8 prefix is kept.
fn header_block(payload: &[u8]) -> &str {
    let end = payload.windows(4).position(|w| w == b"\r\n\r\n").unwrap_or(payload.len());
    let block = &payload[..end];
    match std::str::from_utf8(block) {
        Ok(text) => text,
        Err(e) => std::str::from_utf8(&block[..e.valid_up_to()]).unwrap_or_default(),
    }
}

fn parse_request_line(line: &str) -> Option<HttpRequest> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;
    if !HTTP_METHODS.contains(method) || !version.starts_with("HTTP/") || parts.next().is_some() {
        return None;
    }
    Some(HttpRequest {
        method: method.into(),
        path: path.into(),
        version: version.into(),
    })
}

fn parse_status_line(line: &str) -> Option<HttpResponse> {
    let (version, rest) = line.split_once(' ')?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    let status_code = code.parse::<u16>().ok().filter(|c| (100..1000).contains(c))?;
    Some(HttpResponse {
        version: version.into(),
        status_code,
        reason: reason.trim().into(),
    })
}

fn dns_type_name(qtype: u16) -> String {
    match qtype {
        1 => "A".into(),
        2 => "NS".into(),
        5 => "CNAME".into(),
        6 => "SOA".into(),
        12 => "PTR".into(),
        15 => "MX".into(),
        16 => "TXT".into(),
        28 => "AAAA".into(),
        33 => "SRV".into(),
        65 => "HTTPS".into(),
        255 => "ANY".into(),
        other => format!("TYPE{other}"),
    }
}

/// Header and first question of a DNS message. Whatever is readable is kept.
fn parse_dns(payload: &[u8], over_tcp: bool) -> ProtocolInfo {
    let mut info = ProtocolInfo::labelled("DNS");
    // DNS over TCP is prefixed with a two-byte message length
    let message = if over_tcp { payload.get(2..).unwrap_or(&[]) } else { payload };
    let Some(header) = message.get(..12) else {
        return info;
    };

    let id = u16::from_be_bytes([header[0], header[1]]);
    let flags = u16::from_be_bytes([header[2], header[3]]);
    let questions = u16::from_be_bytes([header[4], header[5]]);
    let answers = u16::from_be_bytes([header[6], header[7]]);

    let headers = &mut info.parsed_headers;
    headers.insert("Transaction ID".into(), format!("0x{id:04x}"));
    headers.insert("Type".into(), if flags & 0x8000 != 0 { "Response" } else { "Query" }.into());
    headers.insert("Questions".into(), questions.to_string());
    headers.insert("Answers".into(), answers.to_string());

    if questions == 0 {
        return info;
    }
    if let Some((name, end)) = read_qname(message, 12) {
        headers.insert("Query".into(), name);
        if let Some(qtype) = message.get(end..end + 2) {
            headers.insert("Query Type".into(), dns_type_name(u16::from_be_bytes([qtype[0], qtype[1]])));
        }
    }
    info
}

/// Reads an uncompressed name starting at `at`; returns it and the offset after it.
fn read_qname(message: &[u8], mut at: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut total = 0usize;
    loop {
        let len = *message.get(at)? as usize;
        at += 1;
        if len == 0 {
            break;
        }
        // Compression pointers never appear in a first question; treat as malformed
        if len & 0xc0 != 0 {
            return None;
        }
        total += len + 1;
        if total > DNS_MAX_NAME {
            return None;
        }
        let label = message.get(at..at + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        at += len;
    }
    let name = if labels.is_empty() { ".".to_string() } else { labels.join(".") };
    Some((name, at))
}

fn parse_ssh(payload: &[u8]) -> ProtocolInfo {
    let mut info = ProtocolInfo::labelled("SSH");
    if payload.starts_with(b"SSH-") {
        let banner = payload.split(|b| *b == b'\n').next().unwrap_or(payload);
        if let Ok(banner) = std::str::from_utf8(banner) {
            info.parsed_headers.insert("Banner".into(), banner.trim_end_matches('\r').to_string());
        }
    }
    info
}
