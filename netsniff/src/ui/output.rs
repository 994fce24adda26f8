use ansi_term::Colour;
use netsniff::analyser::containers::{FrameOrigin, PacketRecord};
use netsniff::capture::interfaces::NetworkInterface;
use netsniff::capture::session::{AttemptOutcome, ProducerKind, StartReport};

pub fn print_report(report: &StartReport) {
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Capture");
    println!("\u{2503}");
    let producer = match &report.producer {
        ProducerKind::Backend(name) => Colour::Green.paint(*name),
        ProducerKind::LocalMonitor => Colour::Yellow.paint("local activity monitor"),
    };
    println!("\u{2503} Producer   : {producer}");
    if let Some(interface) = &report.interface {
        println!("\u{2503} Interface  : {}", Colour::Fixed(226).paint(interface));
    }
    for attempt in &report.attempts {
        let outcome = match attempt.outcome {
            AttemptOutcome::Selected => Colour::Green.paint(attempt.outcome.to_string()),
            AttemptOutcome::NotInstalled => Colour::Fixed(244).paint(attempt.outcome.to_string()),
            _ => Colour::Red.paint(attempt.outcome.to_string()),
        };
        println!("\u{2503}   {:<10} {outcome}", attempt.backend);
    }
    if report.reduced_fidelity {
        println!("\u{2503} {}", Colour::Yellow.paint("Reduced fidelity: a backend was refused capture privileges"));
    }
    if report.degraded() {
        println!("\u{2503} {}", Colour::Yellow.paint("Degraded: records are inferred from the connection table"));
    }
    println!("\u{2503}");
}

pub fn print_interfaces(interfaces: &[NetworkInterface]) {
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Interfaces");
    println!("\u{2503}");
    for interface in interfaces {
        let state = if interface.is_up {
            Colour::Green.paint("up")
        } else {
            Colour::Red.paint("down")
        };
        let loopback = if interface.is_loopback { " (loopback)" } else { "" };
        println!("\u{2503} {:<16} {state}{loopback}", interface.name);
    }
    println!("\u{2503}");
}

fn endpoint(ip: &std::net::Ipv4Addr, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{ip}:{port}"),
        None => ip.to_string(),
    }
}

/// One line per record, without colour.
pub fn record_summary(record: &PacketRecord) -> String {
    let mut line = format!(
        "#{:<5} {} {:<5} {:>21} -> {:<21} {:<7} {:>5}B",
        record.id,
        record.timestamp.format("%H:%M:%S%.3f"),
        record.protocol_name,
        endpoint(&record.source_ip, record.source_port),
        endpoint(&record.dest_ip, record.dest_port),
        record.application_protocol(),
        record.length,
    );
    if !record.flags.is_empty() {
        line.push_str(&format!(" [{}]", record.flags.join(",")));
    }
    line
}

pub fn print_record(record: &PacketRecord, reveal_credentials: bool) {
    let summary = record_summary(record);
    let painted = match record.origin {
        FrameOrigin::Wire => Colour::White.paint(summary),
        FrameOrigin::Reconstructed => Colour::Cyan.paint(summary),
        FrameOrigin::LocalMonitor | FrameOrigin::Demonstration => Colour::Fixed(244).paint(summary),
    };
    println!("{painted}");

    let shown = if reveal_credentials { record.clone() } else { record.redacted() };
    for credential in shown.credentials() {
        let secret = credential
            .password
            .as_deref()
            .or(credential.token.as_deref())
            .unwrap_or("");
        println!(
            "        {} {} {} {}",
            Colour::Red.bold().paint("credential"),
            Colour::Fixed(226).paint(&credential.kind),
            credential.username.as_deref().unwrap_or("-"),
            secret
        );
    }
}

/// Headers, decryption result and a hex dump of the frame.
pub fn print_detail(record: &PacketRecord, reveal_credentials: bool) {
    let shown = if reveal_credentials { record.clone() } else { record.redacted() };
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Packet {}", Colour::Red.paint(shown.id.to_string()));
    println!("\u{2503} {}", record_summary(&shown));
    println!("\u{2503} Origin     : {}", shown.origin);
    if let Some(info) = &shown.protocol_info {
        for (name, value) in &info.parsed_headers {
            println!("\u{2503}   {name}: {}", Colour::Fixed(226).paint(value));
        }
    }
    if let Some(info) = shown.decryption_info.as_ref().filter(|i| i.was_encrypted) {
        println!(
            "\u{2503} Encrypted  : {} via {} ({:.0}%)",
            info.encryption_type,
            info.method,
            info.confidence * 100.0
        );
    }
    for line in hex_dump(&shown.raw_bytes).lines() {
        println!("\u{2503} {line}");
    }
    println!("\u{2503}");
}

/// 16 bytes per row: offset, hex, printable ASCII.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!("{:04x}  {:<47}  {ascii}", row * 16, hex.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn record_as_json(record: &PacketRecord, reveal_credentials: bool) -> serde_json::Result<String> {
    if reveal_credentials {
        serde_json::to_string(record)
    } else {
        serde_json::to_string(&record.redacted())
    }
}
