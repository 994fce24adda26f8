//! Fixed demonstration records, used only when no backend could start and
//! the caller asked for something to look at anyway.
use chrono::Utc;
use std::net::Ipv4Addr;

use crate::analyser::containers::{synthetic_frame_bytes, FrameOrigin, PacketRecord, ProtocolInfo, RecordParts};
use crate::store::PacketStore;

struct DemoFlow {
    source: [u8; 4],
    dest: [u8; 4],
    ports: (u16, u16),
    transport: &'static str,
    application: &'static str,
}

const FLOWS: [DemoFlow; 4] = [
    DemoFlow { source: [192, 168, 1, 100], dest: [93, 184, 216, 34], ports: (52311, 80), transport: "TCP", application: "HTTP" },
    DemoFlow { source: [192, 168, 1, 100], dest: [142, 250, 72, 14], ports: (52312, 443), transport: "TCP", application: "HTTPS" },
    DemoFlow { source: [192, 168, 1, 100], dest: [8, 8, 8, 8], ports: (53011, 53), transport: "UDP", application: "DNS" },
    DemoFlow { source: [192, 168, 1, 100], dest: [192, 168, 1, 1], ports: (52313, 22), transport: "TCP", application: "SSH" },
];

pub fn demonstration_records() -> Vec<PacketRecord> {
    FLOWS
        .iter()
        .map(|flow| {
            let source_ip = Ipv4Addr::from(flow.source);
            let dest_ip = Ipv4Addr::from(flow.dest);
            let description = format!(
                "demonstration record: {} {}:{} -> {}:{} ({})",
                flow.transport, source_ip, flow.ports.0, dest_ip, flow.ports.1, flow.application
            );
            let mut record = PacketRecord::new(RecordParts {
                timestamp: Utc::now(),
                source_ip,
                dest_ip,
                ports: Some(flow.ports),
                protocol_name: flow.transport.into(),
                raw_bytes: synthetic_frame_bytes(&description),
                origin: FrameOrigin::Demonstration,
            });
            record.protocol_info = Some(ProtocolInfo::labelled(flow.application));
            record.flags = vec!["SYNTHETIC".into()];
            record
        })
        .collect()
}

/// Appends the demonstration set. Only call with no session producing into `store`.
pub fn populate(store: &PacketStore) -> usize {
    let records = demonstration_records();
    let count = records.len();
    for record in records {
        store.append(record);
    }
    log::warn!("Loaded {count} demonstration records; these are not captured traffic");
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_records_are_synthetic() {
        let store = PacketStore::default();
        assert_eq!(populate(&store), 4);
        for record in store.snapshot() {
            assert_eq!(record.origin, FrameOrigin::Demonstration);
            assert_eq!(record.length, record.raw_bytes.len());
            assert!(crate::analyser::frame::decode(&record.raw_bytes).is_none());
        }
        let mut out = Vec::new();
        assert_eq!(store.export(&mut out).unwrap(), 0);
    }
}
