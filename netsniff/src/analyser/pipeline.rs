//! Turns raw frames into packet records.
use std::net::Ipv4Addr;

use super::containers::{PacketRecord, RawFrame, RecordParts};
use super::decrypt::{Decryptor, NoDecryption, TlsRecordSniffer};
use super::frame;
use super::protocol;
use crate::config::CaptureConfig;

/// The decode → filter → decrypt → detect chain run by the consumer thread.
pub struct FramePipeline {
    target: Option<Ipv4Addr>,
    decryptor: Box<dyn Decryptor>,
}

impl FramePipeline {
    pub fn new(config: &CaptureConfig) -> Self {
        let decryptor: Box<dyn Decryptor> = if config.detect_encryption {
            Box::new(TlsRecordSniffer)
        } else {
            Box::new(NoDecryption)
        };
        Self::with_decryptor(config, decryptor)
    }

    pub fn with_decryptor(config: &CaptureConfig, decryptor: Box<dyn Decryptor>) -> Self {
        Self {
            target: config.target_ip,
            decryptor,
        }
    }

    /// Applies the target filter to a record produced outside the frame chain.
    pub fn admit(&self, record: PacketRecord) -> Option<PacketRecord> {
        match self.target {
            Some(target) if record.source_ip != target && record.dest_ip != target => None,
            _ => Some(record),
        }
    }

    /// Builds a record from `raw`, or `None` if it is malformed, not IPv4, or
    /// does not involve the configured target.
    pub fn process(&self, raw: RawFrame) -> Option<PacketRecord> {
        let decoded = frame::decode(&raw.data)?;

        if let Some(target) = self.target {
            if !decoded.involves(target) {
                return None;
            }
        }

        let payload = decoded.payload(&raw.data);
        let attempt = if payload.is_empty() {
            Default::default()
        } else {
            self.decryptor.attempt(payload, decoded.source_ip, decoded.dest_ip)
        };
        let info = protocol::detect(payload, &decoded.transport, attempt.cleartext.as_deref());

        let mut flags = decoded.tcp_flag_names();
        if !info.extracted_credentials.is_empty() {
            flags.push("CREDENTIALS".into());
        }
        if attempt.info.as_ref().map_or(false, |i| i.was_encrypted) {
            flags.push("ENCRYPTED".into());
        }

        let mut record = PacketRecord::new(RecordParts {
            timestamp: raw.timestamp,
            source_ip: decoded.source_ip,
            dest_ip: decoded.dest_ip,
            ports: decoded.transport.ports(),
            protocol_name: decoded.transport.name(),
            raw_bytes: raw.data,
            origin: raw.origin,
        });
        record.decrypted_bytes = attempt.cleartext;
        record.decryption_info = attempt.info;
        record.protocol_info = Some(info);
        record.flags = flags;
        Some(record)
    }
}
