//! Extension point for payload decryption.
//!
//! Nothing here holds key material. A real decryptor plugs in through
//! [`Decryptor`] without the rest of the pipeline changing.
use std::net::Ipv4Addr;

use super::containers::DecryptionInfo;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecryptionAttempt {
    pub cleartext: Option<Vec<u8>>,
    pub info: Option<DecryptionInfo>,
}

/// Called once per payload on the consumer thread, so it must return promptly.
pub trait Decryptor: Send + Sync {
    fn attempt(&self, payload: &[u8], source: Ipv4Addr, dest: Ipv4Addr) -> DecryptionAttempt;
}

/// Default hook: reports every payload as plaintext.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDecryption;

impl Decryptor for NoDecryption {
    fn attempt(&self, _payload: &[u8], _source: Ipv4Addr, _dest: Ipv4Addr) -> DecryptionAttempt {
        DecryptionAttempt {
            cleartext: None,
            info: Some(DecryptionInfo::plaintext()),
        }
    }
}

/// Recognizes TLS records without decrypting them.
#[derive(Clone, Copy, Debug, Default)]
pub struct TlsRecordSniffer;

impl TlsRecordSniffer {
    fn version_name(major: u8, minor: u8) -> Option<&'static str> {
        match (major, minor) {
            (3, 0) => Some("SSL 3.0"),
            (3, 1) => Some("TLS 1.0"),
            (3, 2) => Some("TLS 1.1"),
            // TLS 1.3 records advertise 1.2 on the wire
            (3, 3) => Some("TLS 1.2+"),
            (3, 4) => Some("TLS 1.3"),
            _ => None,
        }
    }
}

impl Decryptor for TlsRecordSniffer {
    fn attempt(&self, payload: &[u8], source: Ipv4Addr, dest: Ipv4Addr) -> DecryptionAttempt {
        let header = match payload.get(..5) {
            Some(h) => h,
            None => return NoDecryption.attempt(payload, source, dest),
        };
        let content_type = header[0];
        let version = Self::version_name(header[1], header[2]);
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;

        match (content_type, version) {
            (0x14..=0x17, Some(name)) => {
                // A record length that matches the segment is a stronger signal
                let confidence = if record_len + 5 <= payload.len() { 0.9 } else { 0.6 };
                let method = if content_type == 0x17 { "application data" } else { "handshake" };
                DecryptionAttempt {
                    cleartext: None,
                    info: Some(DecryptionInfo {
                        was_encrypted: true,
                        encryption_type: name.into(),
                        method: format!("record header ({method})"),
                        confidence,
                    }),
                }
            }
            _ => NoDecryption.attempt(payload, source, dest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn default_hook_is_a_no_op() {
        let attempt = NoDecryption.attempt(b"\x17\x03\x03\x00\x10", A, B);
        assert_eq!(attempt.cleartext, None);
        assert!(!attempt.info.unwrap().was_encrypted);
    }

    #[test]
    fn tls_application_data_is_flagged() {
        let mut payload = vec![0x17, 0x03, 0x03, 0x00, 0x04];
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let attempt = TlsRecordSniffer.attempt(&payload, A, B);
        assert_eq!(attempt.cleartext, None);

        let info = attempt.info.unwrap();
        assert!(info.was_encrypted);
        assert_eq!(info.encryption_type, "TLS 1.2+");
        assert!(info.confidence > 0.8);
    }

    #[test]
    fn plaintext_is_not_flagged() {
        let attempt = TlsRecordSniffer.attempt(b"GET / HTTP/1.1\r\n", A, B);
        assert!(!attempt.info.unwrap().was_encrypted);

        let attempt = TlsRecordSniffer.attempt(b"\x16", A, B);
        assert!(!attempt.info.unwrap().was_encrypted);
    }
}
