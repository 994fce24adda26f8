//! Getting frames: backend discovery and launch, output decoding, and the
//! session that ties a producer to the store.
pub mod backend;
pub mod demo;
pub mod dumpcap;
pub mod interfaces;
pub mod pcap_stream;
pub mod session;
pub mod tcpdump;
pub mod tshark;

use backend::CaptureBackend;

/// tshark, then tcpdump, then dumpcap.
pub fn default_backends() -> Vec<Box<dyn CaptureBackend>> {
    vec![
        Box::new(tshark::TsharkBackend),
        Box::new(tcpdump::TcpdumpBackend),
        Box::new(dumpcap::DumpcapBackend),
    ]
}
