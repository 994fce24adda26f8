//! dumpcap backend: libpcap capture streamed to stdout as a pcap file.
use std::path::{Path, PathBuf};

use super::backend::{spawn_piped, CaptureBackend, Launched, ProcessHandle, ToolLocator};
use super::pcap_stream::PcapStreamReader;
use crate::config::CaptureConfig;
use crate::error::CaptureResult;

const KNOWN_PATHS: &[&str] = &[
    "/usr/bin/dumpcap",
    "/usr/sbin/dumpcap",
    "/usr/local/bin/dumpcap",
    "/Applications/Wireshark.app/Contents/MacOS/dumpcap",
    "C:\\Program Files\\Wireshark\\dumpcap.exe",
];

pub struct DumpcapBackend;

impl DumpcapBackend {
    fn arguments(config: &CaptureConfig, interface: &str) -> Vec<String> {
        // -P: classic pcap rather than pcapng, -q: no packet counter on stderr
        let mut args: Vec<String> = ["-i", interface, "-w", "-", "-P", "-q"].iter().map(|s| s.to_string()).collect();
        if !config.promiscuous {
            args.push("-p".into());
        }
        if let Some(filter) = config.effective_filter() {
            args.push("-f".into());
            args.push(filter);
        }
        args
    }
}

impl CaptureBackend for DumpcapBackend {
    fn name(&self) -> &'static str {
        "dumpcap"
    }

    fn locate(&self, locator: &ToolLocator) -> Option<PathBuf> {
        locator.locate("dumpcap", KNOWN_PATHS)
    }

    fn launch(&self, executable: &Path, config: &CaptureConfig, interface: &str) -> CaptureResult<Launched> {
        let args = Self::arguments(config, interface);
        let (child, stdout, tail) = spawn_piped(self.name(), executable, &args, config.admin)?;
        Ok(Launched {
            source: Box::new(PcapStreamReader::new(stdout)),
            handle: ProcessHandle::Child(child),
            diagnostics: Some(tail),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn filter_is_a_single_argument() {
        let config = CaptureConfig {
            target_ip: Some(Ipv4Addr::new(192, 168, 0, 9)),
            ..Default::default()
        };
        let args = DumpcapBackend::arguments(&config, "wlan0");
        assert_eq!(args, vec!["-i", "wlan0", "-w", "-", "-P", "-q", "-f", "host 192.168.0.9"]);
    }
}
