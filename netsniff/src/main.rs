mod ui;

use clap::{ArgAction, Parser};
use netsniff::capture::interfaces;
use netsniff::capture::session::Session;
use netsniff::config::CaptureConfig;
use netsniff::store::StoreEvent;
use std::error::Error;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use ui::output;

/// netsniff captures live traffic and pulls protocols and credentials out of it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to capture on, defaults to the first one that is up
    #[arg(short = 'i', long, value_parser)]
    interface: Option<String>,

    /// Only keep traffic to or from this host
    #[arg(short = 't', long, value_parser)]
    target: Option<Ipv4Addr>,

    /// Capture filter expression, e.g. "tcp port 80"
    #[arg(short = 'f', long, value_parser)]
    filter: Option<String>,

    /// Run the capture tool through sudo -n
    #[arg(short = 'a', long, action = ArgAction::SetTrue)]
    admin: bool,

    /// Leave the interface out of promiscuous mode
    #[arg(long, action = ArgAction::SetTrue)]
    no_promisc: bool,

    /// Skip wire capture and watch local connections instead
    #[arg(short = 'l', long, action = ArgAction::SetTrue)]
    local: bool,

    /// Watch local connections if no capture tool works
    #[arg(long, action = ArgAction::SetTrue)]
    fallback_local: bool,

    /// Load demonstration records if no capture tool works
    #[arg(long, action = ArgAction::SetTrue)]
    demo: bool,

    /// Flag TLS records as encrypted
    #[arg(short = 'e', long, action = ArgAction::SetTrue)]
    detect_encryption: bool,

    /// Stop after this many seconds, default is to run until interrupted
    #[arg(short = 'd', long, value_parser)]
    duration: Option<u64>,

    /// Write captured packets to this pcap file when done
    #[arg(short = 'w', long, value_parser)]
    export: Option<PathBuf>,

    /// Print one JSON object per packet
    #[arg(short = 'j', long, action = ArgAction::SetTrue)]
    json: bool,

    /// Show passwords and tokens instead of fingerprints
    #[arg(long, action = ArgAction::SetTrue)]
    reveal_credentials: bool,

    /// Print details and a hex dump for every packet
    #[arg(short = 'v', long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// List interfaces and exit
    #[arg(long, action = ArgAction::SetTrue)]
    list_interfaces: bool,

    /// JSON capture configuration; flags given here override it
    #[arg(short = 'c', long, value_parser)]
    config: Option<PathBuf>,
}

impl Args {
    fn capture_config(&self) -> std::io::Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::from_file(path)?,
            None => CaptureConfig::default(),
        };
        if self.interface.is_some() {
            config.interface = self.interface.clone();
        }
        if self.target.is_some() {
            config.target_ip = self.target;
        }
        if self.filter.is_some() {
            config.filter = self.filter.clone();
        }
        config.admin |= self.admin;
        config.promiscuous &= !self.no_promisc;
        config.local_monitor |= self.local;
        config.fallback_to_local |= self.fallback_local;
        config.demo_on_failure |= self.demo;
        config.detect_encryption |= self.detect_encryption;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    simple_logger::init_with_env()?;

    let args = Args::parse();

    if args.list_interfaces {
        output::print_interfaces(&interfaces::list_interfaces());
        return Ok(());
    }

    let config = args.capture_config()?;
    let mut session = Session::new(config.store_capacity);
    let store = session.store();
    let events = store.subscribe();

    match session.start(config.clone()) {
        Ok(report) => {
            if !args.json {
                output::print_report(&report);
            }
        }
        Err(e) if config.demo_on_failure => {
            log::warn!("{e}");
            for record in store.snapshot() {
                show(&record, &args)?;
            }
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        log::info!("Interrupted, stopping capture");
        handler_flag.store(false, Ordering::SeqCst);
    })?;

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut shown = 0u64;
    loop {
        if !keep_running(&running, deadline, Instant::now()) {
            break;
        }
        if let Some(error) = session.last_error() {
            log::error!("Capture ended: {error}");
            break;
        }
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(StoreEvent::Appended(_)) => {
                // Catch up from the store; events can be dropped under load
                for record in store.since(shown) {
                    show(&record, &args)?;
                    shown = record.id;
                }
            }
            Ok(_) => {}
            Err(e) if e.is_timeout() => {}
            Err(_) => break,
        }
    }

    session.stop();

    if let Some(path) = args.export.as_deref() {
        export(&session, path)?;
    }
    Ok(())
}

/// False once Ctrl+C has cleared `running` or the optional deadline has passed.
fn keep_running(running: &AtomicBool, deadline: Option<Instant>, now: Instant) -> bool {
    running.load(Ordering::SeqCst) && deadline.map_or(true, |d| now < d)
}

fn show(record: &netsniff::analyser::containers::PacketRecord, args: &Args) -> Result<(), Box<dyn Error>> {
    if args.json {
        println!("{}", output::record_as_json(record, args.reveal_credentials)?);
    } else if args.verbose {
        output::print_detail(record, args.reveal_credentials);
    } else {
        output::print_record(record, args.reveal_credentials);
    }
    Ok(())
}

fn export(session: &Session, path: &Path) -> Result<(), Box<dyn Error>> {
    let written = session.store().export_to_file(path)?;
    if written == 0 {
        log::warn!("Nothing exported; synthetic records are never written to pcap");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_ends_the_capture_loop() {
        let running = AtomicBool::new(true);
        let now = Instant::now();
        assert!(keep_running(&running, None, now));
        assert!(keep_running(&running, Some(now + Duration::from_secs(1)), now));

        running.store(false, Ordering::SeqCst);
        assert!(!keep_running(&running, None, now));
    }

    #[test]
    fn deadline_ends_the_capture_loop() {
        let running = AtomicBool::new(true);
        let now = Instant::now();
        assert!(!keep_running(&running, Some(now), now));
        assert!(!keep_running(&running, Some(now), now + Duration::from_millis(1)));
    }
}
