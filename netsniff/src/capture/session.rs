//! A capture session: picks a producer, runs it on its own thread, and feeds
//! the store through a single consumer.
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::backend::{CaptureBackend, FrameSource, ProcessHandle, StderrTail, ToolLocator};
use super::{demo, interfaces};
use crate::analyser::containers::{PacketRecord, RawFrame};
use crate::analyser::pipeline::FramePipeline;
use crate::config::CaptureConfig;
use crate::error::{looks_like_privilege_error, CaptureError, CaptureResult};
use crate::monitor::{self, ConnectionTable, LocalActivityMonitor};
use crate::store::PacketStore;

/// Frames queued between producer and consumer.
const QUEUE_DEPTH: usize = 4096;

/// How often the consumer looks at the cancellation flag while idle.
const CONSUMER_POLL: Duration = Duration::from_millis(50);

/// stderr is drained on its own thread; time allowed for it to catch up
/// before a dead backend's diagnostics are read.
const STDERR_SETTLE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ProducerKind {
    Backend(&'static str),
    LocalMonitor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    NotInstalled,
    PrivilegeDenied(String),
    NoOutput,
    Failed(String),
    Selected,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::NotInstalled => write!(f, "not installed"),
            AttemptOutcome::PrivilegeDenied(detail) => write!(f, "insufficient privileges ({detail})"),
            AttemptOutcome::NoOutput => write!(f, "no output"),
            AttemptOutcome::Failed(detail) => write!(f, "failed ({detail})"),
            AttemptOutcome::Selected => write!(f, "selected"),
        }
    }
}

impl From<CaptureError> for AttemptOutcome {
    fn from(error: CaptureError) -> Self {
        match error {
            CaptureError::BackendUnavailable { .. } => AttemptOutcome::NotInstalled,
            CaptureError::PrivilegeDenied { detail, .. } => AttemptOutcome::PrivilegeDenied(detail),
            CaptureError::NoOutput { .. } => AttemptOutcome::NoOutput,
            other => AttemptOutcome::Failed(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendAttempt {
    pub backend: &'static str,
    pub outcome: AttemptOutcome,
}

/// What `Session::start` ended up running, and what it tried on the way.
#[derive(Clone, Debug, Serialize)]
pub struct StartReport {
    pub producer: ProducerKind,
    pub interface: Option<String>,
    pub attempts: Vec<BackendAttempt>,
    /// A backend was skipped for lack of privileges.
    pub reduced_fidelity: bool,
}

impl StartReport {
    /// Records come from the OS connection table rather than the wire.
    pub fn degraded(&self) -> bool {
        self.producer == ProducerKind::LocalMonitor
    }
}

enum Captured {
    Frame(RawFrame),
    Record(PacketRecord),
}

struct Running {
    cancel: Arc<AtomicBool>,
    handle: ProcessHandle,
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

/// A producer that has started but whose consumer is not yet running.
struct Producer {
    cancel: Arc<AtomicBool>,
    handle: ProcessHandle,
    thread: JoinHandle<()>,
    frames: Receiver<Captured>,
}

/// State shared with producer threads, which may end the session on a crash.
#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<SessionState>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// A producer that already failed leaves the session `Stopped`.
    fn mark_active(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SessionState::Starting {
            *state = SessionState::Active;
        }
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }
}

/// Owns one capture at a time and the store it fills.
///
/// `start` always stops the previous producer first, so at most one backend
/// subprocess is alive per session and only one consumer appends to the store.
pub struct Session {
    store: Arc<PacketStore>,
    backends: Vec<Box<dyn CaptureBackend>>,
    locator: ToolLocator,
    connections: Arc<dyn ConnectionTable>,
    shared: Shared,
    running: Option<Running>,
}

impl Session {
    pub fn new(store_capacity: usize) -> Self {
        Self::with_store(Arc::new(PacketStore::new(store_capacity)))
    }

    pub fn with_store(store: Arc<PacketStore>) -> Self {
        Self {
            store,
            backends: super::default_backends(),
            locator: ToolLocator::from_env(),
            connections: monitor::system_table(),
            shared: Shared {
                state: Arc::new(Mutex::new(SessionState::Idle)),
                last_error: Arc::new(Mutex::new(None)),
            },
            running: None,
        }
    }

    /// Replaces the backend chain; order is priority order.
    pub fn with_backends(mut self, backends: Vec<Box<dyn CaptureBackend>>) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_locator(mut self, locator: ToolLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_connection_table(mut self, table: Arc<dyn ConnectionTable>) -> Self {
        self.connections = table;
        self
    }

    pub fn store(&self) -> Arc<PacketStore> {
        Arc::clone(&self.store)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Why the session last stopped on its own, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Starts capturing with `config`, stopping any capture already running.
    pub fn start(&mut self, config: CaptureConfig) -> CaptureResult<StartReport> {
        self.stop();
        self.shared.set_error(None);
        self.shared.set_state(SessionState::Starting);

        if config.local_monitor {
            log::info!("Local activity monitor requested; skipping wire capture");
            self.run_local_monitor(&config);
            return Ok(StartReport {
                producer: ProducerKind::LocalMonitor,
                interface: None,
                attempts: Vec::new(),
                reduced_fidelity: false,
            });
        }

        let interface = config.interface.clone().or_else(interfaces::default_interface).unwrap_or_else(|| {
            log::warn!("No usable interface found, capturing on \"any\"");
            "any".to_string()
        });

        let mut attempts = Vec::new();
        let mut selected = None;
        for backend in &self.backends {
            let name = backend.name();
            let located = backend
                .locate(&self.locator)
                .ok_or(CaptureError::BackendUnavailable { backend: name });
            let started = located.and_then(|executable| {
                start_backend(backend.as_ref(), &executable, &config, &interface, &self.shared)
            });
            match started {
                Ok(producer) => {
                    log::info!("Capturing on {interface} with {name}");
                    attempts.push(BackendAttempt { backend: name, outcome: AttemptOutcome::Selected });
                    selected = Some((name, producer));
                    break;
                }
                Err(e @ CaptureError::BackendUnavailable { .. }) => {
                    log::info!("{e}, skipping");
                    attempts.push(BackendAttempt { backend: name, outcome: e.into() });
                }
                Err(e) => {
                    log::warn!("{e}; trying the next backend");
                    attempts.push(BackendAttempt { backend: name, outcome: e.into() });
                }
            }
        }

        let reduced_fidelity = attempts
            .iter()
            .any(|a| matches!(a.outcome, AttemptOutcome::PrivilegeDenied(_)));

        if let Some((name, producer)) = selected {
            self.activate(producer, &config);
            return Ok(StartReport {
                producer: ProducerKind::Backend(name),
                interface: Some(interface),
                attempts,
                reduced_fidelity,
            });
        }

        let tried = attempts
            .iter()
            .map(|a| format!("{}: {}", a.backend, a.outcome))
            .collect::<Vec<_>>()
            .join(", ");

        if config.fallback_to_local {
            log::warn!("No capture backend started ({tried}); falling back to the local activity monitor");
            self.run_local_monitor(&config);
            return Ok(StartReport {
                producer: ProducerKind::LocalMonitor,
                interface: Some(interface),
                attempts,
                reduced_fidelity,
            });
        }

        let error = CaptureError::CaptureUnavailable { tried };
        log::error!("{error}");
        self.shared.set_error(Some(error.to_string()));
        self.shared.set_state(SessionState::Stopped);
        if config.demo_on_failure {
            demo::populate(&self.store);
        }
        Err(error)
    }

    /// Stops the producer and consumer and waits for both. Idempotent.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.store(true, Ordering::SeqCst);
        running.handle.terminate();
        if running.producer.join().is_err() {
            log::error!("Capture producer thread panicked");
        }
        if running.consumer.join().is_err() {
            log::error!("Capture consumer thread panicked");
        }
        self.shared.set_state(SessionState::Stopped);
        log::info!("Capture stopped");
    }

    fn run_local_monitor(&mut self, config: &CaptureConfig) {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::bounded(QUEUE_DEPTH);
        let interval = Duration::from_millis(config.monitor_interval_ms.max(1));
        let mut monitor = LocalActivityMonitor::new(Arc::clone(&self.connections));

        let flag = Arc::clone(&cancel);
        let thread = thread::spawn(move || {
            monitor.run(interval, &flag, |record| tx.send(Captured::Record(record)).is_ok());
        });

        let producer = Producer {
            handle: ProcessHandle::InProcess(Arc::clone(&cancel)),
            cancel,
            thread,
            frames: rx,
        };
        self.activate(producer, config);
    }

    fn activate(&mut self, producer: Producer, config: &CaptureConfig) {
        let pipeline = FramePipeline::new(config);
        let store = Arc::clone(&self.store);
        let cancel = Arc::clone(&producer.cancel);
        let frames = producer.frames;
        let consumer = thread::spawn(move || consume(frames, pipeline, store, cancel));

        self.running = Some(Running {
            cancel: producer.cancel,
            handle: producer.handle,
            producer: producer.thread,
            consumer,
        });
        self.shared.mark_active();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Launches `backend` and waits for its first frame.
///
/// On any failure the subprocess is terminated and its reader thread joined
/// before returning, so a failed backend never outlives its attempt.
fn start_backend(
    backend: &dyn CaptureBackend,
    executable: &Path,
    config: &CaptureConfig,
    interface: &str,
    shared: &Shared,
) -> CaptureResult<Producer> {
    let name = backend.name();
    let launched = backend.launch(executable, config, interface)?;
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = channel::bounded(QUEUE_DEPTH);
    let (ready_tx, ready_rx) = channel::bounded(1);

    let reader = ProducerThread {
        backend: name,
        source: launched.source,
        frames: tx,
        ready: Some(ready_tx),
        cancel: Arc::clone(&cancel),
        diagnostics: launched.diagnostics.clone(),
        shared: shared.clone(),
    };
    let thread = thread::spawn(move || reader.run());

    let timeout = Duration::from_millis(config.startup_timeout_ms);
    let failure = match ready_rx.recv_timeout(timeout) {
        Ok(Ok(())) => {
            return Ok(Producer {
                cancel,
                handle: launched.handle,
                thread,
                frames: rx,
            })
        }
        Ok(Err(e)) => e,
        Err(RecvTimeoutError::Timeout) => CaptureError::NoOutput {
            backend: name,
            waited_ms: config.startup_timeout_ms,
        },
        Err(RecvTimeoutError::Disconnected) => CaptureError::SubprocessCrash {
            backend: name,
            detail: "reader thread exited during startup".into(),
        },
    };

    cancel.store(true, Ordering::SeqCst);
    launched.handle.terminate();
    if thread.join().is_err() {
        log::error!("{name} reader thread panicked");
    }

    // A silent backend may have been waiting on a permission it never got
    match (&failure, &launched.diagnostics) {
        (CaptureError::NoOutput { .. }, Some(tail)) if looks_like_privilege_error(&tail.text()) => {
            Err(CaptureError::PrivilegeDenied { backend: name, detail: tail.text() })
        }
        _ => Err(failure),
    }
}

/// Reads a backend's frames onto the queue.
///
/// The first unit of output, even a malformed one, counts as the backend
/// having started. Before that, a failure is reported back to `start`;
/// afterwards it ends the session.
struct ProducerThread {
    backend: &'static str,
    source: Box<dyn FrameSource>,
    frames: Sender<Captured>,
    ready: Option<Sender<CaptureResult<()>>>,
    cancel: Arc<AtomicBool>,
    diagnostics: Option<StderrTail>,
    shared: Shared,
}

impl ProducerThread {
    fn run(mut self) {
        let failure = loop {
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    self.signal_ready();
                    if self.frames.send(Captured::Frame(frame)).is_err() {
                        return;
                    }
                }
                Err(CaptureError::MalformedFrame(detail)) => {
                    self.signal_ready();
                    log::debug!("{}: dropped malformed frame: {detail}", self.backend);
                }
                Ok(None) => break self.classify_exit("output closed"),
                Err(e) => break e,
            }
        };

        if self.cancel.load(Ordering::SeqCst) {
            return;
        }
        match self.ready.take() {
            Some(ready) => {
                let _ = ready.send(Err(failure));
            }
            None => {
                log::error!("{failure}");
                self.shared.set_error(Some(failure.to_string()));
                self.shared.set_state(SessionState::Stopped);
            }
        }
    }

    fn signal_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }
    }

    fn classify_exit(&self, what: &str) -> CaptureError {
        let Some(tail) = &self.diagnostics else {
            return CaptureError::SubprocessCrash { backend: self.backend, detail: what.into() };
        };
        thread::sleep(STDERR_SETTLE);
        let text = tail.text();
        if looks_like_privilege_error(&text) {
            CaptureError::PrivilegeDenied { backend: self.backend, detail: text }
        } else if text.is_empty() {
            CaptureError::SubprocessCrash { backend: self.backend, detail: what.into() }
        } else {
            CaptureError::SubprocessCrash { backend: self.backend, detail: format!("{what}: {text}") }
        }
    }
}

fn consume(frames: Receiver<Captured>, pipeline: FramePipeline, store: Arc<PacketStore>, cancel: Arc<AtomicBool>) {
    let mut dropped = 0u64;
    while !cancel.load(Ordering::SeqCst) {
        let item = match frames.recv_timeout(CONSUMER_POLL) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let record = match item {
            Captured::Frame(frame) => pipeline.process(frame),
            Captured::Record(record) => pipeline.admit(record),
        };
        match record {
            Some(record) => {
                store.append(record);
            }
            None => dropped += 1,
        }
    }
    log::debug!("Consumer finished, {dropped} frames filtered or undecodable");
}
