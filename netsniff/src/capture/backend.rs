//! The capture backend abstraction and the plumbing shared by subprocess backends.
use std::env;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::analyser::containers::RawFrame;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, CaptureResult};

/// Lines of stderr kept for diagnosing a backend that failed to start.
const STDERR_TAIL_LINES: usize = 20;

/// How long a terminated process gets to exit before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// One way of getting frames off the wire.
///
/// Backends are tried in list order; the first that produces output wins.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves the executable, or `None` if the backend is not installed.
    fn locate(&self, locator: &ToolLocator) -> Option<PathBuf>;

    /// Starts capturing on `interface`.
    fn launch(&self, executable: &Path, config: &CaptureConfig, interface: &str) -> CaptureResult<Launched>;
}

/// Blocking reader over a backend's output.
///
/// `Ok(None)` means the stream ended. `Err(MalformedFrame)` means one unit of
/// output was unusable and reading may continue; any other error ends it.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> CaptureResult<Option<RawFrame>>;
}

/// A started backend.
pub struct Launched {
    pub source: Box<dyn FrameSource>,
    pub handle: ProcessHandle,
    pub diagnostics: Option<StderrTail>,
}

/// Lets the session stop a producer that may be blocked on I/O.
#[derive(Clone)]
pub enum ProcessHandle {
    /// A subprocess we spawned ourselves.
    Child(Arc<Mutex<Child>>),
    /// A subprocess owned by a library, known only by pid.
    Pid(u32),
    /// An in-process source that watches this flag.
    InProcess(Arc<AtomicBool>),
    None,
}

impl ProcessHandle {
    /// Stops the producer. Returns once the subprocess, if any, has exited.
    pub fn terminate(&self) {
        match self {
            ProcessHandle::Child(child) => {
                let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                // TERM first so an elevating wrapper (sudo) passes it on
                signal_terminate(child.id());
                let deadline = Instant::now() + TERMINATE_GRACE;
                while Instant::now() < deadline {
                    match child.try_wait() {
                        Ok(Some(_)) | Err(_) => return,
                        Ok(None) => thread::sleep(Duration::from_millis(20)),
                    }
                }
                if let Err(e) = child.kill() {
                    log::warn!("Failed to kill capture process {}: {e}", child.id());
                }
                let _ = child.wait();
            }
            ProcessHandle::Pid(pid) => signal_terminate(*pid),
            ProcessHandle::InProcess(flag) => flag.store(true, Ordering::SeqCst),
            ProcessHandle::None => {}
        }
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    let status = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        log::warn!("Could not signal process {pid}: {e}");
    }
}

#[cfg(windows)]
fn signal_terminate(pid: u32) {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        log::warn!("Could not terminate process {pid}: {e}");
    }
}

/// The last lines a backend wrote to stderr, collected on a helper thread.
#[derive(Clone, Default)]
pub struct StderrTail(Arc<Mutex<Vec<String>>>);

impl StderrTail {
    pub fn collect<R: Read + Send + 'static>(stream: R) -> Self {
        let tail = StderrTail::default();
        let lines = Arc::clone(&tail.0);
        thread::spawn(move || {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                log::debug!("backend stderr: {line}");
                let mut lines = lines.lock().unwrap_or_else(|e| e.into_inner());
                if lines.len() == STDERR_TAIL_LINES {
                    lines.remove(0);
                }
                lines.push(line);
            }
        });
        tail
    }

    pub fn text(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).join("\n")
    }
}

/// Finds capture tools in well-known install locations and on `PATH`.
#[derive(Clone, Debug)]
pub struct ToolLocator {
    search_path: Vec<PathBuf>,
    use_known_paths: bool,
}

impl ToolLocator {
    pub fn from_env() -> Self {
        let path = env::var_os("PATH").unwrap_or_else(OsString::new);
        Self {
            search_path: env::split_paths(&path).collect(),
            use_known_paths: true,
        }
    }

    /// Only searches `dirs`; known install paths are ignored.
    pub fn isolated(dirs: Vec<PathBuf>) -> Self {
        Self {
            search_path: dirs,
            use_known_paths: false,
        }
    }

    pub fn locate(&self, program: &str, known_paths: &[&str]) -> Option<PathBuf> {
        if self.use_known_paths {
            if let Some(found) = known_paths.iter().map(PathBuf::from).find(|p| p.is_file()) {
                return Some(found);
            }
        }
        let names: Vec<String> = if cfg!(windows) {
            vec![format!("{program}.exe"), program.to_string()]
        } else {
            vec![program.to_string()]
        };
        self.search_path
            .iter()
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
    }
}

/// Spawns `executable args...` with stdout piped for frames and stderr kept for diagnostics.
///
/// With `admin` set on Unix the command runs under `sudo -n`, which fails
/// fast instead of prompting when no cached credentials exist.
pub fn spawn_piped(
    backend: &'static str,
    executable: &Path,
    args: &[String],
    admin: bool,
) -> CaptureResult<(Arc<Mutex<Child>>, ChildStdout, StderrTail)> {
    let mut command = if admin && cfg!(unix) {
        let mut sudo = Command::new("sudo");
        sudo.arg("-n").arg(executable);
        sudo
    } else {
        Command::new(executable)
    };
    command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    log::info!("Starting {backend}: {} {}", executable.display(), args.join(" "));
    let mut child = command
        .spawn()
        .map_err(|source| CaptureError::SpawnFailed { backend, source })?;

    let stdout = child.stdout.take().ok_or_else(|| CaptureError::SubprocessCrash {
        backend,
        detail: "stdout was not captured".into(),
    })?;
    let tail = child.stderr.take().map(StderrTail::collect).unwrap_or_default();
    Ok((Arc::new(Mutex::new(child)), stdout, tail))
}

/// Splits a filter expression into argv words for tools that take it unquoted.
pub fn filter_words(filter: Option<String>) -> Vec<String> {
    filter
        .map(|f| f.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
