//! Lifetime of the external engine process.
//!
//! The supervisor owns at most one child. Output from stdout and stderr is
//! read on two threads and handed line by line to a caller supplied sink,
//! and a monitor thread polls for an exit nobody asked for. Every launch
//! bumps a generation token, so threads left over from an earlier child
//! notice they are stale and quit without touching the new one.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{ProcessRefreshKind, RefreshKind, System, UpdateKind};
use tracing::{debug, info, warn};

use crate::error::SpawnError;

const MONITOR_INTERVAL: Duration = Duration::from_millis(250);
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const ENGINE_TARGET: &str = "raybar::engine";

/// Receives one line of engine output. Called from reader threads, so it
/// must not block for long.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Called once when the engine exits without `stop` being asked for.
pub type ExitHook = Box<dyn FnOnce(ExitInfo) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            error: None,
        }
    }

    fn from_error(err: io::Error) -> Self {
        Self {
            code: None,
            signal: None,
            error: Some(err.to_string()),
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal, &self.error) {
            (_, _, Some(error)) => format!("engine wait failed: {error}"),
            (Some(code), _, _) => format!("engine exited with code {code}"),
            (None, Some(signal), _) => format!("engine killed by signal {signal}"),
            (None, None, None) => "engine exited".to_string(),
        }
    }
}

/// What to run: `<executable> <args..>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
}

impl LaunchSpec {
    /// The engine's standard invocation, `<exe> run -c <config>`.
    pub fn engine(executable: impl Into<PathBuf>, config_path: &Path) -> Self {
        Self {
            executable: executable.into(),
            args: vec!["run".into(), "-c".into(), config_path.as_os_str().to_owned()],
        }
    }
}

/// The seam between the session and a running engine.
pub trait Engine: Send + Sync {
    /// Checks that `executable` exists and may be run.
    fn check(&self, executable: &Path) -> Result<(), SpawnError> {
        check_executable(executable)
    }

    /// Launches the engine and returns its pid once it is running. A
    /// running engine is stopped first.
    fn start(&self, spec: &LaunchSpec, output: OutputSink, on_exit: ExitHook)
        -> Result<u32, SpawnError>;

    /// Terminates the engine. Safe to call when nothing runs.
    fn stop(&self);

    fn state(&self) -> SupervisorState;
}

struct Inner {
    state: SupervisorState,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    on_exit: Option<ExitHook>,
    last_exit: Option<ExitInfo>,
    token: u64,
}

pub struct ProcessSupervisor {
    inner: Arc<Mutex<Inner>>,
    ops: Mutex<()>,
    grace: Duration,
    reap_orphans: bool,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SupervisorState::Idle,
                child: None,
                readers: Vec::new(),
                on_exit: None,
                last_exit: None,
                token: 0,
            })),
            ops: Mutex::new(()),
            grace: TERMINATE_GRACE,
            reap_orphans: false,
        }
    }

    /// Kill leftover engines with the same executable before each launch.
    pub fn with_orphan_sweep(mut self, enabled: bool) -> Self {
        self.reap_orphans = enabled;
        self
    }

    /// How long `stop` waits after SIGTERM before killing.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner).child.as_ref().map(Child::id)
    }

    pub fn last_exit(&self) -> Option<ExitInfo> {
        lock(&self.inner).last_exit.clone()
    }

    fn launch(
        &self,
        spec: &LaunchSpec,
        output: OutputSink,
        on_exit: ExitHook,
    ) -> Result<u32, SpawnError> {
        check_executable(&spec.executable)?;
        if self.reap_orphans {
            reap_orphans(&spec.executable);
        }

        lock(&self.inner).state = SupervisorState::Starting;
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let mut guard = lock(&self.inner);
                guard.state = SupervisorState::Failed;
                guard.last_exit = Some(ExitInfo {
                    code: None,
                    signal: None,
                    error: Some(err.to_string()),
                });
                return Err(spawn_error(&spec.executable, err));
            }
        };
        let pid = child.id();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, output));
        }

        let token = {
            let mut guard = lock(&self.inner);
            guard.child = Some(child);
            guard.readers = readers;
            guard.on_exit = Some(on_exit);
            guard.last_exit = None;
            guard.state = SupervisorState::Running;
            guard.token = guard.token.wrapping_add(1);
            guard.token
        };
        spawn_monitor(self.inner.clone(), token);

        info!(pid, executable = %spec.executable.display(), "engine started");
        Ok(pid)
    }

    fn terminate(&self) {
        let (child, readers) = {
            let mut guard = lock(&self.inner);
            let Some(child) = guard.child.take() else {
                return;
            };
            guard.state = SupervisorState::Stopping;
            guard.token = guard.token.wrapping_add(1);
            guard.on_exit = None;
            (child, std::mem::take(&mut guard.readers))
        };

        let pid = child.id();
        let exit = terminate_child(child, self.grace);
        join_readers(readers, DRAIN_TIMEOUT);

        let mut guard = lock(&self.inner);
        guard.last_exit = Some(exit);
        guard.state = SupervisorState::Idle;
        info!(pid, "engine stopped");
    }
}

impl Engine for ProcessSupervisor {
    fn start(
        &self,
        spec: &LaunchSpec,
        output: OutputSink,
        on_exit: ExitHook,
    ) -> Result<u32, SpawnError> {
        let _op = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        self.terminate();
        self.launch(spec, output, on_exit)
    }

    fn stop(&self) {
        let _op = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        self.terminate();
    }

    fn state(&self) -> SupervisorState {
        lock(&self.inner).state
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_error(executable: &Path, err: io::Error) -> SpawnError {
    match err.kind() {
        io::ErrorKind::NotFound => SpawnError::NotFound(executable.to_path_buf()),
        io::ErrorKind::PermissionDenied => SpawnError::NotExecutable(executable.to_path_buf()),
        _ => SpawnError::Io(err),
    }
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, output: OutputSink) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.split(b'\n') {
            let Ok(line) = line else {
                return;
            };
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            debug!(target: ENGINE_TARGET, "{line}");
            output(line);
        }
    })
}

fn spawn_monitor(inner: Arc<Mutex<Inner>>, token: u64) {
    std::thread::spawn(move || loop {
        std::thread::sleep(MONITOR_INTERVAL);
        let (exit, hook, readers) = {
            let mut guard = lock(&inner);
            if guard.token != token {
                return;
            }
            let Some(child) = guard.child.as_mut() else {
                return;
            };
            let exit = match child.try_wait() {
                Ok(Some(status)) => ExitInfo::from_status(status),
                Ok(None) => continue,
                Err(err) => ExitInfo::from_error(err),
            };
            guard.child = None;
            guard.state = SupervisorState::Failed;
            guard.last_exit = Some(exit.clone());
            (exit, guard.on_exit.take(), std::mem::take(&mut guard.readers))
        };

        join_readers(readers, DRAIN_TIMEOUT);
        warn!(reason = %exit.describe(), "engine exited unexpectedly");
        if let Some(hook) = hook {
            hook(exit);
        }
        return;
    });
}

fn terminate_child(mut child: Child, grace: Duration) -> ExitInfo {
    if let Ok(Some(status)) = child.try_wait() {
        return ExitInfo::from_status(status);
    }

    #[cfg(unix)]
    {
        if let Ok(pid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: kill(2) only signals the pid; it is our own child and
            // has not been reaped yet.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => return ExitInfo::from_status(status),
                Ok(None) => std::thread::sleep(Duration::from_millis(25)),
                Err(_) => break,
            }
        }
        warn!(pid = child.id(), "engine ignored SIGTERM, killing");
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    match child.wait() {
        Ok(status) => ExitInfo::from_status(status),
        Err(err) => ExitInfo::from_error(err),
    }
}

/// Waits for reader threads up to `timeout`; stragglers are detached.
fn join_readers(readers: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for reader in readers {
        while !reader.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if reader.is_finished() {
            let _ = reader.join();
        }
    }
}

/// Reports whether `path` can be launched, without launching it.
pub fn check_executable(path: &Path) -> Result<(), SpawnError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(SpawnError::NotFound(path.to_path_buf()))
        }
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            return Err(SpawnError::NotExecutable(path.to_path_buf()))
        }
        Err(err) => return Err(SpawnError::Io(err)),
    };
    if !metadata.is_file() {
        return Err(SpawnError::NotExecutable(path.to_path_buf()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(SpawnError::NotExecutable(path.to_path_buf()));
        }
    }
    Ok(())
}

/// Runs `<exe> version` and returns the version as `vX.Y.Z`.
pub fn engine_version(executable: &Path) -> Result<String, SpawnError> {
    check_executable(executable)?;
    let output = Command::new(executable)
        .arg("version")
        .stdin(Stdio::null())
        .output()
        .map_err(|err| spawn_error(executable, err))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout).ok_or_else(|| {
        SpawnError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unrecognized version output: {:?}", stdout.lines().next().unwrap_or("")),
        ))
    })
}

/// The engine prints `Xray 1.8.24 (Xray, Penetrates Everything.) ...`.
fn parse_version(output: &str) -> Option<String> {
    let token = output.lines().next()?.split_whitespace().nth(1)?;
    let token = token.trim_start_matches('v');
    if !token.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("v{token}"))
}

/// Kills engine processes left running with the same executable, for
/// example after a crash. Returns how many were signalled.
pub fn reap_orphans(executable: &Path) -> usize {
    let target = std::fs::canonicalize(executable).unwrap_or_else(|_| executable.to_path_buf());
    let own_pid = sysinfo::get_current_pid().ok();
    let system = System::new_with_specifics(
        RefreshKind::new()
            .with_processes(ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet)),
    );

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if Some(*pid) == own_pid {
            continue;
        }
        let Some(exe) = process.exe() else {
            continue;
        };
        if exe != target && exe != executable {
            continue;
        }
        if process.kill() {
            warn!(pid = pid.as_u32(), exe = %exe.display(), "killed orphaned engine");
            killed += 1;
        }
    }
    killed
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("engine.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    /// Runs the script through `/bin/sh` so tests never exec a file that
    /// another test thread may still hold open for writing.
    fn spec(script: &Path) -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from("/bin/sh"),
            args: vec![script.as_os_str().to_owned()],
        }
    }

    fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let sink: OutputSink = Arc::new(move |line: &str| {
            sink_lines.lock().unwrap().push(line.to_string());
        });
        (sink, lines)
    }

    fn alive(pid: u32) -> bool {
        // SAFETY: signal 0 only probes for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let supervisor = ProcessSupervisor::new();
        supervisor.stop();
        supervisor.stop();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(supervisor.last_exit().is_none());
    }

    #[test]
    fn test_output_is_merged_and_stop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echo out-line\necho err-line >&2\nexec sleep 30\n");
        let supervisor = ProcessSupervisor::new();
        let (sink, lines) = collecting_sink();
        let (tx, rx) = mpsc::channel();
        let pid = supervisor
            .start(&spec(&path), sink, Box::new(move |exit| {
                let _ = tx.send(exit);
            }))
            .unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);

        let deadline = Instant::now() + Duration::from_secs(5);
        while lines.lock().unwrap().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let mut seen = lines.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["err-line", "out-line"]);

        supervisor.stop();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(!alive(pid));
        assert_eq!(supervisor.last_exit().unwrap().signal, Some(libc::SIGTERM));
        // An explicit stop never reports an unexpected exit.
        assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());

        supervisor.stop();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[test]
    fn test_unexpected_exit_fires_hook() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echo starting\nexit 3\n");
        let supervisor = ProcessSupervisor::new();
        let (sink, _) = collecting_sink();
        let (tx, rx) = mpsc::channel();
        supervisor
            .start(&spec(&path), sink, Box::new(move |exit| {
                let _ = tx.send(exit);
            }))
            .unwrap();

        let exit = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(exit.code, Some(3));
        assert_eq!(supervisor.state(), SupervisorState::Failed);
        supervisor.stop();
        assert_eq!(supervisor.state(), SupervisorState::Failed);
    }

    #[test]
    fn test_start_replaces_running_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "exec sleep 30\n");
        let supervisor = ProcessSupervisor::new();
        let (sink, _) = collecting_sink();
        let first = supervisor
            .start(&spec(&path), sink.clone(), Box::new(|_| {}))
            .unwrap();
        let second = supervisor.start(&spec(&path), sink, Box::new(|_| {})).unwrap();
        assert_ne!(first, second);
        assert!(!alive(first));
        assert!(alive(second));
        supervisor.stop();
        assert!(!alive(second));
    }

    #[test]
    fn test_stubborn_engine_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "trap '' TERM\nwhile :; do sleep 0.1; done\n");
        let supervisor = ProcessSupervisor::new().with_grace(Duration::from_millis(300));
        let (sink, _) = collecting_sink();
        let pid = supervisor.start(&spec(&path), sink, Box::new(|_| {})).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        supervisor.stop();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!alive(pid));
        assert_eq!(supervisor.last_exit().unwrap().signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_check_executable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(check_executable(&missing), Err(SpawnError::NotFound(_))));

        let plain = dir.path().join("plain");
        std::fs::write(&plain, "#!/bin/sh\n").unwrap();
        assert!(matches!(check_executable(&plain), Err(SpawnError::NotExecutable(_))));
        assert!(matches!(check_executable(dir.path()), Err(SpawnError::NotExecutable(_))));
        assert!(check_executable(Path::new("/bin/sh")).is_ok());
    }

    #[test]
    fn test_start_rejects_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let plain = script(dir.path(), "exit 0\n");
        let supervisor = ProcessSupervisor::new();
        let (sink, _) = collecting_sink();
        let spec = LaunchSpec::engine(&plain, Path::new("/tmp/config.json"));
        let err = supervisor.start(&spec, sink, Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, SpawnError::NotExecutable(_)));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("Xray 1.8.24 (Xray, Penetrates Everything.) 9a3b (go1.22 darwin/arm64)\nA unified platform"),
            Some("v1.8.24".to_string())
        );
        assert_eq!(parse_version("Xray v25.1.1 (x)"), Some("v25.1.1".to_string()));
        assert_eq!(parse_version("usage: engine"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_engine_invocation_args() {
        let spec = LaunchSpec::engine("/opt/xray", Path::new("/home/u/config.json"));
        assert_eq!(spec.args, vec!["run", "-c", "/home/u/config.json"]);
    }
}
