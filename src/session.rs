//! The session orchestrator.
//!
//! A start runs validate, build, persist, snapshot, spawn and apply in
//! that order and unwinds whatever already happened when a later step
//! fails. Start and stop are serialized by one lock, which the engine's
//! exit hook also takes, so an engine dying mid-start is handled only
//! after the start has settled.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::builder;
use crate::config::ProxySessionConfig;
use crate::error::SessionError;
use crate::supervisor::{Engine, ExitHook, ExitInfo, LaunchSpec, OutputSink, SupervisorState};
use crate::system_proxy::{ProxyReport, SystemProxyController, SystemProxySnapshot};

/// The system proxy always points at the local listeners.
pub const PROXY_HOST: &str = "127.0.0.1";

/// Events a subscriber may leave unread before newer ones are dropped.
pub const EVENT_BUFFER: usize = 1024;

/// What `stop` does to the system proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// Put back what the snapshot captured.
    #[default]
    Restore,
    /// Blank and disable every slot.
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Inputs of one session start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub executable: Option<PathBuf>,
    /// Where the engine document is written and read from.
    pub config_path: PathBuf,
    pub config: ProxySessionConfig,
}

/// Things that happen after the triggering call has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    EngineOutput(String),
    /// The engine died on its own. `proxy` is the unwind of the system
    /// proxy, absent when it had not been applied.
    EngineExited {
        exit: ExitInfo,
        proxy: Option<ProxyReport>,
    },
    /// Some services could not be changed.
    ProxyDegraded {
        action: &'static str,
        report: ProxyReport,
    },
}

struct SessionState {
    status: SessionStatus,
    stop_mode: StopMode,
    snapshot: Option<SystemProxySnapshot>,
    proxy_applied: bool,
    last_error: Option<String>,
    token: u64,
}

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Option<SyncSender<SessionEvent>>>>);

impl Events {
    fn emit(&self, event: SessionEvent) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("subscriber lagging, event dropped"),
                Err(TrySendError::Disconnected(_)) => *guard = None,
            }
        }
    }

    fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::sync_channel(EVENT_BUFFER);
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }
}

/// Owns at most one running engine and one system proxy mutation.
pub struct Session {
    engine: Arc<dyn Engine>,
    proxy: SystemProxyController,
    state: Arc<Mutex<SessionState>>,
    ops: Arc<Mutex<()>>,
    events: Events,
}

impl Session {
    pub fn new(engine: Arc<dyn Engine>, proxy: SystemProxyController) -> Self {
        Self {
            engine,
            proxy,
            state: Arc::new(Mutex::new(SessionState {
                status: SessionStatus::Stopped,
                stop_mode: StopMode::default(),
                snapshot: None,
                proxy_applied: false,
                last_error: None,
                token: 0,
            })),
            ops: Arc::new(Mutex::new(())),
            events: Events::default(),
        }
    }

    pub fn with_stop_mode(self, mode: StopMode) -> Self {
        self.set_stop_mode(mode);
        self
    }

    pub fn set_stop_mode(&self, mode: StopMode) {
        lock(&self.state).stop_mode = mode;
    }

    /// Routes events to a new receiver. Only the latest subscriber
    /// receives anything. The channel holds at most [`EVENT_BUFFER`]
    /// events; while it is full, new events are dropped, so a receiver
    /// that is never drained costs a bounded amount of memory.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn engine_state(&self) -> SupervisorState {
        self.engine.state()
    }

    /// The proxy state captured by the most recent start.
    pub fn snapshot(&self) -> Option<SystemProxySnapshot> {
        lock(&self.state).snapshot.clone()
    }

    /// Why the last start failed or the engine last died.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    /// Starts a session, replacing a running one. Returns the engine pid.
    pub fn start(&self, request: &StartRequest) -> Result<u32, SessionError> {
        let _op = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        if self.status() != SessionStatus::Stopped {
            info!("replacing running session");
            self.stop_locked();
        }

        lock(&self.state).status = SessionStatus::Starting;
        let result = self.start_locked(request);
        let mut state = lock(&self.state);
        match &result {
            Ok(pid) => {
                state.status = SessionStatus::Running;
                state.last_error = None;
                info!(pid, "session running");
            }
            Err(err) => {
                state.status = SessionStatus::Stopped;
                state.token = state.token.wrapping_add(1);
                state.last_error = Some(err.to_string());
                error!(stage = %err.stage(), error = %err, "session start failed");
            }
        }
        result
    }

    fn start_locked(&self, request: &StartRequest) -> Result<u32, SessionError> {
        let executable = request
            .executable
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(SessionError::MissingExecutable)?;
        let config = &request.config;
        if config.outbound.link.trim().is_empty() {
            return Err(SessionError::MissingNode);
        }
        config.validate().map_err(SessionError::InvalidConfig)?;
        self.engine
            .check(executable)
            .map_err(SessionError::Executable)?;

        let document = builder::build(config)?;
        let json = document.to_json().map_err(crate::error::BuildError::from)?;
        persist(&request.config_path, &json)?;

        let snapshot = self.proxy.snapshot();
        let token = {
            let mut state = lock(&self.state);
            state.token = state.token.wrapping_add(1);
            state.token
        };

        let spec = LaunchSpec::engine(executable, &request.config_path);
        let pid = self
            .engine
            .start(&spec, self.output_sink(), self.exit_hook(token))
            .map_err(SessionError::Spawn)?;

        let inbound = &config.inbound;
        let report = self
            .proxy
            .apply(PROXY_HOST, inbound.port_http, inbound.port_socks);
        if report.no_effect() {
            warn!(result = %report.summary(), "system proxy not applied, stopping engine");
            // A service that failed halfway may already point at the engine.
            let mode = lock(&self.state).stop_mode;
            unwind_proxy(&self.proxy, mode, Some(&snapshot));
            self.engine.stop();
            return Err(SessionError::Apply(report.summary()));
        }
        if !report.is_complete() {
            self.events.emit(SessionEvent::ProxyDegraded {
                action: "apply",
                report,
            });
        }

        let mut state = lock(&self.state);
        state.snapshot = Some(snapshot);
        state.proxy_applied = true;
        Ok(pid)
    }

    fn output_sink(&self) -> OutputSink {
        let events = self.events.clone();
        Arc::new(move |line: &str| events.emit(SessionEvent::EngineOutput(line.to_string())))
    }

    fn exit_hook(&self, token: u64) -> ExitHook {
        let state = self.state.clone();
        let ops = self.ops.clone();
        let proxy = self.proxy.clone();
        let events = self.events.clone();
        Box::new(move |exit: ExitInfo| {
            let _op = ops.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = {
                let mut state = lock(&state);
                if state.token != token {
                    return;
                }
                state.token = state.token.wrapping_add(1);
                state.status = SessionStatus::Stopped;
                state.last_error = Some(exit.describe());
                let applied = std::mem::take(&mut state.proxy_applied);
                applied.then(|| (state.stop_mode, state.snapshot.clone()))
            };
            error!(reason = %exit.describe(), "engine died, unwinding session");
            let report = pending.map(|(mode, snapshot)| unwind_proxy(&proxy, mode, snapshot.as_ref()));
            events.emit(SessionEvent::EngineExited {
                exit,
                proxy: report,
            });
        })
    }

    /// Restores or clears the system proxy, then stops the engine.
    /// Returns `None` when the proxy had not been applied.
    pub fn stop(&self) -> Option<ProxyReport> {
        let _op = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        self.stop_locked()
    }

    fn stop_locked(&self) -> Option<ProxyReport> {
        let pending = {
            let mut state = lock(&self.state);
            state.token = state.token.wrapping_add(1);
            if state.status != SessionStatus::Stopped {
                state.status = SessionStatus::Stopping;
            }
            let applied = std::mem::take(&mut state.proxy_applied);
            applied.then(|| (state.stop_mode, state.snapshot.clone()))
        };

        let report = pending.map(|(mode, snapshot)| unwind_proxy(&self.proxy, mode, snapshot.as_ref()));
        if let Some(report) = report.as_ref().filter(|r| !r.is_complete()) {
            self.events.emit(SessionEvent::ProxyDegraded {
                action: "stop",
                report: report.clone(),
            });
        }
        self.engine.stop();

        let mut state = lock(&self.state);
        if state.status == SessionStatus::Stopping {
            state.status = SessionStatus::Stopped;
            info!("session stopped");
        }
        report
    }

    /// Stops then starts again, e.g. after the active node changed.
    pub fn restart(&self, request: &StartRequest) -> Result<u32, SessionError> {
        self.stop();
        self.start(request)
    }

    /// Leaves nothing behind: no engine, no proxy pointing at it.
    pub fn shutdown(&self) {
        if self.status() != SessionStatus::Stopped || self.engine.state() != SupervisorState::Idle {
            self.stop();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unwind_proxy(
    proxy: &SystemProxyController,
    mode: StopMode,
    snapshot: Option<&SystemProxySnapshot>,
) -> ProxyReport {
    match (mode, snapshot) {
        (StopMode::Restore, Some(snapshot)) => proxy.restore(snapshot),
        _ => proxy.clear(),
    }
}

fn persist(path: &Path, json: &str) -> Result<(), SessionError> {
    let persist_err = |source| SessionError::Persist {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(persist_err)?;
    }
    fs::write(path, json).map_err(persist_err)
}
