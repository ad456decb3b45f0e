//! Supervisor: launch, readiness, restart and shutdown of managed children
//!
//! Each registered process runs through
//! `NotStarted -> Launching -> Running -> (exit) -> Restarting -> Launching`,
//! with `ShuttingDown -> Stopped` on explicit stop. A monitor task owns each
//! child handle and only posts an exit event; the supervisor's event loop
//! decides what the exit means.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::ipc::control::request_shutdown;
use crate::ipc::messages::Announce;
use crate::supervisor::process::{ProcessInfo, ProcessSpec, ProcessState, ReadinessMode};
use crate::supervisor::readiness::{AnnouncementBus, AnnouncementListener, next_announcement_from, parse_port_line};

pub const CONFIG_DIR_FLAG: &str = "--config-dir";
pub const HELPER_PORT_FLAG: &str = "--helper-port";
pub const CONTROL_SOCKET_FLAG: &str = "--control-socket";
pub const ANNOUNCE_SOCKET_FLAG: &str = "--announce-socket";
pub const PROCESS_NAME_FLAG: &str = "--process-name";

/// Time allowed for a force-killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Supervisor-wide settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Base for relative executable paths.
    pub install_dir: PathBuf,
    /// Time a child has to report readiness.
    pub startup_timeout: Duration,
    /// Time a child has to exit after the shutdown command.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            install_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from(".")),
            startup_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Posted by a monitor task when its child exits.
#[derive(Debug)]
enum ProcessEvent {
    Exited {
        name: String,
        generation: u64,
        status: String,
    },
}

/// Live child as seen by the supervisor; the `Child` itself lives in the
/// monitor task.
struct ChildHandle {
    pid: u32,
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<String>>,
}

struct Managed {
    spec: ProcessSpec,
    state: watch::Sender<ProcessState>,
    child: Option<ChildHandle>,
    restarts: u32,
    recent_restarts: VecDeque<Instant>,
}

impl Managed {
    fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    fn set_state(&self, name: &str, state: ProcessState) {
        debug!("{}: {}", name, state);
        self.state.send_replace(state);
    }
}

struct Inner {
    config: SupervisorConfig,
    processes: Mutex<HashMap<String, Managed>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
    events: mpsc::UnboundedSender<ProcessEvent>,
    bus: AnnouncementBus,
    announce_socket: Mutex<Option<PathBuf>>,
    stop_listeners: CancellationToken,
}

/// Launches and keeps alive a set of named child processes.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor. Must be called inside a Tokio runtime.
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            processes: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            events,
            bus: AnnouncementBus::new(),
            announce_socket: Mutex::new(None),
            stop_listeners: CancellationToken::new(),
        });
        tokio::spawn(event_loop(Arc::downgrade(&inner), receiver));
        Self { inner }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Register a process; it starts in `NotStarted`.
    pub async fn register(&self, spec: ProcessSpec) -> Result<()> {
        let mut processes = self.inner.processes.lock().await;
        if let Some(existing) = processes.get(&spec.name) {
            if existing.state().is_active() {
                return Err(IpcError::AlreadyRunning(spec.name));
            }
        }
        let (state, _) = watch::channel(ProcessState::NotStarted);
        processes.insert(
            spec.name.clone(),
            Managed {
                spec,
                state,
                child: None,
                restarts: 0,
                recent_restarts: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Listen for `Announce` frames on a Unix socket; children using
    /// announcement readiness are told its path.
    pub async fn listen_for_announcements(&self, path: impl Into<PathBuf>) -> Result<()> {
        let listener = AnnouncementListener::bind(path, self.inner.bus.clone()).await?;
        *self.inner.announce_socket.lock().await = Some(listener.path().to_path_buf());
        tokio::spawn(listener.run(self.inner.stop_listeners.child_token()));
        Ok(())
    }

    /// Subscribe to readiness announcements.
    pub fn announcements(&self) -> broadcast::Receiver<Announce> {
        self.inner.bus.subscribe()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.processes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn state(&self, name: &str) -> Option<ProcessState> {
        self.inner.processes.lock().await.get(name).map(Managed::state)
    }

    /// Watch a process's state transitions.
    pub async fn subscribe(&self, name: &str) -> Option<watch::Receiver<ProcessState>> {
        self.inner.processes.lock().await.get(name).map(|p| p.state.subscribe())
    }

    /// Port and pid while running.
    pub async fn info(&self, name: &str) -> Option<ProcessInfo> {
        self.state(name).await.and_then(|s| s.info())
    }

    /// Automatic restarts performed so far.
    pub async fn restarts(&self, name: &str) -> Option<u32> {
        self.inner.processes.lock().await.get(name).map(|p| p.restarts)
    }

    /// Launch a registered process and wait for its readiness signal.
    pub async fn start(&self, name: &str) -> Result<ProcessInfo> {
        {
            let mut processes = self.inner.processes.lock().await;
            let process = processes
                .get_mut(name)
                .ok_or_else(|| IpcError::UnknownProcess(name.to_string()))?;
            // Only a child already told to die may be replaced
            let live_child = process
                .child
                .as_ref()
                .is_some_and(|c| c.kill.is_some() && c.exited.borrow().is_none());
            if process.state().is_active() || live_child {
                return Err(IpcError::AlreadyRunning(name.to_string()));
            }
            process.recent_restarts.clear();
            process.set_state(name, ProcessState::Launching);
        }
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        self.launch(name).await
    }

    /// Ask a process to exit, escalating to a kill after the shutdown timeout.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let (control, generation, pid, mut exited, kill) = {
            let mut processes = self.inner.processes.lock().await;
            let process = processes
                .get_mut(name)
                .ok_or_else(|| IpcError::UnknownProcess(name.to_string()))?;

            let Some(child) = process.child.as_mut() else {
                // A pending restart is cancelled by leaving Restarting
                if process.state() == ProcessState::Restarting {
                    process.set_state(name, ProcessState::Stopped);
                    return Ok(());
                }
                return Err(IpcError::NotRunning(name.to_string()));
            };
            let handle = (
                process.spec.control_socket.clone(),
                child.generation,
                child.pid,
                child.exited.clone(),
                child.kill.take(),
            );
            process.set_state(name, ProcessState::ShuttingDown);
            handle
        };

        let timeout = self.inner.config.shutdown_timeout;
        let graceful = match &control {
            Some(path) => match request_shutdown(path, timeout).await {
                Ok(response) => {
                    debug!("{} acknowledged shutdown: {}", name, response.message);
                    true
                }
                Err(e) => {
                    warn!("Shutdown command to {} failed: {}", name, e);
                    false
                }
            },
            None => false,
        };

        let mut exited_cleanly = false;
        if graceful {
            exited_cleanly = tokio::time::timeout(timeout, exited.wait_for(Option::is_some))
                .await
                .is_ok();
        }

        if !exited_cleanly {
            tracing::warn!(process = name, pid, "forcing termination");
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            if tokio::time::timeout(KILL_GRACE, exited.wait_for(Option::is_some))
                .await
                .is_err()
            {
                self.finish_stop(name, generation, ProcessState::Failed("termination failed".to_string()))
                    .await;
                return Err(IpcError::TerminationFailed(name.to_string()));
            }
        }

        self.finish_stop(name, generation, ProcessState::Stopped).await;
        tracing::info!(process = name, pid, forced = !exited_cleanly, "process stopped");
        Ok(())
    }

    /// Stop (if running) and start again.
    pub async fn restart(&self, name: &str) -> Result<ProcessInfo> {
        match self.stop(name).await {
            Ok(()) | Err(IpcError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(name).await
    }

    /// Stop every process concurrently; returns once all have stopped or
    /// been killed. Automatic restarts are suppressed from here on.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let names = self.names().await;
        info!("Shutting down {} managed process(es)", names.len());

        let results = join_all(names.iter().map(|name| self.stop(name))).await;
        self.inner.stop_listeners.cancel();

        let mut first_error = None;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(()) | Err(IpcError::NotRunning(_)) => {}
                Err(e) => {
                    warn!("Failed to stop {}: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn set_state(&self, name: &str, state: ProcessState) {
        if let Some(process) = self.inner.processes.lock().await.get(name) {
            process.set_state(name, state);
        }
    }

    /// Settle a stop of child `generation`, unless a newer child has taken
    /// its place in the meantime.
    async fn finish_stop(&self, name: &str, generation: u64, state: ProcessState) {
        let mut processes = self.inner.processes.lock().await;
        let Some(process) = processes.get_mut(name) else {
            return;
        };
        let replaced = process.child.as_ref().is_some_and(|c| c.generation != generation);
        if replaced || process.state() != ProcessState::ShuttingDown {
            debug!("Stop of {} superseded ({})", name, process.state());
            return;
        }
        // The exit event may still be queued; it no longer matches a child
        if matches!(state, ProcessState::Stopped) {
            process.child = None;
        }
        process.set_state(name, state);
    }

    /// Spawn the child for a process already moved to `Launching`.
    async fn launch(&self, name: &str) -> Result<ProcessInfo> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let result = self.spawn_and_wait(name, generation).await;
        if let Err(e) = &result {
            warn!("Launch of {} failed: {}", name, e);
            let mut processes = self.inner.processes.lock().await;
            if let Some(process) = processes.get_mut(name) {
                if process.state() == ProcessState::Launching {
                    process.set_state(name, ProcessState::Failed(e.to_string()));
                }
                let ours = process.child.as_ref().map(|c| c.generation) == Some(generation);
                if ours {
                    if let Some(kill) = process.child.as_mut().and_then(|c| c.kill.take()) {
                        let _ = kill.send(());
                    }
                }
            }
        }
        result
    }

    async fn spawn_and_wait(&self, name: &str, generation: u64) -> Result<ProcessInfo> {
        let spec = {
            let processes = self.inner.processes.lock().await;
            let process = processes
                .get(name)
                .ok_or_else(|| IpcError::UnknownProcess(name.to_string()))?;
            process.spec.clone()
        };
        let helper_port = match &spec.depends_on {
            Some(peer) => Some(
                self.info(peer)
                    .await
                    .ok_or_else(|| IpcError::LaunchFailed(format!("{} needs {} running", name, peer)))?
                    .port,
            ),
            None => None,
        };
        let announce_socket = self.inner.announce_socket.lock().await.clone();
        let mut command = self.build_command(&spec, helper_port, announce_socket.as_deref())?;

        let mut announcements = match spec.readiness {
            ReadinessMode::Announcement => Some(self.inner.bus.subscribe()),
            ReadinessMode::Stdout { .. } => None,
        };

        let mut child = command
            .spawn()
            .map_err(|e| IpcError::LaunchFailed(format!("{}: {}", spec.executable.display(), e)))?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(process = name, pid, "launched");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(name.to_string(), stderr));
        }
        let prefix = match &spec.readiness {
            ReadinessMode::Stdout { prefix } => Some(prefix.clone()),
            ReadinessMode::Announcement => None,
        };
        let (port_tx, port_rx) = oneshot::channel();
        match child.stdout.take() {
            Some(stdout) => {
                tokio::spawn(scan_stdout(name.to_string(), stdout, prefix, port_tx));
            }
            None => drop(port_tx),
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exited) = watch::channel(None);
        tokio::spawn(monitor(
            child,
            name.to_string(),
            generation,
            kill_rx,
            exit_tx,
            self.inner.events.clone(),
        ));

        {
            let mut processes = self.inner.processes.lock().await;
            if let Some(process) = processes.get_mut(name) {
                process.child = Some(ChildHandle {
                    pid,
                    generation,
                    kill: Some(kill_tx),
                    exited: exited.clone(),
                });
            }
        }

        let readiness = async {
            match announcements.as_mut() {
                Some(receiver) => next_announcement_from(receiver, name).await.map(|a| a.port),
                None => port_rx
                    .await
                    .map_err(|_| IpcError::LaunchFailed(format!("{} closed stdout before reporting a port", name))),
            }
        };

        let startup_timeout = self.inner.config.startup_timeout;
        let port = tokio::select! {
            port = readiness => port?,
            status = exited.wait_for(Option::is_some) => {
                let status = status.ok().and_then(|s| s.clone()).unwrap_or_default();
                return Err(IpcError::LaunchFailed(format!("{} exited before ready: {}", name, status)));
            }
            _ = tokio::time::sleep(startup_timeout) => {
                return Err(IpcError::StartupTimeout(format!("{} not ready after {:?}", name, startup_timeout)));
            }
        };

        let info = ProcessInfo { port, pid };
        let mut processes = self.inner.processes.lock().await;
        let process = processes
            .get_mut(name)
            .ok_or_else(|| IpcError::UnknownProcess(name.to_string()))?;
        let current = process.child.as_ref().map(|c| c.generation) == Some(generation);
        if !current || process.state() != ProcessState::Launching {
            return Err(IpcError::LaunchFailed(format!("{} was stopped while launching", name)));
        }
        process.set_state(name, ProcessState::Running(info));
        tracing::info!(process = name, pid, port, "running");
        Ok(info)
    }

    fn build_command(&self, spec: &ProcessSpec, helper_port: Option<u16>, announce_socket: Option<&Path>) -> Result<Command> {
        let executable = spec.resolve_executable(&self.inner.config.install_dir);
        if !executable.is_file() {
            return Err(IpcError::ExecutableNotFound(executable.display().to_string()));
        }

        let mut command = Command::new(&executable);
        command.args(&spec.args);

        if let Some(dir) = &spec.config_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| IpcError::InvalidConfigDirectory(format!("{}: {}", dir.display(), e)))?;
            if !dir.is_dir() {
                return Err(IpcError::InvalidConfigDirectory(dir.display().to_string()));
            }
            command.arg(CONFIG_DIR_FLAG).arg(dir);
        }
        if let Some(port) = helper_port {
            command.arg(HELPER_PORT_FLAG).arg(port.to_string());
        }
        if let Some(path) = &spec.control_socket {
            command.arg(CONTROL_SOCKET_FLAG).arg(path);
        }
        if spec.readiness == ReadinessMode::Announcement {
            let path = announce_socket.ok_or_else(|| {
                IpcError::LaunchFailed(format!("{} uses announcements but none are being received", spec.name))
            })?;
            command
                .arg(ANNOUNCE_SOCKET_FLAG)
                .arg(path)
                .arg(PROCESS_NAME_FLAG)
                .arg(&spec.name);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }

    /// React to a child exit posted by its monitor.
    async fn handle_exit(&self, name: String, generation: u64, status: String) {
        let mut processes = self.inner.processes.lock().await;
        let Some(process) = processes.get_mut(&name) else {
            return;
        };
        if process.child.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        process.child = None;

        // Exits in any other state are driven by start/stop themselves
        if !process.state().is_running() {
            debug!("{} exited ({}) while {}", name, status, process.state());
            return;
        }

        tracing::warn!(process = %name, status = %status, "unexpected exit");
        self.restart_or_fail(process, &name);
    }

    /// Apply the restart policy; caller holds the process table lock.
    fn restart_or_fail(&self, process: &mut Managed, name: &str) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            process.set_state(name, ProcessState::Stopped);
            return;
        }

        let policy = process.spec.restart.clone();
        let now = Instant::now();
        while let Some(oldest) = process.recent_restarts.front() {
            if now.duration_since(*oldest) > policy.window {
                process.recent_restarts.pop_front();
            } else {
                break;
            }
        }
        if process.recent_restarts.len() >= policy.max_restarts as usize {
            tracing::warn!(process = name, restarts = process.restarts, "restart limit reached");
            process.set_state(name, ProcessState::Failed("restart limit reached".to_string()));
            return;
        }

        process.recent_restarts.push_back(now);
        process.restarts += 1;
        process.set_state(name, ProcessState::Restarting);
        tracing::info!(process = name, restarts = process.restarts, backoff_ms = policy.backoff.as_millis() as u64, "scheduling restart");

        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(policy.backoff).await;
            supervisor.relaunch(&name).await;
        });
    }

    async fn relaunch(&self, name: &str) {
        {
            let processes = self.inner.processes.lock().await;
            let Some(process) = processes.get(name) else {
                return;
            };
            if self.inner.shutting_down.load(Ordering::SeqCst) || process.state() != ProcessState::Restarting {
                debug!("Restart of {} abandoned ({})", name, process.state());
                return;
            }
            process.set_state(name, ProcessState::Launching);
        }

        if self.launch(name).await.is_err() {
            let mut processes = self.inner.processes.lock().await;
            if let Some(process) = processes.get_mut(name) {
                if matches!(process.state(), ProcessState::Failed(_)) {
                    self.restart_or_fail(process, name);
                }
            }
        }
    }
}

async fn event_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let supervisor = Supervisor { inner };
        match event {
            ProcessEvent::Exited {
                name,
                generation,
                status,
            } => supervisor.handle_exit(name, generation, status).await,
        }
    }
}

/// Own the child until it exits, then post the exit.
async fn monitor(
    mut child: Child,
    name: String,
    generation: u64,
    mut kill: oneshot::Receiver<()>,
    exited: watch::Sender<Option<String>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill {}: {}", name, e);
            }
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    };
    debug!("{} exited: {}", name, status);
    exited.send_replace(Some(status.clone()));
    let _ = events.send(ProcessEvent::Exited {
        name,
        generation,
        status,
    });
}

/// Forward stdout lines to the log, reporting the first port line.
async fn scan_stdout(name: String, stdout: ChildStdout, prefix: Option<String>, port: oneshot::Sender<u16>) {
    let mut port = Some(port);
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let (Some(prefix), true) = (&prefix, port.is_some()) {
            if let Some(found) = parse_port_line(&line, prefix) {
                if let Some(sender) = port.take() {
                    let _ = sender.send(found);
                }
                continue;
            }
        }
        debug!("[{}] {}", name, line);
    }
}

async fn drain_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{} stderr] {}", name, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::process::RestartPolicy;
    use tempfile::tempdir;

    fn sh_spec(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, "/bin/sh")
            .with_args(["-c", script])
            .with_restart(RestartPolicy::disabled())
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            install_dir: PathBuf::from("/"),
            startup_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_start_reads_port_line() {
        let supervisor = Supervisor::new(fast_config());
        supervisor
            .register(sh_spec("child", "echo hello; echo PORT=54321; sleep 30"))
            .await
            .unwrap();

        let info = supervisor.start("child").await.unwrap();
        assert_eq!(info.port, 54321);
        assert_ne!(info.pid, 0);
        assert_eq!(supervisor.state("child").await, Some(ProcessState::Running(info)));
        assert_eq!(supervisor.info("child").await, Some(info));

        supervisor.shutdown().await.unwrap();
        assert_eq!(supervisor.state("child").await, Some(ProcessState::Stopped));
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let supervisor = Supervisor::new(fast_config());
        supervisor
            .register(sh_spec("child", "echo PORT=1000; sleep 30"))
            .await
            .unwrap();
        supervisor.start("child").await.unwrap();

        let err = supervisor.start("child").await.unwrap_err();
        assert!(matches!(err, IpcError::AlreadyRunning(_)));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_refused_while_shutting_down() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("child.sock");
        // Accepts the shutdown command and never answers
        let control = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = control.accept().await {
                held.push(stream);
            }
        });

        let supervisor = Supervisor::new(SupervisorConfig {
            shutdown_timeout: Duration::from_millis(500),
            ..fast_config()
        });
        supervisor
            .register(sh_spec("child", "echo PORT=1234; sleep 30").with_control_socket(&socket))
            .await
            .unwrap();
        let first = supervisor.start("child").await.unwrap();

        let mut states = supervisor.subscribe("child").await.unwrap();
        let stopping = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.stop("child").await })
        };
        states
            .wait_for(|s| *s == ProcessState::ShuttingDown)
            .await
            .unwrap();

        let err = supervisor.start("child").await.unwrap_err();
        assert!(matches!(err, IpcError::AlreadyRunning(_)));

        stopping.await.unwrap().unwrap();
        assert_eq!(supervisor.state("child").await, Some(ProcessState::Stopped));
        assert_eq!(supervisor.info("child").await, None);

        // Once stopped, a fresh child replaces the old one
        let second = supervisor.start("child").await.unwrap();
        assert_ne!(second.pid, first.pid);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.state("child").await, Some(ProcessState::Running(second)));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let config = SupervisorConfig {
            startup_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let supervisor = Supervisor::new(config);
        supervisor.register(sh_spec("silent", "sleep 30")).await.unwrap();

        let err = supervisor.start("silent").await.unwrap_err();
        assert!(matches!(err, IpcError::StartupTimeout(_)));
        assert!(matches!(supervisor.state("silent").await, Some(ProcessState::Failed(_))));
    }

    #[tokio::test]
    async fn test_exit_before_ready() {
        let supervisor = Supervisor::new(fast_config());
        supervisor.register(sh_spec("quitter", "exit 3")).await.unwrap();
        let err = supervisor.start("quitter").await.unwrap_err();
        assert!(matches!(err, IpcError::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let supervisor = Supervisor::new(fast_config());
        supervisor
            .register(ProcessSpec::new("ghost", "/nonexistent/diskjockey-ghost"))
            .await
            .unwrap();
        let err = supervisor.start("ghost").await.unwrap_err();
        assert!(matches!(err, IpcError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_process() {
        let supervisor = Supervisor::new(fast_config());
        assert!(matches!(
            supervisor.start("nobody").await.unwrap_err(),
            IpcError::UnknownProcess(_)
        ));
        assert!(matches!(
            supervisor.stop("nobody").await.unwrap_err(),
            IpcError::UnknownProcess(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let supervisor = Supervisor::new(fast_config());
        supervisor.register(sh_spec("idle", "sleep 30")).await.unwrap();
        assert!(matches!(
            supervisor.stop("idle").await.unwrap_err(),
            IpcError::NotRunning(_)
        ));
    }

    #[tokio::test]
    async fn test_config_dir_is_created_and_passed() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("cfg");
        let supervisor = Supervisor::new(fast_config());
        // $0 is "sh", the flag lands in $1 and the directory in $2
        supervisor
            .register(
                ProcessSpec::new("cfg", "/bin/sh")
                    .with_args(["-c", "test \"$1\" = --config-dir && test -d \"$2\" && echo PORT=2000; sleep 30", "sh"])
                    .with_config_dir(&config_dir)
                    .with_restart(RestartPolicy::disabled()),
            )
            .await
            .unwrap();

        let info = supervisor.start("cfg").await.unwrap();
        assert_eq!(info.port, 2000);
        assert!(config_dir.is_dir());
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_depends_on_requires_running_peer() {
        let supervisor = Supervisor::new(fast_config());
        supervisor
            .register(sh_spec("backend", "echo PORT=3000; sleep 30").depends_on("helper"))
            .await
            .unwrap();
        supervisor
            .register(sh_spec("helper", "echo PORT=4000; sleep 30"))
            .await
            .unwrap();

        let err = supervisor.start("backend").await.unwrap_err();
        assert!(matches!(err, IpcError::LaunchFailed(_)));

        supervisor.start("helper").await.unwrap();
        supervisor.start("backend").await.unwrap();
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_unexpected_exit() {
        let supervisor = Supervisor::new(fast_config());
        let spec = ProcessSpec::new("flaky", "/bin/sh")
            .with_args(["-c", "echo PORT=5000; sleep 0.2; exit 1"])
            .with_restart(RestartPolicy {
                backoff: Duration::from_millis(50),
                max_restarts: 2,
                window: Duration::from_secs(60),
            });
        supervisor.register(spec).await.unwrap();
        let mut states = supervisor.subscribe("flaky").await.unwrap();

        supervisor.start("flaky").await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            states.wait_for(|s| matches!(s, ProcessState::Failed(_))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(supervisor.restarts("flaky").await, Some(2));
        assert_eq!(
            supervisor.state("flaky").await,
            Some(ProcessState::Failed("restart limit reached".into()))
        );
    }

    #[tokio::test]
    async fn test_shutdown_suppresses_restart() {
        let supervisor = Supervisor::new(fast_config());
        let spec = ProcessSpec::new("steady", "/bin/sh")
            .with_args(["-c", "echo PORT=6000; sleep 30"])
            .with_restart(RestartPolicy {
                backoff: Duration::from_millis(10),
                ..Default::default()
            });
        supervisor.register(spec).await.unwrap();
        supervisor.start("steady").await.unwrap();

        supervisor.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.state("steady").await, Some(ProcessState::Stopped));
        assert_eq!(supervisor.restarts("steady").await, Some(0));
    }

    #[tokio::test]
    async fn test_announcement_readiness() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("announce.sock");
        let supervisor = Supervisor::new(fast_config());
        supervisor.listen_for_announcements(&socket).await.unwrap();

        // The child never prints a port; the test announces on its behalf
        supervisor
            .register(
                sh_spec("announcer", "sleep 30").with_readiness(ReadinessMode::Announcement),
            )
            .await
            .unwrap();

        let announcer = {
            let socket = socket.clone();
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                let mut states = supervisor.subscribe("announcer").await.unwrap();
                states.wait_for(|s| *s == ProcessState::Launching).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                crate::supervisor::readiness::announce(
                    &socket,
                    &Announce {
                        name: "announcer".into(),
                        port: 7070,
                        pid: 0,
                    },
                )
                .await
                .unwrap();
            })
        };

        let info = supervisor.start("announcer").await.unwrap();
        assert_eq!(info.port, 7070);
        announcer.await.unwrap();
        supervisor.shutdown().await.unwrap();
    }
}
