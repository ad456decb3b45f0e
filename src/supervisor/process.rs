//! Description and lifecycle states of one managed process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ipc::transport::Endpoint;

/// Default stdout prefix a child prints once it is listening.
pub const DEFAULT_PORT_PREFIX: &str = "PORT=";

/// Reported by a child once it is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub port: u16,
    pub pid: u32,
}

/// How a child signals readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessMode {
    /// A stdout line `<prefix><port>`.
    Stdout { prefix: String },
    /// An `Announce` frame on the supervisor's announcement socket.
    Announcement,
}

impl Default for ReadinessMode {
    fn default() -> Self {
        ReadinessMode::Stdout {
            prefix: DEFAULT_PORT_PREFIX.to_string(),
        }
    }
}

/// When and how often an unexpectedly exited child is relaunched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before relaunching.
    pub backoff: Duration,
    /// Restarts allowed within `window`; one more moves the process to `Failed`.
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Never restart.
    pub fn disabled() -> Self {
        Self {
            max_restarts: 0,
            ..Default::default()
        }
    }
}

/// Everything needed to launch one managed process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Name used for lookup, logging and announcements.
    pub name: String,
    /// Relative to the supervisor's install directory unless absolute.
    pub executable: PathBuf,
    /// Passed before the supervisor's own arguments.
    pub args: Vec<String>,
    /// Passed as `--config-dir`; created if missing.
    pub config_dir: Option<PathBuf>,
    pub readiness: ReadinessMode,
    /// Control socket for graceful shutdown, passed as `--control-socket`.
    pub control_socket: Option<PathBuf>,
    /// Peer whose port is passed as `--helper-port`.
    pub depends_on: Option<String>,
    pub restart: RestartPolicy,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            config_dir: None,
            readiness: ReadinessMode::default(),
            control_socket: None,
            depends_on: None,
            restart: RestartPolicy::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessMode) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = Some(path.into());
        self
    }

    pub fn depends_on(mut self, peer: impl Into<String>) -> Self {
        self.depends_on = Some(peer.into());
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Resolve the executable against an install directory.
    pub fn resolve_executable(&self, install_dir: &Path) -> PathBuf {
        if self.executable.is_absolute() {
            self.executable.clone()
        } else {
            install_dir.join(&self.executable)
        }
    }

    pub fn control_endpoint(&self) -> Option<Endpoint> {
        self.control_socket.clone().map(Endpoint::Unix)
    }
}

/// Lifecycle of a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Launching,
    Running(ProcessInfo),
    Restarting,
    ShuttingDown,
    Stopped,
    Failed(String),
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running(_))
    }

    /// Launching, running or shutting down; a start request is refused in
    /// these states.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessState::Launching | ProcessState::Running(_) | ProcessState::ShuttingDown
        )
    }

    pub fn info(&self) -> Option<ProcessInfo> {
        match self {
            ProcessState::Running(info) => Some(*info),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not started"),
            ProcessState::Launching => write!(f, "launching"),
            ProcessState::Running(info) => write!(f, "running (pid {}, port {})", info.pid, info.port),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::ShuttingDown => write!(f, "shutting down"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Failed(cause) => write!(f, "failed: {}", cause),
        }
    }
}
