//! Audio pipeline supervision.
//!
//! The pipeline is two external processes chained through an OS pipe:
//!
//! ```text
//! producer --config_dir <dir>        (stdout: raw s16le PCM)
//!     │ stdout ──► stdin
//!     ▼
//! transformer <format args> pipe:0 pipe:1   (stdout: resampled s16le PCM)
//!     │
//!     ▼
//! Pipeline::take_output() ──► drain engine
//! ```
//!
//! The producer's stderr is scanned on a dedicated thread to drive the
//! [`ReadinessGate`]. Each stage is spawned explicitly so a failure in
//! either one is reported against that stage.

// Rust guideline compliant 2026-02

pub mod diagnostics;
pub mod producer_config;
pub mod readiness;

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdout, Command};

pub use diagnostics::{scan_line, LineScan};
pub use producer_config::ensure_producer_config;
pub use readiness::ReadinessGate;

use crate::constants;

/// Polls of the producer's exit status after the transformer is gone.
const PRODUCER_REAP_ATTEMPTS: u32 = 20;

/// Interval between producer exit polls.
const PRODUCER_REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Fatal errors raised while launching the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The executable does not exist.
    #[error("{role} executable not found: {}", path.display())]
    Missing {
        /// Pipeline stage ("producer" or "transformer").
        role: &'static str,
        /// Configured executable path.
        path: PathBuf,
    },
    /// The path exists but cannot be executed.
    #[error("{role} is not an executable file: {}", path.display())]
    NotExecutable {
        /// Pipeline stage.
        role: &'static str,
        /// Configured executable path.
        path: PathBuf,
    },
    /// The OS refused to start the process.
    #[error("failed to launch {role} ({}): {source}", path.display())]
    Launch {
        /// Pipeline stage.
        role: &'static str,
        /// Configured executable path.
        path: PathBuf,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },
    /// A requested stdio pipe was not attached to the child.
    #[error("{role} {stream} was not captured")]
    MissingPipe {
        /// Pipeline stage.
        role: &'static str,
        /// Which stream ("stdout", "stderr").
        stream: &'static str,
    },
    /// The diagnostic reader thread could not be started.
    #[error("failed to start diagnostic reader: {0}")]
    Reader(#[source] io::Error),
}

/// Launch parameters for the two-stage pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Producer executable.
    pub producer_path: PathBuf,
    /// Transformer executable.
    pub transformer_path: PathBuf,
    /// Working/config directory passed to the producer.
    pub config_dir: PathBuf,
    /// Arguments passed to the transformer.
    pub transformer_args: Vec<String>,
}

impl PipelineConfig {
    /// Config with the default transformer format arguments.
    #[must_use]
    pub fn new(producer_path: PathBuf, transformer_path: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            producer_path,
            transformer_path,
            config_dir,
            transformer_args: transformer_args(constants::SAMPLE_RATE, constants::CHANNELS),
        }
    }

    /// Replace the transformer arguments for a different PCM format.
    #[must_use]
    pub fn with_format(mut self, sample_rate: u32, channels: u16) -> Self {
        self.transformer_args = transformer_args(sample_rate, channels);
        self
    }

    /// Replace the transformer arguments wholesale.
    #[must_use]
    pub fn with_transformer_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transformer_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Transformer arguments: read s16le from stdin, resample with drift
/// correction, write s16le to stdout with buffering disabled.
#[must_use]
pub fn transformer_args(sample_rate: u32, channels: u16) -> Vec<String> {
    let rate = sample_rate.to_string();
    let channels = channels.to_string();
    [
        "-re", "-f", "s16le", "-ar", &rate, "-ac", &channels, "-i", "pipe:0",
        "-af", "aresample=async=1",
        "-fflags", "nobuffer", "-flags", "low_delay",
        "-f", "s16le", "-ac", &channels, "-ar", &rate, "pipe:1",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

/// The running producer → transformer pipeline.
///
/// Exactly one exists per server process. Dropping it terminates both
/// stages.
#[derive(Debug)]
pub struct Pipeline {
    producer: std::process::Child,
    transformer: Child,
    output: Option<ChildStdout>,
    gate: ReadinessGate,
    terminated: bool,
}

impl Pipeline {
    /// Spawn the producer and transformer, wiring producer stdout into
    /// transformer stdin.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &PipelineConfig) -> Result<Self, SpawnError> {
        check_executable("producer", &config.producer_path)?;
        check_executable("transformer", &config.transformer_path)?;

        log::info!(
            "[Pipeline] Launching {} --config_dir {} | {} {}",
            config.producer_path.display(),
            config.config_dir.display(),
            config.transformer_path.display(),
            config.transformer_args.join(" ")
        );

        let mut producer = std::process::Command::new(&config.producer_path)
            .arg("--config_dir")
            .arg(&config.config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Launch {
                role: "producer",
                path: config.producer_path.clone(),
                source,
            })?;

        let (Some(producer_stdout), Some(producer_stderr)) =
            (producer.stdout.take(), producer.stderr.take())
        else {
            kill_and_reap(&mut producer);
            return Err(SpawnError::MissingPipe { role: "producer", stream: "stdout/stderr" });
        };

        let transformer = Command::new(&config.transformer_path)
            .args(&config.transformer_args)
            .stdin(Stdio::from(producer_stdout))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut transformer = match transformer {
            Ok(child) => child,
            Err(source) => {
                kill_and_reap(&mut producer);
                return Err(SpawnError::Launch {
                    role: "transformer",
                    path: config.transformer_path.clone(),
                    source,
                });
            }
        };

        let gate = ReadinessGate::new();
        let mut pipeline = Self {
            producer,
            output: transformer.stdout.take(),
            transformer,
            gate: gate.clone(),
            terminated: false,
        };

        if pipeline.output.is_none() {
            pipeline.terminate();
            return Err(SpawnError::MissingPipe { role: "transformer", stream: "stdout" });
        }

        if let Err(e) = diagnostics::spawn_reader(producer_stderr, "producer", Some(gate)) {
            pipeline.terminate();
            return Err(SpawnError::Reader(e));
        }

        if let Some(stderr) = pipeline.transformer.stderr.take() {
            // Transformer chatter is only logged; readiness comes from the producer.
            diagnostics::spawn_async_reader(stderr, "transformer");
        }

        log::info!(
            "[Pipeline] Started (producer pid {}, transformer pid {:?})",
            pipeline.producer.id(),
            pipeline.transformer.id()
        );
        Ok(pipeline)
    }

    /// A handle to the readiness latch driven by the producer's diagnostics.
    #[must_use]
    pub fn readiness(&self) -> ReadinessGate {
        self.gate.clone()
    }

    /// Wait up to `timeout` for the producer to authenticate.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.gate.wait(timeout).await
    }

    /// Hand the transformer's stdout to the drain engine.
    ///
    /// Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.output.take()
    }

    /// Send a termination signal to both stages.
    ///
    /// Idempotent; only the first call signals.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        log::info!("[Pipeline] Terminating producer and transformer");

        #[cfg(unix)]
        {
            send_sigterm(self.producer.id(), "producer");
            match self.transformer.id() {
                Some(pid) => send_sigterm(pid, "transformer"),
                None => log::debug!("[Pipeline] Transformer already reaped"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.producer.kill();
            let _ = self.transformer.start_kill();
        }

        // Reap the producer if it already went away; otherwise the OS
        // collects it when we exit.
        if let Ok(Some(status)) = self.producer.try_wait() {
            log::debug!("[Pipeline] Producer exited: {}", status);
        }
    }

    /// Wait for both stages to exit.
    ///
    /// Returns the transformer's status. Callers bound this with a timeout
    /// and fall back to [`kill`](Self::kill).
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.transformer.wait().await?;
        loop {
            if let Some(producer) = self.producer.try_wait()? {
                log::debug!("[Pipeline] Producer exited: {}", producer);
                break;
            }
            tokio::time::sleep(PRODUCER_REAP_INTERVAL).await;
        }
        Ok(status)
    }

    /// SIGKILL both stages and reap them.
    ///
    /// For stages that ignored [`terminate`](Self::terminate).
    pub async fn kill(&mut self) {
        self.terminated = true;
        log::warn!("[Pipeline] Killing producer and transformer");

        if let Err(e) = self.transformer.kill().await {
            log::debug!("[Pipeline] Killing transformer failed: {}", e);
        }
        if let Err(e) = self.producer.kill() {
            log::debug!("[Pipeline] Killing producer failed: {}", e);
        }
        for _ in 0..PRODUCER_REAP_ATTEMPTS {
            match self.producer.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("[Pipeline] Producer exited: {}", status);
                    return;
                }
                Ok(None) => tokio::time::sleep(PRODUCER_REAP_INTERVAL).await,
                Err(e) => {
                    log::debug!("[Pipeline] Reaping producer failed: {}", e);
                    return;
                }
            }
        }
        log::warn!("[Pipeline] Producer {} not reaped after SIGKILL", self.producer.id());
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn check_executable(role: &'static str, path: &Path) -> Result<(), SpawnError> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Err(SpawnError::Missing { role, path: path.to_path_buf() });
    };
    if !meta.is_file() {
        return Err(SpawnError::NotExecutable { role, path: path.to_path_buf() });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(SpawnError::NotExecutable { role, path: path.to_path_buf() });
        }
    }
    Ok(())
}

#[cfg(unix)]
fn send_sigterm(pid: u32, role: &str) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        log::warn!("[Pipeline] {} pid {} out of range", role, pid);
        return;
    };
    // SAFETY: kill(2) only takes integers; `pid` belongs to a child we spawned.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        log::debug!(
            "[Pipeline] SIGTERM to {} ({}) failed: {}",
            role,
            pid,
            io::Error::last_os_error()
        );
    }
}

fn kill_and_reap(child: &mut std::process::Child) {
    if let Err(e) = child.kill() {
        log::debug!("[Pipeline] Killing pid {} failed: {}", child.id(), e);
    }
    match child.wait() {
        Ok(status) => log::debug!("[Pipeline] Pid {} exited: {}", child.id(), status),
        Err(e) => log::debug!("[Pipeline] Reaping pid {} failed: {}", child.id(), e),
    }
}
