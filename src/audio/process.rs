//! # External Codec Processes
//!
//! A transcoding pipeline runs two external processes: a decoder turning the
//! source into raw PCM and an encoder turning PCM into the container sent to
//! the speaker. The pipeline only sees them through [`ProcessLauncher`] and
//! [`ProcessHandle`], so tests can swap in in-memory doubles.
//!
//! ## Lifecycle:
//! 1. **Launch**: the launcher spawns the process and hands over its pipes
//! 2. **Supervise**: a background task waits for exit or a stop request
//! 3. **Stop**: `stop()` is a one-shot request; the supervisor kills and reaps
//! 4. **Exit**: every clone of the exit signal observes the same `ProcessExit`

use crate::audio::gain::SampleFormat;
use anyhow::{Context, Result};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which half of the transcode a process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Source → raw PCM on stdout
    Decode,
    /// Raw PCM on stdin → compressed container on stdout
    Encode,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Decode => write!(f, "decoder"),
            ProcessRole::Encode => write!(f, "encoder"),
        }
    }
}

/// Arguments for one external process.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub role: ProcessRole,
    pub args: Vec<String>,
}

impl ProcessCommand {
    /// Arguments with header values masked, safe for logs.
    pub fn redacted_args(&self) -> String {
        let mut redacted = Vec::with_capacity(self.args.len());
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                redacted.push("<redacted>".to_string());
                mask_next = false;
                continue;
            }
            mask_next = arg == "-headers";
            redacted.push(arg.clone());
        }
        redacted.join(" ")
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own; `None` means terminated by a signal we didn't send
    Exited(Option<i32>),
    /// Stopped because we asked it to
    Killed,
    /// Supervision itself failed (wait error, supervisor dropped)
    Failed(String),
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Exited(Some(0)))
    }

    /// Abnormal termination that we did not request.
    pub fn is_failure(&self) -> bool {
        match self {
            ProcessExit::Exited(code) => *code != Some(0),
            ProcessExit::Killed => false,
            ProcessExit::Failed(_) => true,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Exited(Some(code)) => write!(f, "exited with status {}", code),
            ProcessExit::Exited(None) => write!(f, "terminated by signal"),
            ProcessExit::Killed => write!(f, "stopped"),
            ProcessExit::Failed(msg) => write!(f, "supervision failed: {}", msg),
        }
    }
}

/// Spawns external processes for a pipeline.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, command: &ProcessCommand) -> Result<ProcessHandle>;
}

/// A running (or finished) external process.
pub struct ProcessHandle {
    role: ProcessRole,
    stdin: Option<ProcessWriter>,
    stdout: Option<ProcessReader>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Wrap a process's pipes and start supervising it.
    ///
    /// `supervise` receives the stop token and must resolve once the process
    /// is gone, killing it first if the token fires. Must be called from
    /// within a tokio runtime.
    pub fn new<F, Fut>(
        role: ProcessRole,
        stdin: Option<ProcessWriter>,
        stdout: ProcessReader,
        supervise: F,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ProcessExit> + Send + 'static,
    {
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let supervisor = supervise(kill.clone());

        tokio::spawn(async move {
            let exit = supervisor.await;
            debug!(process = %role, exit = %exit, "Process finished");
            let _ = exit_tx.send(Some(exit));
        });

        Self {
            role,
            stdin,
            stdout: Some(stdout),
            kill,
            exit: exit_rx,
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn take_stdin(&mut self) -> Option<ProcessWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ProcessReader> {
        self.stdout.take()
    }

    /// Request termination. Safe to call repeatedly or after exit.
    pub fn stop(&self) {
        self.kill.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Exit status if the process has already finished.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    /// Future resolving with the exit status; independent of `self`.
    pub fn exited(&self) -> impl Future<Output = ProcessExit> + Send + 'static {
        let mut exit = self.exit.clone();
        async move {
            match exit.wait_for(|status| status.is_some()).await {
                Ok(status) => (*status)
                    .clone()
                    .unwrap_or_else(|| ProcessExit::Failed("missing exit status".to_string())),
                Err(_) => ProcessExit::Failed("supervisor dropped".to_string()),
            }
        }
    }
}

/// Build the decoder arguments: source → raw PCM on stdout.
pub fn decode_args(
    input_url: &str,
    auth_header: Option<&str>,
    start_offset_seconds: f64,
    format: SampleFormat,
    sample_rate: u32,
    channels: u16,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

    if let Some(header) = auth_header {
        args.push("-headers".into());
        args.push(format!("{}\r\n", header));
    }

    if start_offset_seconds > 0.0 {
        args.push("-ss".into());
        args.push(format!("{:.3}", start_offset_seconds));
    }

    args.extend([
        "-i".to_string(),
        input_url.to_string(),
        "-vn".to_string(),
        "-acodec".to_string(),
        format.ffmpeg_codec().to_string(),
        "-f".to_string(),
        format.ffmpeg_name().to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-ac".to_string(),
        channels.to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

/// Build the encoder arguments: raw PCM on stdin → MP3 on stdout.
pub fn encode_args(
    format: SampleFormat,
    sample_rate: u32,
    channels: u16,
    bitrate_kbps: u32,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.extend([
        "-f".to_string(),
        format.ffmpeg_name().to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-ac".to_string(),
        channels.to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-acodec".to_string(),
        "libmp3lame".to_string(),
        "-b:a".to_string(),
        format!("{}k", bitrate_kbps),
        "-f".to_string(),
        "mp3".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

/// Launches ffmpeg for both pipeline roles.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    binary: PathBuf,
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ProcessLauncher for FfmpegLauncher {
    fn launch(&self, command: &ProcessCommand) -> Result<ProcessHandle> {
        let role = command.role;
        info!(process = %role, args = %command.redacted_args(), "Spawning ffmpeg");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match role {
            ProcessRole::Decode => cmd.stdin(Stdio::null()),
            ProcessRole::Encode => cmd.stdin(Stdio::piped()),
        };

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {} ({})", role, self.binary.display()))?;

        let stdin = child.stdin.take().map(|s| Box::new(s) as ProcessWriter);
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("{} stdout missing", role))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(process = %role, "ffmpeg: {}", line);
                }
            });
        }

        Ok(ProcessHandle::new(role, stdin, Box::new(stdout), move |kill| async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ProcessExit::Exited(status.code()),
                    Err(e) => ProcessExit::Failed(e.to_string()),
                },
                _ = kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        warn!(process = %role, error = %e, "Kill failed (already exited?)");
                    }
                    let _ = child.wait().await;
                    ProcessExit::Killed
                }
            }
        }))
    }
}
