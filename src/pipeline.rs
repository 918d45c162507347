//! Transcode pipeline
//!
//! One run per accepted connection: spawn the transcoder for the station's
//! stream, copy its raw PCM output to the connection until either side ends,
//! then reap the process.
//!
//! ```text
//! Spawning --spawn ok--> Streaming --copy ends--> Draining --wait done--> Reaped
//!     \--spawn failed / no stdout---------------------------------------> Reaped
//! ```
//!
//! A run is never cancelled directly. Shutting down the downstream socket
//! makes the copy fail, dropping stdout makes the transcoder's next write
//! fail, and the transcoder exits on its own.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Exit status ffmpeg reports when its output pipe breaks (-EPIPE & 0xff)
pub const BROKEN_PIPE_EXIT_CODE: i32 = 224;
const SIGPIPE: i32 = 13;
const COPY_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Output format expected by the playback device. Not configurable.
const OUTPUT_ARGS: [&str; 9] = [
    "-acodec",
    "pcm_s16le",
    "-ac",
    "2",
    "-ar",
    "44100",
    "-f",
    "s16le",
    "pipe:1",
];

/// Arguments for one transcoder invocation reading `source`
pub fn transcoder_args(source: &str) -> Vec<String> {
    let mut args = vec!["-i".to_string(), source.to_string()];
    args.extend(OUTPUT_ARGS.iter().map(|a| a.to_string()));
    args
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to start transcoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transcoder output handle unavailable")]
    NoStdout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Spawning,
    Streaming,
    Draining,
    Reaped,
}

/// Why the copy loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyEnd {
    /// Transcoder closed its output
    SourceExhausted,
    /// Reading transcoder output failed
    SourceFailed(String),
    /// Downstream write failed or the peer hung up (includes forced close)
    DownstreamGone(String),
}

/// How the transcoder process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    /// Output pipe broke because the downstream side went away
    BrokenPipe,
    Unexpected(String),
    /// Did not exit within the reap timeout and was killed
    Killed,
    WaitFailed(String),
}

impl ExitKind {
    pub fn classify(status: ExitStatus) -> Self {
        if status.success() {
            return ExitKind::Success;
        }
        if status.code() == Some(BROKEN_PIPE_EXIT_CODE) {
            return ExitKind::BrokenPipe;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if status.signal() == Some(SIGPIPE) {
                return ExitKind::BrokenPipe;
            }
        }
        ExitKind::Unexpected(status.to_string())
    }

    fn is_expected(&self) -> bool {
        matches!(self, ExitKind::Success | ExitKind::BrokenPipe)
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Never reached `Streaming`; no process is left behind
    SpawnFailed(PipelineError),
    Completed { copy_end: CopyEnd, exit: ExitKind },
}

impl RunOutcome {
    /// True when the run could not start or the transcoder ended abnormally
    pub fn is_failure(&self) -> bool {
        match self {
            RunOutcome::SpawnFailed(_) => true,
            RunOutcome::Completed { exit, .. } => !exit.is_expected(),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            RunOutcome::SpawnFailed(e) => format!("spawn failed: {}", e),
            RunOutcome::Completed { copy_end, exit } => {
                let end = match copy_end {
                    CopyEnd::SourceExhausted => "stream ended".to_string(),
                    CopyEnd::SourceFailed(e) => format!("stream read failed: {}", e),
                    CopyEnd::DownstreamGone(e) => format!("client gone: {}", e),
                };
                let exit = match exit {
                    ExitKind::Success => "exit 0".to_string(),
                    ExitKind::BrokenPipe => "broken pipe".to_string(),
                    ExitKind::Unexpected(s) => format!("unexpected {}", s),
                    ExitKind::Killed => "killed".to_string(),
                    ExitKind::WaitFailed(e) => format!("wait failed: {}", e),
                };
                format!("{}, {}", end, exit)
            }
        }
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub bytes_copied: u64,
    pub outcome: RunOutcome,
}

/// Logs state transitions of a single run
struct RunTracker<'a> {
    source: &'a str,
    state: PipelineState,
}

impl<'a> RunTracker<'a> {
    fn new(source: &'a str) -> Self {
        debug!(source, "pipeline {:?}", PipelineState::Spawning);
        Self {
            source,
            state: PipelineState::Spawning,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!(source = self.source, "pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Spawns and supervises transcoder processes
#[derive(Debug, Clone)]
pub struct Transcoder {
    program: PathBuf,
    inherit_stderr: bool,
    reap_timeout: Duration,
}

impl Transcoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            inherit_stderr: false,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
        }
    }

    pub fn with_inherit_stderr(mut self, inherit: bool) -> Self {
        self.inherit_stderr = inherit;
        self
    }

    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }

    fn command(&self, source: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(transcoder_args(source))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if self.inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            });
        cmd
    }

    /// Stream `source` to `conn` until either side ends. Always reaps the
    /// process it spawned before returning.
    pub async fn run(&self, source: &str, conn: TcpStream) -> PipelineReport {
        let mut tracker = RunTracker::new(source);

        let mut child = match self.command(source).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracker.advance(PipelineState::Reaped);
                return PipelineReport {
                    bytes_copied: 0,
                    outcome: RunOutcome::SpawnFailed(PipelineError::Spawn {
                        program: self.program.display().to_string(),
                        source: e,
                    }),
                };
            }
        };

        let Some(stdout) = child.stdout.take() else {
            // Started but unusable: kill it so nothing is left unreaped
            if let Err(e) = child.kill().await {
                warn!("Failed to kill transcoder without stdout: {}", e);
            }
            tracker.advance(PipelineState::Reaped);
            return PipelineReport {
                bytes_copied: 0,
                outcome: RunOutcome::SpawnFailed(PipelineError::NoStdout),
            };
        };

        tracker.advance(PipelineState::Streaming);
        let mut bytes_copied = 0u64;
        let copy_end = stream_to(stdout, conn, &mut bytes_copied).await;
        match &copy_end {
            CopyEnd::SourceExhausted => {
                info!("Stream ended normally after {} bytes", bytes_copied)
            }
            CopyEnd::SourceFailed(e) => {
                warn!("Reading transcoder output failed after {} bytes: {}", bytes_copied, e)
            }
            CopyEnd::DownstreamGone(e) => {
                info!("Connection broken after {} bytes: {}", bytes_copied, e)
            }
        }

        tracker.advance(PipelineState::Draining);
        let exit = self.reap(&mut child).await;
        tracker.advance(PipelineState::Reaped);

        match &exit {
            ExitKind::Success => info!("Transcoder exited normally with status 0"),
            ExitKind::BrokenPipe => info!("Transcoder exited with expected broken pipe"),
            ExitKind::Unexpected(status) => warn!("Unexpected transcoder exit: {}", status),
            ExitKind::Killed => warn!(
                "Transcoder did not exit within {:?} and was killed",
                self.reap_timeout
            ),
            ExitKind::WaitFailed(e) => warn!("Error waiting for transcoder: {}", e),
        }

        PipelineReport {
            bytes_copied,
            outcome: RunOutcome::Completed { copy_end, exit },
        }
    }

    async fn reap(&self, child: &mut Child) -> ExitKind {
        match tokio::time::timeout(self.reap_timeout, child.wait()).await {
            Ok(Ok(status)) => ExitKind::classify(status),
            Ok(Err(e)) => ExitKind::WaitFailed(e.to_string()),
            Err(_) => match child.kill().await {
                Ok(()) => ExitKind::Killed,
                Err(e) => ExitKind::WaitFailed(e.to_string()),
            },
        }
    }
}

/// Copy transcoder output to the connection while watching for hang-up.
/// Consumes both ends so stdout is closed when this returns.
async fn stream_to(mut stdout: ChildStdout, conn: TcpStream, bytes: &mut u64) -> CopyEnd {
    let (mut reader, mut writer) = conn.into_split();
    tokio::select! {
        end = pump(&mut stdout, &mut writer, bytes) => end,
        reason = hangup(&mut reader) => CopyEnd::DownstreamGone(reason),
    }
}

async fn pump(stdout: &mut ChildStdout, writer: &mut OwnedWriteHalf, bytes: &mut u64) -> CopyEnd {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => return CopyEnd::SourceExhausted,
            Ok(n) => n,
            Err(e) => return CopyEnd::SourceFailed(e.to_string()),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return CopyEnd::DownstreamGone(e.to_string());
        }
        *bytes += n as u64;
    }
}

/// Resolves once the peer closes or the socket is shut down locally.
/// The device never sends anything meaningful; stray bytes are discarded.
async fn hangup(reader: &mut OwnedReadHalf) -> String {
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return "peer closed connection".to_string(),
            Ok(_) => continue,
            Err(e) => return e.to_string(),
        }
    }
}
