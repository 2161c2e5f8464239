//! Runs the build command and relays its output

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{error, info, warn};

use crate::command::BuildCommand;
use crate::error::{FAILURE_EXIT_CODE, Result, WebhookError};

pub const SUCCESS_MESSAGE: &str = "Successful rebuild!";
pub const FAILURE_MESSAGE: &str = "Oops! An error occured!";

/// Time a timed-out build gets to exit after SIGTERM before its process group is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// One line of build output, tagged with the stream it came from
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

impl OutputChunk {
    /// Progress marker shown to the caller for this chunk.
    pub fn marker(&self) -> &'static str {
        match self {
            OutputChunk::Stdout(_) => ".",
            OutputChunk::Stderr(_) => "E",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildOutcome {
    pub exit_code: i32,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn summary(&self) -> &'static str {
        summary_for(self.exit_code)
    }
}

/// Final message for a process exit code. Only exactly 0 counts as success.
pub fn summary_for(exit_code: i32) -> &'static str {
    if exit_code == 0 {
        SUCCESS_MESSAGE
    } else {
        FAILURE_MESSAGE
    }
}

/// Spawn the build, feed every output line to `on_chunk` and wait for it to exit.
/// When `timeout` elapses the build's whole process group is stopped and
/// `BuildTimedOut` is returned.
pub async fn run_build<F>(
    command: &BuildCommand,
    timeout: Option<Duration>,
    mut on_chunk: F,
) -> Result<BuildOutcome>
where
    F: FnMut(OutputChunk),
{
    info!("Running: {}", command.display());
    let mut child = command.to_command().spawn().map_err(|e| {
        error!("Build command failed to start: {}", e);
        WebhookError::BuildSpawnFailed(e)
    })?;

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, drive(&mut child, &mut on_chunk)).await {
            Ok(status) => status,
            Err(_) => {
                error!("Build exceeded {:?}, stopping it", limit);
                stop_build(&mut child).await;
                return Err(WebhookError::BuildTimedOut(limit.as_secs()));
            }
        },
        None => drive(&mut child, &mut on_chunk).await,
    }
    .map_err(|e| {
        error!("Lost track of the build process: {}", e);
        WebhookError::BuildWaitFailed(e)
    })?;

    let outcome = BuildOutcome {
        exit_code: status.code().unwrap_or(FAILURE_EXIT_CODE),
    };
    if outcome.is_success() {
        info!("Build finished successfully");
    } else {
        error!("Build failed with exit code {}", outcome.exit_code);
    }
    Ok(outcome)
}

/// A child pipe read as raw bytes. Output is split on `\n` and decoded lossily,
/// so bytes that are not UTF-8 never stop the pipe from being drained.
struct OutputPipe<R> {
    reader: BufReader<R>,
    // Kept across `select!` cancellations: `read_until` appends partial reads here.
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputPipe<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at EOF.
    async fn next_chunk(&mut self) -> io::Result<Option<String>> {
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

async fn drive<F>(child: &mut Child, on_chunk: &mut F) -> io::Result<ExitStatus>
where
    F: FnMut(OutputChunk),
{
    let mut stdout = child.stdout.take().map(OutputPipe::new);
    let mut stderr = child.stderr.take().map(OutputPipe::new);

    // A pipe is only dropped at EOF or on a read error from the OS; dropping it
    // earlier would leave the child blocked on a full pipe.
    loop {
        tokio::select! {
            line = next_chunk(&mut stdout), if stdout.is_some() => match line {
                Ok(Some(line)) => on_chunk(OutputChunk::Stdout(line)),
                Ok(None) => stdout = None,
                Err(e) => {
                    warn!("Failed to read build stdout: {}", e);
                    stdout = None;
                }
            },
            line = next_chunk(&mut stderr), if stderr.is_some() => match line {
                Ok(Some(line)) => {
                    warn!(target: "satis_webhook::build", "{}", line);
                    on_chunk(OutputChunk::Stderr(line));
                }
                Ok(None) => stderr = None,
                Err(e) => {
                    warn!("Failed to read build stderr: {}", e);
                    stderr = None;
                }
            },
            else => break,
        }
    }

    child.wait().await
}

async fn next_chunk<R>(pipe: &mut Option<OutputPipe<R>>) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(pipe) => pipe.next_chunk().await,
        None => std::future::pending().await,
    }
}

/// Stop a timed-out build and everything it started. The build runs in its own
/// process group: the group gets SIGTERM first, which `sudo` relays to the
/// command it wraps, then SIGKILL once the grace period is over.
async fn stop_build(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            if tokio::time::timeout(TERMINATE_GRACE, child.wait())
                .await
                .is_err()
            {
                warn!("Build did not exit within {:?} of SIGTERM", TERMINATE_GRACE);
            }
            // Sweep whatever the build left running in its group.
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }
    }

    if let Err(e) = child.kill().await {
        // Already reaped above.
        if e.kind() != io::ErrorKind::InvalidInput {
            warn!("Failed to kill build process: {}", e);
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {} to build group {}: {}", signal, pgid, e),
    }
}
