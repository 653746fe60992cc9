//! Output readers and process termination.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastRegistry;

/// Which child stream a reader is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Spawn a task publishing every line of `stream` until EOF or a read error.
pub(crate) fn spawn_reader<R>(
    stream: R,
    source: OutputStream,
    output: Arc<BroadcastRegistry>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut lines = 0usize;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    debug!(stream = %source, "{}", line);
                    output.publish(line).await;
                    lines += 1;
                }
                Err(e) => {
                    warn!(stream = %source, error = %e, "Output read failed");
                    break;
                }
            }
        }
        debug!(stream = %source, lines, "Output reader finished");
    })
}

/// Strip the line terminator and decode lossily.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Wait for readers to hit EOF, aborting any still running after `timeout`.
///
/// Readers can outlive the process when a grandchild inherited its pipes.
pub(crate) async fn drain_readers(readers: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            warn!("Output reader still open after process exit, aborting");
            reader.abort();
        }
    }
}

/// Terminate the child: SIGTERM, then SIGKILL once `grace` elapses.
///
/// A zero grace period (and every non-unix target) kills immediately.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if !grace.is_zero()
        && let Some(pid) = child.id()
    {
        // SAFETY: pid is a valid process ID obtained from our own Child handle,
        // which has not been reaped yet. kill(2) with SIGTERM is safe to call.
        #[allow(unsafe_code, clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret == 0 {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(exit) => {
                    info!(pid, "Process exited after SIGTERM");
                    return exit;
                }
                Err(_) => warn!(pid, "Timeout waiting for graceful shutdown, killing"),
            }
        } else {
            let err = std::io::Error::last_os_error();
            warn!(pid, error = %err, "Failed to send SIGTERM, killing");
        }
    }

    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill process");
    }
    child.wait().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_terminators() {
        assert_eq!(decode_line(b"hi\n"), "hi");
        assert_eq!(decode_line(b"hi\r\n"), "hi");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[test]
    fn decode_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn reader_publishes_each_line() {
        let output = Arc::new(BroadcastRegistry::new(8, None));
        let mut sub = output.subscribe().await;

        let input: &[u8] = b"first\nsecond\r\nthird";
        spawn_reader(input, OutputStream::Stdout, Arc::clone(&output))
            .await
            .unwrap();

        assert_eq!(sub.recv().await.as_deref(), Some("first"));
        assert_eq!(sub.recv().await.as_deref(), Some("second"));
        assert_eq!(sub.recv().await.as_deref(), Some("third"));
        assert_eq!(output.log().await, "firstsecondthird");
    }

    #[tokio::test]
    async fn drain_aborts_stuck_readers() {
        let stuck = tokio::spawn(std::future::pending::<()>());
        let started = tokio::time::Instant::now();
        drain_readers(vec![stuck], Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
