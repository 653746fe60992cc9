//! The runner: one supervised child process.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::RunnerConfig;
use super::error::{ExitError, Operation, RunnerError};
use super::stream::{OutputStream, drain_readers, spawn_reader, terminate};
use crate::broadcast::{BroadcastRegistry, OutputSubscription};
use crate::status::Status;

/// Recorded result of the process, `None` until completion fires.
type Outcome = Option<Result<(), ExitError>>;

/// Supervisor for a single child-process execution.
///
/// Cheap to clone; clones share the same process.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

struct Inner {
    config: RunnerConfig,
    /// Transition lock. Every status change happens while holding it.
    lifecycle: Mutex<Lifecycle>,
    /// Lock-free mirror of `lifecycle.status` for readers.
    status_tx: watch::Sender<Status>,
    cancel: CancellationToken,
    /// Cancelled once the process is gone (or being stopped). Aborts input
    /// writes still in flight so the waiter can take stdin.
    exited: CancellationToken,
    stdin: Mutex<Option<ChildStdin>>,
    pid: OnceLock<u32>,
    output: Arc<BroadcastRegistry>,
    /// Completion signal carrying the terminal error.
    outcome_tx: watch::Sender<Outcome>,
}

struct Lifecycle {
    status: Status,
    /// Prepared command, taken on start.
    command: Option<Command>,
}

impl Runner {
    /// Prepare a runner for `config` without launching anything.
    pub fn new(config: RunnerConfig) -> Self {
        let command = config.build_command();
        let output = Arc::new(BroadcastRegistry::new(
            config.subscriber_capacity,
            config.subscriber_timeout,
        ));
        let cancel = CancellationToken::new();
        let exited = cancel.child_token();
        let (status_tx, _) = watch::channel(Status::Ready);
        let (outcome_tx, _) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                config,
                lifecycle: Mutex::new(Lifecycle {
                    status: Status::Ready,
                    command: Some(command),
                }),
                status_tx,
                cancel,
                exited,
                stdin: Mutex::new(None),
                pid: OnceLock::new(),
                output,
                outcome_tx,
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Launch the process. Only valid from `READY`.
    ///
    /// On a spawn failure the runner moves to `FAILED`, records the launch
    /// error as its terminal error and fires completion.
    pub async fn start(&self) -> Result<(), RunnerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        require(Operation::Start, lifecycle.status, Status::Ready)?;
        let Some(mut command) = lifecycle.command.take() else {
            return Err(RunnerError::InvalidTransition {
                operation: Operation::Start,
                status: lifecycle.status,
            });
        };

        let config = &self.inner.config;
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = e.to_string();
                error!(command = %config.command, error = %reason, "Failed to spawn process");
                self.inner.transition(&mut lifecycle, Status::Failed);
                drop(lifecycle);

                self.inner.output.close().await;
                self.inner.complete(Err(ExitError::Spawn {
                    reason: reason.clone(),
                }));
                return Err(RunnerError::Spawn { reason });
            }
        };

        if let Some(pid) = child.id() {
            let _ = self.inner.pid.set(pid);
        }
        *self.inner.stdin.lock().await = child.stdin.take();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&self.inner.output),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&self.inner.output),
            ));
        }

        info!(
            command = %config.command,
            args = ?config.args,
            working_dir = ?config.working_dir,
            pid = ?child.id(),
            "Process started"
        );

        tokio::spawn(supervise(Arc::clone(&self.inner), child, readers));
        self.inner.transition(&mut lifecycle, Status::Running);
        Ok(())
    }

    /// Stop the process. Only valid from `RUNNING`.
    ///
    /// Moves to `STOPPED` immediately and closes every subscriber channel;
    /// the process itself is terminated in the background, observe that
    /// with [`wait`](Self::wait).
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        require(Operation::Stop, lifecycle.status, Status::Running)?;
        self.inner.transition(&mut lifecycle, Status::Stopped);
        self.inner.cancel.cancel();
        drop(lifecycle);

        self.inner.output.close().await;
        Ok(())
    }

    /// Wait until the process has exited (or failed to launch).
    ///
    /// Returns `Ok(())` for `COMPLETED` and the recorded [`ExitError`]
    /// otherwise. Any number of callers may wait concurrently; all get the
    /// same result. Fails while `READY`.
    pub async fn wait(&self) -> Result<(), RunnerError> {
        let status = self.inner.lifecycle.lock().await.status;
        if status == Status::Ready {
            return Err(RunnerError::InvalidTransition {
                operation: Operation::Wait,
                status,
            });
        }

        let mut outcome_rx = self.inner.outcome_tx.subscribe();
        let outcome = outcome_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ExitError::Wait {
                reason: "completion signal dropped".to_string(),
            })?;

        match &*outcome {
            Some(Err(e)) => Err(RunnerError::Exit(e.clone())),
            _ => Ok(()),
        }
    }

    /// Send `input` to the process's stdin. Only valid from `RUNNING`.
    ///
    /// The input is recorded in the log and broadcast before it is written,
    /// so subscribers see it ahead of any output it causes. A write still
    /// pending when the process exits fails with
    /// [`RunnerError::InputClosed`].
    pub async fn write_input(&self, input: &str) -> Result<(), RunnerError> {
        self.require_running(Operation::WriteInput).await?;

        let mut stdin = self.inner.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(RunnerError::InputClosed)?;

        let write = async {
            self.inner.output.publish(input.to_string()).await;
            pipe.write_all(input.as_bytes()).await?;
            pipe.flush().await
        };
        tokio::select! {
            result = write => result?,
            () = self.inner.exited.cancelled() => {
                debug!(bytes = input.len(), "Process gone, abandoning input write");
                return Err(RunnerError::InputClosed);
            }
        }
        debug!(bytes = input.len(), "Wrote process input");
        Ok(())
    }

    /// Close the process's stdin so it sees end-of-file. Only valid from
    /// `RUNNING`; closing twice is a no-op.
    pub async fn close_input(&self) -> Result<(), RunnerError> {
        self.require_running(Operation::CloseInput).await?;

        let pipe = self.inner.stdin.lock().await.take();
        if let Some(mut pipe) = pipe {
            pipe.shutdown().await?;
            debug!("Closed process input");
        }
        Ok(())
    }

    /// Subscribe to output.
    ///
    /// The subscription first yields everything logged so far, then each new
    /// line until the runner stops or completes. Subscribing after that
    /// yields the backlog and ends.
    pub async fn read_output(&self) -> OutputSubscription {
        self.inner.output.subscribe().await
    }

    /// Everything captured so far, entries concatenated in arrival order.
    pub async fn read_log(&self) -> String {
        self.inner.output.log().await
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        *self.inner.status_tx.borrow()
    }

    /// Receiver notified on every status transition.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.status_tx.subscribe()
    }

    /// Terminal error, populated once the process exited unsuccessfully,
    /// was stopped, or failed to launch.
    pub fn error(&self) -> Option<ExitError> {
        self.inner
            .outcome_tx
            .borrow()
            .as_ref()
            .and_then(|outcome| outcome.as_ref().err().cloned())
    }

    /// OS process id assigned at launch.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid.get().copied()
    }

    /// Number of live output subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.output.subscriber_count().await
    }

    async fn require_running(&self, operation: Operation) -> Result<(), RunnerError> {
        let status = self.inner.lifecycle.lock().await.status;
        require(operation, status, Status::Running)
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("command", &self.inner.config.command)
            .field("args", &self.inner.config.args)
            .field("status", &self.status())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Record a transition. Caller holds the lifecycle lock.
    fn transition(&self, lifecycle: &mut Lifecycle, to: Status) {
        let from = lifecycle.status;
        lifecycle.status = to;
        self.status_tx.send_replace(to);
        info!(command = %self.config.command, %from, %to, "Status changed");
    }

    /// Fire the completion signal. Later calls are ignored.
    fn complete(&self, outcome: Result<(), ExitError>) {
        self.outcome_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }
}

/// Check the guard of a lifecycle operation before touching any state.
fn require(operation: Operation, status: Status, expected: Status) -> Result<(), RunnerError> {
    if status == expected {
        Ok(())
    } else {
        Err(RunnerError::InvalidTransition { operation, status })
    }
}

/// Waiter task: owns the child until it exits, then settles the outcome.
async fn supervise(inner: Arc<Inner>, mut child: Child, readers: Vec<JoinHandle<()>>) {
    let exit = tokio::select! {
        exit = child.wait() => exit,
        () = inner.cancel.cancelled() => {
            info!(pid = ?child.id(), "Stop requested, terminating process");
            terminate(&mut child, inner.config.terminate_timeout).await
        }
    };

    inner.exited.cancel();
    drain_readers(readers, inner.config.drain_timeout).await;
    drop(inner.stdin.lock().await.take());

    let mut lifecycle = inner.lifecycle.lock().await;
    let outcome = match lifecycle.status {
        Status::Running => {
            let outcome = ExitError::outcome(exit);
            let to = if outcome.is_ok() {
                Status::Completed
            } else {
                Status::Failed
            };
            inner.transition(&mut lifecycle, to);
            outcome
        }
        Status::Stopped => Err(ExitError::stopped(&exit)),
        other => {
            warn!(status = %other, "Process exited in unexpected state");
            ExitError::outcome(exit)
        }
    };
    drop(lifecycle);

    match &outcome {
        Ok(()) => info!(command = %inner.config.command, "Process completed"),
        Err(e) => info!(command = %inner.config.command, error = %e, "Process ended"),
    }

    inner.output.close().await;
    inner.complete(outcome);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_runner_is_ready_and_empty() {
        let runner = Runner::new(RunnerConfig::new("echo").arg("hi"));
        assert_eq!(runner.status(), Status::Ready);
        assert_eq!(runner.read_log().await, "");
        assert!(runner.error().is_none());
        assert!(runner.pid().is_none());
    }

    #[tokio::test]
    async fn operations_before_start_are_rejected() {
        let runner = Runner::new(RunnerConfig::default());

        for result in [
            runner.stop().await,
            runner.wait().await,
            runner.write_input("x").await,
            runner.close_input().await,
        ] {
            assert!(matches!(
                result,
                Err(RunnerError::InvalidTransition {
                    status: Status::Ready,
                    ..
                })
            ));
        }
        assert_eq!(runner.status(), Status::Ready);
    }

    #[tokio::test]
    async fn spawn_failure_fails_runner() {
        let runner = Runner::new(RunnerConfig::new("/nonexistent/procrun-test-binary"));
        let mut sub = runner.read_output().await;

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
        assert_eq!(runner.status(), Status::Failed);
        assert!(matches!(runner.error(), Some(ExitError::Spawn { .. })));

        match runner.wait().await {
            Err(RunnerError::Exit(e)) => assert_eq!(Some(e), runner.error()),
            other => panic!("unexpected wait result: {other:?}"),
        }
        assert_eq!(sub.recv().await, None);

        assert!(matches!(
            runner.start().await,
            Err(RunnerError::InvalidTransition {
                operation: Operation::Start,
                status: Status::Failed,
            })
        ));
    }

    #[tokio::test]
    async fn complete_fires_once() {
        let runner = Runner::new(RunnerConfig::default());
        runner.inner.complete(Err(ExitError::Code { code: 3 }));
        runner.inner.complete(Ok(()));
        assert_eq!(runner.error(), Some(ExitError::Code { code: 3 }));
    }

    #[test]
    fn debug_shows_command_and_status() {
        let runner = Runner::new(RunnerConfig::new("echo").arg("hi"));
        let debug = format!("{runner:?}");
        assert!(debug.contains("echo"));
        assert!(debug.contains("Ready"));
    }
}
