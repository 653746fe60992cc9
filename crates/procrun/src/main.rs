//! `procrun`
//!
//! Runs one command under a [`Runner`], streaming its output to stdout and
//! forwarding stdin to it. Ctrl+C or `--timeout` stops the process.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use procrun::{ExitError, OutputSubscription, Runner, RunnerConfig, RunnerError};

#[derive(Parser, Debug)]
#[command(name = "procrun")]
#[command(version, about = "Run a command under supervision and stream its output")]
struct Args {
    /// Settings file (TOML)
    #[arg(long, env = "PROCRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Extra environment variable for the command (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Stop the command after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Seconds to wait for graceful shutdown before SIGKILL
    #[arg(long)]
    terminate_timeout: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Command to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut settings = procrun_core::config::load_settings(args.config.as_deref())?;
    if let Some(secs) = args.terminate_timeout {
        settings.runner.terminate_timeout_secs = secs;
    }
    if let Some(level) = &args.log_level {
        settings.log.level.clone_from(level);
    }
    let level = &settings.log.level;
    let log_filter = format!("procrun={level},procrun_core={level}");
    procrun_core::tracing_init::init_tracing(&log_filter, args.log_json || settings.log.json);

    let Some((program, program_args)) = args.command.split_first() else {
        anyhow::bail!("no command given");
    };

    let mut config = RunnerConfig::new(program.clone())
        .args(program_args.iter().cloned())
        .with_settings(&settings.runner)
        // The printer is the only subscriber: let it push back on the
        // process rather than be disconnected.
        .subscriber_timeout(None);
    if let Some(dir) = args.cwd {
        config = config.working_dir(dir);
    }
    if !args.env.is_empty() {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(args.env);
        config = config.envs(env);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = %program,
        "Starting procrun"
    );

    let runner = Runner::new(config);
    let printer = tokio::spawn(print_output(runner.read_output().await));

    if let Err(e) = runner.start().await {
        warn!(error = %e, "Could not start command");
        finish_printer(printer).await;
        return Ok(ExitCode::from(exit_code(&Err(e))));
    }
    let forwarder = tokio::spawn(forward_input(runner.clone()));

    let stop_reason = tokio::select! {
        _ = runner.wait() => None,
        _ = tokio::signal::ctrl_c() => Some("interrupt"),
        () = deadline(args.timeout) => Some("timeout"),
    };
    if let Some(reason) = stop_reason {
        info!(reason, "Stopping command");
        if let Err(e) = runner.stop().await {
            debug!(error = %e, "Command already finished");
        }
    }

    let result = runner.wait().await;
    forwarder.abort();
    finish_printer(printer).await;

    Ok(ExitCode::from(exit_code(&result)))
}

async fn deadline(secs: Option<u64>) {
    match secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => std::future::pending().await,
    }
}

/// Copy every broadcast line to stdout.
async fn print_output(mut output: OutputSubscription) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = output.recv().await {
        let write = async {
            stdout.write_all(line.as_bytes()).await?;
            if !line.ends_with('\n') {
                stdout.write_all(b"\n").await?;
            }
            stdout.flush().await
        };
        if let Err(e) = write.await {
            warn!(error = %e, "Failed to write output");
            break;
        }
    }
}

async fn finish_printer(printer: JoinHandle<()>) {
    if let Err(e) = printer.await {
        error!(error = %e, "Output printer failed");
    }
}

/// Forward our stdin to the command line by line; close its input at EOF.
///
/// Stdin is read on a plain thread so a blocked read never holds up
/// runtime shutdown.
async fn forward_input(runner: Runner) {
    let (tx, mut rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = rx.recv().await {
        if let Err(e) = runner.write_input(&format!("{line}\n")).await {
            debug!(error = %e, "Stopped forwarding input");
            return;
        }
    }
    if let Err(e) = runner.close_input().await {
        debug!(error = %e, "Could not close command input");
    }
}

/// Map the runner outcome onto a shell-style exit code.
fn exit_code(result: &Result<(), RunnerError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(RunnerError::Exit(ExitError::Code { code })) => u8::try_from(*code).unwrap_or(1),
        Err(RunnerError::Exit(ExitError::Signal { signal })) => {
            u8::try_from(128 + signal).unwrap_or(1)
        }
        Err(RunnerError::Exit(ExitError::Stopped { .. })) => 130,
        Err(RunnerError::Spawn { .. } | RunnerError::Exit(ExitError::Spawn { .. })) => 127,
        Err(_) => 1,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn env_pair_parsing() {
        assert_eq!(
            parse_env_pair("A=1"),
            Ok(("A".to_string(), "1".to_string()))
        );
        assert_eq!(
            parse_env_pair("A=b=c"),
            Ok(("A".to_string(), "b=c".to_string()))
        );
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair("=x").is_err());
    }

    #[test]
    fn args_capture_trailing_command() {
        let args =
            Args::try_parse_from(["procrun", "--timeout", "3", "ls", "-la", "/tmp"]).unwrap();
        assert_eq!(args.timeout, Some(3));
        assert_eq!(args.command, vec!["ls", "-la", "/tmp"]);
        assert!(args.env.is_empty());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(
            exit_code(&Err(RunnerError::Exit(ExitError::Code { code: 2 }))),
            2
        );
        assert_eq!(
            exit_code(&Err(RunnerError::Exit(ExitError::Signal { signal: 9 }))),
            137
        );
        assert_eq!(
            exit_code(&Err(RunnerError::Exit(ExitError::Stopped {
                code: None,
                signal: Some(15)
            }))),
            130
        );
        assert_eq!(
            exit_code(&Err(RunnerError::Spawn {
                reason: "not found".to_string()
            })),
            127
        );
        assert_eq!(exit_code(&Err(RunnerError::InputClosed)), 1);
    }

    #[test]
    fn env_flag_is_repeatable() {
        let args =
            Args::try_parse_from(["procrun", "--env", "A=1", "--env", "B=2", "env"]).unwrap();
        assert_eq!(
            args.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string())
            ]
        );
    }
}
