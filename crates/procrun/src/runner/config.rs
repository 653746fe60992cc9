//! Runner configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use procrun_core::config::RunnerSettings;
use tokio::process::Command;

/// What to run and how to supervise it.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Program to execute, resolved through `PATH` when not a path.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Environment for the child. `None` inherits the current environment;
    /// `Some` replaces it entirely.
    pub env: Option<BTreeMap<String, String>>,
    /// Working directory. `None` inherits the current one.
    pub working_dir: Option<PathBuf>,
    /// Grace period between the stop signal and a hard kill.
    pub terminate_timeout: Duration,
    /// How long to wait for output readers after the process exits.
    pub drain_timeout: Duration,
    /// Per-subscriber buffer size, in lines.
    pub subscriber_capacity: usize,
    /// How long a subscriber with a full buffer may hold up delivery before
    /// it is disconnected. `None` waits for it indefinitely, so a stalled
    /// subscriber then stalls output capture.
    pub subscriber_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let settings = RunnerSettings::default();
        Self {
            command: String::new(),
            args: Vec::new(),
            env: None,
            working_dir: None,
            terminate_timeout: settings.terminate_timeout(),
            drain_timeout: settings.drain_timeout(),
            subscriber_capacity: settings.subscriber_capacity,
            subscriber_timeout: settings.subscriber_timeout(),
        }
    }
}

impl RunnerConfig {
    /// Create a config for `command` with default tuning.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add one variable. The first call switches from inheriting the
    /// environment to an explicit one.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn subscriber_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.subscriber_timeout = timeout;
        self
    }

    /// Apply tuning from loaded settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: &RunnerSettings) -> Self {
        self.terminate_timeout = settings.terminate_timeout();
        self.drain_timeout = settings.drain_timeout();
        self.subscriber_capacity = settings.subscriber_capacity;
        self.subscriber_timeout = settings.subscriber_timeout();
        self
    }

    /// Build the (not yet spawned) command with all three stdio streams piped.
    pub(crate) fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = &self.env {
            cmd.env_clear().envs(env);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_runner_settings() {
        let config = RunnerConfig::new("echo");
        assert_eq!(config.command, "echo");
        assert!(config.args.is_empty());
        assert!(config.env.is_none());
        assert!(config.working_dir.is_none());
        assert_eq!(config.terminate_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert_eq!(config.subscriber_capacity, 1024);
        assert_eq!(config.subscriber_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn builder_accumulates_args_and_env() {
        let config = RunnerConfig::new("sh")
            .arg("-c")
            .args(["echo $A", "ignored"])
            .env("A", "1")
            .envs([("B", "2")]);

        assert_eq!(config.args, vec!["-c", "echo $A", "ignored"]);
        let env = config.env.unwrap_or_default();
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn settings_override_tuning() {
        let settings = RunnerSettings {
            terminate_timeout_secs: 0,
            drain_timeout_ms: 50,
            subscriber_capacity: 4,
            subscriber_timeout_ms: 0,
        };
        let config = RunnerConfig::new("true").with_settings(&settings);
        assert_eq!(config.terminate_timeout, Duration::ZERO);
        assert_eq!(config.drain_timeout, Duration::from_millis(50));
        assert_eq!(config.subscriber_capacity, 4);
        assert_eq!(config.subscriber_timeout, None);
    }
}
