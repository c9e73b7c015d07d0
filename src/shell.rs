//! Host shell bridge shared by command-backed devices, executors and steps.
//!
//! Every command template is run through `sh -c` so pipes, redirects and
//! `&&` chains behave as written. Placeholders of the form `{name}` are
//! replaced with shell-quoted values before the command runs.
//!
//! ```
//! use modshard::shell::render;
//!
//! let cmd = render("adb -s {serial} shell getprop {key}", &[
//!     ("serial", "emulator-5554"),
//!     ("key", "ro.build.type"),
//! ]);
//! assert_eq!(cmd, "adb -s emulator-5554 shell getprop ro.build.type");
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tracing::debug;

/// Replaces `{name}` placeholders with shell-quoted values.
///
/// Placeholders without a value are left untouched.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in values {
        rendered = rendered.replace(
            &format!("{{{}}}", name),
            &shell_words::quote(value),
        );
    }
    rendered
}

/// Replaces `{name}` placeholders verbatim, for paths that never reach a shell.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Captured result of one shell command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// Exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,

    /// Raw standard output. Kept as bytes: screenshots and bugreports are binary.
    pub stdout: Vec<u8>,

    /// Standard error, lossily decoded.
    pub stderr: String,

    /// Wall-clock duration of the command.
    pub duration: Duration,
}

impl ShellOutput {
    /// Returns `true` if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns standard output as text, lossily decoded.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Errors from running a shell command.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The command could not be spawned.
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command did not finish within its timeout.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs shell commands on the host.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl ShellRunner {
    /// Creates a runner with no timeout, inheriting the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory for spawned commands.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds environment variables for spawned commands.
    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Sets the maximum time a command may run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs `command` through `sh -c` and captures its output.
    pub async fn run(&self, command: &str) -> Result<ShellOutput, ShellError> {
        debug!("Running shell command: {}", command);
        let start = Instant::now();

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.envs(&self.env);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let spawn_err = |source| ShellError::Spawn {
            command: command.to_string(),
            source,
        };

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| ShellError::Timeout(timeout))?
                .map_err(spawn_err)?,
            None => cmd.output().await.map_err(spawn_err)?,
        };

        Ok(ShellOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }
}
