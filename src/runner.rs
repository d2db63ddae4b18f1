//! External command execution.
//!
//! Every interaction with host tooling (lspci, driverctl, ip, mount, dd,
//! qemu, taskset, ...) goes through the [`CommandRunner`] trait. The trait
//! splits the two failure policies at a single seam:
//!
//! - [`CommandRunner::run`] treats a nonzero exit as fatal and returns
//!   [`Error::Command`] carrying the command line and captured stderr.
//! - [`CommandRunner::run_allow_fail`] never fails; callers inspect the
//!   returned [`CommandOutput`] if they care.
//!
//! [`HostRunner`] executes on the real host. [`MockRunner`] records commands
//! and answers from scripted rules so the provisioning state machine can be
//! exercised without root.

use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::error::CommandFailure;
use crate::{Error, Result};

/// A fully-specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Create a command that runs `program` through `sudo`
    pub fn sudo(program: impl Into<String>) -> Self {
        Self::new("sudo").arg(program)
    }

    /// Run `script` through `sudo sh -c`, for sysfs writes that need redirection
    pub fn sudo_shell(script: impl Into<String>) -> Self {
        Self::sudo("sh").arg("-c").arg(script)
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build a command from an argv vector; `None` if it is empty
    pub fn from_argv(argv: Vec<String>) -> Option<Self> {
        let mut iter = argv.into_iter();
        let program = iter.next()?;
        Some(Self {
            program,
            args: iter.collect(),
        })
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (-1 when spawning failed or the process was killed by a signal)
    pub status: i32,
}

impl CommandOutput {
    /// A successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: 0,
        }
    }

    /// A failed output with the given exit status and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status,
        }
    }

    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.status == 0
    }

    fn into_failure(self, cmd: &HostCommand) -> CommandFailure {
        CommandFailure {
            command: cmd.to_string(),
            status: self.status,
            stderr: self.stderr,
        }
    }
}

/// Capability to run host commands.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A nonzero exit is *not* an
    /// error here; only failing to spawn is.
    async fn output(&self, cmd: &HostCommand) -> Result<CommandOutput>;

    /// Start a long-lived process without waiting for it.
    async fn spawn_detached(&self, cmd: &HostCommand) -> Result<()>;

    /// Run a command whose failure aborts provisioning.
    async fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        let out = self.output(cmd).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(Error::Command(out.into_failure(cmd)))
        }
    }

    /// Run a command whose failure is expected and harmless.
    async fn run_allow_fail(&self, cmd: &HostCommand) -> CommandOutput {
        match self.output(cmd).await {
            Ok(out) => {
                if !out.success() {
                    debug!("ignoring failure of `{}` (exit {})", cmd, out.status);
                }
                out
            }
            Err(e) => {
                warn!("ignoring error running `{}`: {}", cmd, e);
                CommandOutput::failed(-1, e.to_string())
            }
        }
    }

    /// Run every command concurrently, wait for all of them, and only then
    /// report failures.
    async fn run_all(&self, cmds: &[HostCommand]) -> Result<()> {
        let outputs = join_all(cmds.iter().map(|cmd| self.output(cmd))).await;
        let mut failures = Vec::new();
        for (cmd, out) in cmds.iter().zip(outputs) {
            match out {
                Ok(out) if out.success() => {}
                Ok(out) => failures.push(out.into_failure(cmd)),
                Err(e) => failures.push(CommandFailure {
                    command: cmd.to_string(),
                    status: -1,
                    stderr: e.to_string(),
                }),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CommandBatch(failures))
        }
    }
}

/// Runs commands on the local host with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct HostRunner;

impl HostRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CommandRunner for HostRunner {
    async fn output(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        debug!("$ {}", cmd);
        let out = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::Command(CommandFailure {
                    command: cmd.to_string(),
                    status: -1,
                    stderr: format!("failed to spawn: {}", e),
                })
            })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            status: out.status.code().unwrap_or(-1),
        })
    }

    async fn spawn_detached(&self, cmd: &HostCommand) -> Result<()> {
        debug!("$ {} &", cmd);
        tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Command(CommandFailure {
                    command: cmd.to_string(),
                    status: -1,
                    stderr: format!("failed to spawn: {}", e),
                })
            })?;
        Ok(())
    }
}

/// Scripted runner that records every command it is asked to run.
///
/// Rules are matched in insertion order against the rendered command line
/// (substring match); the first match answers. Unmatched commands succeed
/// with empty output.
#[derive(Debug, Default)]
pub struct MockRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    log: Mutex<Vec<HostCommand>>,
    spawned: Mutex<Vec<HostCommand>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `output`
    pub fn on(self, pattern: impl Into<String>, output: CommandOutput) -> Self {
        self.push_rule(pattern, output);
        self
    }

    /// Answer commands containing `pattern` with a successful stdout
    pub fn on_stdout(self, pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.on(pattern, CommandOutput::ok(stdout))
    }

    /// Make commands containing `pattern` fail with `stderr`
    pub fn on_fail(self, pattern: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.on(pattern, CommandOutput::failed(1, stderr))
    }

    /// Add a rule through a shared reference
    pub fn push_rule(&self, pattern: impl Into<String>, output: CommandOutput) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((pattern.into(), output));
        }
    }

    /// Rendered command lines, in the order they were issued
    pub fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|log| log.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Rendered command lines of detached spawns
    pub fn spawned(&self) -> Vec<String> {
        self.spawned
            .lock()
            .map(|log| log.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Issued commands whose rendering contains `pattern`
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(pattern))
            .collect()
    }

    /// Forget every recorded command
    pub fn clear(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.clear();
        }
    }

    fn answer(&self, rendered: &str) -> CommandOutput {
        self.rules
            .lock()
            .ok()
            .and_then(|rules| {
                rules
                    .iter()
                    .find(|(pattern, _)| rendered.contains(pattern.as_str()))
                    .map(|(_, out)| out.clone())
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CommandRunner for MockRunner {
    async fn output(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        if let Ok(mut log) = self.log.lock() {
            log.push(cmd.clone());
        }
        Ok(self.answer(&cmd.to_string()))
    }

    async fn spawn_detached(&self, cmd: &HostCommand) -> Result<()> {
        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.push(cmd.clone());
        }
        Ok(())
    }
}
