//! External process execution.
//!
//! Everything pilot does to the host besides writing unit files goes through a
//! [`CommandRunner`]: useradd, psql/createuser/createdb, systemctl, journalctl. Commands are
//! argument vectors, never shell strings, so tenant names are not re-parsed by a shell.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::errors::{Error, Result};
use crate::identity::TenantIdentity;

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, the way a terminal would have shown them
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }

    /// Human-readable exit status for error messages
    pub fn describe_status(&self) -> String {
        match self.status {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Capability to run host commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// Returns `Err` only if the command could not be run at all (spawn failure, timeout). A
    /// non-zero exit is reported through [`CommandOutput::status`]; callers decide whether
    /// that is an error.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command inside a tenant's security context, with the environment its systemd user
    /// manager expects.
    async fn run_as_user(&self, identity: &TenantIdentity, command: &CommandSpec) -> Result<CommandOutput> {
        self.run(&as_user(identity, command)).await
    }
}

/// Wrap a command so it runs as the tenant.
///
/// The invoking process is root, so `XDG_RUNTIME_DIR` and `DBUS_SESSION_BUS_ADDRESS` have to
/// be set explicitly for `systemctl --user` to find the tenant's manager.
pub fn as_user(identity: &TenantIdentity, command: &CommandSpec) -> CommandSpec {
    CommandSpec::new("runuser")
        .args(["-u", identity.name.as_str(), "--", "env"])
        .arg(format!("XDG_RUNTIME_DIR={}", identity.runtime_dir().display()))
        .arg(format!("DBUS_SESSION_BUS_ADDRESS={}", identity.bus_address()))
        .arg(command.program.clone())
        .args(command.args.iter().cloned())
}

/// Run a command and turn a non-zero exit into a fatal error carrying its output.
pub async fn run_checked(runner: &dyn CommandRunner, operation: &str, command: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(command).await?;
    ensure_success(operation, command, output)
}

/// [`run_checked`] in the tenant's security context.
pub async fn run_checked_as_user(
    runner: &dyn CommandRunner,
    identity: &TenantIdentity,
    operation: &str,
    command: &CommandSpec,
) -> Result<CommandOutput> {
    let output = runner.run_as_user(identity, command).await?;
    ensure_success(operation, command, output)
}

fn ensure_success(operation: &str, command: &CommandSpec, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(Error::fatal(operation, failure_message(command, &output)))
    }
}

/// `` `cmd args` failed (exit status N): <output> ``
pub fn failure_message(command: &CommandSpec, output: &CommandOutput) -> String {
    format!("`{command}` failed ({}): {}", output.describe_status(), output.combined())
}

/// [`CommandRunner`] that spawns real processes with a per-command timeout.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    #[instrument(skip_all, fields(command = %command))]
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running command");

        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::fatal(format!("run `{command}`"), e.to_string())),
            Err(_) => {
                warn!(timeout = ?self.timeout, "Command timed out");
                return Err(Error::fatal(
                    format!("run `{command}`"),
                    format!("timed out after {}", humantime::format_duration(self.timeout)),
                ));
            }
        };

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(status = ?output.status, "Command finished");

        Ok(output)
    }
}
