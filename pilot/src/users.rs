//! OS user provisioning.
//!
//! A tenant's units run under its own systemd user manager, which has to keep running while
//! nobody is logged in. Ensuring a user therefore means: the account exists, lingering is on, the
//! `user@<uid>.service` manager is started, and its session bus socket has appeared. Only then can
//! `systemctl --user` talk to it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::errors::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec, failure_message, run_checked};
use crate::identity::{RUNTIME_ROOT, TenantIdentity, UserDirectory, resolve};
use crate::reconcile::{Outcome, Reconcile, reconcile};
use crate::validation::validate_tenant_name;

const BUS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const BUS_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UserProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    directory: &'a dyn UserDirectory,
    runtime_root: PathBuf,
    bus_timeout: Duration,
}

impl<'a> UserProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, directory: &'a dyn UserDirectory) -> Self {
        Self {
            runner,
            directory,
            runtime_root: PathBuf::from(RUNTIME_ROOT),
            bus_timeout: BUS_WAIT_TIMEOUT,
        }
    }

    /// Look for session buses somewhere other than `/run/user`
    pub fn with_runtime_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.runtime_root = root.into();
        self
    }

    pub fn with_bus_timeout(mut self, timeout: Duration) -> Self {
        self.bus_timeout = timeout;
        self
    }

    /// Ensure the tenant's account exists with a running, reachable user manager.
    ///
    /// An existing account is reused; lingering and the user manager are (re)applied either
    /// way, both being no-ops when already in place.
    #[instrument(skip(self))]
    pub async fn ensure_user(&self, name: &str) -> Result<(TenantIdentity, Outcome)> {
        validate_tenant_name(name)?;

        let outcome = reconcile(&OsUser {
            runner: self.runner,
            directory: self.directory,
            name,
        })
        .await?;
        info!(outcome = %outcome, "OS user reconciled");

        let identity = resolve(self.directory, name)?;

        run_checked(
            self.runner,
            &format!("enable lingering for '{name}'"),
            &CommandSpec::new("loginctl").args(["enable-linger", name]),
        )
        .await?;

        let manager = identity.user_manager_unit();
        run_checked(
            self.runner,
            &format!("start {manager}"),
            &CommandSpec::new("systemctl").args(["start", manager.as_str()]),
        )
        .await?;

        let bus = self.runtime_root.join(identity.uid.to_string()).join("bus");
        self.wait_for_bus(&bus).await?;

        Ok((identity, outcome))
    }

    async fn wait_for_bus(&self, bus: &Path) -> Result<()> {
        debug!(bus = %bus.display(), "Waiting for user bus");
        let started = Instant::now();

        loop {
            if bus.exists() {
                debug!(elapsed = ?started.elapsed(), "User bus is ready");
                return Ok(());
            }
            if started.elapsed() >= self.bus_timeout {
                return Err(Error::fatal(
                    format!("wait for user bus at {}", bus.display()),
                    format!(
                        "timed out after {} (is systemd-logind running?)",
                        humantime::format_duration(self.bus_timeout)
                    ),
                ));
            }
            tokio::time::sleep(BUS_POLL_INTERVAL).await;
        }
    }
}

struct OsUser<'r> {
    runner: &'r dyn CommandRunner,
    directory: &'r dyn UserDirectory,
    name: &'r str,
}

#[async_trait]
impl Reconcile for OsUser<'_> {
    fn describe(&self) -> String {
        format!("os user {}", self.name)
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.directory.lookup(self.name)?.is_some())
    }

    async fn create(&self) -> Result<()> {
        validate_tenant_name(self.name)?;
        let command = CommandSpec::new("useradd").args(["-m", "-s", "/bin/bash", self.name]);
        let output = self.runner.run(&command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::transient(
                format!("create user '{}'", self.name),
                failure_message(&command, &output),
            ))
        }
    }
}
