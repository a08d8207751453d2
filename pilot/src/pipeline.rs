//! Tenant provisioning pipeline.
//!
//! `create-tenant` runs the stages below in order, each awaited before the next starts:
//!
//! 1. **User** (unless skipped): account, lingering, user manager
//! 2. **Identity**: uid, gid and home from the user database
//! 3. **Database**: role and database
//! 4. **Units**: render and install the socket-activated units
//! 5. **Route**: Caddy route from the tenant's host to its socket
//!
//! The first failing stage ends the run. Nothing is rolled back; every stage is idempotent, so
//! the recovery path is running the pipeline again.
//!
//! The single-resource commands (`setup-database`, `setup-systemd`, ...) call the same per-stage
//! methods directly.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{error, info, instrument};

use crate::config::Config;
use crate::database::{DatabaseOutcome, DatabaseReconciler};
use crate::errors::{Error, Result};
use crate::exec::CommandRunner;
use crate::identity::{TenantIdentity, UserDirectory, resolve};
use crate::installer::UnitInstaller;
use crate::reconcile::Outcome;
use crate::route::{CaddyClient, RouteSpec, ensure_route};
use crate::units::{UnitSet, generate_units};
use crate::users::UserProvisioner;
use crate::validation::validate_tenant_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    User,
    Identity,
    Database,
    Units,
    Route,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::User => "user",
            Stage::Identity => "identity",
            Stage::Database => "database",
            Stage::Units => "units",
            Stage::Route => "route",
        };
        f.write_str(name)
    }
}

/// A provisioning error tagged with the stage that produced it.
#[derive(ThisError, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}

/// Inputs of one `create-tenant` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub name: String,
    /// Host to route; defaults to `<name>.<domain_suffix>`
    pub domain: Option<String>,
    /// Proxy idle timeout; defaults to `systemd.idle_timeout`
    pub idle_timeout: Option<Duration>,
    /// Upstream to dial; defaults to the tenant's socket
    pub upstream: Option<String>,
    /// Create the OS user first, or require it to exist
    pub create_user: bool,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            idle_timeout: None,
            upstream: None,
            create_user: true,
        }
    }
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub identity: TenantIdentity,
    /// `None` when user creation was skipped
    pub user: Option<Outcome>,
    pub database: DatabaseOutcome,
    pub port: u16,
    pub unit_dir: PathBuf,
    pub route: RouteSpec,
    pub route_outcome: Outcome,
}

pub struct Pipeline {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    directory: Arc<dyn UserDirectory>,
    caddy: CaddyClient,
    runtime_root: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>, directory: Arc<dyn UserDirectory>) -> Result<Self> {
        let caddy = CaddyClient::new(&config.caddy)?;
        Ok(Self {
            config,
            runner,
            directory,
            caddy,
            runtime_root: None,
        })
    }

    /// Look for user session buses under `root` instead of `/run/user`
    pub fn with_runtime_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.runtime_root = Some(root.into());
        self
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn directory(&self) -> &dyn UserDirectory {
        self.directory.as_ref()
    }

    /// Run every stage for one tenant, stopping at the first failure.
    #[instrument(skip_all, fields(tenant = %request.name))]
    pub async fn provision(&self, request: &ProvisionRequest) -> std::result::Result<ProvisionReport, StageError> {
        info!("Starting provisioning");

        let result = self.run_stages(request).await;
        match &result {
            Ok(report) => info!(uid = report.identity.uid, port = report.port, host = %report.route.host, "Tenant fully provisioned"),
            Err(e) => error!(stage = %e.stage, error = %e.source, "Provisioning stopped"),
        }
        result
    }

    async fn run_stages(&self, request: &ProvisionRequest) -> std::result::Result<ProvisionReport, StageError> {
        let name = request.name.as_str();
        // Catch a bad name before the first stage touches anything
        validate_tenant_name(name).at(if request.create_user { Stage::User } else { Stage::Identity })?;

        let user = if request.create_user {
            let (_, outcome) = self.create_user(name).await.at(Stage::User)?;
            Some(outcome)
        } else {
            None
        };

        let identity = self.resolve(name).at(Stage::Identity)?;

        let database = self.setup_database(name).await.at(Stage::Database)?;

        let (units, unit_dir) = self
            .install_units(&identity, request.idle_timeout)
            .await
            .at(Stage::Units)?;

        let (route, route_outcome) = self
            .setup_proxy(name, request.domain.as_deref(), request.upstream.as_deref())
            .await
            .at(Stage::Route)?;

        Ok(ProvisionReport {
            identity,
            user,
            database,
            port: units.port,
            unit_dir,
            route,
            route_outcome,
        })
    }

    pub fn resolve(&self, name: &str) -> Result<TenantIdentity> {
        resolve(self.directory.as_ref(), name)
    }

    pub async fn create_user(&self, name: &str) -> Result<(TenantIdentity, Outcome)> {
        let mut provisioner = UserProvisioner::new(self.runner.as_ref(), self.directory.as_ref());
        if let Some(root) = &self.runtime_root {
            provisioner = provisioner.with_runtime_root(root);
        }
        provisioner.ensure_user(name).await
    }

    pub async fn setup_database(&self, name: &str) -> Result<DatabaseOutcome> {
        DatabaseReconciler::new(self.runner.as_ref(), &self.config.database)
            .ensure_database(name)
            .await
    }

    /// Resolve the tenant, then render and install its units.
    pub async fn setup_systemd(&self, name: &str, idle_timeout: Option<Duration>) -> Result<(UnitSet, PathBuf)> {
        let identity = self.resolve(name)?;
        self.install_units(&identity, idle_timeout).await
    }

    async fn install_units(&self, identity: &TenantIdentity, idle_timeout: Option<Duration>) -> Result<(UnitSet, PathBuf)> {
        let idle = idle_timeout.unwrap_or(self.config.systemd.idle_timeout);
        let units = generate_units(&self.config.systemd, identity, idle)?;
        info!(port = units.port, idle = %humantime::format_duration(idle), "Rendered units");

        let unit_dir = UnitInstaller::new(self.runner.as_ref(), &self.config.systemd)
            .install_units(identity, &units)
            .await?;
        Ok((units, unit_dir))
    }

    /// Route `domain` (default `<name>.<domain_suffix>`) to `upstream` (default: the tenant's
    /// socket).
    pub async fn setup_proxy(&self, name: &str, domain: Option<&str>, upstream: Option<&str>) -> Result<(RouteSpec, Outcome)> {
        let spec = self.route_spec(name, domain, upstream)?;
        let outcome = ensure_route(&self.caddy, &spec).await?;
        Ok((spec, outcome))
    }

    pub fn route_spec(&self, name: &str, domain: Option<&str>, upstream: Option<&str>) -> Result<RouteSpec> {
        validate_tenant_name(name)?;
        let host = match domain {
            Some(domain) => domain.to_string(),
            None => format!("{name}.{}", self.config.domain_suffix),
        };
        let upstream = match upstream {
            Some(upstream) => upstream.to_string(),
            None => self.config.systemd.socket_path(name).display().to_string(),
        };
        RouteSpec::for_tenant(name, host, upstream)
    }
}
