//! PostgreSQL role and database reconciliation.
//!
//! Each tenant gets a login role and a database of the same name, owned by that role, so the
//! backend can connect with peer authentication as its own OS user. Role and database are
//! reconciled independently: a role can exist without its database after a partially failed
//! earlier run.
//!
//! All administration goes through the stock client tools run as the cluster's OS superuser
//! (`sudo -u postgres psql|createuser|createdb`). The existence checks are literal SQL text,
//! which is why the tenant name is validated before any query is built.

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::errors::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec, failure_message, run_checked};
use crate::reconcile::{Outcome, Reconcile, reconcile};
use crate::validation::validate_tenant_name;

/// The role and database owned by one tenant. Both are named after the tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseResource {
    pub role: String,
    pub database: String,
}

impl DatabaseResource {
    pub fn for_tenant(name: &str) -> Result<Self> {
        validate_tenant_name(name)?;
        Ok(Self {
            role: name.to_string(),
            database: name.to_string(),
        })
    }
}

/// What [`DatabaseReconciler::ensure_database`] did to each half of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseOutcome {
    pub role: Outcome,
    pub database: Outcome,
}

/// `SELECT 1 FROM pg_roles WHERE rolname='<name>'`
pub fn role_exists_query(name: &str) -> Result<String> {
    validate_tenant_name(name)?;
    Ok(format!("SELECT 1 FROM pg_roles WHERE rolname='{name}'"))
}

/// `SELECT 1 FROM pg_database WHERE datname='<name>'`
pub fn database_exists_query(name: &str) -> Result<String> {
    validate_tenant_name(name)?;
    Ok(format!("SELECT 1 FROM pg_database WHERE datname='{name}'"))
}

pub struct DatabaseReconciler<'a> {
    runner: &'a dyn CommandRunner,
    admin_user: String,
}

impl<'a> DatabaseReconciler<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &DatabaseConfig) -> Self {
        Self {
            runner,
            admin_user: config.admin_user.clone(),
        }
    }

    /// Ensure the tenant's role and database exist. Safe to call any number of times.
    #[instrument(skip(self))]
    pub async fn ensure_database(&self, name: &str) -> Result<DatabaseOutcome> {
        let resource = DatabaseResource::for_tenant(name)?;

        self.check_privileges().await?;

        let role = reconcile(&PgRole {
            admin: self,
            name: &resource.role,
        })
        .await?;
        info!(role = %resource.role, outcome = %role, "Database role reconciled");

        let database = reconcile(&PgDatabase {
            admin: self,
            name: &resource.database,
            owner: &resource.role,
        })
        .await?;
        info!(database = %resource.database, outcome = %database, "Database reconciled");

        Ok(DatabaseOutcome { role, database })
    }

    /// Confirm we can act as the database superuser before changing anything.
    async fn check_privileges(&self) -> Result<()> {
        let output = run_checked(
            self.runner,
            "verify PostgreSQL administrative access",
            &self.psql("SELECT 1"),
        )
        .await?;

        if output.stdout.trim() != "1" {
            return Err(Error::fatal(
                "verify PostgreSQL administrative access",
                format!("unexpected output from `SELECT 1`: {}", output.combined()),
            ));
        }
        Ok(())
    }

    /// Run a `SELECT 1 ...` query and report whether it returned a row.
    async fn query_exists(&self, operation: &str, sql: String) -> Result<bool> {
        let output = run_checked(self.runner, operation, &self.psql(&sql)).await?;
        Ok(output.stdout.trim() == "1")
    }

    fn psql(&self, sql: &str) -> CommandSpec {
        self.admin_command("psql").args(["-tAc", sql])
    }

    fn admin_command(&self, program: &str) -> CommandSpec {
        CommandSpec::new("sudo").args(["-u", self.admin_user.as_str(), program])
    }

    /// Run a create command; a non-zero exit is transient so the reconciler decides its fate.
    async fn create(&self, operation: &str, command: CommandSpec) -> Result<()> {
        let output = self.runner.run(&command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::transient(operation, failure_message(&command, &output)))
        }
    }
}

struct PgRole<'r, 'a> {
    admin: &'r DatabaseReconciler<'a>,
    name: &'r str,
}

#[async_trait]
impl Reconcile for PgRole<'_, '_> {
    fn describe(&self) -> String {
        format!("postgres role {}", self.name)
    }

    async fn exists(&self) -> Result<bool> {
        let sql = role_exists_query(self.name)?;
        self.admin
            .query_exists(&format!("check for database role '{}'", self.name), sql)
            .await
    }

    async fn create(&self) -> Result<()> {
        validate_tenant_name(self.name)?;
        // -S no superuser, -R no createrole, -D no createdb, -l login
        let command = self.admin.admin_command("createuser").args(["-S", "-R", "-D", "-l", self.name]);
        self.admin
            .create(&format!("create database role '{}'", self.name), command)
            .await
    }
}

struct PgDatabase<'r, 'a> {
    admin: &'r DatabaseReconciler<'a>,
    name: &'r str,
    owner: &'r str,
}

#[async_trait]
impl Reconcile for PgDatabase<'_, '_> {
    fn describe(&self) -> String {
        format!("postgres database {}", self.name)
    }

    async fn exists(&self) -> Result<bool> {
        let sql = database_exists_query(self.name)?;
        self.admin
            .query_exists(&format!("check for database '{}'", self.name), sql)
            .await
    }

    async fn create(&self) -> Result<()> {
        validate_tenant_name(self.name)?;
        validate_tenant_name(self.owner)?;
        let command = self.admin.admin_command("createdb").args(["-O", self.owner, self.name]);
        self.admin
            .create(&format!("create database '{}'", self.name), command)
            .await
    }
}
