//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `pilot.yaml` but can be specified via the `-f` flag or the `PILOT_CONFIG`
//! environment variable. A missing file is not an error: every field has a default that matches
//! a stock host (Caddy admin API on `localhost:2019`, PostgreSQL administered by the `postgres`
//! OS user, sockets under `/run/pilot`).
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `pilot.yaml`)
//! 2. **Environment variables** - Variables prefixed with `PILOT_` override YAML values
//!
//! Nested values use double underscores, e.g. `PILOT_CADDY__ADMIN_URL=http://10.0.0.2:2019` or
//! `PILOT_SYSTEMD__IDLE_TIMEOUT=30s`.
//!
//! ## Example
//!
//! ```yaml
//! domain_suffix: apps.example.com
//! command_timeout: 2m
//! caddy:
//!   admin_url: http://localhost:2019
//!   server: srv0
//!   listen: [":80", ":443"]
//! systemd:
//!   idle_timeout: 5min
//!   port_offset: 10000
//! ```

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::errors::Error;
use crate::validation::validate_name;

/// CLI arguments: the config file plus one provisioning command
#[derive(Parser, Debug)]
#[command(
    name = "pilot",
    author,
    version,
    about = "Control-plane CLI for systemd socket activation orchestration",
    long_about = "Pilot provisions tenants on a single Linux host: a system user with lingering enabled, \
                  a PostgreSQL role and database, socket-activated systemd user units, and a Caddy \
                  route. Every command is idempotent; re-running it is the recovery path."
)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "PILOT_CONFIG", default_value = "pilot.yaml", global = true)]
    pub config: String,

    /// Validate configuration and exit without provisioning anything.
    #[arg(long, global = true)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a system user with lingering enabled and a running user manager
    CreateUser {
        /// Tenant name (linux username)
        #[arg(short, long)]
        name: String,
    },
    /// Ensure the PostgreSQL role and database for a tenant
    SetupDatabase {
        #[arg(short, long)]
        name: String,
    },
    /// Install and start the socket-activated systemd user units
    SetupSystemd {
        #[arg(short, long)]
        name: String,
        /// Time before the backend is stopped (e.g. 10s, 5min); defaults to systemd.idle_timeout
        #[arg(short, long, value_parser = humantime::parse_duration)]
        idle: Option<Duration>,
    },
    /// Route a domain to the tenant's socket through the Caddy admin API
    SetupProxy {
        #[arg(short, long)]
        name: String,
        /// Custom domain (e.g. app.example.com); defaults to <name>.<domain_suffix>
        #[arg(short, long)]
        domain: Option<String>,
        /// Upstream to dial: a socket path or host:port; defaults to the tenant's socket
        #[arg(short, long)]
        upstream: Option<String>,
    },
    /// Full provisioning of a tenant (user, database, systemd, proxy)
    CreateTenant {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        domain: Option<String>,
        #[arg(short, long, value_parser = humantime::parse_duration)]
        idle: Option<Duration>,
        #[arg(short, long)]
        upstream: Option<String>,
        /// Expect the OS user to exist already instead of creating it
        #[arg(long)]
        skip_user: bool,
    },
    /// Show the state and running user of systemd units
    Check {
        /// Units to inspect (default: caddy.service postgresql.service)
        units: Vec<String>,
    },
    /// Show recent journal entries for everything a tenant runs
    CheckLogs {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value_t = 50)]
        lines: u32,
    },
}

/// Main application configuration.
///
/// All fields have defaults, so an empty (or absent) file is a valid configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Suffix for default tenant hostnames: `<tenant>.<domain_suffix>`
    pub domain_suffix: String,
    /// Upper bound for any single external command (useradd, psql, systemctl, ...)
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Append-only log file for administrative actions. Falls back to `./pilot.log` when the
    /// path cannot be opened (e.g. running unprivileged in development).
    pub log_file: Option<PathBuf>,
    pub caddy: CaddyConfig,
    pub database: DatabaseConfig,
    pub systemd: SystemdConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_suffix: "localhost".to_string(),
            command_timeout: Duration::from_secs(60),
            log_file: Some(PathBuf::from("/var/log/pilot.log")),
            caddy: CaddyConfig::default(),
            database: DatabaseConfig::default(),
            systemd: SystemdConfig::default(),
        }
    }
}

/// Caddy admin API settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaddyConfig {
    /// Base URL of the admin API
    pub admin_url: String,
    /// HTTP server whose route list tenant routes are appended to
    pub server: String,
    /// Listen addresses used when the server has to be bootstrapped
    pub listen: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            admin_url: "http://localhost:2019".to_string(),
            server: "srv0".to_string(),
            listen: vec![":80".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// OS user that owns the PostgreSQL cluster; admin commands run as `sudo -u <admin_user>`
    pub admin_user: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            admin_user: "postgres".to_string(),
        }
    }
}

/// Socket activation settings shared by every tenant
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemdConfig {
    /// Shared, world-writable directory holding every tenant's listening socket
    pub socket_dir: PathBuf,
    /// Unit directory relative to the tenant's home
    pub unit_dir: PathBuf,
    /// Backend port = uid + port_offset
    pub port_offset: u32,
    /// Default idle interval after which the proxy (and with it the backend) exits
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    pub proxyd_path: PathBuf,
    /// Backend executable started by the service unit
    pub backend_exec: PathBuf,
    pub socket_unit: String,
    pub proxy_unit: String,
    pub service_unit: String,
}

impl Default for SystemdConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/pilot"),
            unit_dir: PathBuf::from(".config/systemd/user"),
            port_offset: 10_000,
            idle_timeout: Duration::from_secs(5 * 60),
            proxyd_path: PathBuf::from("/usr/lib/systemd/systemd-socket-proxyd"),
            backend_exec: PathBuf::from("/usr/local/bin/user-rest-api"),
            socket_unit: "rest-api.socket".to_string(),
            proxy_unit: "rest-api-proxy.service".to_string(),
            service_unit: "rest-api.service".to_string(),
        }
    }
}

impl SystemdConfig {
    /// Path of the tenant's public listening socket
    pub fn socket_path(&self, tenant: &str) -> PathBuf {
        self.socket_dir.join(format!("{tenant}.sock"))
    }

    /// Absolute unit directory for a tenant with the given home
    pub fn unit_dir_in(&self, home: &Path) -> PathBuf {
        home.join(&self.unit_dir)
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file (missing file contributes nothing)
            .merge(Yaml::file(&args.config))
            // PILOT_CONFIG names the file itself, it is not a config key
            .merge(Env::prefixed("PILOT_").ignore(&["CONFIG"]).split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.domain_suffix.is_empty() {
            return Err(invalid("domain_suffix cannot be empty"));
        }

        if self.command_timeout.is_zero() {
            return Err(invalid("command_timeout must be positive"));
        }

        let admin_url = Url::parse(&self.caddy.admin_url)
            .map_err(|e| invalid(format!("caddy.admin_url '{}' is not a valid URL: {e}", self.caddy.admin_url)))?;
        if !matches!(admin_url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "caddy.admin_url must use http or https, got '{}'",
                admin_url.scheme()
            )));
        }

        validate_name("caddy.server", &self.caddy.server).map_err(|e| invalid(e.to_string()))?;

        if self.caddy.listen.is_empty() {
            return Err(invalid("caddy.listen needs at least one address for bootstrapping the server"));
        }

        if self.caddy.request_timeout.is_zero() {
            return Err(invalid("caddy.request_timeout must be positive"));
        }

        if self.database.admin_user.is_empty() {
            return Err(invalid("database.admin_user cannot be empty"));
        }

        let systemd = &self.systemd;
        if !systemd.socket_dir.is_absolute() {
            return Err(invalid(format!(
                "systemd.socket_dir must be absolute, got '{}'",
                systemd.socket_dir.display()
            )));
        }

        if systemd.unit_dir.as_os_str().is_empty() || systemd.unit_dir.is_absolute() {
            return Err(invalid("systemd.unit_dir must be a non-empty path relative to the tenant's home"));
        }

        if systemd.port_offset == 0 || systemd.port_offset > u32::from(u16::MAX) {
            return Err(invalid(format!(
                "systemd.port_offset must be between 1 and {}, got {}",
                u16::MAX,
                systemd.port_offset
            )));
        }

        if systemd.idle_timeout.is_zero() {
            return Err(invalid("systemd.idle_timeout must be positive"));
        }

        for (field, unit) in [
            ("systemd.socket_unit", &systemd.socket_unit),
            ("systemd.proxy_unit", &systemd.proxy_unit),
            ("systemd.service_unit", &systemd.service_unit),
        ] {
            if unit.is_empty() || unit.contains('/') {
                return Err(invalid(format!("{field} must be a unit file name, got '{unit}'")));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Config { message: message.into() }
}
