//! Tenant identity resolution.
//!
//! A tenant is a host user. Everything else (backend port, unit directory, runtime directory,
//! session bus) is derived from the facts resolved here, which are recomputed on every run.

use std::path::PathBuf;

use nix::unistd::{Uid, User};

use crate::errors::{Error, Result};
use crate::validation::validate_tenant_name;

/// Where systemd-logind creates per-user runtime directories
pub const RUNTIME_ROOT: &str = "/run/user";

/// Host identity facts for a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: PathBuf,
}

impl TenantIdentity {
    /// `XDG_RUNTIME_DIR` of the tenant's user manager
    pub fn runtime_dir(&self) -> PathBuf {
        PathBuf::from(RUNTIME_ROOT).join(self.uid.to_string())
    }

    /// `DBUS_SESSION_BUS_ADDRESS` of the tenant's user manager
    pub fn bus_address(&self) -> String {
        format!("unix:path={}", self.runtime_dir().join("bus").display())
    }

    /// Systemd unit of the tenant's user manager, e.g. `user@1042.service`
    pub fn user_manager_unit(&self) -> String {
        format!("user@{}.service", self.uid)
    }
}

impl From<User> for TenantIdentity {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home_dir: user.dir,
        }
    }
}

/// Read access to the host's user database.
pub trait UserDirectory: Send + Sync {
    /// Look a user up by name. `Ok(None)` means the user does not exist.
    fn lookup(&self, name: &str) -> Result<Option<TenantIdentity>>;

    /// Look a user up by numeric id.
    fn lookup_uid(&self, uid: u32) -> Result<Option<TenantIdentity>>;
}

/// [`UserDirectory`] backed by the system passwd database (NSS).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUserDirectory;

impl UserDirectory for SystemUserDirectory {
    fn lookup(&self, name: &str) -> Result<Option<TenantIdentity>> {
        User::from_name(name)
            .map(|user| user.map(TenantIdentity::from))
            .map_err(|e| Error::fatal(format!("look up user '{name}'"), e.to_string()))
    }

    fn lookup_uid(&self, uid: u32) -> Result<Option<TenantIdentity>> {
        User::from_uid(Uid::from_raw(uid))
            .map(|user| user.map(TenantIdentity::from))
            .map_err(|e| Error::fatal(format!("look up uid {uid}"), e.to_string()))
    }
}

/// Resolve a tenant name to its identity.
///
/// Pure lookup: a missing user is `NotFound` and the caller has to create the user first.
pub fn resolve(directory: &dyn UserDirectory, name: &str) -> Result<TenantIdentity> {
    validate_tenant_name(name)?;

    directory.lookup(name)?.ok_or_else(|| Error::NotFound {
        resource: "OS user".to_string(),
        id: name.to_string(),
    })
}
