//! Installs a rendered [`UnitSet`] into a tenant's systemd user configuration and activates it.

use nix::fcntl::OFlag;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt, fchown};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::config::SystemdConfig;
use crate::errors::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec, run_checked_as_user};
use crate::identity::TenantIdentity;
use crate::units::UnitSet;

const SOCKET_DIR_MODE: u32 = 0o777;
const UNIT_FILE_MODE: u32 = 0o644;

pub struct UnitInstaller<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a SystemdConfig,
}

impl<'a> UnitInstaller<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a SystemdConfig) -> Self {
        Self { runner, config }
    }

    /// Write the units as the tenant, reload the tenant's manager and enable the socket.
    ///
    /// Stops at the first failing step. Files already written stay in place; running the
    /// installer again overwrites them.
    #[instrument(skip_all, fields(tenant = %identity.name))]
    pub async fn install_units(&self, identity: &TenantIdentity, units: &UnitSet) -> Result<PathBuf> {
        ensure_socket_dir(&self.config.socket_dir)?;

        let unit_dir = self.config.unit_dir_in(&identity.home_dir);
        create_owned_dir_all(&identity.home_dir, &self.config.unit_dir, identity)?;

        for unit in units.files() {
            let path = unit_dir.join(&unit.file_name);
            write_owned(&path, &unit.contents, identity)?;
            debug!(path = %path.display(), "Wrote unit file");
        }

        run_checked_as_user(
            self.runner,
            identity,
            "reload systemd user manager",
            &systemctl_user(["daemon-reload"]),
        )
        .await?;

        run_checked_as_user(
            self.runner,
            identity,
            &format!("enable {}", units.socket_unit()),
            &systemctl_user(["enable", "--now", units.socket_unit()]),
        )
        .await?;

        info!(unit_dir = %unit_dir.display(), socket = units.socket_unit(), port = units.port, "Socket activation enabled");
        Ok(unit_dir)
    }
}

fn systemctl_user<'s>(args: impl IntoIterator<Item = &'s str>) -> CommandSpec {
    CommandSpec::new("systemctl").arg("--user").args(args)
}

/// Shared socket directory; every tenant's socket unit binds inside it.
fn ensure_socket_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| io_error("create socket directory", dir, e))?;
    // create_dir_all is subject to the umask
    fs::set_permissions(dir, fs::Permissions::from_mode(SOCKET_DIR_MODE))
        .map_err(|e| io_error("set permissions on socket directory", dir, e))
}

/// `mkdir -p <base>/<relative>`, handing every directory it creates to the tenant.
///
/// Everything below `base` is writable by the tenant, so no component may be a symlink.
fn create_owned_dir_all(base: &Path, relative: &Path, identity: &TenantIdentity) -> Result<()> {
    let mut dir = base.to_path_buf();
    for component in relative.components() {
        dir.push(component);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.file_type().is_symlink() => return Err(refused(&dir, "is a symlink")),
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => return Err(refused(&dir, "is not a directory")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("inspect unit directory", &dir, e)),
        }
        fs::create_dir(&dir).map_err(|e| io_error("create unit directory", &dir, e))?;
        let handle = fs::OpenOptions::new()
            .read(true)
            .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC).bits())
            .open(&dir)
            .map_err(|e| io_error("open unit directory", &dir, e))?;
        give_to(&handle, &dir, identity)?;
    }
    Ok(())
}

fn write_owned(path: &Path, contents: &str, identity: &TenantIdentity) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => return Err(refused(path, "is a symlink")),
        Ok(meta) if !meta.is_file() => return Err(refused(path, "is not a regular file")),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error("inspect unit file", path, e)),
    }

    // O_NOFOLLOW closes the gap between the check above and open(2)
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .mode(UNIT_FILE_MODE)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC).bits())
        .open(path)
        .map_err(|e| io_error("open unit file", path, e))?;

    let meta = file.metadata().map_err(|e| io_error("inspect unit file", path, e))?;
    if !meta.is_file() {
        return Err(refused(path, "is not a regular file"));
    }
    if meta.nlink() > 1 {
        return Err(refused(path, "has more than one hard link"));
    }

    file.set_len(0).map_err(|e| io_error("truncate unit file", path, e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| io_error("write unit file", path, e))?;
    // mode() only applies to newly created files
    file.set_permissions(fs::Permissions::from_mode(UNIT_FILE_MODE))
        .map_err(|e| io_error("set permissions on unit file", path, e))?;
    give_to(&file, path, identity)
}

/// chown through the open descriptor, never by path.
fn give_to(handle: &fs::File, path: &Path, identity: &TenantIdentity) -> Result<()> {
    fchown(handle, Some(identity.uid), Some(identity.gid)).map_err(|e| {
        Error::fatal(
            format!("chown {} to {}", path.display(), identity.name),
            e.to_string(),
        )
    })
}

fn refused(path: &Path, reason: &str) -> Error {
    Error::fatal(
        format!("install into {}", path.display()),
        format!("refusing {}: it {reason}", path.display()),
    )
}

fn io_error(operation: &str, path: &Path, e: std::io::Error) -> Error {
    Error::fatal(format!("{operation} {}", path.display()), e.to_string())
}
