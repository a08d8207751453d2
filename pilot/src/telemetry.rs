//! Logging initialization.
//!
//! Pilot logs to stderr (so command output such as the `check` table stays clean on stdout) and
//! appends the same events, without ANSI colours, to a log file. The file defaults to
//! `/var/log/pilot.log`; when that cannot be opened, which is the normal case when running
//! unprivileged in development, `./pilot.log` is used instead. If neither can be opened the file
//! layer is skipped and only console logging remains.
//!
//! Verbosity follows `RUST_LOG` and defaults to `info`.
//!
//! Administrative actions are additionally recorded as audit events under the
//! [`AUDIT_TARGET`] target, so they can be filtered independently:
//!
//! ```bash
//! RUST_LOG=warn,pilot::audit=info pilot create-tenant --name acme
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Target for audit events emitted by [`audit`]
pub const AUDIT_TARGET: &str = "pilot::audit";

const FALLBACK_LOG_FILE: &str = "pilot.log";

/// Initialize tracing with a console layer and an optional append-only file layer.
///
/// Returns the path of the log file actually in use, if any.
pub fn init_telemetry(log_file: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let opened = log_file.and_then(open_log_file);
    let (file_layer, log_path) = match opened {
        Some((file, path)) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Some(path),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;

    match &log_path {
        Some(path) => info!("Logging initialized, appending to {}", path.display()),
        None => info!("Logging initialized (console only)"),
    }

    Ok(log_path)
}

/// Open the configured log file for appending, falling back to `./pilot.log`.
fn open_log_file(preferred: &Path) -> Option<(File, PathBuf)> {
    [preferred.to_path_buf(), PathBuf::from(FALLBACK_LOG_FILE)]
        .into_iter()
        .find_map(|path| append(&path).ok().map(|file| (file, path)))
}

fn append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Record an administrative action, e.g. `audit("setup-database", "acme", "success")`.
pub fn audit(action: &str, tenant: &str, status: &str) {
    info!(target: AUDIT_TARGET, action, user = tenant, status, "ACTION={action} USER={tenant} STATUS={status}");
}
