//! Systemd unit generation.
//!
//! Every tenant runs the same three user units:
//!
//! - a **socket** listening on `<socket_dir>/<tenant>.sock`, the address Caddy dials,
//! - a **proxy** (`systemd-socket-proxyd`) started by the socket, which forwards to the backend's
//!   loopback port and exits after an idle interval,
//! - the **backend** service, pulled in by the proxy and stopped once the proxy is gone.
//!
//! Rendering is pure: the same identity, configuration and idle timeout always produce the same
//! bytes, so re-running setup rewrites identical files.

use minijinja::{Environment, UndefinedBehavior, context};
use std::time::Duration;

use crate::config::SystemdConfig;
use crate::errors::{Error, Result};
use crate::identity::TenantIdentity;
use crate::validation::validate_tenant_name;

const SOCKET_TEMPLATE: &str = "\
[Unit]
Description=Public Socket for {{ name }}

[Socket]
ListenStream={{ socket_path }}
SocketMode=0666
Service={{ proxy_unit }}

[Install]
WantedBy=sockets.target
";

const PROXY_TEMPLATE: &str = "\
[Unit]
Description=Socket Proxy for {{ name }}
Requires={{ service_unit }}
After={{ service_unit }}

[Service]
ExecStart={{ proxyd_path }} --exit-idle-time={{ idle_timeout }} 127.0.0.1:{{ port }}
NonBlocking=true
";

const SERVICE_TEMPLATE: &str = "\
[Unit]
Description=REST API Backend for {{ name }}
StopWhenUnneeded=true
PartOf={{ proxy_unit }}

[Service]
Type=simple
ExecStart={{ backend_exec }}
Environment=PORT={{ port }}
ExecStartPost=/bin/sleep 1
";

/// Loopback port of a tenant's backend: `uid + offset`.
///
/// Distinct uids map to distinct ports. A uid whose port does not fit in a TCP port is rejected
/// rather than wrapped onto another tenant's port.
pub fn provisioning_port(uid: u32, offset: u32) -> Result<u16> {
    uid.checked_add(offset)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| Error::Validation {
            field: "uid".to_string(),
            value: uid.to_string(),
            reason: format!("uid + port offset {offset} exceeds the largest TCP port {}", u16::MAX),
        })
}

/// One rendered unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    /// File name inside the unit directory, e.g. `rest-api.socket`
    pub file_name: String,
    pub contents: String,
}

/// The socket, proxy and service units of one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSet {
    pub tenant: String,
    pub port: u16,
    pub socket: UnitFile,
    pub proxy: UnitFile,
    pub service: UnitFile,
}

impl UnitSet {
    /// Files in installation order
    pub fn files(&self) -> [&UnitFile; 3] {
        [&self.socket, &self.proxy, &self.service]
    }

    /// The only unit that is enabled; the other two are started on demand.
    pub fn socket_unit(&self) -> &str {
        &self.socket.file_name
    }
}

/// Render the unit set for a tenant.
pub fn generate_units(config: &SystemdConfig, identity: &TenantIdentity, idle_timeout: Duration) -> Result<UnitSet> {
    validate_tenant_name(&identity.name)?;
    let port = provisioning_port(identity.uid, config.port_offset)?;
    let idle = format_idle_timeout(idle_timeout)?;

    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("socket", SOCKET_TEMPLATE).map_err(template_error)?;
    env.add_template("proxy", PROXY_TEMPLATE).map_err(template_error)?;
    env.add_template("service", SERVICE_TEMPLATE).map_err(template_error)?;

    let ctx = context! {
        name => identity.name,
        uid => identity.uid,
        port => port,
        idle_timeout => idle,
        socket_path => config.socket_path(&identity.name).display().to_string(),
        proxyd_path => config.proxyd_path.display().to_string(),
        backend_exec => config.backend_exec.display().to_string(),
        proxy_unit => config.proxy_unit,
        service_unit => config.service_unit,
    };

    let render = |template: &str, file_name: &str| -> Result<UnitFile> {
        let contents = env
            .get_template(template)
            .and_then(|t| t.render(&ctx))
            .map_err(template_error)?;
        Ok(UnitFile {
            file_name: file_name.to_string(),
            contents,
        })
    };

    Ok(UnitSet {
        tenant: identity.name.clone(),
        port,
        socket: render("socket", &config.socket_unit)?,
        proxy: render("proxy", &config.proxy_unit)?,
        service: render("service", &config.service_unit)?,
    })
}

/// systemd time span: whole seconds as `300s`, anything finer as milliseconds.
///
/// Durations with sub-millisecond precision are rejected rather than truncated.
fn format_idle_timeout(idle: Duration) -> Result<String> {
    let invalid = |reason: &str| Error::Validation {
        field: "idle timeout".to_string(),
        value: format!("{idle:?}"),
        reason: reason.to_string(),
    };

    if idle.is_zero() {
        return Err(invalid("must be positive"));
    }
    if idle.subsec_nanos() % 1_000_000 != 0 {
        return Err(invalid("must be a whole number of milliseconds"));
    }

    if idle.subsec_nanos() == 0 {
        Ok(format!("{}s", idle.as_secs()))
    } else {
        Ok(format!("{}ms", idle.as_millis()))
    }
}

fn template_error(e: minijinja::Error) -> Error {
    Error::Other(anyhow::anyhow!("failed to render unit template: {e}"))
}
