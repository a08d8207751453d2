//! Read-only host inspection: unit status and tenant journals.

use std::fmt::Write;
use tracing::warn;

use crate::errors::Result;
use crate::exec::{CommandRunner, CommandSpec, run_checked};
use crate::identity::{UserDirectory, resolve};

/// Units checked when none are given
pub const DEFAULT_UNITS: [&str; 2] = ["caddy.service", "postgresql.service"];

const NOT_FOUND: &str = "not-found";

/// One row of the `check` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub unit: String,
    /// systemd `ActiveState`, or `not-found` for units systemd has not loaded
    pub state: String,
    /// Owner of the main process for active units, `-` otherwise
    pub user: String,
}

/// `caddy` -> `caddy.service`; names with a suffix are left alone.
pub fn normalize_unit_name(unit: &str) -> String {
    if unit.contains('.') {
        unit.to_string()
    } else {
        format!("{unit}.service")
    }
}

/// Query each unit's load state, active state and main process owner.
pub async fn check_units(
    runner: &dyn CommandRunner,
    directory: &dyn UserDirectory,
    units: &[String],
) -> Result<Vec<UnitStatus>> {
    let units: Vec<String> = if units.is_empty() {
        DEFAULT_UNITS.iter().map(ToString::to_string).collect()
    } else {
        units.iter().map(|unit| normalize_unit_name(unit)).collect()
    };

    let mut statuses = Vec::with_capacity(units.len());
    for unit in units {
        let command = CommandSpec::new("systemctl").args([
            "show",
            unit.as_str(),
            "--property=LoadState,ActiveState,ExecMainUID",
        ]);
        let output = runner.run(&command).await?;
        if !output.success() {
            warn!(unit = %unit, output = %output.combined(), "systemctl show failed");
            statuses.push(UnitStatus {
                unit,
                state: NOT_FOUND.to_string(),
                user: "-".to_string(),
            });
            continue;
        }

        let properties = parse_properties(&output.stdout);
        let status = match (properties.load_state, properties.active_state) {
            (Some(NOT_FOUND), _) | (_, None) => UnitStatus {
                unit,
                state: NOT_FOUND.to_string(),
                user: "-".to_string(),
            },
            (_, Some(state)) => {
                let user = match properties.main_uid {
                    Some(uid) if state == "active" => owner_name(directory, uid),
                    _ => "-".to_string(),
                };
                UnitStatus {
                    unit,
                    state: state.to_string(),
                    user,
                }
            }
        };
        statuses.push(status);
    }

    Ok(statuses)
}

#[derive(Default)]
struct UnitProperties<'a> {
    load_state: Option<&'a str>,
    active_state: Option<&'a str>,
    main_uid: Option<u32>,
}

/// Parse `Key=Value` lines from `systemctl show`
fn parse_properties(stdout: &str) -> UnitProperties<'_> {
    let mut properties = UnitProperties::default();
    for line in stdout.lines() {
        match line.split_once('=') {
            Some(("LoadState", value)) => properties.load_state = Some(value.trim()),
            Some(("ActiveState", value)) => properties.active_state = Some(value.trim()),
            // "[not set]" or empty for units without a main process
            Some(("ExecMainUID", value)) => properties.main_uid = value.trim().parse().ok(),
            _ => {}
        }
    }
    properties
}

fn owner_name(directory: &dyn UserDirectory, uid: u32) -> String {
    match directory.lookup_uid(uid) {
        Ok(Some(identity)) => identity.name,
        _ => format!("uid:{uid}"),
    }
}

/// Render statuses as an aligned table.
pub fn render_table(statuses: &[UnitStatus]) -> String {
    const HEADER: [&str; 3] = ["SERVICE", "STATUS", "RUNNING USER"];
    const PADDING: usize = 3;

    let unit_width = statuses
        .iter()
        .map(|s| s.unit.len())
        .chain([HEADER[0].len()])
        .max()
        .unwrap_or_default()
        + PADDING;
    let state_width = statuses
        .iter()
        .map(|s| s.state.len())
        .chain([HEADER[1].len()])
        .max()
        .unwrap_or_default()
        + PADDING;

    let mut table = String::new();
    let mut row = |unit: &str, state: &str, user: &str| {
        let _ = writeln!(table, "{unit:<unit_width$}{state:<state_width$}{user}");
    };
    row(HEADER[0], HEADER[1], HEADER[2]);
    row("-------", "------", "------------");
    for status in statuses {
        row(&status.unit, &status.state, &status.user);
    }
    table
}

/// Recent journal entries for everything running as the tenant (proxy and backend alike).
pub async fn check_logs(
    runner: &dyn CommandRunner,
    directory: &dyn UserDirectory,
    name: &str,
    lines: u32,
) -> Result<String> {
    let identity = resolve(directory, name)?;
    let output = run_checked(
        runner,
        &format!("read journal for '{name}'"),
        &CommandSpec::new("journalctl")
            .arg(format!("_UID={}", identity.uid))
            .arg("--no-pager")
            .arg("-n")
            .arg(lines.to_string()),
    )
    .await?;
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::test_utils::{RecordingRunner, StaticUserDirectory, failed, identity, ok};

    fn directory() -> StaticUserDirectory {
        StaticUserDirectory::new([identity("caddy", 998), identity("postgres", 120)])
    }

    #[test]
    fn test_normalize_unit_name() {
        assert_eq!(normalize_unit_name("caddy"), "caddy.service");
        assert_eq!(normalize_unit_name("rest-api.socket"), "rest-api.socket");
    }

    #[test_log::test(tokio::test)]
    async fn test_defaults_and_running_user() {
        let runner = RecordingRunner::new();
        runner
            .respond("show caddy.service", ok("LoadState=loaded\nActiveState=active\nExecMainUID=998\n"))
            .respond("show postgresql.service", ok("LoadState=loaded\nActiveState=active\nExecMainUID=4242\n"));

        let statuses = check_units(&runner, &directory(), &[]).await.unwrap();

        assert_eq!(
            statuses,
            vec![
                UnitStatus {
                    unit: "caddy.service".to_string(),
                    state: "active".to_string(),
                    user: "caddy".to_string(),
                },
                UnitStatus {
                    unit: "postgresql.service".to_string(),
                    state: "active".to_string(),
                    user: "uid:4242".to_string(),
                },
            ]
        );
        assert_eq!(
            runner.calls()[0],
            "systemctl show caddy.service --property=LoadState,ActiveState,ExecMainUID"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_inactive_and_missing_units() {
        let runner = RecordingRunner::new();
        runner
            .respond("show nginx.service", ok("LoadState=not-found\nActiveState=inactive\nExecMainUID=[not set]\n"))
            .respond("show redis.service", ok("LoadState=loaded\nActiveState=failed\nExecMainUID=0\n"))
            .respond("show broken.service", failed(1, "Failed to connect to bus"));

        let units = ["nginx", "redis", "broken"].map(String::from);
        let statuses = check_units(&runner, &directory(), &units).await.unwrap();

        let summary: Vec<(&str, &str, &str)> = statuses
            .iter()
            .map(|s| (s.unit.as_str(), s.state.as_str(), s.user.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("nginx.service", "not-found", "-"),
                ("redis.service", "failed", "-"),
                ("broken.service", "not-found", "-"),
            ]
        );
    }

    #[test]
    fn test_render_table_aligns_columns() {
        let table = render_table(&[UnitStatus {
            unit: "postgresql.service".to_string(),
            state: "active".to_string(),
            user: "postgres".to_string(),
        }]);

        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "SERVICE              STATUS   RUNNING USER");
        assert_eq!(lines[1], "-------              ------   ------------");
        assert_eq!(lines[2], "postgresql.service   active   postgres");
    }

    #[test_log::test(tokio::test)]
    async fn test_check_logs_reads_tenant_journal() {
        let runner = RecordingRunner::new();
        runner.respond("journalctl", ok("Oct 18 10:00:00 host systemd[1042]: Started rest-api.service.\n"));
        let directory = StaticUserDirectory::new([identity("acme", 1042)]);

        let logs = check_logs(&runner, &directory, "acme", 20).await.unwrap();

        assert!(logs.contains("Started rest-api.service"));
        assert_eq!(runner.calls(), vec!["journalctl _UID=1042 --no-pager -n 20"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_check_logs_unknown_tenant() {
        let runner = RecordingRunner::new();
        let err = check_logs(&runner, &StaticUserDirectory::new([]), "ghost", 50).await.unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }));
        assert!(runner.calls().is_empty());
    }
}
