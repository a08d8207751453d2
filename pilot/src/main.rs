use clap::{CommandFactory, Parser};
use pilot::config::{Args, Command};
use pilot::diagnostics::{check_logs, check_units, render_table};
use pilot::exec::SystemCommandRunner;
use pilot::identity::SystemUserDirectory;
use pilot::telemetry::{self, audit};
use pilot::{Config, Pipeline, ProvisionRequest};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, info};

/// Log the outcome of an administrative action and pass the result through.
fn record<T, E: Display>(action: &str, tenant: &str, result: Result<T, E>) -> Result<T, E> {
    match &result {
        Ok(_) => audit(action, tenant, "success"),
        Err(e) => {
            error!(action, tenant, error = %e, "Action failed");
            audit(action, tenant, "failed");
        }
    }
    result
}

async fn run(pipeline: &Pipeline, command: Command) -> anyhow::Result<()> {
    match command {
        Command::CreateUser { name } => {
            let (identity, outcome) = record("create-user", &name, pipeline.create_user(&name).await)?;
            info!(uid = identity.uid, home = %identity.home_dir.display(), "User {} {}", name, outcome);
        }
        Command::SetupDatabase { name } => {
            let outcome = record("setup-database", &name, pipeline.setup_database(&name).await)?;
            info!("Role {}, database {} for '{}'", outcome.role, outcome.database, name);
        }
        Command::SetupSystemd { name, idle } => {
            let (units, unit_dir) = record("setup-systemd", &name, pipeline.setup_systemd(&name, idle).await)?;
            info!(
                "Socket activation active for '{}' (port {}, units in {})",
                name,
                units.port,
                unit_dir.display()
            );
        }
        Command::SetupProxy { name, domain, upstream } => {
            let (route, outcome) = record(
                "setup-proxy",
                &name,
                pipeline
                    .setup_proxy(&name, domain.as_deref(), upstream.as_deref())
                    .await,
            )?;
            info!("Route {} {}: http://{} -> {}", route.id, outcome, route.host, route.upstream);
        }
        Command::CreateTenant {
            name,
            domain,
            idle,
            upstream,
            skip_user,
        } => {
            let request = ProvisionRequest {
                name: name.clone(),
                domain,
                idle_timeout: idle,
                upstream,
                create_user: !skip_user,
            };
            let report = record("create-tenant", &name, pipeline.provision(&request).await)?;
            info!(
                "Tenant '{}' is fully provisioned: http://{} (uid {}, port {})",
                name, report.route.host, report.identity.uid, report.port
            );
        }
        Command::Check { units } => {
            let statuses = check_units(pipeline.runner(), pipeline.directory(), &units).await?;
            print!("{}", render_table(&statuses));
        }
        Command::CheckLogs { name, lines } => {
            let logs = check_logs(pipeline.runner(), pipeline.directory(), &name, lines).await?;
            println!("{logs}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    let Some(command) = args.command.clone() else {
        Args::command().print_help()?;
        return Ok(());
    };

    telemetry::init_telemetry(config.log_file.as_deref())?;

    tracing::debug!("{:?}", args);

    let runner = Arc::new(SystemCommandRunner::new(config.command_timeout));
    let pipeline = Pipeline::new(config, runner, Arc::new(SystemUserDirectory))?;

    run(&pipeline, command).await
}
