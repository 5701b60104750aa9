use std::{error::Error, path::Path, time::Duration};

use tracing::{error, info};

use lokikit::{
    cli::{Cli, Commands, parse_args},
    config::{CliOverrides, Config, load_config},
    logs::{init_logging, with_console_logging},
    probe::{SystemProcessTable, TcpProbe},
    promtail,
    runtime::{RuntimeLayout, ShutdownSignal},
    setup::run_setup,
    supervisor::{StartOptions, StartOutcome, Supervisor},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let config = resolve_config(&args);

    let logs_dir = RuntimeLayout::new(&config.base_dir).logs_dir();
    match args.command {
        // Clean removes the base directory, so it must not recreate logs/ inside it.
        Commands::Clean => init_logging(None, args.log_level, args.verbose),
        _ => init_logging(Some(&logs_dir), args.log_level, args.verbose),
    }

    let shutdown = match args.command {
        Commands::Start { .. } => ShutdownSignal::install()?,
        _ => ShutdownSignal::new(),
    };

    match args.command {
        Commands::Setup => run_setup(&config)?,
        Commands::Start {
            background,
            force,
            timeout,
        } => {
            let supervisor = supervisor(config, shutdown);
            let options = StartOptions {
                background,
                force,
                timeout: Duration::from_secs(timeout),
            };
            if let StartOutcome::Started { readiness } = supervisor.start(options)?
                && !readiness.is_ready()
            {
                info!(
                    "Services still starting: {:?}. Check their logs for details.",
                    readiness.not_ready()
                );
            }
        }
        Commands::Stop { force } => {
            let summary = supervisor(config, shutdown).stop(force)?;
            if !summary.all_stopped() {
                error!("Some lokikit processes could not be stopped.");
            }
        }
        Commands::Status => {
            supervisor(config, shutdown).status()?;
        }
        Commands::Clean => {
            supervisor(config, shutdown).clean()?;
        }
        Commands::ForceQuit => {
            supervisor(config, shutdown).force_quit()?;
        }
        Commands::Watch { path, job, labels } => {
            promtail::watch(
                &config.base_dir,
                &path,
                job.as_deref(),
                &labels,
                &SystemProcessTable,
            )?;
        }
    }

    Ok(())
}

/// Loads the config file with console-only logging, since the log directory depends on it.
fn resolve_config(args: &Cli) -> Config {
    let overrides = CliOverrides {
        base_dir: args.base_dir.clone(),
        host: args.host.clone(),
        grafana_port: args.port,
        loki_port: args.loki_port,
        promtail_port: args.promtail_port,
    };
    with_console_logging(args.log_level, args.verbose, || {
        Config::resolve(overrides, load_config(args.config.as_deref().map(Path::new)))
    })
}

fn supervisor(
    config: Config,
    shutdown: ShutdownSignal,
) -> Supervisor<SystemProcessTable, TcpProbe> {
    Supervisor::new(config, shutdown, SystemProcessTable, TcpProbe::default())
}
