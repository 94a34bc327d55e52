use clap::Parser;

use echofs_ng::cli::Cli;
use echofs_ng::config;
use echofs_ng::daemon;
use echofs_ng::logging;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let log_handle = logging::init(cli.debug, cli.foreground);

    let mut cfg = config::load_config(&cli.config_file)?;

    if let Some(root_dir) = &cli.root_dir {
        cfg.global_settings.root_dir = root_dir.display().to_string();
    }
    if let Some(mount_dir) = &cli.mount_dir {
        cfg.global_settings.mount_dir = mount_dir.display().to_string();
    }
    if let Some(log_file) = cli
        .log_file
        .clone()
        .or_else(|| (!cfg.global_settings.log_file.is_empty()).then(|| cfg.global_settings.log_file.clone().into()))
    {
        log_handle
            .activate(&log_file)
            .map_err(|source| echofs_ng::error::DaemonError::Io {
                context: format!("opening log file {}", log_file.display()),
                source,
        })?;
    }

    if !cli.foreground {
        daemon::spawn_background(&cli.config_file)?;
        tracing::info!("echofs-ng daemon launched in background");
        return Ok(());
    }

    let backends = daemon::build_backends(&cfg)?;
    daemon::run_preloads(&cfg, &backends);
    daemon::run_serve(&cfg, backends).await?;

    Ok(())
}
