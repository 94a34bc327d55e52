use clap::Parser;
use std::path::PathBuf;

/// EchoFS-NG: stages files from a backing store into a PMEM tier and serves
/// application I/O from it.
#[derive(Parser, Debug)]
#[command(name = "echofs-ng", about = "PMEM-tier staging filesystem daemon", version)]
pub struct Cli {
    /// Backing store directory (overrides global-settings.root-dir).
    #[arg(long)]
    pub root_dir: Option<PathBuf>,

    /// Mount point directory (overrides global-settings.mount-dir).
    #[arg(long)]
    pub mount_dir: Option<PathBuf>,

    /// Path to the YAML config file.
    #[arg(long, default_value = "echofs.yaml")]
    pub config_file: PathBuf,

    /// Log file path (overrides global-settings.log-file).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing.
    #[arg(long)]
    pub foreground: bool,

    /// Force debug-level logging.
    #[arg(long)]
    pub debug: bool,
}
