use std::path::PathBuf;

use clap::Parser;

/// Runs a multi-process TCP echo server.
#[derive(Debug, Parser)]
#[command(about)]
pub struct Cli {
    /// Address to listen on.
    ///
    /// Overrides `host` from the settings file and the environment.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on.
    ///
    /// Overrides `port` from the settings file and the environment.
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to the application configuration file.
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    /// Path to the server settings file.
    ///
    /// Every value can also be set through `TCPD_`-prefixed environment variables, with nested keys separated by a
    /// double underscore: `TCPD_SETTINGS__WORKER_NUM=4`.
    #[arg(long = "settings")]
    pub settings_file: Option<PathBuf>,
}
