//! Command-line interface definitions
//!
//! Defines all server flags using clap

use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Bodega - bucketed key/value store over HTTP
#[derive(Parser, Debug)]
#[command(name = "bodega")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Port for the HTTP API
    #[arg(long, short = 'p', default_value = "8080")]
    pub port: u16,

    /// Directory holding one .db file per database
    #[arg(long, default_value = "dbs")]
    pub data_dir: PathBuf,

    /// Username for basic auth (random when omitted)
    #[arg(long)]
    pub user: Option<String>,

    /// Password for basic auth (random when omitted)
    #[arg(long)]
    pub pass: Option<String>,

    /// Store values without compression
    #[arg(long)]
    pub raw: bool,

    /// Close database handles idle for this many seconds
    #[arg(long, default_value = "10")]
    pub idle_secs: u64,

    /// Seconds between idle-handle sweeps
    #[arg(long, default_value = "10")]
    pub sweep_secs: u64,

    /// Never close idle database handles
    #[arg(long)]
    pub keep_open: bool,
}

impl Cli {
    /// Translate the flags into a store configuration.
    pub fn store_config(&self) -> Config {
        let idle_timeout = if self.keep_open {
            None
        } else {
            Some(Duration::from_secs(self.idle_secs))
        };
        Config::builder()
            .data_dir(self.data_dir.clone())
            .compress(!self.raw)
            .idle_timeout(idle_timeout)
            .sweep_interval(Duration::from_secs(self.sweep_secs))
            .build()
    }
}
