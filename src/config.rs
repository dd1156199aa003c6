//! Store configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for a [`Store`](crate::store::Store).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one `<name>.db` file per database
    pub data_dir: PathBuf,

    /// Snappy-compress values before they hit disk
    pub compress: bool,

    /// How long a database handle may sit unused before it is closed.
    /// `None` keeps handles open for the life of the process.
    pub idle_timeout: Option<Duration>,

    /// How often the background reclaimer scans for idle handles
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("dbs"),
            compress: true,
            idle_timeout: Some(Duration::from_secs(10)),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// File backing the named database
    pub fn db_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(db_file_name(name))
    }
}

/// Filename convention for database files
pub fn db_file_name(name: &str) -> String {
    format!("{name}.db")
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the directory database files live in
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Enable or disable value compression
    pub fn compress(mut self, on: bool) -> Self {
        self.config.compress = on;
        self
    }

    /// Set the idle timeout, or `None` to never close handles
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the reclaimer sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
