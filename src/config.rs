//! Mount configuration.
//!
//! Everything the core components need is supplied once at startup; the
//! CLI in `main.rs` parses these fields and passes the finished struct
//! down. Nothing here is consulted again after construction.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Configuration for one mounted repository.
#[derive(Args, Debug, Clone)]
pub struct MountConfig {
    /// User id for basic authentication
    #[arg(long, env = "REPOFS_USER")]
    pub userid: String,

    /// Password for basic authentication
    #[arg(long, env = "REPOFS_PASSWORD")]
    pub password: String,

    /// Remote protocol, http or https
    #[arg(long, default_value = "https")]
    pub protocol: String,

    /// Remote host name
    #[arg(long)]
    pub host: String,

    /// Remote port
    #[arg(long, default_value_t = 443)]
    pub port: u16,

    /// I/O service base path on the remote host
    #[arg(long, default_value = "/io")]
    pub io_base: String,

    /// Node reference or path scoping every remote operation
    #[arg(long)]
    pub mount_base: String,

    /// Directory holding cached file content
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// HTTP timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Maximum number of idle pooled connections
    #[arg(long, default_value_t = 8)]
    pub pool_max: usize,

    /// Seconds between housekeeping passes
    #[arg(long, default_value_t = 60)]
    pub housekeeping_secs: u64,

    /// Seconds an unreferenced cache file may age before eviction
    #[arg(long, default_value_t = 3600)]
    pub cache_retention_secs: u64,

    /// Log request details
    #[arg(long)]
    pub debug: bool,
}

impl MountConfig {
    /// Precomputed endpoint, e.g. `https://host:443/io`.
    pub fn endpoint(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol,
            self.host,
            self.port,
            self.io_base.trim_end_matches('/')
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_secs)
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_secs(self.cache_retention_secs)
    }

    /// Configured cache directory, or a per-user default.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("repofs")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MountConfig {
        MountConfig {
            userid: "admin".into(),
            password: "secret".into(),
            protocol: "https".into(),
            host: "cm.example.org".into(),
            port: 8443,
            io_base: "/io/".into(),
            mount_base: "workspace://root".into(),
            cache_dir: None,
            timeout_secs: 30,
            pool_max: 8,
            housekeeping_secs: 60,
            cache_retention_secs: 3600,
            debug: false,
        }
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        assert_eq!(config().endpoint(), "https://cm.example.org:8443/io");
    }

    #[test]
    fn default_cache_dir_is_not_empty() {
        assert!(config().cache_dir().as_os_str().len() > 0);
    }
}
