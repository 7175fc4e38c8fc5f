//! Server configuration: the fields of spec §6's `[global]` INI section,
//! each with the documented default. Loading the file itself is treated
//! as an external concern (spec §1 names config-file parsing a non-goal);
//! this module only types the result and fills in defaults.

use std::path::PathBuf;

use serde::Deserialize;

fn default_bind_addr() -> String { "0.0.0.0".to_string() }
fn default_bind_port() -> u16 { 3000 }
fn default_http_root() -> String { "/var/www/html".to_string() }
fn default_num_workers() -> usize { 2 * num_cpus() }
fn default_max_pixels() -> u64 { 90_000_000 }
fn default_def_quality() -> u8 { 95 }
fn default_min_recompress_pixels() -> u64 { 0 }
fn default_todisk_root() -> String { "/nonexistent".to_string() }
fn default_statsd_port() -> u16 { 8125 }
fn default_statsd_prefix() -> String { "dirpy".to_string() }
fn default_redis_prefix() -> String { "dirpy".to_string() }
fn default_log_max_line() -> usize { 300 }
fn default_pid_file() -> String { "/var/run/dirpy.pid".to_string() }
fn default_log_file() -> String { "/var/log/dirpy.log".to_string() }

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Typed view of the `[global]` INI section, with every default from
/// spec §6 baked in via serde.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_http_root")]
    pub http_root: String,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    #[serde(default = "default_def_quality")]
    pub def_quality: u8,
    #[serde(default = "default_min_recompress_pixels")]
    pub min_recompress_pixels: u64,
    #[serde(default)]
    pub req_timeout: Option<u64>,
    #[serde(default)]
    pub allow_post: bool,
    #[serde(default)]
    pub allow_todisk: bool,
    #[serde(default)]
    pub allow_mkdir: bool,
    #[serde(default)]
    pub allow_overwrite: bool,
    #[serde(default = "default_todisk_root")]
    pub todisk_root: String,
    #[serde(default)]
    pub statsd_server: Option<String>,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
    #[serde(default = "default_statsd_prefix")]
    pub statsd_prefix: String,
    #[serde(default)]
    pub redis_hosts: Option<String>,
    #[serde(default)]
    pub redis_cluster: bool,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    #[serde(default = "default_log_max_line")]
    pub log_max_line: usize,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Not part of `[global]`; set from the `-f/--foreground` CLI flag.
    /// Daemonization itself is out of scope (spec §1) — this only
    /// selects whether logs go to stdout or `log_file`.
    #[serde(skip)]
    pub foreground: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
            http_root: default_http_root(),
            num_workers: default_num_workers(),
            max_pixels: default_max_pixels(),
            def_quality: default_def_quality(),
            min_recompress_pixels: default_min_recompress_pixels(),
            req_timeout: None,
            allow_post: false,
            allow_todisk: false,
            allow_mkdir: false,
            allow_overwrite: false,
            todisk_root: default_todisk_root(),
            statsd_server: None,
            statsd_port: default_statsd_port(),
            statsd_prefix: default_statsd_prefix(),
            redis_hosts: None,
            redis_cluster: false,
            redis_prefix: default_redis_prefix(),
            log_max_line: default_log_max_line(),
            debug: false,
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            foreground: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to load config file '{path}': {source}")]
    Load { path: String, source: config::ConfigError },
    #[error("redis_cluster is false but redis_hosts lists more than one host")]
    MultipleRedisHostsWithoutCluster,
    #[error("def_quality must be between 1 and 100")]
    InvalidDefQuality,
}

impl Config {
    /// Load a config file, if one exists at `path`, overlaying it on top
    /// of the built-in defaults. A missing file is not an error — it just
    /// means every field falls back to its default, mirroring the
    /// original's `cfg.defaults = True` behavior.
    pub fn load(path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(
                    config::File::from(path.as_path()).format(config::FileFormat::Ini),
                );
            }
        }

        let raw = builder.build().map_err(|source| ConfigError::Load {
            path: path.map(|p| p.display().to_string()).unwrap_or_default(),
            source,
        })?;

        // The INI file nests everything under `[global]`; fall back to the
        // flat defaults if the section itself is absent.
        let cfg: Config = raw.get("global").unwrap_or_else(|_| Config::default());

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(hosts) = &self.redis_hosts {
            if !self.redis_cluster && hosts.contains(',') {
                return Err(ConfigError::MultipleRedisHostsWithoutCluster);
            }
        }
        if self.def_quality == 0 || self.def_quality > 100 {
            return Err(ConfigError::InvalidDefQuality);
        }
        Ok(())
    }
}

/// A single `host[:port]` entry from `redis_hosts`, split the way the
/// original's `redis_host_port()` does — default port 6379.
pub fn redis_host_port(entry: &str) -> (String, u16) {
    match entry.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (entry.to_string(), 6379),
        },
        None => (entry.to_string(), 6379),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.bind_port, 3000);
        assert_eq!(cfg.max_pixels, 90_000_000);
        assert_eq!(cfg.def_quality, 95);
        assert!(!cfg.allow_post);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_multiple_hosts_without_cluster() {
        let mut cfg = Config::default();
        cfg.redis_hosts = Some("a:6379,b:6379".to_string());
        cfg.redis_cluster = false;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MultipleRedisHostsWithoutCluster)
        ));
    }

    #[test]
    fn redis_host_port_defaults_port() {
        assert_eq!(redis_host_port("redis.local"), ("redis.local".to_string(), 6379));
        assert_eq!(redis_host_port("redis.local:6380"), ("redis.local".to_string(), 6380));
    }
}
