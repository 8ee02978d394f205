use anyhow::{Context, Result};
use crossbar_broker::PoolConfig;
use crossbar_common::Limits;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Daemon configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // Logical broker name; the socket is <runtime_dir>/<name>.sock.
    pub name: String,
    // Directory holding broker sockets.
    pub runtime_dir: String,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Negotiated subscriber receive-buffer capacity.
    pub recv_buffer_bytes: usize,
    // Per-peer outgoing queue depth before notifications are dropped.
    pub send_queue_depth: usize,
    // Worker pool floor.
    pub pool_min_workers: usize,
    // Worker pool ceiling.
    pub pool_max_workers: usize,
    // Idle time before a worker above the floor exits.
    pub pool_idle_linger_ms: u64,
}

const DEFAULT_NAME: &str = "crossbar";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9100";

#[derive(Debug, Deserialize)]
struct ServiceConfigOverride {
    name: Option<String>,
    runtime_dir: Option<String>,
    metrics_bind: Option<String>,
    recv_buffer_bytes: Option<usize>,
    send_queue_depth: Option<usize>,
    pool_min_workers: Option<usize>,
    pool_max_workers: Option<usize>,
    pool_idle_linger_ms: Option<u64>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let name = std::env::var("CROSSBAR_NAME").unwrap_or_else(|_| DEFAULT_NAME.to_string());
        let runtime_dir = std::env::var("CROSSBAR_RUNTIME_DIR")
            .unwrap_or_else(|_| crossbar_transport::DEFAULT_RUNTIME_DIR.to_string());
        let metrics_bind = std::env::var("CROSSBAR_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse CROSSBAR_METRICS_BIND")?;
        let limits = Limits::default();
        let recv_buffer_bytes = std::env::var("CROSSBAR_RECV_BUFFER_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value >= crossbar_wire::HEADER_LEN)
            .unwrap_or(limits.recv_buffer_bytes);
        let send_queue_depth = std::env::var("CROSSBAR_SEND_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(limits.send_queue_depth);
        let pool = PoolConfig::default();
        let pool_min_workers = std::env::var("CROSSBAR_POOL_MIN_WORKERS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(pool.min_workers);
        let pool_max_workers = std::env::var("CROSSBAR_POOL_MAX_WORKERS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(pool.max_workers);
        let pool_idle_linger_ms = std::env::var("CROSSBAR_POOL_IDLE_LINGER_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(pool.idle_linger.as_millis() as u64);
        Ok(Self {
            name,
            runtime_dir,
            metrics_bind,
            recv_buffer_bytes,
            send_queue_depth,
            pool_min_workers,
            pool_max_workers,
            pool_idle_linger_ms,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CROSSBAR_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CROSSBAR_CONFIG: {path}"))?;
            let override_cfg: ServiceConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse crossbar config yaml")?;
            if let Some(value) = override_cfg.name {
                config.name = value;
            }
            if let Some(value) = override_cfg.runtime_dir {
                config.runtime_dir = value;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.recv_buffer_bytes {
                if value >= crossbar_wire::HEADER_LEN {
                    config.recv_buffer_bytes = value;
                }
            }
            if let Some(value) = override_cfg.send_queue_depth {
                if value > 0 {
                    config.send_queue_depth = value;
                }
            }
            if let Some(value) = override_cfg.pool_min_workers {
                config.pool_min_workers = value;
            }
            if let Some(value) = override_cfg.pool_max_workers {
                if value > 0 {
                    config.pool_max_workers = value;
                }
            }
            if let Some(value) = override_cfg.pool_idle_linger_ms {
                if value > 0 {
                    config.pool_idle_linger_ms = value;
                }
            }
        }
        Ok(config)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            recv_buffer_bytes: self.recv_buffer_bytes,
            send_queue_depth: self.send_queue_depth,
        }
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            min_workers: self.pool_min_workers,
            max_workers: self.pool_max_workers.max(self.pool_min_workers.max(1)),
            idle_linger: Duration::from_millis(self.pool_idle_linger_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        let _g1 = EnvGuard::unset("CROSSBAR_NAME");
        let _g2 = EnvGuard::unset("CROSSBAR_RUNTIME_DIR");
        let _g3 = EnvGuard::unset("CROSSBAR_METRICS_BIND");
        let _g4 = EnvGuard::unset("CROSSBAR_CONFIG");
        let config = ServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.name, "crossbar");
        assert_eq!(config.runtime_dir, crossbar_transport::DEFAULT_RUNTIME_DIR);
        assert_eq!(config.recv_buffer_bytes, Limits::default().recv_buffer_bytes);
    }

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        let _g1 = EnvGuard::set("CROSSBAR_NAME", "supervisor");
        let _g2 = EnvGuard::set("CROSSBAR_RECV_BUFFER_BYTES", "4096");
        let _g3 = EnvGuard::set("CROSSBAR_POOL_MAX_WORKERS", "8");
        let _g4 = EnvGuard::unset("CROSSBAR_CONFIG");
        let config = ServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.name, "supervisor");
        assert_eq!(config.recv_buffer_bytes, 4096);
        assert_eq!(config.pool().max_workers, 8);
    }

    #[test]
    #[serial]
    fn yaml_wins_over_env() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "name: filed\nsend_queue_depth: 32").expect("write");
        let _g1 = EnvGuard::set("CROSSBAR_NAME", "enved");
        let _g2 = EnvGuard::set("CROSSBAR_CONFIG", file.path().to_str().expect("utf8"));
        let config = ServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.name, "filed");
        assert_eq!(config.send_queue_depth, 32);
    }

    #[test]
    #[serial]
    fn invalid_env_values_fall_back() {
        let _g1 = EnvGuard::set("CROSSBAR_SEND_QUEUE_DEPTH", "0");
        let _g2 = EnvGuard::set("CROSSBAR_RECV_BUFFER_BYTES", "3");
        let _g3 = EnvGuard::unset("CROSSBAR_CONFIG");
        let config = ServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.send_queue_depth, Limits::default().send_queue_depth);
        assert_eq!(config.recv_buffer_bytes, Limits::default().recv_buffer_bytes);
    }
}
