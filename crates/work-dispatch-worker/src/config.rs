use crate::backoff::FetchErrorPolicy;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use work_dispatch_coord::LockConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub worker_id: Option<String>,
    pub idle_interval_ms: u64,
    pub fetch_error_policy: FetchErrorPolicy,
    /// Where staged resources are written; the system temp dir when unset
    pub staging_dir: Option<PathBuf>,
    pub status: StatusConfig,
    pub locks: LockConfig,
    /// Leader-only cleanup of stale staged files; disabled when unset
    pub sweeper: Option<SweeperConfig>,
    /// Built-in units to register, in order
    pub units: Vec<UnitSpec>,
}

/// A built-in processing unit and its settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitSpec {
    Log {
        #[serde(default = "default_log_unit_name")]
        name: String,
    },
    Command(CommandSpec),
}

fn default_log_unit_name() -> String {
    "log".to_string()
}

/// External program run once per staged property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub program: String,
    /// Arguments placed before the staged file path
    #[serde(default)]
    pub args: Vec<String>,
    /// Property names to claim; empty claims every property with content
    #[serde(default)]
    pub properties: Vec<String>,
    /// Command line run once at startup, fleet-wide exclusive
    #[serde(default)]
    pub setup: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    /// Inclusive range, e.g. "8100-8199"; the first free port is used
    pub port_range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            queue_name: "graph-property".to_string(),
            worker_id: None,
            idle_interval_ms: 100,
            fetch_error_policy: FetchErrorPolicy::default(),
            staging_dir: None,
            status: StatusConfig::default(),
            locks: LockConfig::default(),
            sweeper: None,
            units: vec![UnitSpec::Log {
                name: default_log_unit_name(),
            }],
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            enabled: false,
            port_range: "8100-8199".to_string(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        SweeperConfig {
            interval_secs: 300,
            max_age_secs: 3600,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_name.is_empty() {
            bail!("queue_name must not be empty");
        }
        if self.idle_interval_ms == 0 {
            bail!("idle_interval_ms must be greater than zero");
        }
        self.status.ports()?;
        if let Some(sweeper) = &self.sweeper {
            if sweeper.interval_secs == 0 {
                bail!("sweeper.interval_secs must be greater than zero");
            }
        }
        let mut names = std::collections::HashSet::new();
        for unit in &self.units {
            let name = match unit {
                UnitSpec::Log { name } => name,
                UnitSpec::Command(spec) => &spec.name,
            };
            if !names.insert(name.as_str()) {
                bail!("duplicate unit name: {}", name);
            }
        }
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let random = Uuid::new_v4().simple().to_string()[..8].to_string();

        format!("{}-{}-{}", hostname, pid, random)
    }
}

impl StatusConfig {
    /// Parse the port range into its inclusive bounds
    pub fn ports(&self) -> anyhow::Result<(u16, u16)> {
        let (start, end) = self
            .port_range
            .split_once('-')
            .with_context(|| format!("invalid port range: {}", self.port_range))?;
        let start: u16 = start.trim().parse().context("invalid start port")?;
        let end: u16 = end.trim().parse().context("invalid end port")?;
        if start > end {
            bail!("invalid port range: {}", self.port_range);
        }
        Ok((start, end))
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.idle_interval(), Duration::from_millis(100));
        assert_eq!(config.fetch_error_policy, FetchErrorPolicy::FailFast);
        assert_eq!(config.locks.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.status.ports().unwrap(), (8100, 8199));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
queue_name: media
worker_id: worker-a
fetch_error_policy:
  mode: log_and_retry
  backoff:
    kind: fixed
    delay_ms: 2500
locks:
  prefix: /acme/locks
units:
  - kind: log
  - kind: command
    name: ocr
    program: tesseract
    args: [--psm, "3"]
    properties: [raw]
"#;
        let config: WorkerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.queue_name, "media");
        assert_eq!(config.generate_worker_id(), "worker-a");
        assert_eq!(
            config.fetch_error_policy,
            FetchErrorPolicy::log_and_retry(BackoffPolicy::fixed(Duration::from_millis(2500)))
        );
        assert_eq!(config.locks.prefix, "/acme/locks");
        assert_eq!(config.locks.election_root, "/work-dispatch/leaders");
        assert_eq!(config.idle_interval_ms, 100);
        assert_eq!(config.units.len(), 2);
        match &config.units[1] {
            UnitSpec::Command(spec) => {
                assert_eq!(spec.program, "tesseract");
                assert_eq!(spec.args, vec!["--psm", "3"]);
                assert!(spec.setup.is_empty());
            }
            other => panic!("unexpected unit: {:?}", other),
        }
        assert_eq!(
            config.units[0],
            UnitSpec::Log {
                name: "log".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_unit_names() {
        let config = WorkerConfig {
            units: vec![
                UnitSpec::Log {
                    name: "log".to_string(),
                },
                UnitSpec::Log {
                    name: "log".to_string(),
                },
            ],
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let yaml = r#"
sweeper:
  interval_secs: 0
"#;
        let config: WorkerConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sweeper.interval_secs"));

        let config = WorkerConfig {
            sweeper: Some(SweeperConfig::default()),
            ..WorkerConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_generated_worker_id_has_pid() {
        let config = WorkerConfig::default();
        let id = config.generate_worker_id();
        assert!(id.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_invalid_port_range() {
        let status = StatusConfig {
            enabled: true,
            port_range: "9000".to_string(),
        };
        assert!(status.ports().is_err());

        let reversed = StatusConfig {
            enabled: true,
            port_range: "9001-9000".to_string(),
        };
        assert!(reversed.ports().is_err());
    }
}
