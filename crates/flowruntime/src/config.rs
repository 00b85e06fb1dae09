use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Sibling nodes of one run that may execute at the same time
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Default per-node invocation timeout
    pub node_timeout_ms: u64,
    pub max_sub_workflow_depth: usize,
    /// Node invocations allowed per run, including retries
    pub max_steps: u64,
    /// Save run state after every node, not only on status transitions
    pub persist_progress: bool,
    /// Variables visible to expressions as `env`
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 1,
            event_buffer_size: 1000,
            node_timeout_ms: 300_000,
            max_sub_workflow_depth: 8,
            max_steps: 100_000,
            persist_progress: true,
            env: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load config from a TOML file. A missing file yields the defaults.
    /// `FLOW_*` environment variables override file values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_toml_str(&content)?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("FLOW_MAX_PARALLEL_NODES") {
            self.max_parallel_nodes = parse("FLOW_MAX_PARALLEL_NODES", v)?;
        }
        if let Some(v) = lookup("FLOW_NODE_TIMEOUT_MS") {
            self.node_timeout_ms = parse("FLOW_NODE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("FLOW_MAX_SUB_WORKFLOW_DEPTH") {
            self.max_sub_workflow_depth = parse("FLOW_MAX_SUB_WORKFLOW_DEPTH", v)?;
        }
        if let Some(v) = lookup("FLOW_MAX_STEPS") {
            self.max_steps = parse("FLOW_MAX_STEPS", v)?;
        }
        if let Some(v) = lookup("FLOW_PERSIST_PROGRESS") {
            self.persist_progress = parse("FLOW_PERSIST_PROGRESS", v)?;
        }
        Ok(())
    }
}
