//! Sandbox configuration
//!
//! Configuration for the control plane and the native engine, loaded from
//! environment, a TOML file, or set dynamically.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// How an output reader buffers bytes the embedder has not consumed yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum BufferPolicy {
    /// Keep everything until consumed
    #[default]
    Unbounded,
    /// Keep at most `capacity` bytes; anything beyond is discarded and counted
    DropNewest { capacity: usize },
    /// Keep everything, but ask the engine to stop producing above `capacity`
    Suspend { capacity: usize },
}

impl BufferPolicy {
    /// Buffer ceiling, if the policy has one
    pub fn capacity(&self) -> Option<usize> {
        match self {
            BufferPolicy::Unbounded => None,
            BufferPolicy::DropNewest { capacity } | BufferPolicy::Suspend { capacity } => {
                Some(*capacity)
            }
        }
    }
}

impl FromStr for BufferPolicy {
    type Err = String;

    /// Parses `unbounded`, `drop:<bytes>` or `suspend:<bytes>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, capacity) = match s.split_once(':') {
            Some((mode, capacity)) => (mode.trim(), Some(capacity.trim())),
            None => (s.trim(), None),
        };

        let parse_capacity = || -> Result<usize, String> {
            let raw = capacity.ok_or_else(|| format!("buffer mode '{}' needs a capacity", mode))?;
            raw.parse::<usize>()
                .map_err(|_| format!("invalid buffer capacity '{}'", raw))
        };

        match mode {
            "unbounded" => Ok(BufferPolicy::Unbounded),
            "drop" | "drop_newest" => Ok(BufferPolicy::DropNewest {
                capacity: parse_capacity()?,
            }),
            "suspend" => Ok(BufferPolicy::Suspend {
                capacity: parse_capacity()?,
            }),
            other => Err(format!("unknown buffer mode '{}'", other)),
        }
    }
}

/// Resource limits applied by the native engine before exec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// CPU time limit in milliseconds
    pub cpu_time_ms: Option<u32>,
    /// Wall clock limit in milliseconds, enforced by killing the child
    pub wall_time_ms: Option<u32>,
    /// Address space limit in MB
    pub memory_mb: Option<u32>,
    /// Maximum number of processes
    pub processes: Option<u32>,
    /// Maximum open files
    pub open_files: Option<u32>,
    /// Maximum file size in KB
    pub fsize_kb: Option<u32>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cpu_time_ms: None,
            wall_time_ms: None,
            memory_mb: None,
            processes: None,
            open_files: Some(256),
            fsize_kb: Some(262144), // 256MB
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Ask the engine to preserve crashed children for a debugger
    pub debug_on_crash: bool,
    /// Buffering policy for stdout and stderr
    pub output_buffer: BufferPolicy,
    /// Buffered bytes below which a reader reports it wants more (default: 16KB)
    pub high_water_mark: usize,
    /// Capacity of the data-notice and fault broadcast channels
    pub event_capacity: usize,
    /// Working directory for the child, passed through the filename mapping
    pub working_dir: Option<PathBuf>,
    /// Native engine resource limits
    pub limits: Limits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            debug_on_crash: false,
            output_buffer: BufferPolicy::Unbounded,
            high_water_mark: 16 * 1024,
            event_capacity: 256,
            working_dir: None,
            limits: Limits::default(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from `SANDBOX_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from a variable lookup, falling back to defaults
    /// for anything missing or malformed
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = var("SANDBOX_DEBUG_ON_CRASH") {
            config.debug_on_crash = value == "true" || value == "1";
        }
        if let Some(policy) = parse_var("SANDBOX_OUTPUT_BUFFER", var("SANDBOX_OUTPUT_BUFFER")) {
            config.output_buffer = policy;
        }
        if let Some(mark) = parse_var("SANDBOX_HIGH_WATER_MARK", var("SANDBOX_HIGH_WATER_MARK")) {
            config.high_water_mark = mark;
        }
        if let Some(capacity) = parse_var("SANDBOX_EVENT_CAPACITY", var("SANDBOX_EVENT_CAPACITY")) {
            config.event_capacity = capacity;
        }
        if let Some(dir) = var("SANDBOX_WORKDIR") {
            config.working_dir = Some(PathBuf::from(dir));
        }

        let limits = &mut config.limits;
        let limit = |key: &str, slot: &mut Option<u32>| {
            if let Some(value) = parse_var(key, var(key)) {
                *slot = Some(value);
            }
        };
        limit("SANDBOX_CPU_TIME_MS", &mut limits.cpu_time_ms);
        limit("SANDBOX_WALL_TIME_MS", &mut limits.wall_time_ms);
        limit("SANDBOX_MEMORY_MB", &mut limits.memory_mb);
        limit("SANDBOX_PROCESSES", &mut limits.processes);
        limit("SANDBOX_OPEN_FILES", &mut limits.open_files);
        limit("SANDBOX_FSIZE_KB", &mut limits.fsize_kb);

        config
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse sandbox configuration")
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sandbox configuration {:?}", path))?;
        Self::from_toml_str(&content)
    }

    /// Create config with a specific buffer policy
    pub fn with_output_buffer(mut self, policy: BufferPolicy) -> Self {
        self.output_buffer = policy;
        self
    }

    pub fn with_debug_on_crash(mut self, value: bool) -> Self {
        self.debug_on_crash = value;
        self
    }
}

fn parse_var<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid value {:?} for {}", value, key);
            None
        }
    }
}

/// Global sandbox configuration
static SANDBOX_CONFIG: OnceLock<SandboxConfig> = OnceLock::new();

/// Initialize the process-wide sandbox configuration
pub fn init_config(config: SandboxConfig) -> anyhow::Result<()> {
    SANDBOX_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Sandbox configuration already initialized"))?;

    Ok(())
}

/// Get sandbox configuration
pub fn get_config() -> &'static SandboxConfig {
    SANDBOX_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<SandboxConfig> = OnceLock::new();

        debug!("Sandbox configuration not initialized, using default");
        DEFAULT.get_or_init(SandboxConfig::default)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_buffer_policy() {
        assert_eq!("unbounded".parse(), Ok(BufferPolicy::Unbounded));
        assert_eq!(
            "drop:1024".parse(),
            Ok(BufferPolicy::DropNewest { capacity: 1024 })
        );
        assert_eq!(
            "suspend: 64".parse(),
            Ok(BufferPolicy::Suspend { capacity: 64 })
        );
        assert!("suspend".parse::<BufferPolicy>().is_err());
        assert!("drop:lots".parse::<BufferPolicy>().is_err());
        assert!("spill:10".parse::<BufferPolicy>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = SandboxConfig::from_lookup(lookup(&[
            ("SANDBOX_DEBUG_ON_CRASH", "1"),
            ("SANDBOX_OUTPUT_BUFFER", "suspend:4096"),
            ("SANDBOX_WORKDIR", "/contract/"),
            ("SANDBOX_MEMORY_MB", "512"),
            ("SANDBOX_OPEN_FILES", "not-a-number"),
        ]));

        assert!(config.debug_on_crash);
        assert_eq!(config.output_buffer, BufferPolicy::Suspend { capacity: 4096 });
        assert_eq!(config.working_dir, Some(PathBuf::from("/contract/")));
        assert_eq!(config.limits.memory_mb, Some(512));
        // Malformed values keep the default
        assert_eq!(config.limits.open_files, Some(256));
        assert_eq!(config.high_water_mark, 16 * 1024);
    }

    #[test]
    fn test_load_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
debug_on_crash = true
high_water_mark = 8192

[output_buffer]
mode = "drop_newest"
capacity = 65536

[limits]
wall_time_ms = 5000
processes = 16
"#
        )
        .unwrap();

        let config = SandboxConfig::load(file.path()).unwrap();
        assert!(config.debug_on_crash);
        assert_eq!(config.high_water_mark, 8192);
        assert_eq!(
            config.output_buffer,
            BufferPolicy::DropNewest { capacity: 65536 }
        );
        assert_eq!(config.limits.wall_time_ms, Some(5000));
        assert_eq!(config.limits.processes, Some(16));
        assert_eq!(config.limits.fsize_kb, Some(262144));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_load_missing_file() {
        let err = SandboxConfig::load("/nonexistent/sandbox.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read sandbox configuration"));
    }
}
