//! Worker configuration
//!
//! Read from a TOML file, then overridden by `JUDGE_*` environment variables
//! (a `.env` file is loaded into the environment first by `main`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::engine::compiler::Toolchain;
use crate::engine::executer::{ExecutionPolicy, SignalVerdict};
use crate::engine::sandbox::Limits;
use crate::judger::JudgeSettings;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// isolate box ids handed to judge workers
const MAX_BOX_ID: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the queue API
    pub server_root: String,
    pub box_id: u32,
    /// Wait between polls of an empty queue, and after a failed cycle
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub prefetch_concurrency: usize,
    pub isolate_path: String,
    /// Worker-owned directory for records, the checker and test data. Must
    /// not be visible inside the box.
    pub state_dir: PathBuf,
    pub compiler_path: String,
    pub compiler_flags: Vec<String>,
    pub signal_verdict: SignalVerdict,
    pub run_limits: Limits,
    pub compile_limits: Limits,
    pub checker_limits: Limits,
    /// Merged into the body of every API request
    pub identity: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    server_root: String,
    #[serde(default)]
    box_id: u32,
    #[serde(default = "default_poll_interval")]
    poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    request_timeout_secs: u64,
    #[serde(default = "default_prefetch_concurrency")]
    prefetch_concurrency: usize,
    #[serde(default = "default_isolate_path")]
    isolate_path: String,
    #[serde(default = "default_state_dir")]
    state_dir: PathBuf,
    #[serde(default = "default_compiler_path")]
    compiler_path: String,
    #[serde(default = "default_compiler_flags")]
    compiler_flags: Vec<String>,
    #[serde(default)]
    signal_verdict: SignalVerdict,
    #[serde(default)]
    run_limits: LimitsTable,
    #[serde(default)]
    compile_limits: LimitsTable,
    #[serde(default)]
    checker_limits: LimitsTable,
    #[serde(default)]
    identity: Map<String, Value>,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_prefetch_concurrency() -> usize {
    8
}

fn default_isolate_path() -> String {
    "isolate".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp/judge-client")
}

fn default_compiler_path() -> String {
    "/usr/bin/g++".to_string()
}

fn default_compiler_flags() -> Vec<String> {
    vec!["-O2".to_string(), "-std=c++17".to_string()]
}

/// A `[*_limits]` table; unset keys keep the defaults of that kind of run.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitsTable {
    time_secs: Option<f64>,
    wall_time_secs: Option<f64>,
    memory_kb: Option<u64>,
    processes: Option<u32>,
    full_env: Option<bool>,
}

impl LimitsTable {
    fn over(self, base: Limits) -> Limits {
        Limits {
            time_secs: self.time_secs.unwrap_or(base.time_secs),
            wall_time_secs: self.wall_time_secs.or(base.wall_time_secs),
            memory_kb: self.memory_kb.unwrap_or(base.memory_kb),
            processes: self.processes.or(base.processes),
            full_env: self.full_env.unwrap_or(base.full_env),
        }
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        Self {
            server_root: file.server_root,
            box_id: file.box_id,
            poll_interval_secs: file.poll_interval_secs,
            request_timeout_secs: file.request_timeout_secs,
            prefetch_concurrency: file.prefetch_concurrency,
            isolate_path: file.isolate_path,
            state_dir: file.state_dir,
            compiler_path: file.compiler_path,
            compiler_flags: file.compiler_flags,
            signal_verdict: file.signal_verdict,
            run_limits: file.run_limits.over(Limits::run()),
            compile_limits: file.compile_limits.over(Limits::compile()),
            checker_limits: file.checker_limits.over(Limits::checker()),
            identity: file.identity,
        }
    }
}

impl Config {
    /// Load, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<ConfigFile>(text).map(Config::from)
    }

    /// Apply `JUDGE_SERVER_ROOT`, `JUDGE_BOX_ID`, `JUDGE_ISOLATE_PATH` and
    /// `JUDGE_STATE_DIR`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = lookup("JUDGE_SERVER_ROOT") {
            self.server_root = root;
        }
        if let Some(box_id) = lookup("JUDGE_BOX_ID") {
            self.box_id = box_id
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("JUDGE_BOX_ID={:?} is not a box id", box_id)))?;
        }
        if let Some(isolate) = lookup("JUDGE_ISOLATE_PATH") {
            self.isolate_path = isolate;
        }
        if let Some(state_dir) = lookup("JUDGE_STATE_DIR") {
            self.state_dir = PathBuf::from(state_dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(message)) };

        if !(self.server_root.starts_with("http://") || self.server_root.starts_with("https://")) {
            return invalid(format!(
                "server_root must be an http(s) URL, got {:?}",
                self.server_root
            ));
        }
        if self.box_id >= MAX_BOX_ID {
            return invalid(format!("box_id must be below {}, got {}", MAX_BOX_ID, self.box_id));
        }
        if self.poll_interval_secs == 0 {
            return invalid("poll_interval_secs must be positive".to_string());
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be positive".to_string());
        }
        if self.prefetch_concurrency == 0 {
            return invalid("prefetch_concurrency must be positive".to_string());
        }
        if self.isolate_path.is_empty() || self.compiler_path.is_empty() {
            return invalid("isolate_path and compiler_path must not be empty".to_string());
        }
        if !self.state_dir.is_absolute() {
            return invalid(format!("state_dir must be absolute, got {:?}", self.state_dir));
        }

        for (name, limits) in [
            ("run", &self.run_limits),
            ("compile", &self.compile_limits),
            ("checker", &self.checker_limits),
        ] {
            limits
                .validate(name)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn judge_settings(&self) -> JudgeSettings {
        JudgeSettings {
            toolchain: Toolchain {
                compiler: self.compiler_path.clone(),
                flags: self.compiler_flags.clone(),
                limits: self.compile_limits.clone(),
            },
            policy: ExecutionPolicy {
                run_limits: self.run_limits.clone(),
                checker_limits: self.checker_limits.clone(),
                signal_verdict: self.signal_verdict,
            },
            prefetch_concurrency: self.prefetch_concurrency,
        }
    }
}

/// First argument if it names an existing file, `./config.toml` otherwise.
pub fn config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    match args.next().map(PathBuf::from) {
        Some(path) if path.is_file() => path,
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}
