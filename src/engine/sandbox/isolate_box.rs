//! Isolate box management
//!
//! Low-level wrapper around the isolate utility. `SandboxDriver` is the seam
//! the rest of the worker talks to; `IsolateDriver` is the real thing.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use super::config::Limits;

/// Slack on top of a command's wall-time limit before the worker gives up
/// waiting for isolate itself.
const GUARD_SLACK: Duration = Duration::from_secs(15);
/// Upper bound for `--init` / `--cleanup`
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("isolate {action} failed for box {box_id}: {stderr}")]
    Failed {
        action: &'static str,
        box_id: u32,
        stderr: String,
    },

    #[error("isolate --init for box {0} did not print a sandbox path")]
    NoRoot(u32),

    #[error("isolate did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("sandbox file operation on {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One command to run inside the box. Redirection targets are relative to
/// the box directory; the meta path is absolute.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub command: Vec<String>,
    pub limits: Limits,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub stderr_to_stdout: bool,
    pub meta: Option<PathBuf>,
    /// Read-only binds: (path inside the box, host directory)
    pub dirs: Vec<(String, PathBuf)>,
    /// Suppress isolate's own status line
    pub silent: bool,
}

impl RunSpec {
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>, limits: Limits) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            limits,
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, path: impl Into<String>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<String>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, path: impl Into<String>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn with_stderr_to_stdout(mut self) -> Self {
        self.stderr_to_stdout = true;
        self
    }

    pub fn with_meta(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta = Some(path.into());
        self
    }

    pub fn with_dir(mut self, inside: impl Into<String>, outside: impl Into<PathBuf>) -> Self {
        self.dirs.push((inside.into(), outside.into()));
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// What the isolate process itself reported
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit status of isolate (non-zero whenever the sandboxed program failed)
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Operations of the sandbox utility used by the worker
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Tear a box down. Must succeed on a box in any state, including one
    /// that was never initialized.
    async fn cleanup(&self, box_id: u32) -> Result<(), SandboxError>;

    /// Initialize a box and return its root directory
    async fn init(&self, box_id: u32) -> Result<PathBuf, SandboxError>;

    async fn run(&self, box_id: u32, spec: &RunSpec) -> Result<CommandOutput, SandboxError>;
}

/// Driver that shells out to the isolate binary (always with `--cg`)
#[derive(Debug, Clone)]
pub struct IsolateDriver {
    program: String,
}

impl IsolateDriver {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn invoke(&self, args: &[String], guard: Duration) -> Result<CommandOutput, SandboxError> {
        debug!("Running {} with args: {:?}", self.program, args);

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(guard, child)
            .await
            .map_err(|_| SandboxError::TimedOut(guard))?
            .map_err(|source| SandboxError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl SandboxDriver for IsolateDriver {
    async fn cleanup(&self, box_id: u32) -> Result<(), SandboxError> {
        let output = self
            .invoke(&admin_args(box_id, "--cleanup"), ADMIN_TIMEOUT)
            .await?;
        // a box that was never initialized cleans up with status 0
        if !output.success {
            return Err(SandboxError::Failed {
                action: "--cleanup",
                box_id,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn init(&self, box_id: u32) -> Result<PathBuf, SandboxError> {
        let output = self
            .invoke(&admin_args(box_id, "--init"), ADMIN_TIMEOUT)
            .await?;
        if !output.success {
            return Err(SandboxError::Failed {
                action: "--init",
                box_id,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let path = output.stdout.trim();
        if path.is_empty() {
            return Err(SandboxError::NoRoot(box_id));
        }
        Ok(PathBuf::from(path))
    }

    async fn run(&self, box_id: u32, spec: &RunSpec) -> Result<CommandOutput, SandboxError> {
        self.invoke(&run_args(box_id, spec), guard_for(&spec.limits)).await
    }
}

/// How long to wait on `isolate --run` before killing it. Saturates instead
/// of panicking on limits that never went through validation.
fn guard_for(limits: &Limits) -> Duration {
    Duration::try_from_secs_f64(limits.effective_wall_time())
        .unwrap_or(Duration::MAX)
        .saturating_add(GUARD_SLACK)
}

fn admin_args(box_id: u32, action: &str) -> Vec<String> {
    vec![
        format!("--box-id={}", box_id),
        "--cg".to_string(),
        action.to_string(),
    ]
}

/// Argument vector for `isolate --run`
pub fn run_args(box_id: u32, spec: &RunSpec) -> Vec<String> {
    let limits = &spec.limits;
    let mut args = vec![format!("--box-id={}", box_id), "--cg".to_string()];

    if spec.silent {
        args.push("--silent".to_string());
    }
    if let Some(meta) = &spec.meta {
        args.push(format!("--meta={}", meta.display()));
    }

    args.extend([
        format!("--mem={}", limits.memory_kb),
        format!("--time={}", limits.time_secs),
        format!("--wall-time={}", limits.effective_wall_time()),
    ]);

    if limits.full_env {
        args.push("--full-env".to_string());
    }
    if let Some(processes) = limits.processes {
        args.push(format!("--processes={}", processes));
    }
    for (inside, outside) in &spec.dirs {
        args.push(format!("--dir={}={}", inside, outside.display()));
    }
    if let Some(stdin) = &spec.stdin {
        args.push(format!("--stdin={}", stdin));
    }
    if let Some(stdout) = &spec.stdout {
        args.push(format!("--stdout={}", stdout));
    }
    if let Some(stderr) = &spec.stderr {
        args.push(format!("--stderr={}", stderr));
    }
    if spec.stderr_to_stdout {
        args.push("--stderr-to-stdout".to_string());
    }

    args.push("--run".to_string());
    args.push("--".to_string());
    args.extend(spec.command.iter().cloned());
    args
}
