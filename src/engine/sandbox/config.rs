//! Sandbox resource limits
//!
//! One `Limits` value per kind of sandbox invocation: compiling, running the
//! submission, and running the checker.

/// Longest CPU or wall time any single command may be given, in seconds
pub const MAX_TIME_SECS: f64 = 3600.0;

/// Resource ceiling for a single sandboxed command
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// CPU time limit in seconds
    pub time_secs: f64,
    /// Wall-clock limit in seconds; derived from `time_secs` when unset
    pub wall_time_secs: Option<f64>,
    /// Address space limit in KB (`--mem`)
    pub memory_kb: u64,
    /// Process limit, `Some(0)` for unlimited, `None` for isolate's default of one
    pub processes: Option<u32>,
    /// Pass the worker's environment through (`--full-env`)
    pub full_env: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self::run()
    }
}

impl Limits {
    /// Ceiling applied uniformly to every test case of a job
    pub fn run() -> Self {
        Self {
            time_secs: 1.0,
            wall_time_secs: None,
            memory_kb: 256_000,
            processes: None,
            full_env: false,
        }
    }

    /// Ceiling for compiling the checker and the submission
    pub fn compile() -> Self {
        Self {
            time_secs: 30.0,
            wall_time_secs: Some(45.0),
            memory_kb: 256_000,
            processes: Some(0),
            full_env: true,
        }
    }

    /// Ceiling for one checker invocation
    pub fn checker() -> Self {
        Self::run()
    }

    /// Wall time passed to isolate: explicit, or 2x CPU time plus one second
    pub fn effective_wall_time(&self) -> f64 {
        self.wall_time_secs
            .unwrap_or(self.time_secs * 2.0 + 1.0)
    }

    pub fn validate(&self, name: &str) -> anyhow::Result<()> {
        // also rejects NaN
        if !(self.time_secs > 0.0 && self.time_secs <= MAX_TIME_SECS) {
            anyhow::bail!(
                "{} time limit must be in (0, {}], got {}",
                name,
                MAX_TIME_SECS,
                self.time_secs
            );
        }
        if let Some(wall) = self.wall_time_secs {
            if !(wall >= self.time_secs) {
                anyhow::bail!("{} wall time must not be below the CPU time", name);
            }
        }
        let wall = self.effective_wall_time();
        if !(wall <= 2.0 * MAX_TIME_SECS + 1.0) {
            anyhow::bail!("{} wall time {} is too large", name, wall);
        }
        if self.memory_kb == 0 {
            anyhow::bail!("{} memory limit must be positive", name);
        }
        Ok(())
    }
}
