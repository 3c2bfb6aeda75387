//! Test execution - one test case from program run to `TestResult`

use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::domain::utils::utf8_prefix;
use crate::domain::{TestCase, TestResult, Verdict};
use crate::engine::checker::run_checker;
use crate::engine::sandbox::{parse_meta, ExecStatus, Limits, RunSpec, SandboxContext, SandboxError};

/// Trusted directory holding staged inputs and answers
pub const TESTS_DIR: &str = "tests";
const PROGRAM_META: &str = "meta";
const PROGRAM_INPUT: &str = "input";
const PROGRAM_OUTPUT: &str = "out";
/// Trusted snapshot of the program's output, what the checker reads
const CHECKED_OUTPUT: &str = "out";
const OUTPUT_EXCERPT_BYTES: usize = 1024;

/// Verdict for a program killed by a signal.
///
/// isolate does not say why it delivered the signal, so a memory kill and a
/// segfault look the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SignalVerdict {
    #[default]
    #[serde(rename = "MLE")]
    MemoryLimit,
    #[serde(rename = "RE")]
    RuntimeError,
}

impl From<SignalVerdict> for Verdict {
    fn from(value: SignalVerdict) -> Self {
        match value {
            SignalVerdict::MemoryLimit => Verdict::MemoryLimitExceeded,
            SignalVerdict::RuntimeError => Verdict::RuntimeError,
        }
    }
}

/// Settings shared by every test case of a job
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub run_limits: Limits,
    pub checker_limits: Limits,
    pub signal_verdict: SignalVerdict,
}

/// Verdict forced by how the program terminated, `None` if it exited cleanly
/// and the checker gets to decide.
pub fn runtime_verdict(status: &ExecStatus, on_signal: SignalVerdict) -> Option<Verdict> {
    match status {
        ExecStatus::Ok => None,
        ExecStatus::RuntimeError => Some(Verdict::RuntimeError),
        ExecStatus::Signaled(_) => Some(on_signal.into()),
        ExecStatus::TimedOut => Some(Verdict::TimeLimitExceeded),
        ExecStatus::InternalError | ExecStatus::Unknown(_) => Some(Verdict::InternalError),
    }
}

/// Run the program on one staged test case, check its output, and build the
/// case's result.
///
/// The program only ever sees a box copy of the input. Its record goes to
/// the worker's records directory and its output is snapshotted out of the
/// box before the checker runs.
pub async fn run_test_case(
    ctx: &SandboxContext<'_>,
    case: &TestCase,
    run_command: &[String],
    policy: &ExecutionPolicy,
) -> Result<TestResult, SandboxError> {
    let input = format!("{}/{}", TESTS_DIR, case.input);
    let answer = format!("{}/{}", TESTS_DIR, case.answer);

    // a run that dies before isolate writes its record must not pick up
    // the previous case's files
    ctx.clear_record(PROGRAM_META).await?;
    ctx.remove(PROGRAM_OUTPUT).await?;
    ctx.stage_into_box(&input, PROGRAM_INPUT).await?;

    let started = Instant::now();
    let spec = RunSpec::new(run_command.iter().cloned(), policy.run_limits.clone())
        .with_meta(ctx.record_path(PROGRAM_META))
        .with_stdin(PROGRAM_INPUT)
        .with_stdout(PROGRAM_OUTPUT);
    ctx.run(&spec).await?;
    debug!("Program for {} took {:?}", case.input, started.elapsed());

    let raw_meta = ctx.take_record(PROGRAM_META).await?.ok_or_else(|| SandboxError::Io {
        path: ctx.record_path(PROGRAM_META),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no execution record"),
    })?;
    if !ctx.export_from_box(PROGRAM_OUTPUT, CHECKED_OUTPUT).await? {
        debug!("No regular output file for {}", case.input);
    }
    let usage = parse_meta(&String::from_utf8_lossy(&raw_meta));
    debug!(
        "Meta for {} (wall {:?}s):\n{}",
        case.input,
        usage.wall_time(),
        usage.raw
    );

    let status = usage.status();
    match &status {
        ExecStatus::Signaled(Some(signal)) => {
            debug!("Program for {} was killed by signal {}", case.input, signal)
        }
        ExecStatus::Unknown(code) => warn!("Unrecognized isolate status {:?} for {}", code, case.input),
        _ => {}
    }

    let started = Instant::now();
    let (verdict, message) = match runtime_verdict(&status, policy.signal_verdict) {
        Some(verdict) => (verdict, String::new()),
        None => {
            let checked =
                run_checker(ctx, &input, CHECKED_OUTPUT, &answer, &policy.checker_limits).await?;
            debug!("Checker for {} took {:?}", case.input, started.elapsed());
            (checked.verdict, checked.message)
        }
    };

    let output = ctx
        .read_trusted(CHECKED_OUTPUT)
        .await?
        .map(|data| utf8_prefix(&data, OUTPUT_EXCERPT_BYTES))
        .unwrap_or_default();

    info!("Test case {}: {} {}", case.input, verdict, message);

    Ok(TestResult {
        verdict,
        meta: usage.raw.clone(),
        message,
        output,
        time: usage.time,
        memory: usage.max_rss,
    })
}
