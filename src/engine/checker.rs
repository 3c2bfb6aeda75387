//! Checker module
//!
//! Runs the problem's testlib.h-based checker inside the box and turns its
//! output into a verdict. Arguments to checker: <input> <output> <answer>.
//!
//! The binary and all three files come from the read-only `/judge` bind, so
//! nothing the submission left in the box is consulted.

use tracing::{debug, warn};

use crate::domain::Verdict;
use crate::engine::compiler::CHECKER_BINARY;
use crate::engine::sandbox::{
    parse_meta, ExecStatus, Limits, ResourceUsage, RunSpec, SandboxContext, SandboxError,
};

const CHECKER_META: &str = "checker.meta";

/// testlib `_fail`: the checker itself detected a bug or bad test data
const TESTLIB_FAIL: i32 = 3;

/// Result of one checker invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerResult {
    pub verdict: Verdict,
    /// Everything the checker printed, trimmed
    pub message: String,
}

/// Decide the case verdict from the checker's output and its own
/// execution record.
///
/// A checker that crashed, timed out, could not be run, or reported
/// `_fail` is an internal error. Otherwise the output must start with `ok`
/// for the answer to be accepted.
pub fn classify(message: &str, usage: Option<&ResourceUsage>) -> Verdict {
    let Some(usage) = usage else {
        warn!("Checker left no execution record");
        return Verdict::InternalError;
    };

    let faulted = match usage.status() {
        ExecStatus::Ok => false,
        ExecStatus::RuntimeError => usage.exit_code() == Some(TESTLIB_FAIL),
        ExecStatus::Signaled(_)
        | ExecStatus::TimedOut
        | ExecStatus::InternalError
        | ExecStatus::Unknown(_) => true,
    };
    if faulted {
        warn!("Checker faulted: {}", usage.raw.replace('\n', ", "));
        return Verdict::InternalError;
    }

    if message.starts_with("ok") {
        Verdict::Accepted
    } else {
        Verdict::WrongAnswer
    }
}

/// Run the installed checker. `input`, `output` and `answer` name files in
/// the trusted directory.
pub async fn run_checker(
    ctx: &SandboxContext<'_>,
    input: &str,
    output: &str,
    answer: &str,
    limits: &Limits,
) -> Result<CheckerResult, SandboxError> {
    ctx.clear_record(CHECKER_META).await?;

    let command = [CHECKER_BINARY, input, output, answer].map(|name| ctx.mounted(name));
    let spec = ctx
        .with_trusted_mount(RunSpec::new(command, limits.clone()))
        .with_meta(ctx.record_path(CHECKER_META))
        .with_stderr_to_stdout();
    let result = ctx.run(&spec).await?;
    let message = result.stdout.trim().to_string();

    let usage = ctx
        .take_record(CHECKER_META)
        .await?
        .map(|raw| parse_meta(&String::from_utf8_lossy(&raw)));

    debug!(
        "Checker result: message={}, meta={:?}",
        message.chars().take(200).collect::<String>(),
        usage.as_ref().map(|u| u.raw.as_str())
    );

    Ok(CheckerResult {
        verdict: classify(&message, usage.as_ref()),
        message,
    })
}
