//! Build stage - compiling the checker and the submission inside the box
//!
//! Success is decided by whether the expected binary exists afterwards, not
//! by the compiler's exit status. The checker is moved into the trusted
//! directory before any submission file reaches the box.

use tracing::{debug, info, warn};

use crate::domain::Verdict;
use crate::engine::sandbox::{Limits, RunSpec, SandboxContext, SandboxError};
use crate::jobs::Submission;
use crate::languages::Language;

pub const CHECKER_SOURCE: &str = "checker.cpp";
pub const CHECKER_HEADER: &str = "testlib.h";
pub const CHECKER_BINARY: &str = "checker";
pub const PROGRAM_BINARY: &str = "program";
const COMPILE_LOG: &str = "compile.out";

/// How C++ sources are compiled
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub compiler: String,
    pub flags: Vec<String>,
    pub limits: Limits,
}

impl Toolchain {
    fn command(&self, output: &str, source: &str) -> Vec<String> {
        let mut cmd = vec![self.compiler.clone()];
        cmd.extend(self.flags.iter().cloned());
        cmd.extend(["-o".to_string(), output.to_string(), source.to_string()]);
        cmd
    }
}

/// Checker sources fetched from the server's `resource/` area
#[derive(Debug, Clone)]
pub struct CheckerSources {
    pub checker: Vec<u8>,
    pub header: Vec<u8>,
}

/// What the test stage needs from a successful build
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub language: Language,
    /// Command running the submission, `None` if this worker cannot run it
    pub run_command: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Ready(Artifacts),
    /// The job ends here with this verdict and message
    Rejected { verdict: Verdict, message: String },
}

impl BuildOutcome {
    fn rejected(verdict: Verdict, message: impl Into<String>) -> Self {
        BuildOutcome::Rejected {
            verdict,
            message: message.into(),
        }
    }
}

/// Build the checker and, for compiled languages, the submission.
///
/// An unknown language or a checker that does not build is an internal
/// error; a submission that does not build is a compile error carrying the
/// compiler's stderr. Only file staging failures are returned as `Err`.
pub async fn build(
    ctx: &SandboxContext<'_>,
    toolchain: &Toolchain,
    submission: &Submission,
    checker: &CheckerSources,
) -> Result<BuildOutcome, SandboxError> {
    let language = match submission.language.parse::<Language>() {
        Ok(language) => language,
        Err(e) => {
            warn!("{}", e);
            return Ok(BuildOutcome::rejected(
                Verdict::InternalError,
                "The language is not supported.",
            ));
        }
    };

    info!("Compiling checker");
    ctx.write(CHECKER_SOURCE, &checker.checker).await?;
    ctx.write(CHECKER_HEADER, &checker.header).await?;

    let spec = RunSpec::new(
        toolchain.command(CHECKER_BINARY, CHECKER_SOURCE),
        toolchain.limits.clone(),
    );
    if let Err(e) = ctx.run(&spec).await {
        warn!("Checker compiler invocation failed: {}", e);
    }
    if !ctx.install_trusted(CHECKER_BINARY).await? {
        return Ok(BuildOutcome::rejected(
            Verdict::InternalError,
            "Error when compiling the checker.",
        ));
    }
    info!("Checker compiled and installed");

    ctx.write(language.source_file(), &submission.body).await?;

    if language.is_compiled() {
        info!("Compiling {} program", language);
        let spec = RunSpec::new(
            toolchain.command(PROGRAM_BINARY, language.source_file()),
            toolchain.limits.clone(),
        )
        .with_stderr(COMPILE_LOG)
        .silent();

        let invocation = ctx.run(&spec).await;
        if let Err(e) = &invocation {
            warn!("Compiler invocation failed: {}", e);
        }

        if invocation.is_err() || !ctx.exists(PROGRAM_BINARY).await {
            let diagnostics = match ctx.read_optional(COMPILE_LOG).await? {
                Some(log) => String::from_utf8_lossy(&log).into_owned(),
                None => invocation.err().map(|e| e.to_string()).unwrap_or_default(),
            };
            info!("Compile error for {} program", language);
            debug!("Compiler output:\n{}", diagnostics);
            return Ok(BuildOutcome::rejected(Verdict::CompileError, diagnostics));
        }
        info!("Compiled {} program", language);
    }

    Ok(BuildOutcome::Ready(Artifacts {
        language,
        run_command: language.run_command(),
    }))
}
