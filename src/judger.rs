//! Judger module for processing claimed jobs
//!
//! One job runs end to end here: manifest, placeholder report, build, test
//! staging, sequential execution with a publish after every case, and the
//! final report. The sandbox is released on every path out of the job.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use crate::domain::{parse_manifest, JudgeReport, TestCase, Verdict, VerdictAggregator};
use crate::engine::compiler::{build, BuildOutcome, CheckerSources, Toolchain};
use crate::engine::executer::{run_test_case, ExecutionPolicy, TESTS_DIR};
use crate::engine::sandbox::{Sandbox, SandboxContext};
use crate::infra::QueueApi;
use crate::jobs::Job;

const MANIFEST_FILE: &str = "testcases.txt";
const CHECKER_SOURCE_PATH: &str = "resource/checker.cpp";
const CHECKER_HEADER_PATH: &str = "resource/testlib.h";

const INTERPRETED_UNAVAILABLE: &str = "interpreted execution is not available";

/// Everything about judging that does not change between jobs
#[derive(Debug, Clone)]
pub struct JudgeSettings {
    pub toolchain: Toolchain,
    pub policy: ExecutionPolicy,
    /// Upper bound on concurrent test file downloads
    pub prefetch_concurrency: usize,
}

pub struct Judger {
    api: Arc<dyn QueueApi>,
    sandbox: Sandbox,
    settings: JudgeSettings,
}

impl Judger {
    pub fn new(api: Arc<dyn QueueApi>, sandbox: Sandbox, settings: JudgeSettings) -> Self {
        Self {
            api,
            sandbox,
            settings,
        }
    }

    /// Judge one job and return its final verdict.
    ///
    /// Classified outcomes (CE, IE, per-case verdicts) are published and
    /// returned as `Ok`. `Err` means the job was abandoned part way and the
    /// queue may not have seen a terminal verdict.
    pub async fn judge(&self, job: &Job) -> Result<Verdict> {
        let problem = job.problem_id();
        info!(
            "Judging job {}: problem={}, language={}",
            job.id, problem, job.submission.language
        );

        let manifest = self
            .fetch(&format!("{}/{}", problem, MANIFEST_FILE))
            .await?;
        let cases = match parse_manifest(&String::from_utf8_lossy(&manifest)) {
            Ok(cases) => cases,
            Err(e) => {
                warn!("Rejecting manifest of problem {}: {}", problem, e);
                let mut report = JudgeReport::default();
                report.set_message(e.to_string());
                return self.conclude(job, Verdict::InternalError, &report).await;
            }
        };
        info!("Problem {} has {} test cases", problem, cases.len());

        let mut report = JudgeReport::seeded(&cases);
        self.publish(job, None, &report).await?;

        let ctx = self
            .sandbox
            .acquire()
            .await
            .with_context(|| format!("Failed to acquire sandbox {}", self.sandbox.box_id()))?;
        let outcome = self.judge_in(&ctx, job, &cases, &mut report).await;
        ctx.release().await;
        outcome
    }

    async fn judge_in(
        &self,
        ctx: &SandboxContext<'_>,
        job: &Job,
        cases: &[TestCase],
        report: &mut JudgeReport,
    ) -> Result<Verdict> {
        let checker = self.fetch_checker().await?;
        let outcome = build(ctx, &self.settings.toolchain, &job.submission, &checker)
            .await
            .context("Build stage failed")?;

        let artifacts = match outcome {
            BuildOutcome::Ready(artifacts) => artifacts,
            BuildOutcome::Rejected { verdict, message } => {
                report.set_message(message);
                return self.conclude(job, verdict, report).await;
            }
        };
        let Some(run_command) = artifacts.run_command else {
            warn!("No runner for {} submissions", artifacts.language);
            report.set_message(INTERPRETED_UNAVAILABLE);
            return self.conclude(job, Verdict::InternalError, report).await;
        };

        self.stage_tests(ctx, job.problem_id(), cases).await?;

        let mut aggregator = VerdictAggregator::new();
        for case in cases {
            let result = run_test_case(ctx, case, &run_command, &self.settings.policy)
                .await
                .with_context(|| format!("Failed to run test case {}", case.input))?;

            aggregator.record(result.verdict);
            report.record(&case.input, result);
            self.publish(job, Some(aggregator.current()), report).await?;
        }

        self.conclude(job, aggregator.finish(), report).await
    }

    /// Download every input and answer into the trusted directory, at most
    /// `prefetch_concurrency` at a time.
    async fn stage_tests(
        &self,
        ctx: &SandboxContext<'_>,
        problem: &str,
        cases: &[TestCase],
    ) -> Result<()> {
        ctx.create_trusted_dir(TESTS_DIR).await?;

        // several cases may share one answer file
        let mut seen = HashSet::new();
        let names: Vec<&str> = cases
            .iter()
            .flat_map(|case| [case.input.as_str(), case.answer.as_str()])
            .filter(|name| seen.insert(*name))
            .collect();

        let staged = names.len();
        stream::iter(names)
            .map(|name| async move {
                let data = self.fetch(&format!("{}/{}", problem, name)).await?;
                ctx.write_trusted(&format!("{}/{}", TESTS_DIR, name), data)
                    .await
                    .with_context(|| format!("Failed to stage {}", name))
            })
            .buffer_unordered(self.settings.prefetch_concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        info!("Staged {} test files for problem {}", staged, problem);
        Ok(())
    }

    async fn fetch_checker(&self) -> Result<CheckerSources> {
        let (checker, header) = tokio::try_join!(
            self.fetch(CHECKER_SOURCE_PATH),
            self.fetch(CHECKER_HEADER_PATH)
        )?;
        Ok(CheckerSources { checker, header })
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        self.api
            .fetch_file(path)
            .await
            .with_context(|| format!("Failed to fetch {}", path))
    }

    async fn publish(&self, job: &Job, verdict: Option<Verdict>, report: &JudgeReport) -> Result<()> {
        self.api
            .publish_result(job.id, verdict, report)
            .await
            .with_context(|| format!("Failed to publish result of job {}", job.id))
    }

    /// Publish the terminal state of the job.
    async fn conclude(&self, job: &Job, verdict: Verdict, report: &JudgeReport) -> Result<Verdict> {
        self.publish(job, Some(verdict), report).await?;
        let passed = report
            .iter()
            .filter(|(_, result)| result.verdict.is_accepted())
            .count();
        info!(
            "Job {} finished: {} ({}/{} test cases accepted)",
            job.id,
            verdict,
            passed,
            report.len()
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::engine::executer::SignalVerdict;
    use crate::engine::sandbox::testing::{host_path, FakeDriver};
    use crate::engine::sandbox::{CommandOutput, Limits, RunSpec};
    use crate::infra::api::testing::FakeQueue;
    use crate::jobs::{Problem, Submission};

    const COMPILER: &str = "/usr/bin/g++";
    const FORGED_CHECKER: &str = "#!/bin/sh\necho ok\n";

    fn settings() -> JudgeSettings {
        JudgeSettings {
            toolchain: Toolchain {
                compiler: COMPILER.into(),
                flags: vec!["-O2".into()],
                limits: Limits::compile(),
            },
            policy: ExecutionPolicy {
                run_limits: Limits::run(),
                checker_limits: Limits::checker(),
                signal_verdict: SignalVerdict::MemoryLimit,
            },
            prefetch_concurrency: 4,
        }
    }

    fn job(language: &str, body: &str) -> Job {
        Job {
            id: 17,
            submission: Submission {
                language: language.into(),
                body: body.into(),
                problem: Problem { id: "5".into() },
            },
        }
    }

    fn write_meta(spec: &RunSpec, content: &str) {
        if let Some(meta) = &spec.meta {
            std::fs::write(meta, content).unwrap();
        }
    }

    /// A whole box: g++ that fails on `syntax error` or a `broken` checker,
    /// an echoing program that hangs on `loop` or replaces the box's
    /// `checker` on `plant`, and an exact-match checker. The checker is
    /// executed by reading the binary its command names.
    fn judge_box(dir: &Path, spec: &RunSpec) -> CommandOutput {
        match spec.command[0].as_str() {
            COMPILER => {
                let pos = spec.command.iter().position(|a| a == "-o").unwrap();
                let source = std::fs::read_to_string(dir.join(&spec.command[pos + 2])).unwrap();
                if source.contains("syntax error") || source.contains("broken") {
                    if let Some(stderr) = &spec.stderr {
                        std::fs::write(dir.join(stderr), "error: expected ';'").unwrap();
                    }
                    return CommandOutput::default();
                }
                std::fs::write(dir.join(&spec.command[pos + 1]), b"\x7fELF").unwrap();
                CommandOutput {
                    success: true,
                    ..Default::default()
                }
            }
            "program" => {
                let input = std::fs::read_to_string(dir.join(spec.stdin.as_ref().unwrap())).unwrap();
                match input.trim() {
                    "loop" => write_meta(spec, "time:1.010\nmax-rss:900\nstatus:TO\n"),
                    "plant" => {
                        std::fs::write(dir.join("checker"), FORGED_CHECKER).unwrap();
                        write_meta(spec, "time:0.010\nmax-rss:1536\nexitcode:0\n");
                    }
                    _ => {
                        std::fs::write(dir.join(spec.stdout.as_ref().unwrap()), &input).unwrap();
                        write_meta(spec, "time:0.010\nmax-rss:1536\nexitcode:0\n");
                    }
                }
                CommandOutput::default()
            }
            binary => {
                let read = |path: &str| {
                    std::fs::read_to_string(host_path(dir, spec, path)).unwrap_or_default()
                };
                let output = read(&spec.command[2]);
                let answer = read(&spec.command[3]);
                let forged = read(binary) == FORGED_CHECKER;
                if forged || output.trim() == answer.trim() {
                    write_meta(spec, "exitcode:0\n");
                    CommandOutput {
                        success: true,
                        stdout: "ok 1 number".into(),
                        ..Default::default()
                    }
                } else {
                    write_meta(spec, "status:RE\nexitcode:1\n");
                    CommandOutput {
                        stdout: "wrong answer 5th line differ".into(),
                        ..Default::default()
                    }
                }
            }
        }
    }

    fn queue(manifest: &str) -> FakeQueue {
        FakeQueue::default()
            .with_file("5/testcases.txt", manifest)
            .with_file("resource/checker.cpp", "#include \"testlib.h\"")
            .with_file("resource/testlib.h", "// testlib")
    }

    fn two_case_queue(second_input: &str) -> FakeQueue {
        queue("1.in 1.ans\n2.in 2.ans\n")
            .with_file("5/1.in", "42\n")
            .with_file("5/1.ans", "42\n")
            .with_file("5/2.in", second_input)
            .with_file("5/2.ans", "7\n")
    }

    async fn judge(queue: FakeQueue, job: &Job) -> (Arc<FakeQueue>, Arc<FakeDriver>, Result<Verdict>) {
        let queue = Arc::new(queue);
        let driver = Arc::new(FakeDriver::new(judge_box));
        let judger = Judger::new(
            queue.clone(),
            Sandbox::new(driver.clone(), 0, driver.state_root()),
            settings(),
        );
        let verdict = judger.judge(job).await;
        (queue, driver, verdict)
    }

    #[tokio::test]
    async fn test_all_cases_accepted() {
        let (queue, driver, verdict) = judge(two_case_queue("7\n"), &job("cpp", "int main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::Accepted);

        let published = queue.published();
        // placeholder, one per case, final
        assert_eq!(published.len(), 4);
        assert_eq!(published[3].verdict, Some(Verdict::Accepted));
        assert_eq!(published[3].case_verdict("2.in"), "AC");
        assert!(published.iter().all(|p| p.job_id == 17));

        // released after the job
        assert_eq!(driver.calls().last().map(String::as_str), Some("cleanup"));
        assert!(!driver.box_dir().exists());
    }

    #[tokio::test]
    async fn test_time_limit_on_second_case() {
        let (queue, _, verdict) = judge(two_case_queue("loop\n"), &job("cpp", "int main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::TimeLimitExceeded);

        let published = queue.published();
        assert_eq!(published.len(), 4);
        assert!(published.iter().all(|p| p.test_count() == 2));

        assert_eq!(published[0].verdict, None);
        assert_eq!(published[0].case_verdict("1.in"), "WJ");

        // still pending after the first case
        assert_eq!(published[1].verdict, Some(Verdict::Waiting));
        assert_eq!(published[1].case_verdict("1.in"), "AC");
        assert_eq!(published[1].case_verdict("2.in"), "WJ");

        assert_eq!(published[2].verdict, Some(Verdict::TimeLimitExceeded));
        assert_eq!(published[2].case_verdict("2.in"), "TLE");
        assert_eq!(published[3].verdict, Some(Verdict::TimeLimitExceeded));
    }

    #[tokio::test]
    async fn test_replacing_box_checker_changes_nothing() {
        let (queue, driver, verdict) = judge(two_case_queue("plant\n"), &job("cpp", "int main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::WrongAnswer);

        let last = queue.published().pop().unwrap();
        assert_eq!(last.case_verdict("1.in"), "AC");
        assert_eq!(last.case_verdict("2.in"), "WA");

        // test data never entered the box
        let program_runs: Vec<_> = driver
            .runs()
            .into_iter()
            .filter(|run| run.command[0] == "program")
            .collect();
        assert_eq!(program_runs.len(), 2);
        assert!(program_runs.iter().all(|run| run.dirs.is_empty()));
    }

    #[tokio::test]
    async fn test_first_failure_wins() {
        let queue = queue("1.in 1.ans\n2.in 2.ans\n3.in 3.ans\n")
            .with_file("5/1.in", "1\n")
            .with_file("5/1.ans", "1\n")
            .with_file("5/2.in", "2\n")
            .with_file("5/2.ans", "3\n")
            .with_file("5/3.in", "loop\n")
            .with_file("5/3.ans", "3\n");
        let (queue, _, verdict) = judge(queue, &job("cpp", "int main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::WrongAnswer);

        let last = queue.published().pop().unwrap();
        assert_eq!(last.case_verdict("2.in"), "WA");
        assert_eq!(last.case_verdict("3.in"), "TLE");
        assert_eq!(last.report["tests"]["2.in"]["message"], "wrong answer 5th line differ");
    }

    #[tokio::test]
    async fn test_shared_answer_file_staged_once() {
        let queue = queue("a.in same.ans\nb.in same.ans\n")
            .with_file("5/a.in", "9\n")
            .with_file("5/b.in", "9\n")
            .with_file("5/same.ans", "9\n");
        let (_, _, verdict) = judge(queue, &job("cpp", "int main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::Accepted);
    }

    #[tokio::test]
    async fn test_unknown_language_runs_nothing() {
        let (queue, driver, verdict) = judge(two_case_queue("7\n"), &job("rust", "fn main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::InternalError);
        assert!(driver.runs().is_empty());

        let published = queue.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].report["message"], "The language is not supported.");
        assert_eq!(published[1].case_verdict("1.in"), "WJ");
    }

    #[tokio::test]
    async fn test_compile_error_single_report() {
        let (queue, driver, verdict) =
            judge(two_case_queue("7\n"), &job("cpp", "int main() { syntax error }")).await;
        assert_eq!(verdict.unwrap(), Verdict::CompileError);

        let published = queue.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].verdict, Some(Verdict::CompileError));
        assert_eq!(published[1].report["message"], "error: expected ';'");
        // checker and program compilation only
        assert_eq!(driver.runs().len(), 2);
    }

    #[tokio::test]
    async fn test_checker_compile_failure() {
        let queue = two_case_queue("7\n").with_file("resource/checker.cpp", "broken");
        let (queue, driver, verdict) = judge(queue, &job("cpp", "int main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::InternalError);
        assert_eq!(driver.runs().len(), 1);

        let last = queue.published().pop().unwrap();
        assert_eq!(last.report["message"], "Error when compiling the checker.");
    }

    #[tokio::test]
    async fn test_interpreted_language_reported() {
        let (queue, driver, verdict) = judge(two_case_queue("7\n"), &job("py3", "print(42)")).await;
        assert_eq!(verdict.unwrap(), Verdict::InternalError);
        assert_eq!(driver.runs().len(), 1);

        let last = queue.published().pop().unwrap();
        assert_eq!(last.report["message"], INTERPRETED_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_bad_manifest_is_internal_error() {
        let (queue, driver, verdict) = judge(queue("1.in\n"), &job("cpp", "int main() {}")).await;
        assert_eq!(verdict.unwrap(), Verdict::InternalError);
        assert!(driver.calls().is_empty());

        let published = queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].test_count(), 0);
        assert!(published[0].report["message"].as_str().unwrap().contains("line 1"));
    }

    #[tokio::test]
    async fn test_missing_test_file_aborts_and_releases() {
        let queue = queue("1.in 1.ans\n").with_file("5/1.in", "42\n");
        let (queue, driver, verdict) = judge(queue, &job("cpp", "int main() {}")).await;

        let err = verdict.unwrap_err();
        assert!(format!("{:#}", err).contains("5/1.ans"));
        // placeholder only; no terminal verdict
        assert_eq!(queue.published().len(), 1);
        assert_eq!(driver.calls().last().map(String::as_str), Some("cleanup"));
    }
}
