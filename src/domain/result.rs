//! Per-test-case results and submission-level verdict folding.

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use super::testcase::TestCase;
use super::verdict::Verdict;

/// Outcome of one test case as published to the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub verdict: Verdict,
    /// Trimmed execution-metadata record of the program run
    pub meta: String,
    /// Checker output (or the reason no checker verdict exists)
    pub message: String,
    /// First 1024 bytes of what the program wrote to stdout
    pub output: String,
    /// CPU seconds, `null` when the record did not carry it
    pub time: Option<f64>,
    /// Peak resident memory in KB, `null` when unknown
    pub memory: Option<f64>,
}

impl TestResult {
    pub fn pending() -> Self {
        Self {
            verdict: Verdict::Waiting,
            meta: String::new(),
            message: String::new(),
            output: String::new(),
            time: None,
            memory: None,
        }
    }
}

/// The judging state of one job: every declared test case keyed by its
/// input file name, in manifest order, plus an optional job-level message.
///
/// Owned by a single pipeline run; publishing serializes a snapshot of it.
#[derive(Debug, Clone, Default)]
pub struct JudgeReport {
    tests: Vec<(String, TestResult)>,
    message: Option<String>,
}

impl JudgeReport {
    /// Seed one pending entry per test case.
    pub fn seeded(cases: &[TestCase]) -> Self {
        Self {
            tests: cases
                .iter()
                .map(|tc| (tc.input.clone(), TestResult::pending()))
                .collect(),
            message: None,
        }
    }

    /// Overwrite the entry for `input`. Unknown names are ignored so the
    /// entry count never drifts from the manifest.
    pub fn record(&mut self, input: &str, result: TestResult) -> bool {
        match self.tests.iter_mut().find(|(name, _)| name == input) {
            Some((_, slot)) => {
                *slot = result;
                true
            }
            None => false,
        }
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TestResult)> {
        self.tests.iter().map(|(name, result)| (name.as_str(), result))
    }

    /// JSON text sent as `judgeOutput`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

struct OrderedTests<'a>(&'a [(String, TestResult)]);

impl Serialize for OrderedTests<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, result) in self.0 {
            map.serialize_entry(name, result)?;
        }
        map.end()
    }
}

impl Serialize for JudgeReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.message.is_some() { 2 } else { 1 };
        let mut state = serializer.serialize_struct("JudgeReport", fields)?;
        state.serialize_field("tests", &OrderedTests(&self.tests))?;
        if let Some(message) = &self.message {
            state.serialize_field("message", message)?;
        }
        state.end()
    }
}

/// Folds per-case verdicts into the submission verdict: the first case that
/// is not accepted decides, and later cases can no longer change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictAggregator {
    current: Verdict,
}

impl Default for VerdictAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl VerdictAggregator {
    pub fn new() -> Self {
        Self {
            current: Verdict::Waiting,
        }
    }

    pub fn record(&mut self, case: Verdict) {
        if !case.is_accepted() && self.current == Verdict::Waiting {
            self.current = case;
        }
    }

    /// Verdict to publish alongside an incremental update.
    pub fn current(&self) -> Verdict {
        self.current
    }

    /// Final verdict once every case has been recorded.
    pub fn finish(self) -> Verdict {
        match self.current {
            Verdict::Waiting => Verdict::Accepted,
            other => other,
        }
    }
}
