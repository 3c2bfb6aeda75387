//! Domain types shared by the pipeline: verdicts, test cases and results.

pub mod result;
pub mod testcase;
pub mod utils;
pub mod verdict;

pub use result::{JudgeReport, TestResult, VerdictAggregator};
pub use testcase::{parse_manifest, TestCase};
pub use verdict::Verdict;
