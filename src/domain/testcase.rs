//! Test case manifest
//!
//! A problem's manifest (`<problem>/testcases.txt`) lists one test case per
//! line as `<input-file> <answer-file>`. The order of the lines is the order
//! in which the test cases are executed.

use std::collections::HashSet;

use thiserror::Error;

use super::utils::is_plain_file_name;

/// One test case: the input fed to the program and the expected answer
/// handed to the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    pub answer: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("line {line}: expected `<input> <answer>`, got {found:?}")]
    MalformedLine { line: usize, found: String },

    #[error("line {line}: {name:?} is not a plain file name")]
    UnsafeName { line: usize, name: String },

    #[error("line {line}: input {name:?} is listed more than once")]
    DuplicateInput { line: usize, name: String },
}

/// Parse a manifest into test cases, preserving line order.
///
/// Blank lines are skipped. Input names key the result set, so they must be
/// unique within one manifest.
pub fn parse_manifest(content: &str) -> Result<Vec<TestCase>, ManifestError> {
    let mut cases = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }

        let names: Vec<&str> = trimmed.split_whitespace().collect();
        let [input, answer] = names.as_slice() else {
            return Err(ManifestError::MalformedLine {
                line,
                found: trimmed.to_string(),
            });
        };

        for name in [input, answer] {
            if !is_plain_file_name(name) {
                return Err(ManifestError::UnsafeName {
                    line,
                    name: name.to_string(),
                });
            }
        }

        if !seen.insert(input.to_string()) {
            return Err(ManifestError::DuplicateInput {
                line,
                name: input.to_string(),
            });
        }

        cases.push(TestCase {
            input: input.to_string(),
            answer: answer.to_string(),
        });
    }

    Ok(cases)
}
