use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict codes understood by the queue API.
///
/// The same set is used for single test cases and for the whole submission.
/// `WJ` is the placeholder for work that has not finished yet and is never a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "WJ")]
    Waiting,
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "CE")]
    CompileError,
    #[serde(rename = "IE")]
    InternalError,
}

impl Verdict {
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Waiting => "WJ",
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::RuntimeError => "RE",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::CompileError => "CE",
            Verdict::InternalError => "IE",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accepted.to_string(), "AC");
        assert_eq!(Verdict::MemoryLimitExceeded.to_string(), "MLE");
        assert_eq!(Verdict::Waiting.to_string(), "WJ");
    }

    #[test]
    fn test_verdict_serializes_as_code() {
        let json = serde_json::to_string(&Verdict::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"TLE\"");

        let parsed: Verdict = serde_json::from_str("\"IE\"").unwrap();
        assert_eq!(parsed, Verdict::InternalError);
    }
}
