//! Languages accepted by the judge

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Closed set of language tags the server may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    /// C++, compiled ahead of time with the configured compiler
    Cpp,
    /// Python 3. Recognized, but interpreted execution is not wired up yet
    Python3,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported language: {0:?}")]
pub struct UnsupportedLanguage(pub String);

impl Language {
    pub fn tag(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Python3 => "py3",
        }
    }

    /// File name the submission is written to inside the sandbox
    pub fn source_file(&self) -> &'static str {
        match self {
            Language::Cpp => "program.cpp",
            Language::Python3 => "program.py",
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Cpp)
    }

    /// Command that runs the built program inside the sandbox, `None` when
    /// this worker cannot execute the language yet.
    pub fn run_command(&self) -> Option<Vec<String>> {
        match self {
            Language::Cpp => Some(vec!["program".to_string()]),
            Language::Python3 => None,
        }
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpp" => Ok(Language::Cpp),
            "py3" => Ok(Language::Python3),
            other => Err(UnsupportedLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
