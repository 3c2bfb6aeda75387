//! Jobs handed out by the queue API

use serde::{Deserialize, Deserializer, Serialize};

/// One claimed grading request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub submission: Submission,
}

impl Job {
    pub fn problem_id(&self) -> &str {
        &self.submission.problem.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Language tag as sent by the server; validated by the build stage
    pub language: String,
    /// Program text
    pub body: String,
    pub problem: Problem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Namespace for the problem's files on the server
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

/// Raw `judger/get` response. An empty object, `null`, or a missing/zero id
/// all mean that nothing is pending.
#[derive(Debug, Default, Deserialize)]
pub struct ClaimResponse {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub submission: Option<Submission>,
}

impl ClaimResponse {
    /// `Ok(None)` when no job is pending, `Err` when an id came without a
    /// submission.
    pub fn into_job(self) -> Result<Option<Job>, String> {
        match (self.id, self.submission) {
            (None, _) | (Some(0), _) => Ok(None),
            (Some(id), Some(submission)) => Ok(Some(Job { id, submission })),
            (Some(id), None) => Err(format!("job {} has no submission", id)),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
