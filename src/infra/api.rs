//! Queue API client
//!
//! Every call is a JSON `POST` to `<server_root>/judger/<action>`. The body is
//! the worker's identity table with the call's own fields merged on top.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::domain::{JudgeReport, Verdict};
use crate::jobs::{ClaimResponse, Job};

mod endpoints {
    pub const PING: &str = "judger/ping";
    pub const CLAIM: &str = "judger/get";
    pub const FILE: &str = "judger/file";
    pub const PUBLISH: &str = "judger/set";
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned status {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode {endpoint} response: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },
}

/// The remote side of the judge: liveness, job claims, problem files and
/// result publication.
#[async_trait]
pub trait QueueApi: Send + Sync {
    async fn ping(&self) -> Result<(), ApiError>;

    /// Claim the next pending job, `None` if the queue is empty
    async fn claim_job(&self) -> Result<Option<Job>, ApiError>;

    /// Raw bytes of a stored file (`<problem>/<name>` or `resource/<name>`)
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, ApiError>;

    /// Upsert the judging state of a job. `verdict` is omitted while the
    /// submission has not been judged at all.
    async fn publish_result(
        &self,
        job_id: i64,
        verdict: Option<Verdict>,
        report: &JudgeReport,
    ) -> Result<(), ApiError>;
}

/// `QueueApi` over HTTP
#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    client: Client,
    base_url: String,
    identity: Map<String, Value>,
}

impl HttpQueueClient {
    pub fn new(
        server_root: &str,
        identity: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_root(server_root),
            identity,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn post(&self, endpoint: &'static str, fields: Value) -> Result<Vec<u8>, ApiError> {
        debug!("POST {}", endpoint);

        let response = self
            .client
            .post(self.url(endpoint))
            .json(&merge_body(&self.identity, fields))
            .send()
            .await
            .map_err(|source| ApiError::Request { endpoint, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| ApiError::Request { endpoint, source })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl QueueApi for HttpQueueClient {
    async fn ping(&self) -> Result<(), ApiError> {
        self.post(endpoints::PING, json!({})).await.map(|_| ())
    }

    async fn claim_job(&self) -> Result<Option<Job>, ApiError> {
        let body = self.post(endpoints::CLAIM, json!({})).await?;
        decode_claim(&body)
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        self.post(endpoints::FILE, json!({ "file": path })).await
    }

    async fn publish_result(
        &self,
        job_id: i64,
        verdict: Option<Verdict>,
        report: &JudgeReport,
    ) -> Result<(), ApiError> {
        let fields = publish_fields(job_id, verdict, report).map_err(|e| ApiError::Decode {
            endpoint: endpoints::PUBLISH,
            message: e.to_string(),
        })?;
        self.post(endpoints::PUBLISH, fields).await.map(|_| ())
    }
}

/// Base URL that relative endpoints can be appended to
fn normalize_root(server_root: &str) -> String {
    if server_root.ends_with('/') {
        server_root.to_string()
    } else {
        format!("{}/", server_root)
    }
}

/// Identity fields first, call fields override them
fn merge_body(identity: &Map<String, Value>, fields: Value) -> Value {
    let mut body = identity.clone();
    if let Value::Object(fields) = fields {
        body.extend(fields);
    }
    Value::Object(body)
}

fn publish_fields(
    job_id: i64,
    verdict: Option<Verdict>,
    report: &JudgeReport,
) -> serde_json::Result<Value> {
    let mut fields = json!({
        "id": job_id,
        "judgeOutput": report.to_json()?,
    });
    if let Some(verdict) = verdict {
        fields["verdict"] = json!(verdict);
    }
    Ok(fields)
}

fn decode_claim(body: &[u8]) -> Result<Option<Job>, ApiError> {
    let decode_error = |message: String| ApiError::Decode {
        endpoint: endpoints::CLAIM,
        message,
    };

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let claim: Option<ClaimResponse> =
        serde_json::from_slice(body).map_err(|e| decode_error(e.to_string()))?;
    match claim {
        Some(claim) => claim.into_job().map_err(decode_error),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording in-memory queue.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// One `publish_result` call, with the report decoded back to JSON
    #[derive(Debug, Clone)]
    pub struct Published {
        pub job_id: i64,
        pub verdict: Option<Verdict>,
        pub report: Value,
    }

    impl Published {
        pub fn test_count(&self) -> usize {
            self.report["tests"].as_object().map_or(0, |tests| tests.len())
        }

        pub fn case_verdict(&self, input: &str) -> &str {
            self.report["tests"][input]["verdict"].as_str().unwrap_or("")
        }
    }

    #[derive(Default)]
    pub struct FakeQueue {
        pub files: HashMap<String, Vec<u8>>,
        pub jobs: Mutex<VecDeque<Job>>,
        pub published: Mutex<Vec<Published>>,
        pub pings: AtomicUsize,
        pub offline: bool,
    }

    impl FakeQueue {
        pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
            self.files.insert(path.to_string(), data.into());
            self
        }

        pub fn push_job(&self, job: Job) {
            self.jobs.lock().unwrap().push_back(job);
        }

        pub fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }

        pub fn pings(&self) -> usize {
            self.pings.load(Ordering::SeqCst)
        }

        fn check_online(&self, endpoint: &'static str) -> Result<(), ApiError> {
            if self.offline {
                return Err(ApiError::Status {
                    endpoint,
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl QueueApi for FakeQueue {
        async fn ping(&self) -> Result<(), ApiError> {
            self.check_online(endpoints::PING)?;
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn claim_job(&self) -> Result<Option<Job>, ApiError> {
            self.check_online(endpoints::CLAIM)?;
            Ok(self.jobs.lock().unwrap().pop_front())
        }

        async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, ApiError> {
            self.check_online(endpoints::FILE)?;
            self.files.get(path).cloned().ok_or_else(|| ApiError::Status {
                endpoint: endpoints::FILE,
                status: 404,
                body: format!("{} not found", path),
            })
        }

        async fn publish_result(
            &self,
            job_id: i64,
            verdict: Option<Verdict>,
            report: &JudgeReport,
        ) -> Result<(), ApiError> {
            self.check_online(endpoints::PUBLISH)?;
            self.published.lock().unwrap().push(Published {
                job_id,
                verdict,
                report: serde_json::to_value(report).unwrap(),
            });
            Ok(())
        }
    }
}
