//! Tutor matcher trait and implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{CourseId, StudentId, TutorId};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};

/// What the matcher is asked to decide on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub student_id: StudentId,
    pub course_id: CourseId,
    /// Sessions bought, for capacity-aware matching.
    pub session_count: u32,
    /// Free-form criteria taken from the purchase metadata.
    pub criteria: serde_json::Value,
}

/// External tutor-selection policy.
///
/// Callers bound every call with a timeout; implementations only have to
/// return a tutor or an error, never an empty answer.
#[async_trait]
pub trait TutorMatcher: Send + Sync {
    async fn select_tutor(&self, request: &MatchRequest) -> Result<TutorId>;
}

#[derive(Debug, Default)]
struct InMemoryMatcherState {
    tutors: Vec<TutorId>,
    fail: bool,
    delay: Option<Duration>,
}

/// Round-robin matcher over a fixed tutor list, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTutorMatcher {
    state: Arc<RwLock<InMemoryMatcherState>>,
    next: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl InMemoryTutorMatcher {
    /// Creates a matcher over the given tutors.
    pub fn new(tutors: Vec<TutorId>) -> Self {
        Self {
            state: Arc::new(RwLock::new(InMemoryMatcherState {
                tutors,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    /// Creates a matcher with `count` generated tutors.
    pub fn with_tutors(count: usize) -> Self {
        Self::new((0..count).map(|_| TutorId::new()).collect())
    }

    /// Makes every call fail until reset.
    pub async fn set_fail(&self, fail: bool) {
        self.state.write().await.fail = fail;
    }

    /// Delays every answer, to exercise caller timeouts.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.delay = delay;
    }

    /// Number of `select_tutor` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TutorMatcher for InMemoryTutorMatcher {
    async fn select_tutor(&self, _request: &MatchRequest) -> Result<TutorId> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (tutors, fail, delay) = {
            let state = self.state.read().await;
            (state.tutors.clone(), state.fail, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(PipelineError::Matching("matcher unavailable".to_string()));
        }
        if tutors.is_empty() {
            return Err(PipelineError::Matching("no tutors available".to_string()));
        }

        let index = self.next.fetch_add(1, Ordering::SeqCst) % tutors.len();
        Ok(tutors[index])
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchResponse {
    tutor_id: Option<TutorId>,
}

/// Matcher that POSTs a [`MatchRequest`] as JSON and expects
/// `{"tutorId": "<uuid>"}` back.
#[derive(Debug, Clone)]
pub struct HttpTutorMatcher {
    client: Client,
    url: String,
}

impl HttpTutorMatcher {
    /// Creates a matcher for the given endpoint.
    ///
    /// `timeout` bounds each HTTP request in addition to the caller's own
    /// timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Matching(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TutorMatcher for HttpTutorMatcher {
    #[tracing::instrument(skip(self, request), fields(student_id = %request.student_id, course_id = %request.course_id))]
    async fn select_tutor(&self, request: &MatchRequest) -> Result<TutorId> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| PipelineError::Matching(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Matching(format!("matcher returned {status}")));
        }

        let body: MatchResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Matching(format!("invalid matcher response: {e}")))?;

        body.tutor_id
            .ok_or_else(|| PipelineError::Matching("matcher returned no tutor".to_string()))
    }
}
