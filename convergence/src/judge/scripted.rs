//! In-memory judge that replays canned results, for tests and dry runs

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{Judge, JudgeError, JudgeRequest};
use crate::review::Review;

enum Step {
    Reply(Result<Review, JudgeError>),
    Delayed(Duration, Review),
}

/// Pops one scripted step per call; falls back to a fixed review when empty
pub struct ScriptedJudge {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<Review>,
    requests: Mutex<Vec<JudgeRequest>>,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            steps: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Judge that returns `scores` in order, as `revise` reviews
    pub fn with_scores(scores: &[f64]) -> Self {
        let judge = Self::new();
        for score in scores {
            judge.push_review(Review::new(*score, crate::review::Verdict::Revise, "scripted"));
        }
        judge
    }

    /// Review returned once the script runs out
    pub fn with_fallback(mut self, review: Review) -> Self {
        self.fallback = Some(review);
        self
    }

    pub fn push_review(&self, review: Review) {
        self.lock_steps().push_back(Step::Reply(Ok(review)));
    }

    pub fn push_error(&self, error: JudgeError) {
        self.lock_steps().push_back(Step::Reply(Err(error)));
    }

    /// Review that only arrives after `delay` (times out if `delay` exceeds the budget)
    pub fn push_delayed(&self, delay: Duration, review: Review) {
        self.lock_steps().push_back(Step::Delayed(delay, review));
    }

    /// Requests seen so far, in call order
    pub fn requests(&self) -> Vec<JudgeRequest> {
        match self.requests.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests().len()
    }

    fn lock_steps(&self) -> std::sync::MutexGuard<'_, VecDeque<Step>> {
        match self.steps.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn review(&self, request: &JudgeRequest, timeout: Duration) -> Result<Review, JudgeError> {
        match self.requests.lock() {
            Ok(mut g) => g.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
        let step = self.lock_steps().pop_front();

        match step {
            Some(Step::Reply(result)) => result,
            Some(Step::Delayed(delay, review)) => {
                if delay > timeout {
                    tokio::time::sleep(timeout).await;
                    Err(JudgeError::Timeout {
                        secs: timeout.as_secs(),
                    })
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(review)
                }
            }
            None => self.fallback.clone().ok_or_else(|| JudgeError::Malformed {
                message: "scripted judge has no more reviews".to_string(),
            }),
        }
    }
}
