//! Judge backed by an external program
//!
//! The request is written to the child's stdin as JSON; one JSON review is
//! read back from stdout. The child runs in its own process group with
//! `kill_on_drop`, so a timeout or a cancelled submission reaps it.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{parse_review, Judge, JudgeConfig, JudgeError, JudgeRequest};
use crate::review::Review;

#[derive(Debug, Clone)]
pub struct SubprocessJudge {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl SubprocessJudge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn from_config(config: &JudgeConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so the whole judge tree dies with it
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn run(&self, payload: Vec<u8>) -> Result<std::process::Output, JudgeError> {
        let mut child = self.command().spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                JudgeError::ExecutableMissing {
                    program: self.program.clone(),
                }
            } else {
                JudgeError::Io {
                    message: format!("failed to spawn {}: {}", self.program, e),
                }
            }
        })?;

        // Feed stdin concurrently so a chatty judge cannot deadlock on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Judge closed stdin early");
                }
            });
        }

        child.wait_with_output().await.map_err(|e| JudgeError::Io {
            message: format!("failed to wait for judge: {}", e),
        })
    }
}

#[async_trait]
impl Judge for SubprocessJudge {
    fn name(&self) -> &str {
        &self.program
    }

    async fn review(&self, request: &JudgeRequest, timeout: Duration) -> Result<Review, JudgeError> {
        let payload = serde_json::to_vec(request).map_err(|e| JudgeError::Io {
            message: format!("failed to encode request: {}", e),
        })?;

        let start = Instant::now();
        info!(
            judge = %self.program,
            session_id = %request.context.session_id,
            loop_index = request.context.loop_index,
            timeout_secs = timeout.as_secs(),
            "Invoking judge"
        );

        let output = match tokio::time::timeout(timeout, self.run(payload)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(judge = %self.program, timeout_secs = timeout.as_secs(), "Judge timed out");
                return Err(JudgeError::Timeout {
                    secs: timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(judge = %self.program, code = ?output.status.code(), "Judge exited with failure");
            return Err(JudgeError::NonZeroExit {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let review = parse_review(&stdout)?;
        info!(
            judge = %self.program,
            score = review.score,
            verdict = %review.verdict,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Judge finished"
        );
        Ok(review)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::complexity::{analyze, plan, Language};
    use crate::session::{SessionConfig, SessionState};
    use chrono::Utc;

    fn request() -> JudgeRequest {
        let state = SessionState::new("s1", SessionConfig::for_task("t"), Utc::now());
        let plan = plan(&analyze("x", Language::Other));
        JudgeRequest::for_session(&state, 1, "x", &plan)
    }

    fn sh(script: &str) -> SubprocessJudge {
        SubprocessJudge::new("sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_reads_review_from_stdout() {
        let judge = sh(r#"cat >/dev/null; echo 'log line'; echo '{"score": 77, "verdict": "revise"}'"#);
        let review = judge.review(&request(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(review.score, 77.0);
        assert!(!review.synthetic);
    }

    #[tokio::test]
    async fn test_request_is_written_to_stdin() {
        // Echo the task back as the summary
        let judge = sh(
            r#"input=$(cat); case "$input" in *'"task":"t"'*) s=ok;; *) s=missing;; esac; printf '{"score": 50, "verdict": "revise", "summary": "%s"}' "$s""#,
        );
        let review = judge.review(&request(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(review.summary, "ok");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let judge = SubprocessJudge::new("/definitely/not/a/judge-binary");
        let err = judge.review(&request(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, JudgeError::ExecutableMissing { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let judge = sh("echo 'bad rubric' >&2; exit 3");
        let err = judge.review(&request(), Duration::from_secs(10)).await.unwrap_err();
        match err {
            JudgeError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "bad rubric");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let judge = sh("sleep 5");
        let start = Instant::now();
        let err = judge
            .review(&request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_malformed_output() {
        let judge = sh("cat >/dev/null; echo 'not json'");
        let err = judge.review(&request(), Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, JudgeError::Malformed { .. }));
        assert!(err.is_recoverable());
    }
}
