//! Session persistence across controller instances
//!
//! - Resume from a JSON record written by an earlier process
//! - Corrupted record replaced by a fresh session
//! - Unsafe session ids rejected before touching disk
//! - Concurrent submissions, same and different session ids

use std::sync::Arc;

use convergence::session::{SessionManager, StoreError};
use convergence::{
    AuditController, AuditError, ControllerConfig, ErrorCategory, FileSessionStore, Review,
    ScriptedJudge, SessionStore, Submission, Verdict,
};
use tempfile::tempdir;

fn controller(dir: &std::path::Path, scores: &[f64]) -> AuditController {
    let store = Arc::new(FileSessionStore::new(dir));
    let judge = Arc::new(ScriptedJudge::with_scores(scores));
    AuditController::new(store, judge, ControllerConfig::default())
}

#[tokio::test]
async fn test_resume_across_instances() {
    let dir = tempdir().unwrap();

    let first = controller(dir.path(), &[55.0]);
    first.submit(Submission::new("resume", "v1")).await.unwrap();
    drop(first);

    let second = controller(dir.path(), &[75.0]);
    let reply = second.submit(Submission::new("resume", "v2")).await.unwrap();
    assert_eq!(reply.standard.loop_index, 2);
    assert_eq!(reply.standard.history_length, 2);

    let status = second.status("resume").await.unwrap();
    let meta = status.session_metadata.unwrap();
    assert_eq!(meta.score_progression, vec![55.0, 75.0]);
    assert_eq!(meta.average_improvement, Some(20.0));

    let raw = std::fs::read_to_string(dir.path().join("resume.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["current_loop"], 2);
    assert_eq!(json["iterations"][0]["candidate"], "v1");
    assert_eq!(json["iterations"][1]["loop_index"], 2);

    let store = FileSessionStore::new(dir.path());
    assert_eq!(store.list().await.unwrap(), vec!["resume".to_string()]);
}

#[tokio::test]
async fn test_corrupted_record_is_recreated() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

    let store = FileSessionStore::new(dir.path());
    match store.load("broken").await {
        Err(StoreError::Corrupted { .. }) => {}
        other => panic!("expected corruption, got {other:?}"),
    }

    let ctl = controller(dir.path(), &[40.0]);
    let reply = ctl.submit(Submission::new("broken", "fresh")).await.unwrap();
    assert_eq!(reply.standard.loop_index, 1);
    let state = store.load("broken").await.unwrap().unwrap();
    assert_eq!(state.iterations.len(), 1);
    assert_eq!(state.iterations[0].candidate, "fresh");
}

#[tokio::test]
async fn test_inconsistent_record_is_corrupted() {
    let dir = tempdir().unwrap();
    let ctl = controller(dir.path(), &[40.0]);
    ctl.submit(Submission::new("edited", "v1")).await.unwrap();

    // Hand-edited so the loop counter disagrees with the history
    let path = dir.path().join("edited.json");
    let mut json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    json["current_loop"] = serde_json::json!(5);
    std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

    let store = FileSessionStore::new(dir.path());
    assert!(matches!(
        store.load("edited").await,
        Err(StoreError::Corrupted { .. })
    ));
}

#[tokio::test]
async fn test_unsafe_session_id_rejected() {
    let dir = tempdir().unwrap();
    let ctl = controller(dir.path(), &[40.0]);
    let err = ctl
        .submit(Submission::new("../escape", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Store(StoreError::InvalidId { .. })));
    assert_eq!(err.classify().category, ErrorCategory::Session);
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_concurrent_submissions() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path()));
    let judge = Arc::new(
        ScriptedJudge::new().with_fallback(Review::new(50.0, Verdict::Revise, "again")),
    );
    let ctl = Arc::new(AuditController::new(
        store.clone(),
        judge,
        ControllerConfig::default(),
    ));

    let mut handles = Vec::new();
    for session in 0..4 {
        for attempt in 0..3 {
            let ctl = ctl.clone();
            handles.push(tokio::spawn(async move {
                ctl.submit(Submission::new(
                    format!("s{session}"),
                    format!("session {session} attempt {attempt}\n"),
                ))
                .await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for session in 0..4 {
        let state = store.load(&format!("s{session}")).await.unwrap().unwrap();
        assert_eq!(state.iterations.len(), 3);
        assert_eq!(state.current_loop, 3);
        state.check_invariants().unwrap();
    }
}

#[tokio::test]
async fn test_manager_append_retry_over_files() {
    let dir = tempdir().unwrap();
    let manager = SessionManager::new(Arc::new(FileSessionStore::new(dir.path())));
    let review = Review::new(61.0, Verdict::Revise, "");

    manager.append("retry", 1, "v1", review.clone()).await.unwrap();
    let state = manager.append("retry", 1, "v1", review).await.unwrap();
    assert_eq!(state.iterations.len(), 1);

    let state = manager
        .mark_complete("retry", convergence::CompletionReason::Manual)
        .await
        .unwrap();
    assert!(state.is_complete);
    let loaded = manager.load("retry").await.unwrap().unwrap();
    assert_eq!(loaded, state);
}
